//! Federated aggregation
//!
//! - `AggregationCoordinator`: per-cycle collection, aggregation, validation, publication
//! - `weights`: quality-weighted averaging over `f32` deltas
//! - `NormValidator`: built-in magnitude check used when no evaluator is attached

mod coordinator;
mod validator;
pub mod weights;

pub use coordinator::{
    AggregationCoordinator, CycleOutcome, ModelPublisher, PublishedModel, SubmitAck, Validator,
};
pub use validator::NormValidator;
pub use weights::{weighted_average, WeightedAggregate};
