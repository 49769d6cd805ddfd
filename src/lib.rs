pub mod agents;
pub mod aggregation;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod persistence;
pub mod pricing;
pub mod registry;
pub mod routing;
pub mod sim;
pub mod tasks;

pub use aggregation::{AggregationCoordinator, CycleOutcome, PublishedModel};
pub use config::AppConfig;
pub use engine::Engine;
pub use error::{AgoraError, Result};
pub use events::{Event, EventBus};
pub use ledger::Ledger;
pub use pricing::PricingEngine;
pub use registry::Registry;
pub use routing::{RankingPolicy, RouteRequest, Router};
pub use tasks::TaskCoordinator;
