//! Demand-driven pricing

mod engine;

pub use engine::{demand_multiplier, PriceSnapshot, PricingEngine, MAX_MULTIPLIER, MIN_MULTIPLIER};
