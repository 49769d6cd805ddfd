//! Agent decision strategies, injected by the caller

mod strategy;

pub use strategy::{AgentStrategy, AgentView, BudgetFraction, TaskIntent};
