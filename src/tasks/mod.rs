//! Task pipelines
//!
//! - `TaskCoordinator`: one pipeline per task, created → settled/rejected/expired
//! - `ExecutionService`: the external service a task is handed to
//! - `SettlementGuard`: at most one settlement per task id
//! - `AnomalyLog`: slippage beyond tolerance

mod coordinator;
mod execution;
mod guard;
mod slippage;

pub use coordinator::{TaskCoordinator, TaskStatus};
pub use execution::{
    ExecutionFailure, ExecutionReport, ExecutionRequest, ExecutionService, ExecutorSet,
};
pub use guard::{Claim, SettlementGuard};
pub use slippage::{detect_slippage, slippage_pct, AnomalyLog};
