use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityId, InfraTier};
use super::state::TaskState;
use super::transaction::Credits;

/// A unit of work requested by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub requesting_agent: EntityId,
    pub operation_tag: String,
    pub parameters: serde_json::Value,
    pub budget_ceiling: Credits,
    /// Upper bound on declared service latency (ms); `None` accepts any
    pub latency_constraint_ms: Option<u64>,
    /// Restrict routing to one infrastructure tier
    pub required_tier: Option<InfraTier>,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        requesting_agent: &str,
        operation_tag: &str,
        budget_ceiling: Credits,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            requesting_agent: requesting_agent.to_string(),
            operation_tag: operation_tag.to_string(),
            parameters: serde_json::Value::Null,
            budget_ceiling,
            latency_constraint_ms: None,
            required_tier: None,
            deadline,
            created_at: Utc::now(),
        }
    }

    /// Task with a deadline relative to now
    pub fn with_timeout(
        requesting_agent: &str,
        operation_tag: &str,
        budget_ceiling: Credits,
        timeout_ms: u64,
    ) -> Self {
        let timeout_ms = timeout_ms.min(i64::MAX as u64) as i64;
        let deadline = Utc::now() + ChronoDuration::milliseconds(timeout_ms);
        Self::new(requesting_agent, operation_tag, budget_ceiling, deadline)
    }

    pub fn with_task_id(mut self, task_id: &str) -> Self {
        self.task_id = task_id.to_string();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_latency_constraint(mut self, latency_ms: u64) -> Self {
        self.latency_constraint_ms = Some(latency_ms);
        self
    }

    pub fn with_tier(mut self, tier: InfraTier) -> Self {
        self.required_tier = Some(tier);
        self
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Time left until the deadline, `None` once it has passed
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.deadline - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Quoted-vs-settled cost overshoot beyond the configured tolerance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlippageAnomaly {
    pub task_id: String,
    pub service_id: EntityId,
    pub quoted_price: Decimal,
    pub actual_cost: Credits,
    /// (actual - quoted) / quoted
    pub slippage_pct: Decimal,
    pub tolerance_pct: Decimal,
    pub detected_at: DateTime<Utc>,
}

/// Successful settlement of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub service_id: EntityId,
    pub quoted_price: Decimal,
    pub actual_cost: Credits,
    pub sequence_number: u64,
    pub output: serde_json::Value,
    pub quality_score: Option<f64>,
    pub anomaly: Option<SlippageAnomaly>,
}

/// Why a task was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    NoCandidate,
    InsufficientBalance { balance: Credits, required: Credits },
    ExecutionFailed { attempts: u32, last_error: String },
    Cancelled,
    /// Infrastructure fault while processing the task (e.g. journal write)
    Fault { reason: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NoCandidate => write!(f, "no candidate service"),
            RejectReason::InsufficientBalance { balance, required } => {
                write!(f, "insufficient balance: {} < {}", balance, required)
            }
            RejectReason::ExecutionFailed {
                attempts,
                last_error,
            } => write!(f, "execution failed after {} attempts: {}", attempts, last_error),
            RejectReason::Cancelled => write!(f, "cancelled by requesting agent"),
            RejectReason::Fault { reason } => write!(f, "fault: {}", reason),
        }
    }
}

/// Final result of one task pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Settled(Settlement),
    Rejected(RejectReason),
    Expired { last_state: TaskState },
}

impl TaskOutcome {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Settled(_) => TaskState::Settled,
            TaskOutcome::Rejected(_) => TaskState::Rejected,
            TaskOutcome::Expired { .. } => TaskState::Expired,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, TaskOutcome::Settled(_))
    }
}
