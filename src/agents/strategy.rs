//! AgentStrategy: caller-supplied decision logic for agents
//!
//! The core never embeds agent behavior. A strategy looks at what the agent
//! can see (its balance and the current price) and decides whether to ask for
//! work, with what budget and deadline.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::{Credits, EntityId, InfraTier, Task};

/// What an agent observes before deciding
#[derive(Debug, Clone, PartialEq)]
pub struct AgentView {
    pub agent_id: EntityId,
    pub balance: Credits,
    pub operation_tag: String,
    /// Current market unit price of the operation
    pub unit_price: Decimal,
}

/// A request an agent wants submitted
#[derive(Debug, Clone, PartialEq)]
pub struct TaskIntent {
    pub operation_tag: String,
    pub budget: Credits,
    pub timeout_ms: u64,
    pub latency_constraint_ms: Option<u64>,
    pub tier: Option<InfraTier>,
    pub parameters: serde_json::Value,
}

impl TaskIntent {
    pub fn into_task(self, agent_id: &str) -> Task {
        let mut task = Task::with_timeout(agent_id, &self.operation_tag, self.budget, self.timeout_ms)
            .with_parameters(self.parameters);
        if let Some(latency) = self.latency_constraint_ms {
            task = task.with_latency_constraint(latency);
        }
        if let Some(tier) = self.tier {
            task = task.with_tier(tier);
        }
        task
    }
}

#[async_trait]
pub trait AgentStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Next request for the agent, or `None` to sit this round out
    async fn next_task(&self, view: &AgentView) -> Option<TaskIntent>;
}

/// Spends a fixed fraction of the balance, capped at `headroom × price`
#[derive(Debug, Clone)]
pub struct BudgetFraction {
    pub fraction: Decimal,
    /// Multiple of the current price the agent is willing to pay
    pub headroom: Decimal,
    pub timeout_ms: u64,
    pub latency_constraint_ms: Option<u64>,
}

impl Default for BudgetFraction {
    fn default() -> Self {
        Self {
            fraction: Decimal::new(25, 2),
            headroom: Decimal::new(15, 1),
            timeout_ms: 5_000,
            latency_constraint_ms: None,
        }
    }
}

#[async_trait]
impl AgentStrategy for BudgetFraction {
    fn name(&self) -> &str {
        "budget_fraction"
    }

    async fn next_task(&self, view: &AgentView) -> Option<TaskIntent> {
        if view.balance <= 0 || view.unit_price <= Decimal::ZERO {
            return None;
        }
        let affordable = Decimal::from(view.balance) * self.fraction;
        let wanted = view.unit_price * self.headroom;
        let budget = affordable.min(wanted).floor().to_i64()?;

        // Not worth asking when the budget cannot cover the market price
        if Decimal::from(budget) < view.unit_price {
            return None;
        }
        Some(TaskIntent {
            operation_tag: view.operation_tag.clone(),
            budget,
            timeout_ms: self.timeout_ms,
            latency_constraint_ms: self.latency_constraint_ms,
            tier: None,
            parameters: serde_json::Value::Null,
        })
    }
}
