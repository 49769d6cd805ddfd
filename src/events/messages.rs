use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregation::PublishedModel;
use crate::domain::{EntityId, LearningUpdate};
use crate::tasks::{ExecutionFailure, ExecutionReport, ExecutionRequest};

/// Outcome of one execution, as sent back by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub service_id: EntityId,
    pub result: Result<ExecutionReport, ExecutionFailure>,
}

impl TaskResult {
    pub fn completed(request: &ExecutionRequest, report: ExecutionReport) -> Self {
        Self {
            task_id: request.task_id.clone(),
            service_id: request.service_id.clone(),
            result: Ok(report),
        }
    }

    pub fn failed(request: &ExecutionRequest, failure: ExecutionFailure) -> Self {
        Self {
            task_id: request.task_id.clone(),
            service_id: request.service_id.clone(),
            result: Err(failure),
        }
    }
}

/// A price change, either an operation's market price or a service's own estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub operation_tag: Option<String>,
    pub service_id: Option<EntityId>,
    pub unit_price: Decimal,
    pub at_sequence: u64,
    pub at: DateTime<Utc>,
}

impl PriceUpdate {
    pub fn for_operation(operation_tag: &str, unit_price: Decimal, at_sequence: u64) -> Self {
        Self {
            operation_tag: Some(operation_tag.to_string()),
            service_id: None,
            unit_price,
            at_sequence,
            at: Utc::now(),
        }
    }

    pub fn for_service(service_id: &str, unit_price: Decimal, at_sequence: u64) -> Self {
        Self {
            operation_tag: None,
            service_id: Some(service_id.to_string()),
            unit_price,
            at_sequence,
            at: Utc::now(),
        }
    }
}

/// Announcement of a new published aggregate; carries the digest, not the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPublished {
    pub cycle_id: u64,
    pub digest: String,
    pub contributors: Vec<EntityId>,
    pub validation_score: f64,
    pub published_at: DateTime<Utc>,
}

impl From<&PublishedModel> for ModelPublished {
    fn from(model: &PublishedModel) -> Self {
        Self {
            cycle_id: model.cycle_id,
            digest: model.digest.clone(),
            contributors: model.contributors.clone(),
            validation_score: model.validation_score,
            published_at: model.published_at,
        }
    }
}

/// Every message kind carried on the event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    TaskRequest(ExecutionRequest),
    TaskResult(TaskResult),
    LearningUpdate(LearningUpdate),
    PriceUpdate(PriceUpdate),
    ModelPublished(ModelPublished),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskRequest(_) => "task_request",
            Event::TaskResult(_) => "task_result",
            Event::LearningUpdate(_) => "learning_update",
            Event::PriceUpdate(_) => "price_update",
            Event::ModelPublished(_) => "model_published",
        }
    }

    /// Deduplication key for at-least-once delivery
    pub fn idempotency_key(&self) -> Option<String> {
        match self {
            Event::TaskRequest(r) => Some(format!("task_request:{}", r.task_id)),
            Event::TaskResult(r) => Some(format!("task_result:{}", r.task_id)),
            Event::LearningUpdate(u) => {
                Some(format!("learning_update:{}:{}", u.producer_id, u.cycle_id))
            }
            Event::PriceUpdate(_) | Event::ModelPublished(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_wire_format_is_tagged() {
        let event = Event::PriceUpdate(PriceUpdate::for_operation("summarize", dec!(12.5), 4));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "price_update");
        assert_eq!(json["payload"]["operation_tag"], "summarize");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_idempotency_keys() {
        let update = LearningUpdate::new("edge-1", 3, vec![], 0.5);
        assert_eq!(
            Event::LearningUpdate(update).idempotency_key().as_deref(),
            Some("learning_update:edge-1:3")
        );
        let price = PriceUpdate::for_service("svc", dec!(1), 0);
        assert_eq!(Event::PriceUpdate(price).idempotency_key(), None);
    }
}
