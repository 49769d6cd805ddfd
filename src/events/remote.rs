//! Execution collaborator reached over the event channel
//!
//! `execute` publishes a `TaskRequest` and parks on a oneshot keyed by task
//! id until the matching `TaskResult` is handed to [`RemoteExecutor::complete`].
//! The channel delivers at least once, so a second result for the same task
//! finds no pending entry and is dropped.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::messages::{Event, TaskResult};
use crate::domain::EntityId;
use crate::error::{AgoraError, Result};
use crate::tasks::{ExecutionFailure, ExecutionReport, ExecutionRequest, ExecutionService};

type Pending = Arc<DashMap<String, oneshot::Sender<TaskResult>>>;

pub struct RemoteExecutor {
    service_id: EntityId,
    bus: EventBus,
    pending: Pending,
    /// Last advertised unit price per operation
    prices: DashMap<String, Decimal>,
    default_price: Option<Decimal>,
}

impl RemoteExecutor {
    pub fn new(service_id: &str, bus: EventBus) -> Self {
        Self {
            service_id: service_id.to_string(),
            bus,
            pending: Arc::new(DashMap::new()),
            prices: DashMap::new(),
            default_price: None,
        }
    }

    /// Price reported for operations the service never advertised
    pub fn with_default_price(mut self, price: Decimal) -> Self {
        self.default_price = Some(price);
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Record a price advertised by the service
    pub fn advertise(&self, operation_tag: &str, price: Decimal) {
        self.prices.insert(operation_tag.to_string(), price);
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Deliver a result; `false` when nothing was waiting for it
    pub fn complete(&self, result: TaskResult) -> bool {
        let Some((task_id, tx)) = self.pending.remove(&result.task_id) else {
            debug!(
                "Dropping result for {} from {}: no request pending",
                result.task_id, result.service_id
            );
            return false;
        };
        if tx.send(result).is_err() {
            debug!("Requester for {} stopped waiting", task_id);
            return false;
        }
        true
    }
}

/// Removes the pending entry when the waiting future is dropped (e.g. on timeout)
struct PendingSlot {
    pending: Pending,
    task_id: String,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.pending.remove(&self.task_id);
    }
}

#[async_trait]
impl ExecutionService for RemoteExecutor {
    async fn estimate_cost(&self, operation_tag: &str) -> Result<Decimal> {
        self.prices
            .get(operation_tag)
            .map(|p| *p)
            .or(self.default_price)
            .ok_or_else(|| {
                AgoraError::NotFound(format!(
                    "price for {} at {}",
                    operation_tag, self.service_id
                ))
            })
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(request.task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ExecutionFailure::new(format!(
                    "task {} already in flight at {}",
                    request.task_id, self.service_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _slot = PendingSlot {
            pending: Arc::clone(&self.pending),
            task_id: request.task_id.clone(),
        };

        if self.bus.publish(Event::TaskRequest(request.clone())) == 0 {
            warn!(
                "No listener for task {} at {}",
                request.task_id, self.service_id
            );
            return Err(ExecutionFailure::new("service unreachable"));
        }

        match rx.await {
            Ok(result) => result.result,
            Err(_) => Err(ExecutionFailure::new("result channel closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn request(task_id: &str) -> ExecutionRequest {
        ExecutionRequest {
            task_id: task_id.into(),
            service_id: "svc".into(),
            operation_tag: "summarize".into(),
            parameters: serde_json::json!({}),
            quoted_price: dec!(10),
            deadline: Utc::now() + chrono::Duration::seconds(5),
        }
    }

    fn report(cost: i64) -> ExecutionReport {
        ExecutionReport {
            actual_cost: cost,
            output: serde_json::json!({"ok": true}),
            quality_score: None,
        }
    }

    #[tokio::test]
    async fn test_result_resolves_pending_request_once() {
        let bus = EventBus::new(8);
        let mut requests = bus.subscribe();
        let executor = Arc::new(RemoteExecutor::new("svc", bus.clone()));

        let waiting = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move { executor.execute(&request("t1")).await })
        };

        let Event::TaskRequest(req) = requests.recv().await.unwrap() else {
            panic!("expected a task request");
        };
        assert!(executor.complete(TaskResult::completed(&req, report(10))));
        assert!(!executor.complete(TaskResult::completed(&req, report(10))));

        let result = waiting.await.unwrap().unwrap();
        assert_eq!(result.actual_cost, 10);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_fails() {
        let executor = RemoteExecutor::new("svc", EventBus::new(4));
        let failure = executor.execute(&request("t1")).await.unwrap_err();
        assert_eq!(failure.reason, "service unreachable");
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_wait_clears_pending_entry() {
        let bus = EventBus::new(4);
        let _listener = bus.subscribe();
        let executor = RemoteExecutor::new("svc", bus);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), executor.execute(&request("t1"))).await;
        assert!(timed_out.is_err());
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_estimate_uses_advertised_price() {
        let executor =
            RemoteExecutor::new("svc", EventBus::new(4)).with_default_price(dec!(30));
        executor.advertise("summarize", dec!(22));
        assert_eq!(executor.estimate_cost("summarize").await.unwrap(), dec!(22));
        assert_eq!(executor.estimate_cost("translate").await.unwrap(), dec!(30));
    }
}
