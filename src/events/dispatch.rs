use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::messages::Event;
use super::remote::RemoteExecutor;
use crate::aggregation::{AggregationCoordinator, SubmitAck};
use crate::domain::EntityId;
use crate::error::{AgoraError, Result};

/// What happened to one inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// Duplicate, stale, or addressed to a finished request
    Dropped,
    /// Outbound kinds this side only publishes
    Skipped,
}

/// Routes inbound results and learning updates to the coordinators
pub struct InboundDispatcher {
    aggregation: Arc<AggregationCoordinator>,
    remotes: DashMap<EntityId, Arc<RemoteExecutor>>,
}

impl InboundDispatcher {
    pub fn new(aggregation: Arc<AggregationCoordinator>) -> Self {
        Self {
            aggregation,
            remotes: DashMap::new(),
        }
    }

    /// Deliver `TaskResult`s addressed to this service to `executor`
    pub fn attach(&self, executor: Arc<RemoteExecutor>) {
        self.remotes
            .insert(executor.service_id().to_string(), executor);
    }

    pub async fn handle(&self, event: Event) -> Result<Dispatch> {
        match event {
            Event::TaskResult(result) => {
                let Some(executor) = self
                    .remotes
                    .get(&result.service_id)
                    .map(|e| Arc::clone(e.value()))
                else {
                    return Err(AgoraError::NotFound(format!(
                        "remote executor {}",
                        result.service_id
                    )));
                };
                Ok(if executor.complete(result) {
                    Dispatch::Delivered
                } else {
                    Dispatch::Dropped
                })
            }
            Event::LearningUpdate(update) => match self.aggregation.submit(update).await? {
                SubmitAck::Accepted { .. } => Ok(Dispatch::Delivered),
                SubmitAck::Ignored { .. } => Ok(Dispatch::Dropped),
            },
            Event::PriceUpdate(update) => {
                // A service advertising its own price
                if let (Some(service_id), Some(op)) = (&update.service_id, &update.operation_tag) {
                    if let Some(executor) = self.remotes.get(service_id) {
                        executor.advertise(op, update.unit_price);
                        return Ok(Dispatch::Delivered);
                    }
                }
                Ok(Dispatch::Skipped)
            }
            Event::TaskRequest(_) | Event::ModelPublished(_) => Ok(Dispatch::Skipped),
        }
    }

    /// Consume the bus until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Inbound dispatcher started");
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        let kind = event.kind();
                        match self.handle(event).await {
                            Ok(Dispatch::Dropped) => debug!("Dropped {} event", kind),
                            Ok(_) => {}
                            Err(e) => warn!("Failed to dispatch {} event: {}", kind, e),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Inbound dispatcher lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Inbound dispatcher stopped");
    }
}
