use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::messages::{Event, ModelPublished};
use crate::aggregation::{ModelPublisher, PublishedModel};
use crate::error::Result;

const DEFAULT_CAPACITY: usize = 1024;

/// In-process event channel (per-channel ordering, fan-out to every subscriber)
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many subscribers received it
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No subscribers for {} event", kind);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Announces published aggregates on the bus
pub struct BusPublisher {
    bus: EventBus,
}

impl BusPublisher {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ModelPublisher for BusPublisher {
    async fn publish(&self, model: &PublishedModel) -> Result<()> {
        let receivers = self
            .bus
            .publish(Event::ModelPublished(ModelPublished::from(model)));
        info!(
            "Announced model {} for cycle {} to {} subscriber(s)",
            model.digest, model.cycle_id, receivers
        );
        Ok(())
    }
}
