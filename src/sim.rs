//! Simulated collaborators for the `simulate` command and integration tests
//!
//! Nothing here runs inference. Services sleep, charge around the quote and
//! fail at a configured rate; producers emit random deltas with a quality score.

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::aggregation::weights::encode_f32_le;
use crate::domain::{EntityId, LearningUpdate};
use crate::error::Result;
use crate::events::{Event, EventBus, TaskResult};
use crate::tasks::{ExecutionFailure, ExecutionReport, ExecutionRequest, ExecutionService};

/// In-process stand-in for an inference service
#[derive(Debug, Clone)]
pub struct SimulatedService {
    pub estimate: Decimal,
    pub latency: Duration,
    /// Actual cost as a multiple of the quote
    pub cost_factor: Decimal,
    /// Uniform noise applied to the cost factor (0.05 = ±5%)
    pub cost_jitter: f64,
    pub failure_rate: f64,
    pub quality: Option<f64>,
}

impl SimulatedService {
    pub fn new(estimate: Decimal, latency: Duration) -> Self {
        Self {
            estimate,
            latency,
            cost_factor: Decimal::ONE,
            cost_jitter: 0.0,
            failure_rate: 0.0,
            quality: None,
        }
    }

    pub fn with_cost_factor(mut self, factor: Decimal) -> Self {
        self.cost_factor = factor;
        self
    }

    pub fn with_cost_jitter(mut self, jitter: f64) -> Self {
        self.cost_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }

    fn roll(&self) -> (bool, Decimal) {
        let mut rng = rand::thread_rng();
        let failed = self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate);
        let noise = if self.cost_jitter > 0.0 {
            rng.gen_range(-self.cost_jitter..=self.cost_jitter)
        } else {
            0.0
        };
        let noise = Decimal::try_from(noise).unwrap_or(Decimal::ZERO);
        (failed, self.cost_factor * (Decimal::ONE + noise))
    }
}

#[async_trait]
impl ExecutionService for SimulatedService {
    async fn estimate_cost(&self, _operation_tag: &str) -> Result<Decimal> {
        Ok(self.estimate)
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<ExecutionReport, ExecutionFailure> {
        let (failed, factor) = self.roll();
        tokio::time::sleep(self.latency).await;

        if failed {
            return Err(ExecutionFailure::new("simulated failure"));
        }
        let actual_cost = (request.quoted_price * factor)
            .ceil()
            .to_i64()
            .unwrap_or(i64::MAX)
            .max(1);
        Ok(ExecutionReport {
            actual_cost,
            output: serde_json::json!({
                "operation": request.operation_tag,
                "task_id": request.task_id,
            }),
            quality_score: self.quality,
        })
    }
}

/// Answers `TaskRequest`s on the bus for a set of simulated services
pub struct ServiceWorker {
    bus: EventBus,
    services: HashMap<EntityId, SimulatedService>,
    /// Publish every result twice, as an at-least-once channel may
    duplicate_results: bool,
}

impl ServiceWorker {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            services: HashMap::new(),
            duplicate_results: false,
        }
    }

    pub fn with_service(mut self, service_id: &str, service: SimulatedService) -> Self {
        self.services.insert(service_id.to_string(), service);
        self
    }

    pub fn with_duplicate_results(mut self) -> Self {
        self.duplicate_results = true;
        self
    }

    /// Subscribe now and serve requests until shutdown
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let rx = self.bus.subscribe();
        tokio::spawn(self.run(rx, shutdown))
    }

    async fn run(self, mut rx: broadcast::Receiver<Event>, mut shutdown: watch::Receiver<bool>) {
        let worker = Arc::new(self);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(Event::TaskRequest(request)) => {
                        let Some(service) = worker.services.get(&request.service_id).cloned() else {
                            continue;
                        };
                        let worker = Arc::clone(&worker);
                        tokio::spawn(async move {
                            let result = match service.execute(&request).await {
                                Ok(report) => TaskResult::completed(&request, report),
                                Err(failure) => TaskResult::failed(&request, failure),
                            };
                            debug!("Worker answering {} for {}", request.task_id, request.service_id);
                            if worker.duplicate_results {
                                worker.bus.publish(Event::TaskResult(result.clone()));
                            }
                            worker.bus.publish(Event::TaskResult(result));
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Service worker lagged, {} events skipped", skipped);
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
    }
}

/// Edge device that trains locally and reports deltas
#[derive(Debug, Clone)]
pub struct SimulatedProducer {
    pub producer_id: EntityId,
    pub dimension: usize,
    /// Mean quality score; each report draws within ±0.1
    pub quality: f64,
    /// Scale of the random delta values
    pub scale: f32,
}

impl SimulatedProducer {
    pub fn new(producer_id: &str, dimension: usize, quality: f64) -> Self {
        Self {
            producer_id: producer_id.to_string(),
            dimension,
            quality,
            scale: 0.1,
        }
    }

    pub fn update_for(&self, cycle_id: u64) -> LearningUpdate {
        let mut rng = rand::thread_rng();
        let delta: Vec<f32> = (0..self.dimension)
            .map(|_| rng.gen_range(-self.scale..=self.scale))
            .collect();
        let quality = (self.quality + rng.gen_range(-0.1..=0.1)).clamp(0.0, 1.0);
        LearningUpdate::new(&self.producer_id, cycle_id, encode_f32_le(&delta), quality)
    }

    /// Report one update to the bus
    pub fn report(&self, bus: &EventBus, cycle_id: u64) {
        let update = self.update_for(cycle_id);
        info!(
            "Producer {} reporting cycle {} (quality {:.3})",
            self.producer_id, cycle_id, update.quality_score
        );
        bus.publish(Event::LearningUpdate(update));
    }
}
