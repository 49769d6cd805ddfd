//! Engine: process-scoped owner of every component
//!
//! Built once at startup, handed out by reference, torn down on shutdown.
//! Background loops (mint schedule, price recompute, cost refresh,
//! aggregation cycles, inbound dispatch) all stop on one `watch` signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregation::{AggregationCoordinator, NormValidator, Validator};
use crate::config::AppConfig;
use crate::domain::{Credits, Task, TaskOutcome};
use crate::error::Result;
use crate::events::{BusPublisher, Event, EventBus, InboundDispatcher, PriceUpdate, RemoteExecutor};
use crate::ledger::{Ledger, LedgerOptions, MintScheduler};
use crate::persistence::{open_journal, Journal};
use crate::pricing::PricingEngine;
use crate::registry::{load_bootstrap, Registry};
use crate::routing::Router;
use crate::tasks::{ExecutionService, ExecutorSet, TaskCoordinator};

/// Operation tag used when moving credits from the pool to an agent
pub const ALLOCATION_OPERATION: &str = "allocation";

pub struct Engine {
    config: AppConfig,
    journal: Arc<dyn Journal>,
    ledger: Arc<Ledger>,
    pricing: Arc<PricingEngine>,
    registry: Arc<Registry>,
    router: Router,
    executors: Arc<ExecutorSet>,
    tasks: TaskCoordinator,
    aggregation: Arc<AggregationCoordinator>,
    bus: EventBus,
    dispatcher: Arc<InboundDispatcher>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the configured journal and build every component
    pub async fn open(config: AppConfig) -> Result<Self> {
        let journal = open_journal(&config.persistence).await?;
        Self::open_with(config, journal, Arc::new(NormValidator::default())).await
    }

    /// Build on an explicit journal and validation collaborator
    pub async fn open_with(
        config: AppConfig,
        journal: Arc<dyn Journal>,
        validator: Arc<dyn Validator>,
    ) -> Result<Self> {
        info!("Opening engine ({} journal)", journal.backend_name());

        let ledger =
            Arc::new(Ledger::open(Arc::clone(&journal), LedgerOptions::from(&config.ledger)).await?);

        let registry = Arc::new(Registry::new());
        if let Some(path) = &config.registry.bootstrap_path {
            let entities = load_bootstrap(path)?;
            let count = registry.bootstrap(entities)?;
            info!("Registered {} entities from {}", count, path.display());
        }

        let pricing = Arc::new(PricingEngine::new(config.pricing.clone(), Arc::clone(&ledger)));
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&pricing),
            config.routing.ranking,
        );
        let executors = Arc::new(ExecutorSet::new());
        let tasks = TaskCoordinator::new(
            config.tasks.clone(),
            config.routing.quote_staleness_window,
            Arc::clone(&ledger),
            Arc::clone(&registry),
            router.clone(),
            Arc::clone(&executors),
        );

        let bus = EventBus::default();
        let aggregation = Arc::new(
            AggregationCoordinator::open(
                config.aggregation.clone(),
                Arc::clone(&registry),
                Arc::clone(&journal),
                validator,
                Arc::new(BusPublisher::new(bus.clone())),
            )
            .await?,
        );
        let dispatcher = Arc::new(InboundDispatcher::new(Arc::clone(&aggregation)));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            journal,
            ledger,
            pricing,
            registry,
            router,
            executors,
            tasks,
            aggregation,
            bus,
            dispatcher,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn journal(&self) -> Arc<dyn Journal> {
        Arc::clone(&self.journal)
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    pub fn pricing(&self) -> Arc<PricingEngine> {
        Arc::clone(&self.pricing)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn tasks(&self) -> &TaskCoordinator {
        &self.tasks
    }

    pub fn aggregation(&self) -> Arc<AggregationCoordinator> {
        Arc::clone(&self.aggregation)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Attach an in-process execution collaborator for a service
    pub fn attach_executor(&self, service_id: &str, executor: Arc<dyn ExecutionService>) {
        self.executors.insert(service_id, executor);
    }

    /// Reach a service over the event bus
    pub fn attach_remote(&self, service_id: &str) -> Arc<RemoteExecutor> {
        let mut remote = RemoteExecutor::new(service_id, self.bus.clone());
        if let Ok(entity) = self.registry.get(service_id) {
            if let Some(price) = entity.service_profile().and_then(|p| p.base_price) {
                remote = remote.with_default_price(price);
            }
        }
        let remote = Arc::new(remote);
        self.executors
            .insert(service_id, Arc::clone(&remote) as Arc<dyn ExecutionService>);
        self.dispatcher.attach(Arc::clone(&remote));
        remote
    }

    /// Move credits from the pool to an agent
    pub async fn allocate(&self, agent_id: &str, amount: Credits) -> Result<u64> {
        self.ledger
            .transfer(&self.config.ledger.pool_entity, agent_id, amount, ALLOCATION_OPERATION)
            .await
    }

    pub async fn submit(&self, task: Task) -> Result<TaskOutcome> {
        self.tasks.submit(task).await
    }

    /// Recompute prices and announce them on the bus
    pub fn recompute_prices(&self) {
        let snapshot = self.pricing.recompute();
        for (operation, _) in snapshot.operations() {
            self.bus.publish(Event::PriceUpdate(PriceUpdate::for_operation(
                operation,
                snapshot.price(operation),
                snapshot.computed_at_sequence,
            )));
        }
    }

    /// Ask every attached executor for its current estimate and store it as the service's base price
    pub async fn refresh_costs(&self) -> usize {
        let mut refreshed = 0;
        for (service_id, executor) in self.executors.entries() {
            let Ok(entity) = self.registry.get(&service_id) else {
                debug!("Executor {} has no registry entry", service_id);
                continue;
            };
            // Services are priced per entity; the first capability (by name) is the reference
            let Some(operation) = entity.capabilities.iter().next() else {
                continue;
            };
            let price = match executor.estimate_cost(operation).await {
                Ok(price) => price,
                Err(e) => {
                    warn!("Cost estimate from {} failed: {}", service_id, e);
                    continue;
                }
            };
            match self.registry.update_service_price(&service_id, price) {
                Ok(()) => {
                    refreshed += 1;
                    self.bus.publish(Event::PriceUpdate(PriceUpdate::for_service(
                        &service_id,
                        price,
                        self.ledger.latest_sequence(),
                    )));
                }
                Err(e) => warn!("Rejected estimate {} from {}: {}", price, service_id, e),
            }
        }
        refreshed
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Genesis mint, then spawn every background loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mint = MintScheduler::new(Arc::clone(&self.ledger), &self.config.ledger);
        mint.ensure_genesis().await?;
        let producers = self.aggregation.refresh_producers().await;
        debug!("Aggregation expects {} producers", producers);

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(mint.run(self.shutdown_signal())));
        handles.push(tokio::spawn(
            Arc::clone(&self.dispatcher).run(self.bus.subscribe(), self.shutdown_signal()),
        ));
        handles.push(tokio::spawn(
            Arc::clone(&self.aggregation).run(self.shutdown_signal()),
        ));

        let engine = Arc::clone(self);
        let period = self.config.pricing.recompute_interval_ms;
        handles.push(tokio::spawn(every(period, self.shutdown_signal(), move || {
            let engine = Arc::clone(&engine);
            async move { engine.recompute_prices() }
        })));

        let engine = Arc::clone(self);
        let period = self.config.pricing.cost_refresh_interval_ms;
        handles.push(tokio::spawn(every(period, self.shutdown_signal(), move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.refresh_costs().await;
            }
        })));

        let tasks = self.tasks.clone();
        let period = self.config.tasks.retention_ms;
        handles.push(tokio::spawn(every(period, self.shutdown_signal(), move || {
            let tasks = tasks.clone();
            async move {
                tasks.evict_finished().await;
            }
        })));

        info!("Engine started with {} background loops", handles.len());
        Ok(())
    }

    /// Signal every loop and wait for them to finish
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background loop ended abnormally: {}", e);
            }
        }
        info!(
            "Engine stopped at ledger sequence {}",
            self.ledger.latest_sequence()
        );
    }
}

/// Run `tick` every `period_ms` until shutdown; a zero period disables the loop
async fn every<F, Fut>(period_ms: u64, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    if period_ms == 0 {
        return;
    }
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Entity, InfraTier};
    use crate::persistence::MemoryJournal;
    use crate::sim::SimulatedService;
    use rust_decimal_macros::dec;

    async fn engine() -> Arc<Engine> {
        let engine = Engine::open_with(
            AppConfig::default(),
            Arc::new(MemoryJournal::new()),
            Arc::new(NormValidator::default()),
        )
        .await
        .unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn test_start_mints_genesis_and_shuts_down() {
        let engine = engine().await;
        engine.start().await.unwrap();
        assert_eq!(engine.ledger().balance("pool"), 10_000);

        engine.allocate("agent1", 100).await.unwrap();
        assert_eq!(engine.ledger().balance("agent1"), 100);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_costs_updates_registry() {
        let engine = engine().await;
        engine
            .registry()
            .register(
                Entity::service("svc", 500, InfraTier::Edge)
                    .with_capability("summarize")
                    .with_base_price(dec!(25)),
            )
            .unwrap();
        let mut prices = engine.bus().subscribe();
        engine.attach_executor(
            "svc",
            Arc::new(SimulatedService::new(dec!(18), Duration::from_millis(1))),
        );

        assert_eq!(engine.refresh_costs().await, 1);
        let profile_price = engine
            .registry()
            .get("svc")
            .unwrap()
            .service_profile()
            .and_then(|p| p.base_price);
        assert_eq!(profile_price, Some(dec!(18)));

        let Event::PriceUpdate(update) = prices.recv().await.unwrap() else {
            panic!("expected a price update");
        };
        assert_eq!(update.service_id.as_deref(), Some("svc"));
        assert_eq!(update.unit_price, dec!(18));
    }
}
