//! Task pipelines end to end: expiry, fallback, cancellation, idempotent settlement

use agora::aggregation::NormValidator;
use agora::config::{AppConfig, PricingConfig, TaskConfig};
use agora::domain::{Entity, InfraTier, RejectReason, Task, TaskOutcome, TaskState};
use agora::engine::Engine;
use agora::events::{Event, TaskResult};
use agora::ledger::{Ledger, LedgerOptions};
use agora::persistence::MemoryJournal;
use agora::pricing::PricingEngine;
use agora::registry::Registry;
use agora::routing::{RankingPolicy, Router};
use agora::sim::{ServiceWorker, SimulatedService};
use agora::tasks::{
    ExecutionFailure, ExecutionReport, ExecutionRequest, ExecutionService, ExecutorSet,
    TaskCoordinator,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    coordinator: TaskCoordinator,
    ledger: Arc<Ledger>,
    registry: Arc<Registry>,
    executors: Arc<ExecutorSet>,
}

async fn harness() -> Harness {
    harness_with(TaskConfig::default()).await
}

async fn harness_with(config: TaskConfig) -> Harness {
    let ledger = Arc::new(
        Ledger::open(Arc::new(MemoryJournal::new()), LedgerOptions::default())
            .await
            .unwrap(),
    );
    ledger.mint("pool", 1_000).await.unwrap();
    ledger.transfer("pool", "agent1", 100, "allocation").await.unwrap();

    let registry = Arc::new(Registry::new());
    registry
        .register(
            Entity::service("svc-cheap", 300, InfraTier::Edge)
                .with_capability("summarize")
                .with_base_price(dec!(20)),
        )
        .unwrap();
    registry
        .register(
            Entity::service("svc-backup", 700, InfraTier::Cloud)
                .with_capability("summarize")
                .with_base_price(dec!(30)),
        )
        .unwrap();

    let pricing = Arc::new(PricingEngine::new(PricingConfig::default(), Arc::clone(&ledger)));
    let router = Router::new(Arc::clone(&registry), pricing, RankingPolicy::PriceFirst);
    let executors = Arc::new(ExecutorSet::new());
    let coordinator = TaskCoordinator::new(
        config,
        64,
        Arc::clone(&ledger),
        Arc::clone(&registry),
        router,
        Arc::clone(&executors),
    );
    Harness {
        coordinator,
        ledger,
        registry,
        executors,
    }
}

fn fast(cost_estimate: i64) -> Arc<SimulatedService> {
    Arc::new(SimulatedService::new(cost_estimate.into(), Duration::from_millis(5)))
}

#[tokio::test]
async fn slow_service_expires_without_charging() {
    let h = harness().await;
    h.executors.insert(
        "svc-cheap",
        Arc::new(SimulatedService::new(dec!(20), Duration::from_millis(500))),
    );

    let task = Task::with_timeout("agent1", "summarize", 50, 100);
    let outcome = h.coordinator.submit(task).await.unwrap();

    assert_eq!(
        outcome,
        TaskOutcome::Expired {
            last_state: TaskState::Executing
        }
    );
    assert_eq!(h.ledger.balance("agent1"), 100);
    assert_eq!(h.ledger.latest_sequence(), 2);
}

#[tokio::test]
async fn failed_service_falls_back_to_next_candidate() {
    let h = harness().await;
    h.executors.insert(
        "svc-cheap",
        Arc::new(SimulatedService::new(dec!(20), Duration::from_millis(5)).with_failure_rate(1.0)),
    );
    h.executors.insert("svc-backup", fast(30));

    let task = Task::with_timeout("agent1", "summarize", 50, 2_000);
    let outcome = h.coordinator.submit(task).await.unwrap();

    let TaskOutcome::Settled(settlement) = outcome else {
        panic!("expected settlement, got {outcome:?}");
    };
    assert_eq!(settlement.service_id, "svc-backup");
    assert_eq!(settlement.actual_cost, 30);
    assert_eq!(h.ledger.balance("agent1"), 70);

    let cheap = h.registry.service_stats("svc-cheap");
    assert_eq!((cheap.attempts, cheap.successes), (1, 0));
    let backup = h.registry.service_stats("svc-backup");
    assert_eq!((backup.attempts, backup.successes), (1, 1));
}

/// Fails after other traffic moves the ledger past the quote window and the
/// backup service reprices
struct BusyMarketFailure {
    ledger: Arc<Ledger>,
    registry: Arc<Registry>,
    backup_price: Decimal,
}

#[async_trait]
impl ExecutionService for BusyMarketFailure {
    async fn estimate_cost(&self, _operation_tag: &str) -> agora::error::Result<Decimal> {
        Ok(dec!(20))
    }

    async fn execute(
        &self,
        _request: &ExecutionRequest,
    ) -> Result<ExecutionReport, ExecutionFailure> {
        for _ in 0..100 {
            self.ledger
                .transfer("pool", "filler", 1, "filler")
                .await
                .map_err(|e| ExecutionFailure::new(e.to_string()))?;
        }
        self.registry
            .update_service_price("svc-backup", self.backup_price)
            .map_err(|e| ExecutionFailure::new(e.to_string()))?;
        Err(ExecutionFailure::new("overloaded"))
    }
}

#[tokio::test]
async fn fallback_is_requoted_after_ledger_moves_past_window() {
    let h = harness().await;
    h.executors.insert(
        "svc-cheap",
        Arc::new(BusyMarketFailure {
            ledger: Arc::clone(&h.ledger),
            registry: Arc::clone(&h.registry),
            backup_price: dec!(35),
        }),
    );
    h.executors.insert("svc-backup", fast(35));

    let task = Task::with_timeout("agent1", "summarize", 40, 2_000).with_task_id("t-requote");
    let outcome = h.coordinator.submit(task).await.unwrap();

    let TaskOutcome::Settled(settlement) = outcome else {
        panic!("expected settlement, got {outcome:?}");
    };
    assert_eq!(settlement.service_id, "svc-backup");
    // Charged against the re-derived price, not the one quoted at #2
    assert_eq!(settlement.quoted_price, dec!(35));
    assert_eq!(h.ledger.balance("agent1"), 65);

    let status = h.coordinator.status("t-requote").await.unwrap();
    let states: Vec<TaskState> = status.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            TaskState::Quoted,
            TaskState::Authorized,
            TaskState::Executing,
            TaskState::Quoted,
            TaskState::Authorized,
            TaskState::Executing,
            TaskState::Settled,
        ]
    );
}

#[tokio::test]
async fn fallback_priced_out_after_requote_is_not_executed() {
    let h = harness().await;
    h.executors.insert(
        "svc-cheap",
        Arc::new(BusyMarketFailure {
            ledger: Arc::clone(&h.ledger),
            registry: Arc::clone(&h.registry),
            backup_price: dec!(45),
        }),
    );
    h.executors.insert("svc-backup", fast(45));

    let task = Task::with_timeout("agent1", "summarize", 40, 2_000);
    let outcome = h.coordinator.submit(task).await.unwrap();

    assert!(matches!(
        outcome,
        TaskOutcome::Rejected(RejectReason::ExecutionFailed { attempts: 1, .. })
    ));
    assert_eq!(h.ledger.balance("agent1"), 100);
    assert_eq!(h.ledger.balance("svc-backup"), 0);

    assert_eq!(h.registry.service_stats("svc-backup").attempts, 0);
}

#[tokio::test]
async fn budget_below_every_quote_is_rejected() {
    let h = harness().await;
    h.executors.insert("svc-cheap", fast(20));

    let task = Task::with_timeout("agent1", "summarize", 10, 2_000);
    let outcome = h.coordinator.submit(task).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Rejected(RejectReason::NoCandidate));
    assert_eq!(h.ledger.balance("agent1"), 100);
}

#[tokio::test]
async fn cancel_during_execution_is_ignored() {
    let h = harness().await;
    h.executors.insert(
        "svc-cheap",
        Arc::new(SimulatedService::new(dec!(20), Duration::from_millis(200))),
    );

    let task = Task::with_timeout("agent1", "summarize", 50, 5_000).with_task_id("late-cancel");
    h.coordinator.open(task).await.unwrap();
    let running = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move { coordinator.run("late-cancel").await })
    };

    while h.coordinator.state("late-cancel").await != Some(TaskState::Executing) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.coordinator.cancel("late-cancel").await.unwrap());

    let outcome = running.await.unwrap().unwrap();
    assert!(outcome.is_settled());
    assert_eq!(h.ledger.balance("agent1"), 80);
}

#[tokio::test]
async fn cancel_before_execution_rejects() {
    let h = harness().await;
    h.executors.insert("svc-cheap", fast(20));

    let task = Task::with_timeout("agent1", "summarize", 50, 5_000).with_task_id("early-cancel");
    h.coordinator.open(task).await.unwrap();
    assert!(h.coordinator.cancel("early-cancel").await.unwrap());

    let outcome = h.coordinator.run("early-cancel").await.unwrap();
    assert_eq!(outcome, TaskOutcome::Rejected(RejectReason::Cancelled));
    assert_eq!(h.ledger.balance("agent1"), 100);
}

#[tokio::test]
async fn slippage_beyond_tolerance_still_settles() {
    let h = harness().await;
    h.executors.insert(
        "svc-cheap",
        Arc::new(SimulatedService::new(dec!(20), Duration::from_millis(5)).with_cost_factor(dec!(1.5))),
    );

    let task = Task::with_timeout("agent1", "summarize", 50, 2_000);
    let TaskOutcome::Settled(settlement) = h.coordinator.submit(task).await.unwrap() else {
        panic!("expected settlement");
    };
    assert_eq!(settlement.actual_cost, 30);
    let anomaly = settlement.anomaly.expect("slippage anomaly");
    assert_eq!(anomaly.slippage_pct, dec!(0.5));
    assert_eq!(h.coordinator.anomalies().len().await, 1);
}

#[tokio::test]
async fn finished_tasks_are_evicted_after_retention() {
    let h = harness_with(TaskConfig {
        retention_ms: 100,
        ..Default::default()
    })
    .await;
    h.executors.insert("svc-cheap", fast(20));

    let task = Task::with_timeout("agent1", "summarize", 50, 2_000).with_task_id("t-evict");
    let first = h.coordinator.submit(task.clone()).await.unwrap();
    assert!(first.is_settled());

    // Still inside the window
    assert_eq!(h.coordinator.evict_finished().await, 0);
    assert_eq!(h.coordinator.state("t-evict").await, Some(TaskState::Settled));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.coordinator.evict_finished().await, 1);
    assert!(h.coordinator.state("t-evict").await.is_none());

    // Redelivery after eviction is answered from the ledger
    let sequence = h.ledger.latest_sequence();
    let again = h.coordinator.submit(task).await.unwrap();
    assert!(again.is_settled());
    assert_eq!(h.ledger.latest_sequence(), sequence);
    assert_eq!(h.ledger.balance("agent1"), 80);
}

#[tokio::test]
async fn running_tasks_are_not_evicted() {
    let h = harness_with(TaskConfig {
        retention_ms: 0,
        ..Default::default()
    })
    .await;
    h.executors.insert(
        "svc-cheap",
        Arc::new(SimulatedService::new(dec!(20), Duration::from_millis(200))),
    );

    let task = Task::with_timeout("agent1", "summarize", 50, 5_000).with_task_id("t-busy");
    let running = h.coordinator.spawn(task);
    while h.coordinator.state("t-busy").await != Some(TaskState::Executing) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.coordinator.evict_finished().await, 0);

    assert!(running.await.unwrap().unwrap().is_settled());
    assert_eq!(h.coordinator.evict_finished().await, 1);
}

#[tokio::test]
async fn duplicate_task_results_settle_once() {
    let engine = Arc::new(
        Engine::open_with(
            AppConfig::default(),
            Arc::new(MemoryJournal::new()),
            Arc::new(NormValidator::default()),
        )
        .await
        .unwrap(),
    );
    engine
        .registry()
        .register(
            Entity::service("svc-remote", 400, InfraTier::Cloud)
                .with_capability("summarize")
                .with_base_price(dec!(15)),
        )
        .unwrap();
    engine.attach_remote("svc-remote");
    let _worker = ServiceWorker::new(engine.bus().clone())
        .with_service(
            "svc-remote",
            SimulatedService::new(dec!(15), Duration::from_millis(10)),
        )
        .with_duplicate_results()
        .spawn(engine.shutdown_signal());

    engine.start().await.unwrap();
    engine.allocate("agent1", 100).await.unwrap();

    let task = Task::with_timeout("agent1", "summarize", 40, 5_000).with_task_id("t-dup");
    let first = engine.submit(task.clone()).await.unwrap();
    assert!(first.is_settled());

    // A redelivered request and a late replayed result change nothing
    let again = engine.submit(task).await.unwrap();
    assert_eq!(again, first);

    let replay = ExecutionRequest {
        task_id: "t-dup".into(),
        service_id: "svc-remote".into(),
        operation_tag: "summarize".into(),
        parameters: serde_json::Value::Null,
        quoted_price: dec!(15),
        deadline: chrono::Utc::now(),
    };
    engine.bus().publish(Event::TaskResult(TaskResult::completed(
        &replay,
        ExecutionReport {
            actual_cost: 15,
            output: serde_json::Value::Null,
            quality_score: None,
        },
    )));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ledger = engine.ledger();
    let settlements = ledger
        .log(..)
        .iter()
        .filter(|tx| tx.reference.as_deref() == Some("t-dup"))
        .count();
    assert_eq!(settlements, 1);
    assert_eq!(ledger.balance("agent1"), 85);
    assert_eq!(ledger.balance("svc-remote"), 15);

    engine.shutdown().await;
}
