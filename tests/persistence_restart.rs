//! State rebuilt from a file journal after a restart

use agora::aggregation::weights::encode_f32_le;
use agora::aggregation::{AggregationCoordinator, NormValidator};
use agora::config::{AggregationConfig, PricingConfig, TaskConfig};
use agora::domain::{Entity, InfraTier, LearningUpdate, Task, TaskOutcome};
use agora::events::{BusPublisher, EventBus};
use agora::ledger::{Ledger, LedgerOptions};
use agora::persistence::{FileJournal, Journal};
use agora::pricing::PricingEngine;
use agora::registry::Registry;
use agora::routing::{RankingPolicy, Router};
use agora::sim::SimulatedService;
use agora::tasks::{ExecutorSet, TaskCoordinator};
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

async fn open_ledger(dir: &Path) -> (Arc<Ledger>, Arc<dyn Journal>) {
    let journal: Arc<dyn Journal> = Arc::new(FileJournal::open(dir).await.unwrap());
    let ledger = Ledger::open(Arc::clone(&journal), LedgerOptions::default())
        .await
        .unwrap();
    (Arc::new(ledger), journal)
}

fn registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry
        .register(
            Entity::service("svc", 200, InfraTier::Edge)
                .with_capability("summarize")
                .with_base_price(dec!(25)),
        )
        .unwrap();
    registry
        .register(Entity::agent("edge-1").with_capability("federated"))
        .unwrap();
    registry
}

fn tasks(ledger: &Arc<Ledger>, registry: &Arc<Registry>) -> TaskCoordinator {
    let pricing = Arc::new(PricingEngine::new(PricingConfig::default(), Arc::clone(ledger)));
    let router = Router::new(Arc::clone(registry), pricing, RankingPolicy::PriceFirst);
    let executors = Arc::new(ExecutorSet::new());
    executors.insert(
        "svc",
        Arc::new(SimulatedService::new(dec!(25), Duration::from_millis(5))),
    );
    TaskCoordinator::new(
        TaskConfig::default(),
        64,
        Arc::clone(ledger),
        Arc::clone(registry),
        router,
        executors,
    )
}

#[tokio::test]
async fn balances_and_sequence_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let (ledger, _) = open_ledger(dir.path()).await;
        ledger.mint("pool", 1_000).await.unwrap();
        ledger.transfer("pool", "agent1", 100, "allocation").await.unwrap();
        ledger.transfer("agent1", "svc", 28, "summarize").await.unwrap();
    }

    let (ledger, _) = open_ledger(dir.path()).await;
    assert_eq!(ledger.latest_sequence(), 3);
    assert_eq!(ledger.balance("pool"), 900);
    assert_eq!(ledger.balance("agent1"), 72);
    assert_eq!(ledger.balance("svc"), 28);
    assert_eq!(ledger.total_minted(), 1_000);
    assert_eq!(ledger.net_balance(), 0);

    // Appends continue the sequence
    let seq = ledger.transfer("agent1", "svc", 2, "summarize").await.unwrap();
    assert_eq!(seq, 4);
}

#[tokio::test]
async fn failed_journal_write_does_not_corrupt_restart() {
    let dir = tempdir().unwrap();
    {
        let journal = Arc::new(FileJournal::open(dir.path()).await.unwrap());
        let ledger = Ledger::open(journal.clone(), LedgerOptions::default())
            .await
            .unwrap();
        ledger.mint("pool", 1_000).await.unwrap();

        journal.fail_next_sync();
        assert!(ledger.transfer("pool", "agent1", 100, "allocation").await.is_err());
        assert_eq!(ledger.latest_sequence(), 1);

        // The same sequence number is handed out again
        let seq = ledger.transfer("pool", "agent2", 40, "allocation").await.unwrap();
        assert_eq!(seq, 2);
    }

    let (ledger, _) = open_ledger(dir.path()).await;
    assert_eq!(ledger.latest_sequence(), 2);
    assert_eq!(ledger.balance("agent1"), 0);
    assert_eq!(ledger.balance("agent2"), 40);
    assert_eq!(ledger.balance("pool"), 960);
    assert_eq!(ledger.net_balance(), 0);
}

#[tokio::test]
async fn settled_task_is_not_charged_again_after_restart() {
    let dir = tempdir().unwrap();
    let registry = registry();

    let first = {
        let (ledger, _) = open_ledger(dir.path()).await;
        ledger.mint("agent1", 100).await.unwrap();
        let coordinator = tasks(&ledger, &registry);
        let task = Task::with_timeout("agent1", "summarize", 50, 2_000).with_task_id("t-restart");
        coordinator.submit(task).await.unwrap()
    };
    let TaskOutcome::Settled(before) = first else {
        panic!("expected settlement, got {first:?}");
    };

    let (ledger, _) = open_ledger(dir.path()).await;
    let coordinator = tasks(&ledger, &registry);
    let sequence = ledger.latest_sequence();

    let task = Task::with_timeout("agent1", "summarize", 50, 2_000).with_task_id("t-restart");
    let TaskOutcome::Settled(after) = coordinator.submit(task).await.unwrap() else {
        panic!("redelivered task was not reported as settled");
    };

    assert_eq!(after.sequence_number, before.sequence_number);
    assert_eq!(after.actual_cost, before.actual_cost);
    assert_eq!(ledger.latest_sequence(), sequence);
    assert_eq!(ledger.balance("agent1"), 75);
}

#[tokio::test]
async fn aggregation_resumes_after_last_recorded_cycle() {
    let dir = tempdir().unwrap();
    let registry = registry();
    let config = AggregationConfig {
        collection_timeout_ms: 50,
        ..Default::default()
    };

    {
        let journal: Arc<dyn Journal> = Arc::new(FileJournal::open(dir.path()).await.unwrap());
        let coordinator = AggregationCoordinator::open(
            config.clone(),
            Arc::clone(&registry),
            journal,
            Arc::new(NormValidator::default()),
            Arc::new(BusPublisher::new(EventBus::default())),
        )
        .await
        .unwrap();
        coordinator.refresh_producers().await;
        for cycle in 1..=2 {
            coordinator
                .submit(LearningUpdate::new("edge-1", cycle, encode_f32_le(&[0.5]), 0.9))
                .await
                .unwrap();
            assert!(coordinator.run_cycle().await.unwrap().is_published());
        }
    }

    let journal: Arc<dyn Journal> = Arc::new(FileJournal::open(dir.path()).await.unwrap());
    assert_eq!(journal.load_cycle_records().await.unwrap().len(), 2);
    let coordinator = AggregationCoordinator::open(
        config,
        registry,
        journal,
        Arc::new(NormValidator::default()),
        Arc::new(BusPublisher::new(EventBus::default())),
    )
    .await
    .unwrap();
    assert_eq!(coordinator.current_cycle_id().await, 3);
}
