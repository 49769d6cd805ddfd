use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agents::{AgentStrategy, AgentView, BudgetFraction};
use crate::aggregation::NormValidator;
use crate::config::{AppConfig, JournalBackend};
use crate::domain::{Credits, CycleRecord, Entity, EntityId, InfraTier, TaskOutcome};
use crate::engine::Engine;
use crate::error::{AgoraError, Result};
use crate::ledger::{Ledger, LedgerOptions};
use crate::persistence::{open_journal, MemoryJournal};
use crate::registry::load_bootstrap;
use crate::sim::{ServiceWorker, SimulatedProducer, SimulatedService};

#[derive(Parser)]
#[command(name = "agora")]
#[command(version)]
#[command(about = "Compute-credit economy: ledger, pricing, routing and federated aggregation", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml, $AGORA_ENV.toml)
    #[arg(short, long, default_value = "config", env = "AGORA_CONFIG_DIR")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine until Ctrl-C / SIGTERM
    Run,
    /// Run an in-memory scenario with simulated services and producers
    Simulate {
        /// Agents requesting work
        #[arg(long, default_value = "3")]
        agents: usize,
        /// Task requests to issue
        #[arg(long, default_value = "20")]
        tasks: usize,
        /// Federated producers
        #[arg(long, default_value = "3")]
        producers: usize,
        /// Aggregation cycles to run
        #[arg(long, default_value = "2")]
        cycles: u64,
    },
    /// Inspect the ledger journal
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Validate registry bootstrap files
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// Validate configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// Current balance of an entity
    Balance { entity: String },
    /// Transactions involving an entity
    History {
        entity: String,
        /// Show only the most recent N transactions
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// Parse a bootstrap file and list its entities
    Check { file: PathBuf },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Load and validate the configuration
    Check,
}

// ============================================================================
// Inspection commands
// ============================================================================

async fn open_ledger(config: &AppConfig) -> Result<Ledger> {
    if config.persistence.backend == JournalBackend::Memory {
        warn!("Memory journal configured; the ledger is empty");
    }
    let journal = open_journal(&config.persistence).await?;
    Ledger::open(journal, LedgerOptions::from(&config.ledger)).await
}

pub async fn show_balance(config: &AppConfig, entity: &str) -> Result<()> {
    let ledger = open_ledger(config).await?;
    println!(
        "{}: {} credits (as of sequence {})",
        entity,
        ledger.balance(entity),
        ledger.latest_sequence()
    );
    Ok(())
}

pub async fn show_history(config: &AppConfig, entity: &str, limit: Option<usize>) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let history = ledger.history(entity, ..);
    let total = history.count();
    let skip = limit.map(|n| total.saturating_sub(n)).unwrap_or(0);

    println!(
        "{:>8}  {:<20}  {:<20}  {:>10}  {:<14}  {}",
        "SEQ", "FROM", "TO", "AMOUNT", "OPERATION", "TIME"
    );
    for tx in history.iter().skip(skip) {
        println!(
            "{:>8}  {:<20}  {:<20}  {:>10}  {:<14}  {}",
            tx.sequence_number,
            tx.from_entity,
            tx.to_entity,
            tx.amount,
            tx.operation_tag,
            tx.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!(
        "{} transaction(s), balance {}",
        total,
        ledger.balance(entity)
    );
    Ok(())
}

pub fn check_registry(path: &Path) -> Result<()> {
    let entities = load_bootstrap(path)?;
    println!("{:<24}  {:<9}  {}", "ID", "KIND", "CAPABILITIES");
    for entity in &entities {
        let capabilities: Vec<&str> = entity.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<24}  {:<9}  {}",
            entity.id,
            entity.kind(),
            capabilities.join(", ")
        );
    }
    println!("{} entities OK", entities.len());
    Ok(())
}

pub fn check_config(config: &AppConfig) -> Result<()> {
    config.validate().map_err(|errors| {
        for e in &errors {
            println!("  ✗ {}", e);
        }
        AgoraError::Validation(format!("{} invalid setting(s)", errors.len()))
    })?;
    println!(
        "Configuration OK ({} journal, {} ranking, mint {} to {})",
        match config.persistence.backend {
            JournalBackend::Memory => "memory",
            JournalBackend::File => "file",
            JournalBackend::Postgres => "postgres",
        },
        serde_json::to_value(config.routing.ranking)?
            .as_str()
            .unwrap_or("custom"),
        config.ledger.mint_amount,
        config.ledger.pool_entity
    );
    Ok(())
}

// ============================================================================
// Simulation
// ============================================================================

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub agents: usize,
    pub tasks: usize,
    pub producers: usize,
    pub cycles: u64,
    pub allocation: Credits,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            agents: 3,
            tasks: 20,
            producers: 3,
            cycles: 2,
            allocation: 200,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimulationReport {
    pub settled: usize,
    pub rejected: usize,
    pub expired: usize,
    pub skipped: usize,
    /// Pipelines that ended in an infrastructure error
    pub errors: usize,
    pub anomalies: usize,
    pub balances: BTreeMap<EntityId, Credits>,
    pub cycles: Vec<CycleRecord>,
}

const SIM_OPERATION: &str = "summarize";

/// In-memory run: three services (two local, one over the bus), strategy-driven agents, producers
pub async fn run_simulation(mut config: AppConfig, options: &SimulationOptions) -> Result<SimulationReport> {
    config.persistence.backend = JournalBackend::Memory;
    config.registry.bootstrap_path = None;
    config.ledger.mint_interval_secs = 0;
    config.pricing.recompute_interval_ms = 200;
    config.pricing.cost_refresh_interval_ms = 500;
    config.aggregation.collection_timeout_ms = 1_000;

    let engine = Arc::new(
        Engine::open_with(
            config,
            Arc::new(MemoryJournal::new()),
            Arc::new(NormValidator::default()),
        )
        .await?,
    );
    let registry = engine.registry();

    let services = [
        ("svc-edge", 400, InfraTier::Edge, Decimal::from(12)),
        ("svc-cloud", 900, InfraTier::Cloud, Decimal::from(9)),
        ("svc-remote", 600, InfraTier::Cloud, Decimal::from(10)),
    ];
    for (id, latency_ms, tier, price) in services {
        registry.register(
            Entity::service(id, latency_ms, tier)
                .with_capability(SIM_OPERATION)
                .with_base_price(price),
        )?;
    }
    engine.attach_executor(
        "svc-edge",
        Arc::new(
            SimulatedService::new(Decimal::from(12), Duration::from_millis(40))
                .with_cost_jitter(0.15)
                .with_failure_rate(0.1),
        ),
    );
    engine.attach_executor(
        "svc-cloud",
        Arc::new(
            SimulatedService::new(Decimal::from(9), Duration::from_millis(90))
                .with_cost_jitter(0.05),
        ),
    );
    engine.attach_remote("svc-remote");
    let _worker = ServiceWorker::new(engine.bus().clone())
        .with_service(
            "svc-remote",
            SimulatedService::new(Decimal::from(10), Duration::from_millis(60)),
        )
        .with_duplicate_results()
        .spawn(engine.shutdown_signal());

    let agents: Vec<String> = (1..=options.agents).map(|i| format!("agent-{}", i)).collect();
    for agent in &agents {
        registry.register(Entity::agent(agent.as_str()).with_strategy("budget_fraction"))?;
    }
    let producers: Vec<SimulatedProducer> = (1..=options.producers)
        .map(|i| SimulatedProducer::new(&format!("edge-{}", i), 16, 0.7))
        .collect();
    for producer in &producers {
        registry.register(Entity::agent(producer.producer_id.as_str()).with_capability("federated"))?;
    }

    engine.start().await?;
    for agent in &agents {
        engine.allocate(agent, options.allocation).await?;
    }

    let mut report = SimulationReport::default();
    let strategy = BudgetFraction::default();
    let mut pending = Vec::new();
    for i in 0..options.tasks {
        let agent = &agents[i % agents.len().max(1)];
        let view = AgentView {
            agent_id: agent.clone(),
            balance: engine.ledger().balance(agent),
            operation_tag: SIM_OPERATION.to_string(),
            unit_price: engine.pricing().price(SIM_OPERATION),
        };
        match strategy.next_task(&view).await {
            Some(intent) => pending.push(engine.tasks().spawn(intent.into_task(agent))),
            None => report.skipped += 1,
        }
    }
    for joined in join_all(pending).await {
        match joined {
            Ok(Ok(TaskOutcome::Settled(_))) => report.settled += 1,
            Ok(Ok(TaskOutcome::Rejected(reason))) => {
                debug!("Task rejected: {}", reason);
                report.rejected += 1;
            }
            Ok(Ok(TaskOutcome::Expired { .. })) => report.expired += 1,
            Ok(Err(e)) => {
                warn!("Task pipeline error: {}", e);
                report.errors += 1;
            }
            Err(e) => {
                warn!("Task pipeline panicked: {}", e);
                report.errors += 1;
            }
        }
    }

    let aggregation = engine.aggregation();
    for _ in 0..options.cycles {
        let cycle_id = aggregation.current_cycle_id().await;
        for producer in &producers {
            producer.report(engine.bus(), cycle_id);
        }
        // The engine's aggregation loop closes the cycle once all producers reported
        let journal = engine.journal();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let recorded = journal.load_cycle_records().await?;
                if recorded.iter().any(|r| r.cycle_id == cycle_id) {
                    return Ok::<_, AgoraError>(());
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        match closed {
            Ok(result) => result?,
            Err(_) => warn!("Cycle {} did not close", cycle_id),
        }
    }

    report.anomalies = engine.tasks().anomalies().len().await;
    report.balances = engine.ledger().balances().into_iter().collect();
    report.cycles = engine.journal().load_cycle_records().await?;
    engine.shutdown().await;

    info!(
        "Simulation done: {} settled, {} rejected, {} expired",
        report.settled, report.rejected, report.expired
    );
    Ok(report)
}

pub fn print_simulation(report: &SimulationReport) {
    println!(
        "Tasks: {} settled, {} rejected, {} expired, {} skipped, {} errors, {} slippage anomalies",
        report.settled,
        report.rejected,
        report.expired,
        report.skipped,
        report.errors,
        report.anomalies
    );
    println!();
    println!("{:<16}  {:>10}", "ENTITY", "BALANCE");
    for (entity, balance) in &report.balances {
        println!("{:<16}  {:>10}", entity, balance);
    }
    println!();
    for record in &report.cycles {
        println!(
            "cycle {:>3}  {:<10}  contributors {:?}  score {}{}",
            record.cycle_id,
            record.state,
            record.contributors,
            record
                .validation_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "-".into()),
            record
                .discard_reason
                .as_ref()
                .map(|r| format!("  ({})", r))
                .unwrap_or_default()
        );
    }
}
