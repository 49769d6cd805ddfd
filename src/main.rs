use agora::cli::{
    self, Cli, Commands, ConfigCommands, LedgerCommands, RegistryCommands, SimulationOptions,
};
use agora::config::{AppConfig, LoggingConfig};
use agora::engine::Engine;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;

    match cli.command {
        Commands::Run => {
            let _guard = init_logging(&config.logging);
            run_engine(config).await?;
        }
        Commands::Simulate {
            agents,
            tasks,
            producers,
            cycles,
        } => {
            let _guard = init_logging(&config.logging);
            let options = SimulationOptions {
                agents,
                tasks,
                producers,
                cycles,
                ..Default::default()
            };
            let report = cli::run_simulation(config, &options).await?;
            cli::print_simulation(&report);
        }
        Commands::Ledger { command } => {
            init_logging_simple();
            match command {
                LedgerCommands::Balance { entity } => cli::show_balance(&config, &entity).await?,
                LedgerCommands::History { entity, limit } => {
                    cli::show_history(&config, &entity, limit).await?
                }
            }
        }
        Commands::Registry {
            command: RegistryCommands::Check { file },
        } => {
            init_logging_simple();
            cli::check_registry(&file)?;
        }
        Commands::Config {
            command: ConfigCommands::Check,
        } => {
            init_logging_simple();
            cli::check_config(&config)?;
        }
    }

    Ok(())
}

async fn run_engine(config: AppConfig) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        anyhow::bail!("{} invalid setting(s)", errors.len());
    }

    let engine = Arc::new(Engine::open(config).await?);

    // Every registered service is reached over the event channel
    let services: Vec<String> = engine
        .registry()
        .snapshot()
        .entities()
        .filter(|e| e.service_profile().is_some())
        .map(|e| e.id.clone())
        .collect();
    for service_id in &services {
        engine.attach_remote(service_id);
    }
    info!("Attached {} remote services", services.len());

    engine.start().await?;
    info!("Engine running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    engine.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let default_directives = if config.level == "info" {
        "info,agora=debug,sqlx=warn".to_string()
    } else {
        format!("{},sqlx=warn", config.level)
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let (file_layer, guard) = match &config.directory {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "agora.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not create log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let (plain, json) = if config.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .with(file_layer)
        .init();

    guard
}

fn init_logging_simple() {
    // Minimal logging for inspection commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
