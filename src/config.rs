use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::routing::RankingPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Designated source entity for minted credits
    pub mint_entity: String,
    /// Entity that receives scheduled mints
    pub pool_entity: String,
    /// Credits minted per mint event
    pub mint_amount: i64,
    /// Seconds between scheduled mints (0 = only the genesis mint)
    pub mint_interval_secs: u64,
    /// Total supply cap across all mints
    pub max_supply: Option<i64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mint_entity: "mint".to_string(),
            pool_entity: "pool".to_string(),
            mint_amount: 10_000,
            mint_interval_secs: 0,
            max_supply: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Base price used for operations without an explicit entry
    pub default_base_price: Decimal,
    /// Per-operation base prices (e.g. "summarize" = 25)
    pub base_prices: HashMap<String, Decimal>,
    /// Number of trailing ledger sequence numbers counted as "recent" demand
    pub demand_window: u64,
    /// Smoothing factor of the demand baseline EWMA (0, 1]
    pub ema_alpha: Decimal,
    /// Milliseconds between price recomputation boundaries
    pub recompute_interval_ms: u64,
    /// Milliseconds between service cost estimate refreshes (0 disables)
    pub cost_refresh_interval_ms: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_base_price: Decimal::from(10),
            base_prices: HashMap::new(),
            demand_window: 256,
            ema_alpha: Decimal::new(2, 1), // 0.2
            recompute_interval_ms: 5_000,
            cost_refresh_interval_ms: 30_000,
        }
    }
}

impl PricingConfig {
    /// Configured base price for an operation, falling back to the default
    pub fn base_price(&self, operation_tag: &str) -> Decimal {
        self.base_prices
            .get(operation_tag)
            .copied()
            .unwrap_or(self.default_base_price)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Ordering applied to surviving candidates
    pub ranking: RankingPolicy,
    /// Ledger sequence numbers a quote stays valid for
    pub quote_staleness_window: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ranking: RankingPolicy::PriceFirst,
            quote_staleness_window: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Allowed overshoot of actual cost over the quote (e.g. 0.10 = 10%)
    pub slippage_tolerance_pct: Decimal,
    /// Maximum execution attempts across ranked candidates
    pub max_attempts: u32,
    /// Deadline applied to requests that carry none (ms)
    pub default_deadline_ms: u64,
    /// How long a finished task stays queryable before eviction (ms); 0 disables the sweep
    pub retention_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            slippage_tolerance_pct: Decimal::new(10, 2),
            max_attempts: 3,
            default_deadline_ms: 30_000,
            retention_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// How long a cycle collects updates before aggregating a partial set (ms)
    pub collection_timeout_ms: u64,
    /// Validation score an aggregate must exceed to be published
    pub acceptance_threshold: f64,
    /// Capability tag that marks an agent as an expected producer
    pub producer_capability: String,
    /// Minimum contributors required to aggregate after a timeout
    pub min_quorum: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            collection_timeout_ms: 60_000,
            acceptance_threshold: 0.5,
            producer_capability: "federated".to_string(),
            min_quorum: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalBackend {
    #[default]
    Memory,
    File,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: JournalBackend,
    /// Directory for the file journal
    pub directory: PathBuf,
    /// PostgreSQL connection URL (postgres backend)
    pub database_url: Option<String>,
    /// Maximum connections in pool
    pub max_connections: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: JournalBackend::Memory,
            directory: PathBuf::from("data"),
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// TOML file listing entities registered at startup
    pub bootstrap_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Write daily-rolling log files into this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("AGORA_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (AGORA_LEDGER__MINT_AMOUNT, etc.)
            .add_source(
                Environment::with_prefix("AGORA")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.ledger.mint_amount <= 0 {
            errors.push("ledger.mint_amount must be positive".to_string());
        }
        if self.ledger.mint_entity == self.ledger.pool_entity {
            errors.push("ledger.mint_entity and ledger.pool_entity must differ".to_string());
        }
        if let Some(cap) = self.ledger.max_supply {
            if cap < self.ledger.mint_amount {
                errors.push(format!(
                    "ledger.max_supply ({cap}) is below a single mint ({})",
                    self.ledger.mint_amount
                ));
            }
        }

        if self.pricing.default_base_price <= Decimal::ZERO {
            errors.push("pricing.default_base_price must be positive".to_string());
        }
        for (op, price) in &self.pricing.base_prices {
            if *price <= Decimal::ZERO {
                errors.push(format!("pricing.base_prices.{op} must be positive"));
            }
        }
        if self.pricing.demand_window == 0 {
            errors.push("pricing.demand_window must be at least 1".to_string());
        }
        if self.pricing.ema_alpha <= Decimal::ZERO || self.pricing.ema_alpha > Decimal::ONE {
            errors.push("pricing.ema_alpha must be in (0, 1]".to_string());
        }

        if self.tasks.slippage_tolerance_pct < Decimal::ZERO {
            errors.push("tasks.slippage_tolerance_pct must not be negative".to_string());
        }
        if self.tasks.max_attempts == 0 {
            errors.push("tasks.max_attempts must be at least 1".to_string());
        }

        if !self.aggregation.acceptance_threshold.is_finite() {
            errors.push("aggregation.acceptance_threshold must be finite".to_string());
        }
        if self.aggregation.min_quorum == 0 {
            errors.push("aggregation.min_quorum must be at least 1".to_string());
        }

        if self.persistence.backend == JournalBackend::Postgres
            && self.persistence.database_url.is_none()
        {
            errors.push("persistence.database_url is required for the postgres backend".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.ranking, RankingPolicy::PriceFirst);
    }

    #[test]
    fn test_base_price_fallback() {
        let mut pricing = PricingConfig::default();
        pricing.base_prices.insert("summarize".to_string(), dec!(25));
        assert_eq!(pricing.base_price("summarize"), dec!(25));
        assert_eq!(pricing.base_price("caption"), dec!(10));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = AppConfig::default();
        config.pricing.ema_alpha = dec!(1.5);
        config.tasks.max_attempts = 0;
        config.persistence.backend = JournalBackend::Postgres;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
            [pricing]
            default_base_price = "12"
            demand_window = 32

            [pricing.base_prices]
            summarize = "20"

            [routing]
            ranking = "latency_first"
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.pricing.default_base_price, dec!(12));
        assert_eq!(config.pricing.demand_window, 32);
        assert_eq!(config.pricing.base_price("summarize"), dec!(20));
        assert_eq!(config.routing.ranking, RankingPolicy::LatencyFirst);
        assert_eq!(config.tasks.max_attempts, 3);
    }
}
