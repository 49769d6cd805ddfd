//! Dynamic pricing
//!
//! Prices are `base_price × demand_multiplier`. The multiplier compares the
//! number of transactions for an operation over the last K ledger sequence
//! numbers with an exponentially weighted baseline of earlier windows, and is
//! clamped to `[0.5, 2.0]`. Multipliers are recomputed only at cycle
//! boundaries; between boundaries every caller sees the same snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use crate::config::PricingConfig;
use crate::ledger::Ledger;

pub const MIN_MULTIPLIER: Decimal = dec!(0.5);
pub const MAX_MULTIPLIER: Decimal = dec!(2.0);

/// Demand multiplier for `recent` calls against a trailing `baseline`
///
/// Returns 1 when there is no baseline yet (cold start). Non-decreasing in
/// `recent` for a fixed baseline, always within `[0.5, 2.0]`.
pub fn demand_multiplier(recent: Decimal, baseline: Decimal) -> Decimal {
    if baseline <= Decimal::ZERO {
        return Decimal::ONE;
    }
    (recent / baseline).clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)
}

/// Prices published for one recomputation cycle
#[derive(Debug, Clone)]
pub struct PriceSnapshot {
    /// Recomputation cycle counter (0 = nothing computed yet)
    pub cycle: u64,
    /// Ledger sequence number the demand counts were read at
    pub computed_at_sequence: u64,
    pub computed_at: DateTime<Utc>,
    default_base_price: Decimal,
    base_prices: HashMap<String, Decimal>,
    multipliers: HashMap<String, Decimal>,
}

impl PriceSnapshot {
    /// Snapshot with every multiplier at 1
    pub fn unadjusted(config: &PricingConfig) -> Self {
        Self {
            cycle: 0,
            computed_at_sequence: 0,
            computed_at: Utc::now(),
            default_base_price: config.default_base_price,
            base_prices: config.base_prices.clone(),
            multipliers: HashMap::new(),
        }
    }

    /// Snapshot with fixed multipliers, for callers that price without a ledger
    pub fn with_multipliers(
        config: &PricingConfig,
        multipliers: impl IntoIterator<Item = (String, Decimal)>,
    ) -> Self {
        let mut snapshot = Self::unadjusted(config);
        snapshot.multipliers = multipliers
            .into_iter()
            .map(|(op, m)| (op, m.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER)))
            .collect();
        snapshot
    }

    pub fn base_price(&self, operation_tag: &str) -> Decimal {
        self.base_prices
            .get(operation_tag)
            .copied()
            .unwrap_or(self.default_base_price)
    }

    pub fn multiplier(&self, operation_tag: &str) -> Decimal {
        self.multipliers
            .get(operation_tag)
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    /// Unit price of an operation at its configured base price
    pub fn price(&self, operation_tag: &str) -> Decimal {
        self.base_price(operation_tag) * self.multiplier(operation_tag)
    }

    /// Unit price at a specific service; its own base price wins over the operation's
    pub fn price_for(&self, operation_tag: &str, service_base: Option<Decimal>) -> Decimal {
        let base = service_base
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or_else(|| self.base_price(operation_tag));
        base * self.multiplier(operation_tag)
    }

    /// Operations with a demand-derived multiplier
    pub fn operations(&self) -> impl Iterator<Item = (&String, &Decimal)> {
        self.multipliers.iter()
    }
}

/// Derives and caches per-operation prices from ledger volume
pub struct PricingEngine {
    config: PricingConfig,
    ledger: Arc<Ledger>,
    /// EWMA of per-window call volume, per operation
    baselines: Mutex<HashMap<String, Decimal>>,
    current: RwLock<Arc<PriceSnapshot>>,
}

impl PricingEngine {
    pub fn new(config: PricingConfig, ledger: Arc<Ledger>) -> Self {
        let current = RwLock::new(Arc::new(PriceSnapshot::unadjusted(&config)));
        Self {
            config,
            ledger,
            baselines: Mutex::new(HashMap::new()),
            current,
        }
    }

    /// Cached snapshot of the current cycle
    pub fn snapshot(&self) -> Arc<PriceSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Cached price of an operation for the current cycle
    pub fn price(&self, operation_tag: &str) -> Decimal {
        self.snapshot().price(operation_tag)
    }

    /// Uncached price over an explicit demand window, against the current baseline
    pub fn price_over(&self, operation_tag: &str, window: u64) -> Decimal {
        let (counts, _) = self.ledger.operation_counts(window);
        let recent = Decimal::from(counts.get(operation_tag).copied().unwrap_or(0));
        let baseline = self
            .baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_tag)
            .copied()
            .unwrap_or(Decimal::ZERO);
        self.config.base_price(operation_tag) * demand_multiplier(recent, baseline)
    }

    /// Close the current cycle: derive new multipliers and publish a new snapshot
    pub fn recompute(&self) -> Arc<PriceSnapshot> {
        let (counts, sequence) = self.ledger.operation_counts(self.config.demand_window);
        let alpha = self.config.ema_alpha;

        let mut baselines = self.baselines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut operations: Vec<String> = baselines.keys().cloned().collect();
        operations.extend(counts.keys().filter(|op| !baselines.contains_key(*op)).cloned());

        let mut multipliers = HashMap::with_capacity(operations.len());
        for op in operations {
            let recent = Decimal::from(counts.get(&op).copied().unwrap_or(0));
            let baseline = baselines.get(&op).copied().unwrap_or(Decimal::ZERO);

            let multiplier = demand_multiplier(recent, baseline);
            multipliers.insert(op.clone(), multiplier);

            let next = if baseline <= Decimal::ZERO {
                recent
            } else {
                alpha * recent + (Decimal::ONE - alpha) * baseline
            };
            debug!(
                "{}: recent {} baseline {} -> {} (x{})",
                op, recent, baseline, next, multiplier
            );
            baselines.insert(op, next);
        }
        drop(baselines);

        let previous = self.snapshot();
        let snapshot = Arc::new(PriceSnapshot {
            cycle: previous.cycle + 1,
            computed_at_sequence: sequence,
            computed_at: Utc::now(),
            default_base_price: self.config.default_base_price,
            base_prices: self.config.base_prices.clone(),
            multipliers,
        });

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        info!(
            "Price cycle {} published at sequence {} ({} operations)",
            snapshot.cycle,
            sequence,
            snapshot.multipliers.len()
        );
        snapshot
    }
}
