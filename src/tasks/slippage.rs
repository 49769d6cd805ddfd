//! Settlement slippage
//!
//! Slippage is `(actual - quoted) / quoted`. Overshoot beyond the configured
//! tolerance does not block settlement; it is recorded as an anomaly.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::{Credits, SlippageAnomaly};

const DEFAULT_CAPACITY: usize = 1_024;

/// Relative overshoot of the actual cost over the quote
pub fn slippage_pct(quoted: Decimal, actual: Credits) -> Decimal {
    if quoted <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (Decimal::from(actual) - quoted) / quoted
}

/// Anomaly for a settlement whose cost exceeds the quote by more than `tolerance_pct`
pub fn detect_slippage(
    task_id: &str,
    service_id: &str,
    quoted: Decimal,
    actual: Credits,
    tolerance_pct: Decimal,
) -> Option<SlippageAnomaly> {
    let slippage = slippage_pct(quoted, actual);
    (slippage > tolerance_pct).then(|| SlippageAnomaly {
        task_id: task_id.to_string(),
        service_id: service_id.to_string(),
        quoted_price: quoted,
        actual_cost: actual,
        slippage_pct: slippage.round_dp(6),
        tolerance_pct,
        detected_at: Utc::now(),
    })
}

/// Bounded in-memory log of slippage anomalies, newest last
pub struct AnomalyLog {
    entries: RwLock<VecDeque<SlippageAnomaly>>,
    capacity: usize,
}

impl Default for AnomalyLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl AnomalyLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, anomaly: SlippageAnomaly) {
        warn!(
            task_id = %anomaly.task_id,
            service = %anomaly.service_id,
            "Slippage anomaly: quoted {} settled {} ({} > {})",
            anomaly.quoted_price,
            anomaly.actual_cost,
            anomaly.slippage_pct,
            anomaly.tolerance_pct
        );
        let mut entries = self.entries.write().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(anomaly);
    }

    pub async fn recent(&self) -> Vec<SlippageAnomaly> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
