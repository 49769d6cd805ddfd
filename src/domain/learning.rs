use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::entity::EntityId;
use super::state::CycleState;

/// A locally trained model delta submitted for one aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningUpdate {
    pub producer_id: EntityId,
    pub cycle_id: u64,
    /// Opaque adapter delta; aggregated as little-endian f32 values
    pub delta_weights: Vec<u8>,
    /// Validation accuracy (or inverted loss) reported by the producer
    pub quality_score: f64,
    pub produced_at: DateTime<Utc>,
}

impl LearningUpdate {
    pub fn new(producer_id: &str, cycle_id: u64, delta_weights: Vec<u8>, quality_score: f64) -> Self {
        Self {
            producer_id: producer_id.to_string(),
            cycle_id,
            delta_weights,
            quality_score,
            produced_at: Utc::now(),
        }
    }
}

/// One round of collection and aggregation
#[derive(Debug, Clone)]
pub struct AggregationCycle {
    pub cycle_id: u64,
    pub expected_producers: BTreeSet<EntityId>,
    pub received: HashMap<EntityId, LearningUpdate>,
    pub state: CycleState,
    pub opened_at: DateTime<Utc>,
}

impl AggregationCycle {
    pub fn open(cycle_id: u64, expected_producers: BTreeSet<EntityId>) -> Self {
        Self {
            cycle_id,
            expected_producers,
            received: HashMap::new(),
            state: CycleState::Collecting,
            opened_at: Utc::now(),
        }
    }

    /// Every expected producer has reported
    pub fn is_complete(&self) -> bool {
        !self.expected_producers.is_empty()
            && self
                .expected_producers
                .iter()
                .all(|p| self.received.contains_key(p))
    }

    pub fn missing_producers(&self) -> Vec<EntityId> {
        self.expected_producers
            .iter()
            .filter(|p| !self.received.contains_key(*p))
            .cloned()
            .collect()
    }
}

/// Why a cycle ended without publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscardReason {
    /// Fewer contributors than the configured minimum quorum
    QuorumNotMet { received: usize, required: usize },
    /// Every received update had a non-positive quality score or was malformed
    NoValidUpdates,
    /// Validation score did not exceed the acceptance threshold
    ValidationRejected { score: f64, threshold: f64 },
    /// The validation collaborator returned an error
    ValidatorFailed { reason: String },
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::QuorumNotMet { received, required } => {
                write!(f, "quorum not met: {} of {} required", received, required)
            }
            DiscardReason::NoValidUpdates => write!(f, "no valid updates"),
            DiscardReason::ValidationRejected { score, threshold } => {
                write!(f, "validation rejected: score {:.4} <= {:.4}", score, threshold)
            }
            DiscardReason::ValidatorFailed { reason } => write!(f, "validator failed: {}", reason),
        }
    }
}

/// Durable audit record of a closed cycle; raw deltas are not retained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: u64,
    pub state: CycleState,
    pub contributors: Vec<EntityId>,
    pub excluded: Vec<EntityId>,
    pub missing: Vec<EntityId>,
    /// SHA-256 (hex) of each contributor's delta
    pub delta_digests: BTreeMap<EntityId, String>,
    pub aggregate_digest: Option<String>,
    pub validation_score: Option<f64>,
    pub discard_reason: Option<DiscardReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}
