//! AggregationCoordinator: federated update collection and publication
//!
//! One cycle at a time: `collecting → aggregating → validating →
//! published | discarded`. Collection ends when every expected producer has
//! reported or the collection timeout elapses, whichever is first; a partial
//! set is aggregated from whoever responded. The next cycle opens as soon as
//! collection ends, so late updates for a closed cycle are ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::weights::{digest, weighted_average};
use crate::config::AggregationConfig;
use crate::domain::{
    AggregationCycle, CycleRecord, CycleState, DiscardReason, EntityId, EntityKind,
    LearningUpdate,
};
use crate::error::{AgoraError, Result};
use crate::persistence::Journal;
use crate::registry::Registry;

/// Scores a candidate aggregate (higher is better)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, cycle_id: u64, candidate: &[u8]) -> Result<f64>;
}

/// Announces a newly published aggregate to the producers
#[async_trait]
pub trait ModelPublisher: Send + Sync {
    async fn publish(&self, model: &PublishedModel) -> Result<()>;
}

/// Aggregate that passed validation and became the new base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedModel {
    pub cycle_id: u64,
    /// SHA-256 (hex) of `weights`; the reference announced to producers
    pub digest: String,
    pub weights: Vec<u8>,
    pub contributors: Vec<EntityId>,
    pub validation_score: f64,
    pub published_at: DateTime<Utc>,
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Published {
        record: CycleRecord,
        model: PublishedModel,
    },
    Discarded {
        record: CycleRecord,
    },
}

impl CycleOutcome {
    pub fn record(&self) -> &CycleRecord {
        match self {
            CycleOutcome::Published { record, .. } | CycleOutcome::Discarded { record } => record,
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, CycleOutcome::Published { .. })
    }
}

/// Result of handing an update to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAck {
    /// Stored for the active cycle; `replaced` when it overwrote an earlier update
    Accepted { replaced: bool },
    /// Update addressed a cycle other than the active one
    Ignored { active_cycle: u64 },
}

pub struct AggregationCoordinator {
    config: AggregationConfig,
    registry: Arc<Registry>,
    journal: Arc<dyn Journal>,
    validator: Arc<dyn Validator>,
    publisher: Arc<dyn ModelPublisher>,
    active: Mutex<AggregationCycle>,
    complete: Notify,
    latest: RwLock<Option<PublishedModel>>,
}

impl AggregationCoordinator {
    /// Resume after the highest cycle id found in the journal
    pub async fn open(
        config: AggregationConfig,
        registry: Arc<Registry>,
        journal: Arc<dyn Journal>,
        validator: Arc<dyn Validator>,
        publisher: Arc<dyn ModelPublisher>,
    ) -> Result<Self> {
        let records = journal.load_cycle_records().await?;
        let next_cycle = records.iter().map(|r| r.cycle_id).max().unwrap_or(0) + 1;

        let expected = registry.find_by_capability(&config.producer_capability, Some(EntityKind::Agent));
        info!(
            "Aggregation resuming at cycle {} ({} recorded, {} producers)",
            next_cycle,
            records.len(),
            expected.len()
        );

        Ok(Self {
            active: Mutex::new(AggregationCycle::open(next_cycle, expected)),
            config,
            registry,
            journal,
            validator,
            publisher,
            complete: Notify::new(),
            latest: RwLock::new(None),
        })
    }

    pub async fn current_cycle_id(&self) -> u64 {
        self.active.lock().await.cycle_id
    }

    /// Producers the active cycle still waits for
    pub async fn missing_producers(&self) -> Vec<EntityId> {
        self.active.lock().await.missing_producers()
    }

    pub async fn latest_model(&self) -> Option<PublishedModel> {
        self.latest.read().await.clone()
    }

    /// Re-read the active cycle's expected producers from the registry
    pub async fn refresh_producers(&self) -> usize {
        let expected = self
            .registry
            .find_by_capability(&self.config.producer_capability, Some(EntityKind::Agent));
        let mut cycle = self.active.lock().await;
        cycle.received.retain(|producer, _| expected.contains(producer));
        cycle.expected_producers = expected;
        if cycle.is_complete() {
            self.complete.notify_one();
        }
        cycle.expected_producers.len()
    }

    /// Accept an update for the active cycle (last write wins per producer)
    pub async fn submit(&self, update: LearningUpdate) -> Result<SubmitAck> {
        let mut cycle = self.active.lock().await;

        if update.cycle_id != cycle.cycle_id {
            debug!(
                "Ignoring update from {} for cycle {} (active {})",
                update.producer_id, update.cycle_id, cycle.cycle_id
            );
            return Ok(SubmitAck::Ignored {
                active_cycle: cycle.cycle_id,
            });
        }
        if !cycle.expected_producers.contains(&update.producer_id) {
            return Err(AgoraError::NotFound(format!(
                "producer {} in cycle {}",
                update.producer_id, cycle.cycle_id
            )));
        }

        let producer = update.producer_id.clone();
        let replaced = cycle.received.insert(producer.clone(), update).is_some();
        debug!(
            "Cycle {}: update from {}{} ({}/{})",
            cycle.cycle_id,
            producer,
            if replaced { " (replaced)" } else { "" },
            cycle.received.len(),
            cycle.expected_producers.len()
        );

        if cycle.is_complete() {
            self.complete.notify_one();
        }
        Ok(SubmitAck::Accepted { replaced })
    }

    /// Wait for a full set or the collection timeout, then close the cycle
    ///
    /// While no producer is registered the cycle stays open: each timeout
    /// re-reads the registry instead of recording an empty cycle.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let timeout = Duration::from_millis(self.config.collection_timeout_ms);
        let mut deadline = Instant::now() + timeout;

        loop {
            let notified = self.complete.notified();
            if self.active.lock().await.is_complete() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let idle = self.active.lock().await.expected_producers.is_empty();
                if !idle {
                    debug!("Collection timeout reached");
                    break;
                }
                let producers = self.refresh_producers().await;
                if producers == 0 {
                    debug!("No producers registered, cycle stays open");
                } else {
                    debug!("{} producers joined, collection restarted", producers);
                }
                deadline = Instant::now() + timeout;
            }
        }

        self.close_cycle().await
    }

    /// End collection now and finish the cycle with whatever has arrived
    pub async fn close_cycle(&self) -> Result<CycleOutcome> {
        let mut cycle = {
            let mut active = self.active.lock().await;
            let expected = self
                .registry
                .find_by_capability(&self.config.producer_capability, Some(EntityKind::Agent));
            let next = AggregationCycle::open(active.cycle_id + 1, expected);
            std::mem::replace(&mut *active, next)
        };

        let missing = cycle.missing_producers();
        if !missing.is_empty() {
            warn!(
                "Cycle {} closing without {} producer(s): {:?}",
                cycle.cycle_id,
                missing.len(),
                missing
            );
        }

        let outcome = self.finish(&mut cycle, missing).await;
        self.journal.append_cycle_record(outcome.record()).await?;

        if let CycleOutcome::Published { model, .. } = &outcome {
            *self.latest.write().await = Some(model.clone());
            if let Err(e) = self.publisher.publish(model).await {
                error!("Failed to announce cycle {}: {}", model.cycle_id, e);
            }
        }

        let record = outcome.record();
        info!(
            "Cycle {} {}: {} contributors, {} excluded{}",
            record.cycle_id,
            record.state,
            record.contributors.len(),
            record.excluded.len(),
            record
                .discard_reason
                .as_ref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        Ok(outcome)
    }

    async fn finish(&self, cycle: &mut AggregationCycle, missing: Vec<EntityId>) -> CycleOutcome {
        let delta_digests: BTreeMap<EntityId, String> = cycle
            .received
            .iter()
            .map(|(producer, update)| (producer.clone(), digest(&update.delta_weights)))
            .collect();
        let mut record = CycleRecord {
            cycle_id: cycle.cycle_id,
            state: CycleState::Collecting,
            contributors: Vec::new(),
            excluded: Vec::new(),
            missing,
            delta_digests,
            aggregate_digest: None,
            validation_score: None,
            discard_reason: None,
            opened_at: cycle.opened_at,
            closed_at: Utc::now(),
        };

        let received = cycle.received.len();
        if received < self.config.min_quorum {
            return discard(
                cycle,
                record,
                DiscardReason::QuorumNotMet {
                    received,
                    required: self.config.min_quorum,
                },
            );
        }

        // collecting -> aggregating
        advance(cycle, CycleState::Aggregating);
        let aggregate = match weighted_average(cycle.cycle_id, cycle.received.values()) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                warn!("Cycle {}: {}", cycle.cycle_id, e);
                record.excluded = sorted_keys(cycle);
                return discard(cycle, record, DiscardReason::NoValidUpdates);
            }
        };
        // Raw deltas are not kept past aggregation
        cycle.received.clear();

        record.contributors = aggregate.contributors();
        record.excluded = aggregate.excluded.clone();
        let weights = aggregate.encoded();
        let aggregate_digest = digest(&weights);
        record.aggregate_digest = Some(aggregate_digest.clone());

        // aggregating -> validating
        advance(cycle, CycleState::Validating);
        let score = match self.validator.validate(cycle.cycle_id, &weights).await {
            Ok(score) => score,
            Err(e) => {
                return discard(
                    cycle,
                    record,
                    DiscardReason::ValidatorFailed {
                        reason: e.to_string(),
                    },
                );
            }
        };
        record.validation_score = Some(score);

        let threshold = self.config.acceptance_threshold;
        if score.is_nan() || score <= threshold {
            return discard(cycle, record, DiscardReason::ValidationRejected { score, threshold });
        }

        advance(cycle, CycleState::Published);
        record.state = CycleState::Published;
        record.closed_at = Utc::now();
        let model = PublishedModel {
            cycle_id: cycle.cycle_id,
            digest: aggregate_digest,
            weights,
            contributors: record.contributors.clone(),
            validation_score: score,
            published_at: record.closed_at,
        };
        CycleOutcome::Published { record, model }
    }

    /// Run cycles back to back until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Aggregation loop started");
        loop {
            tokio::select! {
                result = self.run_cycle() => {
                    if let Err(e) = result {
                        error!("Aggregation cycle failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Aggregation loop stopped");
    }
}

fn advance(cycle: &mut AggregationCycle, to: CycleState) {
    debug_assert!(cycle.state.can_transition_to(to));
    debug!("Cycle {}: {} -> {}", cycle.cycle_id, cycle.state, to);
    cycle.state = to;
}

fn sorted_keys(cycle: &AggregationCycle) -> Vec<EntityId> {
    let mut keys: Vec<EntityId> = cycle.received.keys().cloned().collect();
    keys.sort();
    keys
}

fn discard(
    cycle: &mut AggregationCycle,
    mut record: CycleRecord,
    reason: DiscardReason,
) -> CycleOutcome {
    advance(cycle, CycleState::Discarded);
    cycle.received.clear();
    record.state = CycleState::Discarded;
    record.discard_reason = Some(reason);
    record.closed_at = Utc::now();
    CycleOutcome::Discarded { record }
}
