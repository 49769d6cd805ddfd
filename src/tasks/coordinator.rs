//! TaskCoordinator: request → route → authorize → execute → settle
//!
//! Every task runs its own pipeline; pipelines share only the ledger append
//! path. The hand-off to the execution service is the sole suspension point
//! and is bounded by the task deadline: running out of time there expires the
//! task, it does not reject it.
//!
//! Cancellation is honoured in `created`, `quoted` and `authorized`. Once a
//! task is executing, a cancel request is ignored and the task settles
//! normally.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::execution::{ExecutionFailure, ExecutionReport, ExecutionRequest, ExecutorSet};
use super::guard::{Claim, SettlementGuard};
use super::slippage::{detect_slippage, AnomalyLog};
use crate::config::TaskConfig;
use crate::domain::{
    EntityId, RejectReason, Settlement, StateTransition, Task, TaskOutcome, TaskState,
    TransferRequest,
};
use crate::error::{AgoraError, Result};
use crate::ledger::Ledger;
use crate::registry::Registry;
use crate::routing::{RouteCandidate, RouteRequest, Router};

/// Consecutive re-derivations of stale quotes before the pipeline gives up
const MAX_REQUOTES: u32 = 3;

struct TaskEntry {
    task: Task,
    state: TaskState,
    transitions: Vec<StateTransition>,
    cancel_requested: bool,
    started: bool,
    finished_at: Option<Instant>,
    done: watch::Sender<Option<TaskOutcome>>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            task,
            state: TaskState::Created,
            transitions: Vec::new(),
            cancel_requested: false,
            started: false,
            finished_at: None,
            done,
        }
    }
}

/// How a pipeline ended, before the terminal state is recorded
enum Terminal {
    Outcome(TaskOutcome),
    Expired,
}

/// Point-in-time view of one task
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task: Task,
    pub state: TaskState,
    pub transitions: Vec<StateTransition>,
    pub outcome: Option<TaskOutcome>,
}

/// Orchestrates task pipelines; clone freely, clones share state
#[derive(Clone)]
pub struct TaskCoordinator {
    config: TaskConfig,
    quote_staleness_window: u64,
    ledger: Arc<Ledger>,
    registry: Arc<Registry>,
    router: Router,
    executors: Arc<ExecutorSet>,
    guard: Arc<SettlementGuard>,
    anomalies: Arc<AnomalyLog>,
    tasks: Arc<RwLock<HashMap<String, TaskEntry>>>,
}

impl TaskCoordinator {
    pub fn new(
        config: TaskConfig,
        quote_staleness_window: u64,
        ledger: Arc<Ledger>,
        registry: Arc<Registry>,
        router: Router,
        executors: Arc<ExecutorSet>,
    ) -> Self {
        let guard = Arc::new(SettlementGuard::from_ledger(&ledger));
        Self {
            config,
            quote_staleness_window,
            ledger,
            registry,
            router,
            executors,
            guard,
            anomalies: Arc::new(AnomalyLog::default()),
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn anomalies(&self) -> Arc<AnomalyLog> {
        Arc::clone(&self.anomalies)
    }

    pub fn executors(&self) -> Arc<ExecutorSet> {
        Arc::clone(&self.executors)
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Run a task to completion
    ///
    /// Submitting a task id that is already known returns (or waits for) the
    /// existing outcome instead of running it again.
    pub async fn submit(&self, task: Task) -> Result<TaskOutcome> {
        let task_id = task.task_id.clone();

        let known = self.tasks.read().await.contains_key(&task_id);
        if !known {
            if let Some(outcome) = self.settled_before_restart(&task_id) {
                debug!("Task {} already settled on the ledger", task_id);
                return Ok(outcome);
            }
        }

        match self.open(task).await {
            Ok(()) => self.run(&task_id).await,
            Err(AgoraError::DuplicateId(_)) => {
                debug!("Duplicate task request {}, awaiting existing outcome", task_id);
                self.wait_for(&task_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Run a task on its own tokio task
    pub fn spawn(&self, task: Task) -> tokio::task::JoinHandle<Result<TaskOutcome>> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.submit(task).await })
    }

    /// Record a task in `created` without starting it
    pub async fn open(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(AgoraError::DuplicateId(task.task_id));
        }
        debug!(
            "Task {} created by {} for {} (budget {})",
            task.task_id, task.requesting_agent, task.operation_tag, task.budget_ceiling
        );
        tasks.insert(task.task_id.clone(), TaskEntry::new(task));
        Ok(())
    }

    /// Drive an opened task through its pipeline
    #[instrument(skip(self))]
    pub async fn run(&self, task_id: &str) -> Result<TaskOutcome> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(task_id)
                .ok_or_else(|| AgoraError::NotFound(format!("task {}", task_id)))?;
            if entry.started {
                drop(tasks);
                return self.wait_for(task_id).await;
            }
            entry.started = true;
            entry.task.clone()
        };

        let terminal = match self.pipeline(&task).await {
            Ok(outcome) => Terminal::Outcome(outcome),
            Err(AgoraError::Cancelled) => {
                Terminal::Outcome(TaskOutcome::Rejected(RejectReason::Cancelled))
            }
            Err(AgoraError::Expired(reason)) => {
                debug!("Task {} expired: {}", task_id, reason);
                Terminal::Expired
            }
            Err(e) => {
                error!("Task {} failed: {}", task_id, e);
                Terminal::Outcome(TaskOutcome::Rejected(RejectReason::Fault {
                    reason: e.to_string(),
                }))
            }
        };

        Ok(self.finish(task_id, terminal).await)
    }

    /// Request cancellation
    ///
    /// Returns `true` when the cancel will be honoured and `false` when the
    /// task is already executing or finished.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| AgoraError::NotFound(format!("task {}", task_id)))?;

        if !entry.state.is_cancellable() {
            debug!("Cancel of {} ignored in {}", task_id, entry.state);
            return Ok(false);
        }
        entry.cancel_requested = true;
        info!("Task {} cancel requested in {}", task_id, entry.state);
        Ok(true)
    }

    pub async fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.read().await.get(task_id).map(|e| e.state)
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(task_id)?;
        let outcome = entry.done.borrow().clone();
        Some(TaskStatus {
            task: entry.task.clone(),
            state: entry.state,
            transitions: entry.transitions.clone(),
            outcome,
        })
    }

    pub async fn outcome(&self, task_id: &str) -> Option<TaskOutcome> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(task_id)?;
        let outcome = entry.done.borrow().clone();
        outcome
    }

    /// Drop finished tasks older than the retention window
    ///
    /// A settled task that is resubmitted after eviction is still answered
    /// from the ledger, so eviction never causes a second charge.
    pub async fn evict_finished(&self) -> usize {
        let retention = Duration::from_millis(self.config.retention_ms);
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!("Evicted {} finished tasks, {} retained", evicted, tasks.len());
        }
        evicted
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    async fn pipeline(&self, task: &Task) -> Result<TaskOutcome> {
        if task.budget_ceiling <= 0 {
            return Err(AgoraError::Validation(format!(
                "non-positive budget {}",
                task.budget_ceiling
            )));
        }

        // created -> quoted
        let mut queue = self.quote(task, &HashSet::new()).await?;
        if queue.is_empty() {
            info!("Task {}: no candidate for {}", task.task_id, task.operation_tag);
            return Ok(TaskOutcome::Rejected(RejectReason::NoCandidate));
        }

        // quoted -> authorized -> executing, falling back down the ranked list
        let mut tried: HashSet<EntityId> = HashSet::new();
        let mut requotes = 0u32;
        let mut attempts = 0u32;
        let mut last_error = String::new();

        while attempts < self.config.max_attempts {
            self.check_deadline(task)?;
            let Some(candidate) = queue.pop_front() else {
                break;
            };

            // A quote is only honoured while the ledger is within the staleness window
            if candidate
                .quote
                .is_stale(self.ledger.latest_sequence(), self.quote_staleness_window)
            {
                if requotes >= MAX_REQUOTES {
                    warn!(
                        "Task {}: quotes keep going stale, giving up after {} re-derivations",
                        task.task_id, requotes
                    );
                    break;
                }
                requotes += 1;
                debug!(
                    "Task {}: quote for {} from #{} is stale, re-routing",
                    task.task_id, candidate.service_id, candidate.quote.quoted_at_sequence
                );
                queue = self.quote(task, &tried).await?;
                continue;
            }
            requotes = 0;

            let required = candidate.quote.credits();
            let balance = self.ledger.balance(&task.requesting_agent);
            if balance < required {
                info!(
                    "Task {}: {} cannot cover {} ({} < {})",
                    task.task_id, task.requesting_agent, candidate.service_id, balance, required
                );
                return Ok(TaskOutcome::Rejected(RejectReason::InsufficientBalance {
                    balance,
                    required,
                }));
            }
            self.transition(
                &task.task_id,
                TaskState::Authorized,
                format!("{} at {}", candidate.service_id, candidate.quote.unit_price),
            )
            .await?;

            self.check_deadline(task)?;
            self.transition(&task.task_id, TaskState::Executing, candidate.service_id.clone())
                .await?;
            attempts += 1;
            tried.insert(candidate.service_id.clone());

            let failure = match self.execute(task, &candidate).await? {
                Ok(report) if report.actual_cost > 0 => {
                    return self.settle(task, &candidate, report).await;
                }
                Ok(report) => {
                    ExecutionFailure::new(format!("invalid reported cost {}", report.actual_cost))
                }
                Err(failure) => failure,
            };

            warn!(
                "Task {}: {} failed attempt {}: {}",
                task.task_id, candidate.service_id, attempts, failure
            );
            if let Err(e) = self.registry.record_outcome(&candidate.service_id, false) {
                debug!("Outcome not recorded for {}: {}", candidate.service_id, e);
            }
            last_error = failure.reason;
        }

        if attempts == 0 {
            return Ok(TaskOutcome::Rejected(RejectReason::NoCandidate));
        }
        Ok(TaskOutcome::Rejected(RejectReason::ExecutionFailed {
            attempts,
            last_error,
        }))
    }

    /// Rank fresh quotes at the current ledger sequence, skipping services already tried
    async fn quote(
        &self,
        task: &Task,
        tried: &HashSet<EntityId>,
    ) -> Result<VecDeque<RouteCandidate>> {
        self.check_deadline(task)?;
        let request = RouteRequest::for_task(task, self.ledger.latest_sequence());
        let candidates: VecDeque<RouteCandidate> = self
            .router
            .route_with_fallback(&request)
            .into_iter()
            .filter(|c| !tried.contains(&c.service_id))
            .collect();
        if let Some(best) = candidates.front() {
            self.transition(
                &task.task_id,
                TaskState::Quoted,
                format!(
                    "{} candidates at #{}, best {}",
                    candidates.len(),
                    request.at_sequence,
                    best.service_id
                ),
            )
            .await?;
        }
        Ok(candidates)
    }

    async fn execute(
        &self,
        task: &Task,
        candidate: &RouteCandidate,
    ) -> Result<std::result::Result<ExecutionReport, ExecutionFailure>> {
        let Some(executor) = self.executors.get(&candidate.service_id) else {
            return Ok(Err(ExecutionFailure::new("no executor attached")));
        };
        let remaining = task
            .remaining(Utc::now())
            .ok_or_else(|| AgoraError::Expired(format!("deadline {}", task.deadline)))?;

        let request = ExecutionRequest {
            task_id: task.task_id.clone(),
            service_id: candidate.service_id.clone(),
            operation_tag: task.operation_tag.clone(),
            parameters: task.parameters.clone(),
            quoted_price: candidate.quote.unit_price,
            deadline: task.deadline,
        };

        match tokio::time::timeout(remaining, executor.execute(&request)).await {
            Ok(result) => Ok(result),
            Err(_) => Err(AgoraError::Expired(format!(
                "{} did not answer within {}ms",
                candidate.service_id,
                remaining.as_millis()
            ))),
        }
    }

    async fn settle(
        &self,
        task: &Task,
        candidate: &RouteCandidate,
        report: ExecutionReport,
    ) -> Result<TaskOutcome> {
        match self.guard.claim(&task.task_id) {
            Claim::Acquired => {}
            Claim::Settled(seq) => {
                warn!("Task {} already settled at #{}", task.task_id, seq);
                return self
                    .settled_before_restart(&task.task_id)
                    .ok_or_else(|| AgoraError::Internal(format!("settlement #{} missing", seq)));
            }
            Claim::InFlight => {
                return Err(AgoraError::Internal(format!(
                    "concurrent settlement of {}",
                    task.task_id
                )));
            }
        }

        let quoted = candidate.quote.unit_price;
        let anomaly = detect_slippage(
            &task.task_id,
            &candidate.service_id,
            quoted,
            report.actual_cost,
            self.config.slippage_tolerance_pct,
        );

        let transfer = TransferRequest::new(
            &task.requesting_agent,
            &candidate.service_id,
            report.actual_cost,
            &task.operation_tag,
        )
        .with_reference(&task.task_id);

        let sequence = match self.ledger.append(transfer).await {
            Ok(seq) => seq,
            Err(e) => {
                self.guard.release(&task.task_id);
                return match e {
                    AgoraError::InsufficientBalance {
                        balance, required, ..
                    } => {
                        error!(
                            "Task {}: executed but {} cannot pay {} (balance {})",
                            task.task_id, task.requesting_agent, required, balance
                        );
                        Ok(TaskOutcome::Rejected(RejectReason::InsufficientBalance {
                            balance,
                            required,
                        }))
                    }
                    other => Err(other),
                };
            }
        };
        self.guard.confirm(&task.task_id, sequence);

        if let Err(e) = self.registry.record_outcome(&candidate.service_id, true) {
            debug!("Outcome not recorded for {}: {}", candidate.service_id, e);
        }
        if let Some(anomaly) = &anomaly {
            self.anomalies.record(anomaly.clone()).await;
        }

        Ok(TaskOutcome::Settled(Settlement {
            service_id: candidate.service_id.clone(),
            quoted_price: quoted,
            actual_cost: report.actual_cost,
            sequence_number: sequence,
            output: report.output,
            quality_score: report.quality_score,
            anomaly,
        }))
    }

    // =========================================================================
    // State bookkeeping
    // =========================================================================

    fn check_deadline(&self, task: &Task) -> Result<()> {
        if task.is_past_deadline(Utc::now()) {
            return Err(AgoraError::Expired(format!("deadline {}", task.deadline)));
        }
        Ok(())
    }

    async fn transition(&self, task_id: &str, to: TaskState, reason: impl Into<String>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(task_id)
            .ok_or_else(|| AgoraError::NotFound(format!("task {}", task_id)))?;

        if entry.cancel_requested {
            return Err(AgoraError::Cancelled);
        }
        if !entry.state.can_transition_to(to) {
            return Err(AgoraError::InvalidStateTransition {
                from: entry.state.to_string(),
                to: to.to_string(),
            });
        }

        let transition = StateTransition::new(entry.state, to, reason);
        debug!("Task {}: {} -> {} ({})", task_id, transition.from, to, transition.reason);
        entry.transitions.push(transition);
        entry.state = to;
        Ok(())
    }

    async fn finish(&self, task_id: &str, terminal: Terminal) -> TaskOutcome {
        let mut tasks = self.tasks.write().await;
        let Some(entry) = tasks.get_mut(task_id) else {
            // Only finished entries are evicted
            return match terminal {
                Terminal::Outcome(outcome) => outcome,
                Terminal::Expired => TaskOutcome::Expired {
                    last_state: TaskState::Created,
                },
            };
        };

        let outcome = match terminal {
            Terminal::Outcome(outcome) => outcome,
            Terminal::Expired => TaskOutcome::Expired {
                last_state: entry.state,
            },
        };
        let to = outcome.state();
        let reason = match &outcome {
            TaskOutcome::Settled(s) => format!("settled {} at #{}", s.actual_cost, s.sequence_number),
            TaskOutcome::Rejected(reason) => reason.to_string(),
            TaskOutcome::Expired { .. } => "deadline passed".to_string(),
        };

        entry.transitions.push(StateTransition::new(entry.state, to, reason.clone()));
        entry.state = to;
        entry.finished_at = Some(Instant::now());
        entry.done.send_replace(Some(outcome.clone()));

        info!("Task {} {}: {}", task_id, to, reason);
        outcome
    }

    async fn wait_for(&self, task_id: &str) -> Result<TaskOutcome> {
        let mut rx = {
            let tasks = self.tasks.read().await;
            tasks
                .get(task_id)
                .ok_or_else(|| AgoraError::NotFound(format!("task {}", task_id)))?
                .done
                .subscribe()
        };
        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| AgoraError::Internal(format!("task {} dropped", task_id)))?;
        outcome
            .clone()
            .ok_or_else(|| AgoraError::Internal(format!("task {} has no outcome", task_id)))
    }

    /// Outcome reconstructed from a settlement already on the ledger
    fn settled_before_restart(&self, task_id: &str) -> Option<TaskOutcome> {
        self.guard.settled_sequence(task_id)?;
        let tx = self.ledger.find_by_reference(task_id)?;
        Some(TaskOutcome::Settled(Settlement {
            service_id: tx.to_entity,
            quoted_price: Decimal::from(tx.amount),
            actual_cost: tx.amount,
            sequence_number: tx.sequence_number,
            output: serde_json::Value::Null,
            quality_score: None,
            anomaly: None,
        }))
    }
}
