use serde::{Deserialize, Serialize};
use std::fmt;

/// Task pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Request accepted, not yet routed
    Created,
    /// Ranked candidates and quotes available
    Quoted,
    /// Requesting agent can cover the top quote
    Authorized,
    /// Handed to the execution collaborator
    Executing,
    /// Cost settled on the ledger
    Settled,
    /// No candidate, insufficient balance, execution failure, or cancellation
    Rejected,
    /// Deadline passed before settlement
    Expired,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Quoted => "QUOTED",
            TaskState::Authorized => "AUTHORIZED",
            TaskState::Executing => "EXECUTING",
            TaskState::Settled => "SETTLED",
            TaskState::Rejected => "REJECTED",
            TaskState::Expired => "EXPIRED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        match (self, target) {
            // Any non-terminal state may expire
            (from, Expired) => !from.is_terminal(),

            (Created, Quoted) => true,
            (Created, Rejected) => true, // No candidate or cancelled

            (Quoted, Authorized) => true,
            (Quoted, Rejected) => true,
            (Quoted, Quoted) => true, // Stale quote re-derived

            (Authorized, Executing) => true,
            (Authorized, Rejected) => true, // Cancelled before hand-off

            (Executing, Settled) => true,
            (Executing, Rejected) => true,   // Every candidate failed
            (Executing, Authorized) => true, // Retry against next candidate
            (Executing, Quoted) => true,     // Fallback quote went stale, re-routed

            _ => false,
        }
    }

    /// Terminal states end the pipeline
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Settled | TaskState::Rejected | TaskState::Expired
        )
    }

    /// States in which a cancellation request is honoured
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TaskState::Created | TaskState::Quoted | TaskState::Authorized
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TaskState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(TaskState::Created),
            "QUOTED" => Ok(TaskState::Quoted),
            "AUTHORIZED" => Ok(TaskState::Authorized),
            "EXECUTING" => Ok(TaskState::Executing),
            "SETTLED" => Ok(TaskState::Settled),
            "REJECTED" => Ok(TaskState::Rejected),
            "EXPIRED" => Ok(TaskState::Expired),
            _ => Err(format!("Unknown task state: {}", s)),
        }
    }
}

/// Aggregation cycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleState {
    Collecting,
    Aggregating,
    Validating,
    Published,
    Discarded,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Collecting => "COLLECTING",
            CycleState::Aggregating => "AGGREGATING",
            CycleState::Validating => "VALIDATING",
            CycleState::Published => "PUBLISHED",
            CycleState::Discarded => "DISCARDED",
        }
    }

    pub fn can_transition_to(&self, target: CycleState) -> bool {
        use CycleState::*;

        matches!(
            (self, target),
            (Collecting, Aggregating)
                | (Collecting, Discarded) // Quorum not met
                | (Aggregating, Validating)
                | (Aggregating, Discarded) // No valid updates
                | (Validating, Published)
                | (Validating, Discarded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Published | CycleState::Discarded)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: TaskState, to: TaskState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_transitions() {
        use TaskState::*;

        assert!(Created.can_transition_to(Quoted));
        assert!(Created.can_transition_to(Rejected));
        assert!(Quoted.can_transition_to(Authorized));
        assert!(Authorized.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Settled));
        assert!(Executing.can_transition_to(Authorized));
        assert!(Executing.can_transition_to(Quoted));
        assert!(Executing.can_transition_to(Expired));

        assert!(!Created.can_transition_to(Executing));
        assert!(!Quoted.can_transition_to(Settled));
        assert!(!Settled.can_transition_to(Expired));
        assert!(!Rejected.can_transition_to(Quoted));
        assert!(!Expired.can_transition_to(Expired));
    }

    #[test]
    fn test_cancellable() {
        assert!(TaskState::Created.is_cancellable());
        assert!(TaskState::Authorized.is_cancellable());
        assert!(!TaskState::Executing.is_cancellable());
        assert!(!TaskState::Settled.is_cancellable());
    }

    #[test]
    fn test_task_state_from_str() {
        assert_eq!(TaskState::try_from("settled").unwrap(), TaskState::Settled);
        assert!(TaskState::try_from("done").is_err());
    }

    #[test]
    fn test_cycle_transitions() {
        use CycleState::*;

        assert!(Collecting.can_transition_to(Aggregating));
        assert!(Aggregating.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Published));
        assert!(Validating.can_transition_to(Discarded));
        assert!(!Collecting.can_transition_to(Published));
        assert!(!Published.can_transition_to(Collecting));
        assert!(Discarded.is_terminal());
    }
}
