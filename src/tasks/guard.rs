//! Settlement guard
//!
//! Makes settlement idempotent per task id. Each settlement transaction
//! carries its task id as the ledger reference, so the guard can be rebuilt
//! from the ledger after a restart.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::ledger::Ledger;

/// Result of trying to claim a task for settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Caller owns the settlement and must `confirm` or `release`
    Acquired,
    /// Already settled at this ledger sequence number
    Settled(u64),
    /// Another caller is settling this task right now
    InFlight,
}

#[derive(Default)]
pub struct SettlementGuard {
    /// task id -> settlement sequence (`None` while in flight)
    settled: DashMap<String, Option<u64>>,
}

impl SettlementGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the references recorded on the ledger
    pub fn from_ledger(ledger: &Ledger) -> Self {
        let guard = Self::new();
        for reference in ledger.references() {
            if let Some(tx) = ledger.find_by_reference(&reference) {
                guard.settled.insert(reference, Some(tx.sequence_number));
            }
        }
        info!("Settlement guard rebuilt with {} settled tasks", guard.settled.len());
        guard
    }

    pub fn claim(&self, task_id: &str) -> Claim {
        match self.settled.entry(task_id.to_string()) {
            Entry::Occupied(entry) => match *entry.get() {
                Some(seq) => Claim::Settled(seq),
                None => Claim::InFlight,
            },
            Entry::Vacant(entry) => {
                entry.insert(None);
                Claim::Acquired
            }
        }
    }

    pub fn confirm(&self, task_id: &str, sequence: u64) {
        self.settled.insert(task_id.to_string(), Some(sequence));
    }

    /// Drop a claim whose settlement did not commit
    pub fn release(&self, task_id: &str) {
        self.settled.remove_if(task_id, |_, seq| seq.is_none());
    }

    pub fn settled_sequence(&self, task_id: &str) -> Option<u64> {
        self.settled.get(task_id).and_then(|seq| *seq)
    }
}
