//! Journal trait and the in-memory backend
//!
//! A journal is the durable, append-only record behind the ledger and the
//! aggregation audit trail. Writes are committed once the call returns `Ok`;
//! callers publish state only after that.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::domain::{CycleRecord, Transaction};
use crate::error::{AgoraError, Result};

/// Durable append-only storage for ledger transactions and cycle records
#[async_trait]
pub trait Journal: Send + Sync {
    /// Durably append one sequenced transaction
    async fn append_transaction(&self, tx: &Transaction) -> Result<()>;

    /// All transactions in sequence order
    async fn load_transactions(&self) -> Result<Vec<Transaction>>;

    /// Durably append the audit record of a closed aggregation cycle
    async fn append_cycle_record(&self, record: &CycleRecord) -> Result<()>;

    /// All cycle records in cycle order
    async fn load_cycle_records(&self) -> Result<Vec<CycleRecord>>;

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Non-durable journal for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryJournal {
    transactions: Mutex<Vec<Transaction>>,
    cycles: Mutex<Vec<CycleRecord>>,
    fail_next: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next append fail, simulating a storage fault
    pub fn fail_next_append(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AgoraError::Journal("injected append failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append_transaction(&self, tx: &Transaction) -> Result<()> {
        self.take_failure()?;
        self.transactions.lock().await.push(tx.clone());
        Ok(())
    }

    async fn load_transactions(&self) -> Result<Vec<Transaction>> {
        Ok(self.transactions.lock().await.clone())
    }

    async fn append_cycle_record(&self, record: &CycleRecord) -> Result<()> {
        self.take_failure()?;
        self.cycles.lock().await.push(record.clone());
        Ok(())
    }

    async fn load_cycle_records(&self) -> Result<Vec<CycleRecord>> {
        Ok(self.cycles.lock().await.clone())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransferRequest;

    #[tokio::test]
    async fn test_memory_journal_failure_injection() {
        let journal = MemoryJournal::new();
        let tx = Transaction::sequenced(TransferRequest::new("mint", "pool", 10, "mint"), 1);

        journal.fail_next_append();
        assert!(journal.append_transaction(&tx).await.is_err());
        assert!(journal.load_transactions().await.unwrap().is_empty());

        journal.append_transaction(&tx).await.unwrap();
        assert_eq!(journal.load_transactions().await.unwrap(), vec![tx]);
    }
}
