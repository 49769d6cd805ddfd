//! JSON-lines file journal
//!
//! One file per stream (`transactions.jsonl`, `cycles.jsonl`). Every record is
//! flushed with `sync_data` before the append returns. A failed append is
//! truncated back to the last committed byte; if even that fails the journal
//! refuses further appends until it is reopened.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::journal::Journal;
use crate::domain::{CycleRecord, Transaction};
use crate::error::{AgoraError, Result};

const TRANSACTIONS_FILE: &str = "transactions.jsonl";
const CYCLES_FILE: &str = "cycles.jsonl";

pub struct FileJournal {
    directory: PathBuf,
    write_lock: Mutex<()>,
    /// Set when a failed append could not be rolled back
    poisoned: AtomicBool,
    fail_next_sync: AtomicBool,
}

impl FileJournal {
    /// Open (creating if needed) a journal directory
    pub async fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).await?;
        info!("Opened file journal at {}", directory.display());
        Ok(Self {
            directory,
            write_lock: Mutex::new(()),
            poisoned: AtomicBool::new(false),
            fail_next_sync: AtomicBool::new(false),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Make the next append fail after its bytes are written, before they are synced
    pub fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::SeqCst);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    async fn append_line<T: Serialize>(&self, file: &str, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if self.is_poisoned() {
            return Err(AgoraError::Journal(format!(
                "{} refuses appends after a failed rollback",
                self.directory.display()
            )));
        }

        let path = self.directory.join(file);
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let committed = handle.metadata().await?.len();

        if let Err(e) = self.write_synced(&mut handle, &line).await {
            warn!("Append to {} failed, truncating to {}: {}", path.display(), committed, e);
            if let Err(rollback) = truncate(&mut handle, committed).await {
                error!("Rollback of {} failed, journal poisoned: {}", path.display(), rollback);
                self.poisoned.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn write_synced(&self, handle: &mut File, line: &[u8]) -> Result<()> {
        handle.write_all(line).await?;
        handle.flush().await?;
        if self.fail_next_sync.swap(false, Ordering::SeqCst) {
            return Err(AgoraError::Journal("injected sync failure".into()));
        }
        handle.sync_data().await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.directory.join(file);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let last = lines.len().saturating_sub(1);
        let mut records = Vec::with_capacity(lines.len());

        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A torn final line is an append that never committed
                Err(e) if idx == last && !content.ends_with('\n') => {
                    warn!("Ignoring torn trailing record in {}: {}", path.display(), e);
                }
                Err(e) => {
                    return Err(AgoraError::Journal(format!(
                        "corrupt record at {}:{}: {}",
                        path.display(),
                        idx + 1,
                        e
                    )));
                }
            }
        }

        debug!("Loaded {} records from {}", records.len(), path.display());
        Ok(records)
    }
}

async fn truncate(handle: &mut File, len: u64) -> std::io::Result<()> {
    handle.set_len(len).await?;
    handle.sync_data().await
}

#[async_trait]
impl Journal for FileJournal {
    async fn append_transaction(&self, tx: &Transaction) -> Result<()> {
        self.append_line(TRANSACTIONS_FILE, tx).await
    }

    async fn load_transactions(&self) -> Result<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self.read_lines(TRANSACTIONS_FILE).await?;
        txs.sort_by_key(|tx| tx.sequence_number);
        Ok(txs)
    }

    async fn append_cycle_record(&self, record: &CycleRecord) -> Result<()> {
        self.append_line(CYCLES_FILE, record).await
    }

    async fn load_cycle_records(&self) -> Result<Vec<CycleRecord>> {
        let mut records: Vec<CycleRecord> = self.read_lines(CYCLES_FILE).await?;
        records.sort_by_key(|r| r.cycle_id);
        Ok(records)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransferRequest;

    #[tokio::test]
    async fn test_round_trip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let journal = FileJournal::open(dir.path()).await.unwrap();
            for seq in 1..=3 {
                let tx = Transaction::sequenced(TransferRequest::new("mint", "pool", 5, "mint"), seq);
                journal.append_transaction(&tx).await.unwrap();
            }
        }

        let reopened = FileJournal::open(dir.path()).await.unwrap();
        let txs = reopened.load_transactions().await.unwrap();
        assert_eq!(txs.len(), 3);
        assert_eq!(
            txs.iter().map(|t| t.sequence_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(reopened.load_cycle_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::open(dir.path()).await.unwrap();
        let tx = Transaction::sequenced(TransferRequest::new("mint", "pool", 5, "mint"), 1);
        journal.append_transaction(&tx).await.unwrap();

        let path = dir.path().join(TRANSACTIONS_FILE);
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"id\":\"trunc");
        std::fs::write(&path, content).unwrap();

        assert_eq!(journal.load_transactions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_append_leaves_no_bytes_behind() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::open(dir.path()).await.unwrap();
        let path = dir.path().join(TRANSACTIONS_FILE);

        let first = Transaction::sequenced(TransferRequest::new("mint", "pool", 5, "mint"), 1);
        journal.append_transaction(&first).await.unwrap();
        let committed = std::fs::metadata(&path).unwrap().len();

        journal.fail_next_sync();
        let lost = Transaction::sequenced(TransferRequest::new("pool", "a", 2, "op"), 2);
        assert!(journal.append_transaction(&lost).await.is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed);
        assert!(!journal.is_poisoned());

        // The sequence number is reusable and the file stays loadable
        let retry = Transaction::sequenced(TransferRequest::new("pool", "b", 3, "op"), 2);
        journal.append_transaction(&retry).await.unwrap();
        let txs = journal.load_transactions().await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].to_entity, "b");
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let journal = FileJournal::open(dir.path()).await.unwrap();
        let tx = Transaction::sequenced(TransferRequest::new("mint", "pool", 5, "mint"), 1);
        let good = serde_json::to_string(&tx).unwrap();
        std::fs::write(
            dir.path().join(TRANSACTIONS_FILE),
            format!("garbage\n{}\n", good),
        )
        .unwrap();

        assert!(matches!(
            journal.load_transactions().await,
            Err(AgoraError::Journal(_))
        ));
    }
}
