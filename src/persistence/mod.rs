//! Persistence Layer
//!
//! Durable append-only storage for ledger transactions and aggregation
//! cycle records:
//! - In-memory journal for tests and ephemeral runs
//! - JSON-lines file journal
//! - PostgreSQL journal

pub mod file;
pub mod journal;
pub mod postgres;

pub use file::FileJournal;
pub use journal::{Journal, MemoryJournal};
pub use postgres::PostgresJournal;

use std::sync::Arc;

use crate::config::{JournalBackend, PersistenceConfig};
use crate::error::{AgoraError, Result};

/// Open the journal selected by configuration
pub async fn open_journal(config: &PersistenceConfig) -> Result<Arc<dyn Journal>> {
    let journal: Arc<dyn Journal> = match config.backend {
        JournalBackend::Memory => Arc::new(MemoryJournal::new()),
        JournalBackend::File => Arc::new(FileJournal::open(&config.directory).await?),
        JournalBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                AgoraError::Validation("persistence.database_url is not set".to_string())
            })?;
            Arc::new(PostgresJournal::connect(url, config.max_connections).await?)
        }
    };
    tracing::info!("Using {} journal", journal.backend_name());
    Ok(journal)
}
