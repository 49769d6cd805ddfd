//! PostgreSQL journal

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::journal::Journal;
use crate::domain::{CycleRecord, Transaction};
use crate::error::{AgoraError, Result};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresJournal {
    pool: PgPool,
}

impl PostgresJournal {
    /// Connect and run migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        let journal = Self { pool };
        journal.migrate().await?;
        Ok(journal)
    }

    /// Create a journal from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Journal for PostgresJournal {
    #[instrument(skip(self, tx), fields(seq = tx.sequence_number))]
    async fn append_transaction(&self, tx: &Transaction) -> Result<()> {
        let sequence = i64::try_from(tx.sequence_number)
            .map_err(|_| AgoraError::Journal("sequence number overflow".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO ledger_transactions
            (sequence_number, id, from_entity, to_entity, amount, operation_tag, reference, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(sequence)
        .bind(tx.id)
        .bind(&tx.from_entity)
        .bind(&tx.to_entity)
        .bind(tx.amount)
        .bind(&tx.operation_tag)
        .bind(&tx.reference)
        .bind(tx.timestamp)
        .execute(&self.pool)
        .await?;

        debug!("Journaled transaction {}", tx.sequence_number);
        Ok(())
    }

    async fn load_transactions(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_number, id, from_entity, to_entity, amount,
                   operation_tag, reference, created_at
            FROM ledger_transactions
            ORDER BY sequence_number ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Transaction> {
                let sequence: i64 = row.try_get("sequence_number")?;
                Ok(Transaction {
                    id: row.try_get("id")?,
                    from_entity: row.try_get("from_entity")?,
                    to_entity: row.try_get("to_entity")?,
                    amount: row.try_get("amount")?,
                    operation_tag: row.try_get("operation_tag")?,
                    reference: row.try_get("reference")?,
                    timestamp: row.try_get("created_at")?,
                    sequence_number: sequence as u64,
                })
            })
            .collect()
    }

    #[instrument(skip(self, record), fields(cycle = record.cycle_id))]
    async fn append_cycle_record(&self, record: &CycleRecord) -> Result<()> {
        let cycle_id = i64::try_from(record.cycle_id)
            .map_err(|_| AgoraError::Journal("cycle id overflow".to_string()))?;
        let payload = serde_json::to_value(record)?;

        sqlx::query(
            r#"
            INSERT INTO aggregation_cycles (cycle_id, state, record, closed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(cycle_id)
        .bind(record.state.as_str())
        .bind(&payload)
        .bind(record.closed_at)
        .execute(&self.pool)
        .await?;

        debug!("Journaled cycle {} ({})", record.cycle_id, record.state);
        Ok(())
    }

    async fn load_cycle_records(&self) -> Result<Vec<CycleRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM aggregation_cycles
            ORDER BY cycle_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<CycleRecord> {
                let payload: serde_json::Value = row.try_get("record")?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
