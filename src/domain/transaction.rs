use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::EntityId;

/// Internal unit of account
pub type Credits = i64;

/// Operation tag carried by mint transactions
pub const MINT_OPERATION: &str = "mint";

/// A transfer request before the ledger has sequenced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    /// Signed, non-zero. A negative amount moves credits from `to_entity` to `from_entity`.
    pub amount: Credits,
    pub operation_tag: String,
    /// Correlation key (task id for settlements)
    pub reference: Option<String>,
}

impl TransferRequest {
    pub fn new(from: &str, to: &str, amount: Credits, operation_tag: &str) -> Self {
        Self {
            from_entity: from.to_string(),
            to_entity: to.to_string(),
            amount,
            operation_tag: operation_tag.to_string(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    /// Entity whose balance decreases
    pub fn payer(&self) -> &str {
        if self.amount >= 0 {
            &self.from_entity
        } else {
            &self.to_entity
        }
    }

    /// Entity whose balance increases
    pub fn payee(&self) -> &str {
        if self.amount >= 0 {
            &self.to_entity
        } else {
            &self.from_entity
        }
    }
}

/// Immutable, sequenced ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    pub amount: Credits,
    pub operation_tag: String,
    pub reference: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
}

impl Transaction {
    pub(crate) fn sequenced(request: TransferRequest, sequence_number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_entity: request.from_entity,
            to_entity: request.to_entity,
            amount: request.amount,
            operation_tag: request.operation_tag,
            reference: request.reference,
            timestamp: Utc::now(),
            sequence_number,
        }
    }

    /// Signed balance change this transaction applies to `entity`
    pub fn delta_for(&self, entity: &str) -> Credits {
        let mut delta = 0;
        if self.from_entity == entity {
            delta -= self.amount;
        }
        if self.to_entity == entity {
            delta += self.amount;
        }
        delta
    }

    pub fn involves(&self, entity: &str) -> bool {
        self.from_entity == entity || self.to_entity == entity
    }
}

/// Price of one operation at one service, pinned to a ledger sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub operation_tag: String,
    pub service_id: EntityId,
    pub unit_price: Decimal,
    pub estimated_latency_ms: u64,
    pub quoted_at_sequence: u64,
}

impl PriceQuote {
    /// A quote is stale once the ledger has advanced more than `window` past it
    pub fn is_stale(&self, current_sequence: u64, window: u64) -> bool {
        current_sequence.saturating_sub(self.quoted_at_sequence) > window
    }

    /// Quoted price rounded up to whole credits
    pub fn credits(&self) -> Credits {
        use rust_decimal::prelude::ToPrimitive;
        self.unit_price.ceil().to_i64().unwrap_or(Credits::MAX)
    }
}
