//! Credit Ledger - append-only transaction log with derived balances
//!
//! Appends are serialized by a single async writer lock that is held across
//! validation, sequence assignment and the durable journal write. Readers
//! only take the published-state lock for the O(1) publish step, so a slow
//! journal never blocks balance or history reads.

use std::collections::HashMap;
use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Credits, EntityId, Transaction, TransferRequest, MINT_OPERATION};
use crate::error::{AgoraError, Result};
use crate::persistence::Journal;

/// Balance of one entity right after a transaction touched it
#[derive(Debug, Clone, Copy)]
struct Posting {
    sequence: u64,
    balance_after: Credits,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// Index `i` holds sequence number `i + 1`
    transactions: Vec<Arc<Transaction>>,
    balances: HashMap<EntityId, Credits>,
    postings: HashMap<EntityId, Vec<Posting>>,
    references: HashMap<String, u64>,
    minted: Credits,
}

impl LedgerState {
    fn latest_sequence(&self) -> u64 {
        self.transactions.len() as u64
    }

    fn balance(&self, entity: &str) -> Credits {
        self.balances.get(entity).copied().unwrap_or(0)
    }

    fn apply(&mut self, tx: Transaction, mint_entity: &str) {
        let tx = Arc::new(tx);
        let mut touched: Vec<&str> = vec![tx.from_entity.as_str()];
        if tx.to_entity != tx.from_entity {
            touched.push(tx.to_entity.as_str());
        }

        for entity in touched {
            let balance = self.balances.entry(entity.to_string()).or_insert(0);
            *balance += tx.delta_for(entity);
            self.postings
                .entry(entity.to_string())
                .or_default()
                .push(Posting {
                    sequence: tx.sequence_number,
                    balance_after: *balance,
                });
        }

        if tx.from_entity == mint_entity && tx.operation_tag == MINT_OPERATION {
            self.minted += tx.amount;
        }
        if let Some(reference) = &tx.reference {
            self.references.insert(reference.clone(), tx.sequence_number);
        }
        self.transactions.push(tx);
    }
}

/// Ledger construction parameters
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Source entity of minted credits; the only entity allowed a negative balance
    pub mint_entity: EntityId,
    /// Cap on the total credits ever minted
    pub max_supply: Option<Credits>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            mint_entity: "mint".to_string(),
            max_supply: None,
        }
    }
}

impl From<&crate::config::LedgerConfig> for LedgerOptions {
    fn from(config: &crate::config::LedgerConfig) -> Self {
        Self {
            mint_entity: config.mint_entity.clone(),
            max_supply: config.max_supply,
        }
    }
}

/// Append-only credit ledger
pub struct Ledger {
    options: LedgerOptions,
    journal: Arc<dyn Journal>,
    writer: Mutex<()>,
    state: Arc<RwLock<LedgerState>>,
}

impl Ledger {
    /// Open a ledger, replaying everything already in the journal
    pub async fn open(journal: Arc<dyn Journal>, options: LedgerOptions) -> Result<Self> {
        let mut state = LedgerState::default();

        for (idx, tx) in journal.load_transactions().await?.into_iter().enumerate() {
            let expected = idx as u64 + 1;
            if tx.sequence_number != expected {
                return Err(AgoraError::Journal(format!(
                    "sequence gap in journal: expected {}, found {}",
                    expected, tx.sequence_number
                )));
            }
            state.apply(tx, &options.mint_entity);
        }

        info!(
            "Ledger opened from {} journal at sequence {} (minted {})",
            journal.backend_name(),
            state.latest_sequence(),
            state.minted
        );

        Ok(Self {
            options,
            journal,
            writer: Mutex::new(()),
            state: Arc::new(RwLock::new(state)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mint_entity(&self) -> &str {
        &self.options.mint_entity
    }

    /// Validate, sequence, journal and publish one transfer
    ///
    /// Fails with `InvalidAmount` for a zero amount and `InsufficientBalance`
    /// when the payer (anyone but the mint) would go negative. A failed append
    /// leaves the ledger untouched.
    #[instrument(skip(self, request), fields(op = %request.operation_tag))]
    pub async fn append(&self, request: TransferRequest) -> Result<u64> {
        let magnitude = match request.amount.checked_abs() {
            Some(0) | None => return Err(AgoraError::InvalidAmount(request.amount)),
            Some(m) => m,
        };

        let _writer = self.writer.lock().await;

        let (sequence, payer_balance, minted) = {
            let state = self.read();
            (
                state.latest_sequence() + 1,
                state.balance(request.payer()),
                state.minted,
            )
        };

        let is_mint = request.payer() == self.options.mint_entity;
        if is_mint {
            if request.operation_tag != MINT_OPERATION {
                return Err(AgoraError::Validation(format!(
                    "{} may only pay out mint transactions",
                    self.options.mint_entity
                )));
            }
            if let Some(cap) = self.options.max_supply {
                if minted.saturating_add(magnitude) > cap {
                    return Err(AgoraError::SupplyCapReached { minted, cap });
                }
            }
        } else if payer_balance < magnitude {
            warn!(
                "Rejected {} credits from {}: balance {}",
                magnitude,
                request.payer(),
                payer_balance
            );
            return Err(AgoraError::InsufficientBalance {
                entity: request.payer().to_string(),
                balance: payer_balance,
                required: magnitude,
            });
        }

        let tx = Transaction::sequenced(request, sequence);
        self.journal.append_transaction(&tx).await?;

        debug!(
            "Appended #{}: {} -> {} ({} credits, {})",
            tx.sequence_number, tx.from_entity, tx.to_entity, tx.amount, tx.operation_tag
        );
        self.write().apply(tx, &self.options.mint_entity);
        Ok(sequence)
    }

    /// Transfer `amount` credits between two entities
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Credits,
        operation_tag: &str,
    ) -> Result<u64> {
        self.append(TransferRequest::new(from, to, amount, operation_tag))
            .await
    }

    /// Mint new credits from the designated mint entity
    pub async fn mint(&self, to: &str, amount: Credits) -> Result<u64> {
        if amount <= 0 {
            return Err(AgoraError::InvalidAmount(amount));
        }
        let seq = self
            .append(TransferRequest::new(
                &self.options.mint_entity,
                to,
                amount,
                MINT_OPERATION,
            ))
            .await?;
        info!("Minted {} credits to {} (#{})", amount, to, seq);
        Ok(seq)
    }

    /// Current balance of `entity`
    pub fn balance(&self, entity: &str) -> Credits {
        self.read().balance(entity)
    }

    /// Balance of `entity` after the transaction with sequence number `as_of`
    pub fn balance_as_of(&self, entity: &str, as_of: u64) -> Credits {
        let state = self.read();
        let Some(postings) = state.postings.get(entity) else {
            return 0;
        };
        let idx = postings.partition_point(|p| p.sequence <= as_of);
        if idx == 0 {
            0
        } else {
            postings[idx - 1].balance_after
        }
    }

    /// Sequence number of the most recent committed transaction (0 when empty)
    pub fn latest_sequence(&self) -> u64 {
        self.read().latest_sequence()
    }

    /// Total credits minted so far
    pub fn total_minted(&self) -> Credits {
        self.read().minted
    }

    /// Snapshot of every non-zero balance
    pub fn balances(&self) -> HashMap<EntityId, Credits> {
        self.read()
            .balances
            .iter()
            .filter(|(_, b)| **b != 0)
            .map(|(e, b)| (e.clone(), *b))
            .collect()
    }

    /// Sum of all balances; zero at every point in history
    pub fn net_balance(&self) -> Credits {
        self.read().balances.values().sum()
    }

    /// Transaction carrying the given reference (task id for settlements)
    pub fn find_by_reference(&self, reference: &str) -> Option<Transaction> {
        let state = self.read();
        let seq = *state.references.get(reference)?;
        state
            .transactions
            .get((seq - 1) as usize)
            .map(|tx| tx.as_ref().clone())
    }

    /// Every reference recorded on the ledger
    pub fn references(&self) -> Vec<String> {
        self.read().references.keys().cloned().collect()
    }

    /// Per-operation transaction counts over the last `window` sequence numbers,
    /// together with the sequence number the counts were taken at
    pub fn operation_counts(&self, window: u64) -> (HashMap<String, u64>, u64) {
        let state = self.read();
        let latest = state.latest_sequence();
        let start = latest.saturating_sub(window) as usize;

        let mut counts = HashMap::new();
        for tx in &state.transactions[start..] {
            if tx.operation_tag != MINT_OPERATION {
                *counts.entry(tx.operation_tag.clone()).or_insert(0) += 1;
            }
        }
        (counts, latest)
    }

    /// Transactions touching `entity` within `range` of sequence numbers
    ///
    /// The upper bound is pinned to the latest sequence at call time, so the
    /// returned history is a consistent prefix even while appends continue.
    pub fn history<R: RangeBounds<u64>>(&self, entity: &str, range: R) -> LedgerHistory {
        self.history_inner(Some(entity.to_string()), range)
    }

    /// Every transaction within `range` of sequence numbers
    pub fn log<R: RangeBounds<u64>>(&self, range: R) -> LedgerHistory {
        self.history_inner(None, range)
    }

    fn history_inner<R: RangeBounds<u64>>(
        &self,
        entity: Option<EntityId>,
        range: R,
    ) -> LedgerHistory {
        let latest = self.latest_sequence();
        let from = match range.start_bound() {
            Bound::Included(s) => *s,
            Bound::Excluded(s) => s.saturating_add(1),
            Bound::Unbounded => 1,
        }
        .max(1);
        let to = match range.end_bound() {
            Bound::Included(e) => *e,
            Bound::Excluded(e) => e.saturating_sub(1),
            Bound::Unbounded => latest,
        }
        .min(latest);

        LedgerHistory {
            state: Arc::clone(&self.state),
            entity,
            from,
            to,
        }
    }
}

/// Lazy, restartable view over a range of the ledger
///
/// Each call to [`LedgerHistory::iter`] starts again from the beginning of the
/// range; items are read from the ledger one at a time.
#[derive(Clone)]
pub struct LedgerHistory {
    state: Arc<RwLock<LedgerState>>,
    entity: Option<EntityId>,
    from: u64,
    to: u64,
}

impl LedgerHistory {
    pub fn iter(&self) -> HistoryIter<'_> {
        HistoryIter {
            history: self,
            cursor: None,
        }
    }

    /// Number of transactions in the view
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Inclusive sequence range covered by this view
    pub fn bounds(&self) -> (u64, u64) {
        (self.from, self.to)
    }
}

impl<'a> IntoIterator for &'a LedgerHistory {
    type Item = Transaction;
    type IntoIter = HistoryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct HistoryIter<'a> {
    history: &'a LedgerHistory,
    /// Next index into the entity's postings, or next sequence for the full log
    cursor: Option<usize>,
}

impl Iterator for HistoryIter<'_> {
    type Item = Transaction;

    fn next(&mut self) -> Option<Self::Item> {
        let history = self.history;
        if history.from > history.to {
            return None;
        }
        let state = history
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let sequence = match &history.entity {
            Some(entity) => {
                let postings = state.postings.get(entity)?;
                let idx = *self
                    .cursor
                    .get_or_insert_with(|| postings.partition_point(|p| p.sequence < history.from));
                let posting = postings.get(idx)?;
                self.cursor = Some(idx + 1);
                posting.sequence
            }
            None => {
                let seq = *self.cursor.get_or_insert(history.from as usize) as u64;
                self.cursor = Some(seq as usize + 1);
                seq
            }
        };

        if sequence > history.to {
            return None;
        }
        state
            .transactions
            .get((sequence - 1) as usize)
            .map(|tx| tx.as_ref().clone())
    }
}
