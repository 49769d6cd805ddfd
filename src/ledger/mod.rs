//! Credit ledger
//!
//! - `Ledger`: append-only transaction log with derived balances
//! - `MintScheduler`: the only source of new credits

#[allow(clippy::module_inception)]
mod ledger;
mod mint;

pub use ledger::{HistoryIter, Ledger, LedgerHistory, LedgerOptions};
pub use mint::MintScheduler;
