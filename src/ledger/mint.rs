//! Scheduled mint events
//!
//! Credits enter the economy only here: one fixed-amount mint from the mint
//! entity to the pool per interval, until the supply cap is reached.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::Ledger;
use crate::config::LedgerConfig;
use crate::error::{AgoraError, Result};

pub struct MintScheduler {
    ledger: Arc<Ledger>,
    pool_entity: String,
    mint_amount: i64,
    interval: Option<Duration>,
}

impl MintScheduler {
    pub fn new(ledger: Arc<Ledger>, config: &LedgerConfig) -> Self {
        let interval = (config.mint_interval_secs > 0)
            .then(|| Duration::from_secs(config.mint_interval_secs));
        Self {
            ledger,
            pool_entity: config.pool_entity.clone(),
            mint_amount: config.mint_amount,
            interval,
        }
    }

    /// Mint the genesis supply into the pool if nothing has been minted yet
    pub async fn ensure_genesis(&self) -> Result<Option<u64>> {
        if self.ledger.total_minted() > 0 {
            return Ok(None);
        }
        let seq = self.ledger.mint(&self.pool_entity, self.mint_amount).await?;
        info!("Genesis mint of {} to {}", self.mint_amount, self.pool_entity);
        Ok(Some(seq))
    }

    /// One scheduled mint; `Ok(None)` once the supply cap is reached
    pub async fn tick(&self) -> Result<Option<u64>> {
        match self.ledger.mint(&self.pool_entity, self.mint_amount).await {
            Ok(seq) => Ok(Some(seq)),
            Err(AgoraError::SupplyCapReached { minted, cap }) => {
                info!("Supply cap reached ({} of {}), mint schedule finished", minted, cap);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the schedule until shutdown or until the cap is reached
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Some(period) = self.interval else {
            return;
        };

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; genesis already covered it
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.tick().await {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) if e.is_rejection() => {
                            warn!("Scheduled mint rejected: {}", e);
                        }
                        Err(e) => error!("Scheduled mint failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Mint scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerOptions;
    use crate::persistence::MemoryJournal;

    async fn scheduler(max_supply: Option<i64>) -> (MintScheduler, Arc<Ledger>) {
        let config = LedgerConfig {
            mint_amount: 400,
            max_supply,
            ..Default::default()
        };
        let ledger = Arc::new(
            Ledger::open(Arc::new(MemoryJournal::new()), LedgerOptions::from(&config))
                .await
                .unwrap(),
        );
        (MintScheduler::new(ledger.clone(), &config), ledger)
    }

    #[tokio::test]
    async fn test_genesis_runs_once() {
        let (scheduler, ledger) = scheduler(None).await;
        assert_eq!(scheduler.ensure_genesis().await.unwrap(), Some(1));
        assert_eq!(scheduler.ensure_genesis().await.unwrap(), None);
        assert_eq!(ledger.balance("pool"), 400);
        assert_eq!(ledger.balance("mint"), -400);
    }

    #[tokio::test]
    async fn test_tick_stops_at_cap() {
        let (scheduler, ledger) = scheduler(Some(1_000)).await;
        assert!(scheduler.tick().await.unwrap().is_some());
        assert!(scheduler.tick().await.unwrap().is_some());
        assert!(scheduler.tick().await.unwrap().is_none());
        assert_eq!(ledger.total_minted(), 800);
    }
}
