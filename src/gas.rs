//! Shared gas price oracle
//!
//! Signer-agnostic current-price feed. A snapshot is cached for a short TTL
//! and published through a watch channel so readers never block on a fetch;
//! callers that miss the TTL serialize behind one refresh lock and share the
//! in-flight fetch. When the upstream oracle is unavailable the last known
//! good value is returned with its staleness flagged instead of failing.

use crate::chain::{GasPrice, LedgerClient};
use crate::error::{EngineError, EngineResult};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// A point-in-time gas price observation
#[derive(Debug, Clone)]
pub struct GasSnapshot {
    pub price: GasPrice,
    pub fetched_at: Instant,
    /// Set when the upstream fetch failed and this is the last known value
    pub stale: bool,
}

/// Cached, shared gas price source
pub struct GasPriceOracle {
    ledger: Arc<dyn LedgerClient>,
    ttl: Duration,
    snapshot_tx: watch::Sender<Option<GasSnapshot>>,
    snapshot_rx: watch::Receiver<Option<GasSnapshot>>,
    refresh: Mutex<()>,
}

impl GasPriceOracle {
    pub fn new(ledger: Arc<dyn LedgerClient>, ttl: Duration) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        Self {
            ledger,
            ttl,
            snapshot_tx,
            snapshot_rx,
            refresh: Mutex::new(()),
        }
    }

    /// Current price snapshot, refreshing at most once per TTL window
    pub async fn current_price(&self) -> EngineResult<GasSnapshot> {
        if let Some(snapshot) = self.fresh_snapshot() {
            return Ok(snapshot);
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(snapshot) = self.fresh_snapshot() {
            return Ok(snapshot);
        }

        match self.ledger.gas_price().await {
            Ok(price) => {
                let snapshot = GasSnapshot {
                    price,
                    fetched_at: Instant::now(),
                    stale: false,
                };
                debug!("Gas price refreshed: {:?}", snapshot.price);
                let _ = self.snapshot_tx.send(Some(snapshot.clone()));
                Ok(snapshot)
            }
            Err(e) => {
                // Serve the last known good value if there is one
                let last = self.snapshot_rx.borrow().clone();
                match last {
                    Some(mut snapshot) => {
                        warn!("Gas price fetch failed, serving stale value: {}", e);
                        snapshot.stale = true;
                        let _ = self.snapshot_tx.send(Some(snapshot.clone()));
                        Ok(snapshot)
                    }
                    None => Err(EngineError::GasPrice(format!(
                        "no gas price available: {}",
                        e
                    ))),
                }
            }
        }
    }

    fn fresh_snapshot(&self) -> Option<GasSnapshot> {
        let snapshot = self.snapshot_rx.borrow().clone()?;
        if !snapshot.stale && snapshot.fetched_at.elapsed() < self.ttl {
            Some(snapshot)
        } else {
            None
        }
    }
}
