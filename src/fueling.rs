//! Auto-fueling of orchestrator signing addresses
//!
//! When an orchestrator finds its signer's balance below the floor needed to
//! submit its next transaction it asks the fueling manager for a top-up. The
//! manager keeps at most one outstanding fueling transaction per destination:
//! a new one is only created once the previous one is observed complete.

use crate::error::EngineResult;
use crate::store::TransactionStore;
use crate::types::{PublicTransaction, PubTxStatus, SortBy, TxFilter, TxId};

use ethers::types::{Address, Bytes, U256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Highest observed terminal nonce per signing address.
///
/// Monotonic: writers never lower an entry. Readers tolerate outdated values
/// because every caller re-checks frequently.
#[derive(Default)]
pub struct CompletedNonceCache {
    inner: Mutex<HashMap<Address, u64>>,
}

impl CompletedNonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signer: Address) -> Option<u64> {
        self.inner.lock().unwrap().get(&signer).copied()
    }

    /// Raise the entry for `signer` to `nonce`. Returns true when the entry
    /// changed; lowering is never applied.
    pub fn promote(&self, signer: Address, nonce: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(&signer) {
            Some(current) if *current >= nonce => false,
            _ => {
                inner.insert(signer, nonce);
                true
            }
        }
    }
}

/// Creates and deduplicates fueling transactions from the funding address
pub struct FuelingManager {
    store: Arc<dyn TransactionStore>,
    completed: Arc<CompletedNonceCache>,
    source: Address,
    gas_limit: U256,
    // Serializes the lookup-then-create window so two callers cannot both
    // enqueue a fueling transaction for the same destination
    create_lock: tokio::sync::Mutex<()>,
}

impl FuelingManager {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        completed: Arc<CompletedNonceCache>,
        source: Address,
        gas_limit: U256,
    ) -> Self {
        Self {
            store,
            completed,
            source,
            gas_limit,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn source_address(&self) -> Address {
        self.source
    }

    /// Ensure a fueling transaction of `amount` is on its way to
    /// `destination`. Idempotent: while one is outstanding its id is returned
    /// instead of creating another.
    pub async fn ensure_fueled(&self, destination: Address, amount: U256) -> EngineResult<TxId> {
        let _guard = self.create_lock.lock().await;

        if let Some(existing) = self
            .get_pending_fueling_transaction(self.source, destination)
            .await?
        {
            if !self.check_transaction_completed(&existing).await {
                debug!(
                    "Fueling for {:?} already pending as {}",
                    destination, existing.id
                );
                return Ok(existing.id);
            }
        }

        let tx = PublicTransaction::new(
            self.source,
            Some(destination),
            Bytes::default(),
            amount,
            self.gas_limit,
        );
        let id = tx.id;
        self.store.insert_transaction(&tx).await?;

        crate::metrics::record_fueling_requested();
        info!(
            "Fueling transaction {} created: {} wei from {:?} to {:?}",
            id, amount, self.source, destination
        );
        Ok(id)
    }

    /// Latest pending transaction carrying value from `source` to
    /// `destination`. A transaction with value is assumed to be a fueling
    /// transaction.
    pub async fn get_pending_fueling_transaction(
        &self,
        source: Address,
        destination: Address,
    ) -> EngineResult<Option<PublicTransaction>> {
        let filter = TxFilter {
            in_status: vec![PubTxStatus::Pending, PubTxStatus::Submitted],
            from: Some(source),
            to: Some(destination),
            has_value: Some(true),
            sort: SortBy::NonceDesc,
            limit: Some(1),
            ..Default::default()
        };
        let mut txs = self.store.list_transactions(&filter).await?;
        Ok(txs.pop())
    }

    /// True iff the completed-nonce watermark for the transaction's signer
    /// has reached its nonce. A store failure reads as incomplete; outdated
    /// information is acceptable because callers retry frequently.
    pub async fn check_transaction_completed(&self, tx: &PublicTransaction) -> bool {
        let nonce = match tx.nonce {
            Some(n) => n,
            // no nonce assigned yet, certainly not complete
            None => return false,
        };

        if let Some(completed) = self.completed.get(tx.from) {
            return completed >= nonce;
        }

        match self.store.highest_completed_nonce(tx.from).await {
            Ok(Some(highest)) => {
                self.completed.promote(tx.from, highest);
                highest >= nonce
            }
            Ok(None) => false,
            Err(_) => false,
        }
    }
}
