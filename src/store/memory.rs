//! In-memory transaction store
//!
//! Shares the `TransactionStore` contract with the SQL implementation,
//! including the nonce guard on terminal transitions and post-commit hook
//! ordering. Used by the test harness and for ephemeral dev runs.

use super::{PostCommitHook, TransactionStore};
use crate::chain::GasPrice;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    PublicTransaction, PubTxStatus, ReceiptRecord, SortBy, StatusUpdate, TxFilter, TxId,
};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

#[derive(Default)]
struct MemState {
    rows: HashMap<TxId, PublicTransaction>,
    receipts: HashMap<TxId, ReceiptRecord>,
    completed: HashMap<Address, u64>,
    next_sequence: u64,
}

/// Transaction store held entirely in process memory
#[derive(Default)]
pub struct InMemoryTxStore {
    state: Mutex<MemState>,
    post_commit: RwLock<Vec<PostCommitHook>>,
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fire_post_commit(&self) {
        let hooks = self.post_commit.read().unwrap();
        for hook in hooks.iter() {
            hook();
        }
    }

    fn has_lower_open_nonce(state: &MemState, signer: Address, nonce: u64) -> bool {
        state.rows.values().any(|t| {
            t.from == signer
                && t.nonce.map(|n| n < nonce).unwrap_or(false)
                && !t.status.is_terminal()
        })
    }
}

#[async_trait]
impl TransactionStore for InMemoryTxStore {
    async fn insert_transaction(&self, tx: &PublicTransaction) -> EngineResult<u64> {
        let sequence;
        {
            let mut state = self.state.lock().unwrap();
            state.next_sequence += 1;
            sequence = state.next_sequence;
            let mut row = tx.clone();
            row.sequence = sequence;
            state.rows.insert(row.id, row);
        }
        self.fire_post_commit();
        Ok(sequence)
    }

    async fn get_transaction(&self, id: &TxId) -> EngineResult<Option<PublicTransaction>> {
        Ok(self.state.lock().unwrap().rows.get(id).cloned())
    }

    async fn list_transactions(&self, filter: &TxFilter) -> EngineResult<Vec<PublicTransaction>> {
        let state = self.state.lock().unwrap();

        let mut matches: Vec<PublicTransaction> = state
            .rows
            .values()
            .filter(|t| filter.in_status.is_empty() || filter.in_status.contains(&t.status))
            .filter(|t| filter.from.map(|f| t.from == f).unwrap_or(true))
            .filter(|t| filter.to.map(|to| t.to == Some(to)).unwrap_or(true))
            .filter(|t| !filter.not_from.contains(&t.from))
            .filter(|t| filter.has_value.map(|h| t.has_value == h).unwrap_or(true))
            .cloned()
            .collect();

        match filter.sort {
            SortBy::SequenceAsc => matches.sort_by_key(|t| t.sequence),
            SortBy::NonceDesc => {
                matches.sort_by_key(|t| std::cmp::Reverse(t.nonce.unwrap_or(0)))
            }
        }

        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }

        Ok(matches)
    }

    async fn assign_nonce(&self, id: &TxId, nonce: u64) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let row = state
                .rows
                .get_mut(id)
                .ok_or(EngineError::TransactionNotFound(*id))?;

            if let Some(existing) = row.nonce {
                return Err(EngineError::Nonce {
                    signer: row.from,
                    message: format!(
                        "nonce already assigned for transaction {} ({})",
                        id, existing
                    ),
                });
            }
            row.nonce = Some(nonce);
            row.last_action = Utc::now();
        }
        self.fire_post_commit();
        Ok(())
    }

    async fn update_status(
        &self,
        id: &TxId,
        status: PubTxStatus,
        update: StatusUpdate,
    ) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let row = state
                .rows
                .get(id)
                .ok_or(EngineError::TransactionNotFound(*id))?
                .clone();

            if status == PubTxStatus::Succeeded {
                let nonce = row.nonce.ok_or_else(|| EngineError::Nonce {
                    signer: row.from,
                    message: "cannot succeed without an assigned nonce".to_string(),
                })?;
                if Self::has_lower_open_nonce(&state, row.from, nonce) {
                    return Err(EngineError::InvalidStatusTransition {
                        from: row.status.to_string(),
                        to: status.to_string(),
                    });
                }
            }

            let row = state.rows.get_mut(id).unwrap();
            row.status = status;
            if let Some(error) = update.error {
                row.last_error = Some(error);
            }
            if let Some(attempts) = update.attempt_count {
                row.attempt_count = attempts;
            }
            if let Some(hash) = update.last_hash {
                row.last_hash = Some(hash);
            }
            row.last_action = Utc::now();
        }
        self.fire_post_commit();
        Ok(())
    }

    async fn record_broadcast(
        &self,
        id: &TxId,
        hash: H256,
        gas_price: &GasPrice,
        attempt_count: u32,
    ) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let row = state
                .rows
                .get_mut(id)
                .ok_or(EngineError::TransactionNotFound(*id))?;
            row.status = PubTxStatus::Submitted;
            row.last_hash = Some(hash);
            row.gas_price = Some(gas_price.clone());
            row.attempt_count = attempt_count;
            row.last_action = Utc::now();
        }
        self.fire_post_commit();
        Ok(())
    }

    async fn record_receipt(&self, receipt: &ReceiptRecord) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let row = state
                .rows
                .get_mut(&receipt.tx_id)
                .ok_or(EngineError::TransactionNotFound(receipt.tx_id))?;

            row.status = if receipt.success {
                PubTxStatus::Succeeded
            } else {
                PubTxStatus::Failed
            };
            row.last_hash = Some(receipt.hash);
            row.last_action = Utc::now();

            let entry = state.completed.entry(receipt.signer).or_insert(receipt.nonce);
            if receipt.nonce > *entry {
                *entry = receipt.nonce;
            }
            state.receipts.insert(receipt.tx_id, receipt.clone());
        }
        self.fire_post_commit();
        Ok(())
    }

    async fn reopen_transaction(&self, id: &TxId) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let row = state
                .rows
                .get_mut(id)
                .ok_or(EngineError::TransactionNotFound(*id))?;

            if row.status != PubTxStatus::Succeeded {
                return Err(EngineError::InvalidStatusTransition {
                    from: row.status.to_string(),
                    to: PubTxStatus::Submitted.to_string(),
                });
            }
            row.status = PubTxStatus::Submitted;
            row.last_action = Utc::now();
        }
        self.fire_post_commit();
        Ok(())
    }

    async fn delete_unassigned(&self, id: &TxId) -> EngineResult<bool> {
        let deleted;
        {
            let mut state = self.state.lock().unwrap();
            deleted = match state.rows.get(id) {
                Some(row) if row.status == PubTxStatus::Pending && row.nonce.is_none() => {
                    state.rows.remove(id);
                    true
                }
                _ => false,
            };
        }
        if deleted {
            self.fire_post_commit();
        }
        Ok(deleted)
    }

    async fn get_latest_receipt(&self, id: &TxId) -> EngineResult<Option<ReceiptRecord>> {
        Ok(self.state.lock().unwrap().receipts.get(id).cloned())
    }

    async fn highest_completed_nonce(&self, signer: Address) -> EngineResult<Option<u64>> {
        let state = self.state.lock().unwrap();
        let from_watermark = state.completed.get(&signer).copied();
        let from_rows = state
            .rows
            .values()
            .filter(|t| t.from == signer && t.status.is_terminal())
            .filter_map(|t| t.nonce)
            .max();
        Ok(match (from_watermark, from_rows) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        })
    }

    fn add_post_commit_hook(&self, hook: PostCommitHook) {
        self.post_commit.write().unwrap().push(hook);
    }
}
