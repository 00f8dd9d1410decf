//! Durable queue of public transactions
//!
//! The store is the engine's single source of pending work, indexed by
//! signing address, nonce and status. Every mutation is its own database
//! transaction; cross-component coordination happens only through
//! post-commit hooks, which fire strictly after durable persistence so no
//! consumer can observe a signal whose row is not yet visible.

pub mod memory;
pub mod sql;

pub use memory::InMemoryTxStore;
pub use sql::SqlTxStore;

use crate::error::EngineResult;
use crate::types::{
    PublicTransaction, PubTxStatus, ReceiptRecord, StatusUpdate, TxFilter, TxId,
};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::sync::Arc;

/// Hook invoked after a mutation commits
pub type PostCommitHook = Arc<dyn Fn() + Send + Sync>;

/// Persistence contract for the transaction queue
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new transaction, assigning its creation sequence.
    /// Returns the assigned sequence.
    async fn insert_transaction(&self, tx: &PublicTransaction) -> EngineResult<u64>;

    async fn get_transaction(&self, id: &TxId) -> EngineResult<Option<PublicTransaction>>;

    /// List transactions matching `filter`, honoring status sets, signer
    /// inclusion and exclusion, sort key and limit
    async fn list_transactions(&self, filter: &TxFilter) -> EngineResult<Vec<PublicTransaction>>;

    /// Record the nonce chosen for a transaction. Rejected if one is already
    /// assigned: the nonce is immutable after first submission.
    async fn assign_nonce(&self, id: &TxId, nonce: u64) -> EngineResult<()>;

    /// Conditional status transition. Setting Succeeded is rejected while a
    /// lower nonce for the same signer is still non-terminal.
    async fn update_status(
        &self,
        id: &TxId,
        status: PubTxStatus,
        update: StatusUpdate,
    ) -> EngineResult<()>;

    /// Record a broadcast: the new hash supersedes any previous one for this
    /// nonce and the transaction moves to Submitted
    async fn record_broadcast(
        &self,
        id: &TxId,
        hash: H256,
        gas_price: &crate::chain::GasPrice,
        attempt_count: u32,
    ) -> EngineResult<()>;

    /// Persist an observed receipt and the matching terminal status in one
    /// transaction, promoting the durable completed-nonce watermark
    async fn record_receipt(&self, receipt: &ReceiptRecord) -> EngineResult<()>;

    /// Reorg path: revert a Succeeded transaction to Submitted so its
    /// orchestrator can re-broadcast
    async fn reopen_transaction(&self, id: &TxId) -> EngineResult<()>;

    /// Remove a Pending transaction with no nonce assigned.
    /// Returns false when the row was not in a deletable state.
    async fn delete_unassigned(&self, id: &TxId) -> EngineResult<bool>;

    /// Latest receipt recorded for a transaction, if any
    async fn get_latest_receipt(&self, id: &TxId) -> EngineResult<Option<ReceiptRecord>>;

    /// Highest terminal nonce recorded for a signer, if any
    async fn highest_completed_nonce(&self, signer: Address) -> EngineResult<Option<u64>>;

    /// Register a hook fired after every committed mutation
    fn add_post_commit_hook(&self, hook: PostCommitHook);
}
