//! Persisted transaction model and store query types

use crate::chain::GasPrice;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque stable transaction identity
pub type TxId = Uuid;

/// Lifecycle status of a public transaction.
///
/// Pending -> Submitted -> (Succeeded | Failed). A Submitted transaction may
/// be Suspended after attempt saturation and re-broadcast later with a
/// bumped fee. Failed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubTxStatus {
    Pending,
    Submitted,
    Succeeded,
    Failed,
    Suspended,
}

impl PubTxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PubTxStatus::Pending => "pending",
            PubTxStatus::Submitted => "submitted",
            PubTxStatus::Succeeded => "succeeded",
            PubTxStatus::Failed => "failed",
            PubTxStatus::Suspended => "suspended",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PubTxStatus::Pending),
            "submitted" => Some(PubTxStatus::Submitted),
            "succeeded" => Some(PubTxStatus::Succeeded),
            "failed" => Some(PubTxStatus::Failed),
            "suspended" => Some(PubTxStatus::Suspended),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PubTxStatus::Succeeded | PubTxStatus::Failed)
    }
}

impl std::fmt::Display for PubTxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behavioral kind of the last error observed for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxErrorKind {
    Rejected,
    InsufficientFunds,
    Underpriced,
    Reverted,
}

impl TxErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxErrorKind::Rejected => "rejected",
            TxErrorKind::InsufficientFunds => "insufficient_funds",
            TxErrorKind::Underpriced => "underpriced",
            TxErrorKind::Reverted => "reverted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rejected" => Some(TxErrorKind::Rejected),
            "insufficient_funds" => Some(TxErrorKind::InsufficientFunds),
            "underpriced" => Some(TxErrorKind::Underpriced),
            "reverted" => Some(TxErrorKind::Reverted),
            _ => None,
        }
    }
}

/// A public transaction queued for submission to the base ledger
#[derive(Debug, Clone)]
pub struct PublicTransaction {
    pub id: TxId,
    /// Owning signing address
    pub from: Address,
    pub to: Option<Address>,
    /// Target ledger nonce, assigned at first submission and immutable after
    pub nonce: Option<u64>,
    pub status: PubTxStatus,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: U256,
    /// Pricing chosen at the last broadcast
    pub gas_price: Option<GasPrice>,
    /// Transactions carrying value are fueling transactions
    pub has_value: bool,
    /// Monotonic creation order, assigned by the store
    pub sequence: u64,
    pub attempt_count: u32,
    pub last_hash: Option<H256>,
    pub last_error: Option<TxErrorKind>,
    pub last_action: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PublicTransaction {
    /// Build a new Pending transaction; sequence is filled in by the store
    pub fn new(
        from: Address,
        to: Option<Address>,
        data: Bytes,
        value: U256,
        gas_limit: U256,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            nonce: None,
            status: PubTxStatus::Pending,
            data,
            value,
            gas_limit,
            gas_price: None,
            has_value: !value.is_zero(),
            sequence: 0,
            attempt_count: 0,
            last_hash: None,
            last_error: None,
            last_action: now,
            created_at: now,
        }
    }
}

/// Sort order for store listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// FIFO order, the default for engine polling
    #[default]
    SequenceAsc,
    /// Fueling lookups want the latest nonce first
    NonceDesc,
}

/// Filter for `TransactionStore::list_transactions`
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub in_status: Vec<PubTxStatus>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    /// Exclusion set: skip rows owned by these signers. Lets the engine ask
    /// for pending work belonging to signers it is not already running.
    pub not_from: Vec<Address>,
    pub has_value: Option<bool>,
    pub sort: SortBy,
    pub limit: Option<usize>,
}

/// Fields applied alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub error: Option<TxErrorKind>,
    pub attempt_count: Option<u32>,
    pub last_hash: Option<H256>,
}

/// A receipt observed for a broadcast hash
#[derive(Debug, Clone)]
pub struct ReceiptRecord {
    pub tx_id: TxId,
    pub signer: Address,
    pub nonce: u64,
    pub hash: H256,
    pub success: bool,
    pub block_number: u64,
    pub block_hash: H256,
}

/// Status report returned to callers
#[derive(Debug, Clone)]
pub struct TxStatusInfo {
    pub id: TxId,
    pub status: PubTxStatus,
    pub hash: Option<H256>,
    pub block_number: Option<u64>,
    pub error: Option<TxErrorKind>,
    pub attempt_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            PubTxStatus::Pending,
            PubTxStatus::Submitted,
            PubTxStatus::Succeeded,
            PubTxStatus::Failed,
            PubTxStatus::Suspended,
        ] {
            assert_eq!(PubTxStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(PubTxStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(PubTxStatus::Succeeded.is_terminal());
        assert!(PubTxStatus::Failed.is_terminal());
        assert!(!PubTxStatus::Submitted.is_terminal());
        assert!(!PubTxStatus::Suspended.is_terminal());
    }

    #[test]
    fn test_value_marks_fueling() {
        let with_value = PublicTransaction::new(
            Address::random(),
            Some(Address::random()),
            Bytes::default(),
            U256::from(1_000u64),
            U256::from(21_000u64),
        );
        assert!(with_value.has_value);

        let without = PublicTransaction::new(
            Address::random(),
            Some(Address::random()),
            Bytes::default(),
            U256::zero(),
            U256::from(21_000u64),
        );
        assert!(!without.has_value);
    }
}
