//! Error types for the public transaction engine

use ethers::types::Address;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Broadcast rejected: {0}")]
    Broadcast(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Key not found for signing address {0:?}")]
    KeyNotFound(Address),

    #[error("Gas price error: {0}")]
    GasPrice(String),

    #[error("Nonce error for signer {signer:?}: {message}")]
    Nonce { signer: Address, message: String },

    #[error("Transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("Transaction {id} cannot be cancelled in status {status}")]
    NotCancellable { id: Uuid, status: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Event subscription closed")]
    SubscriptionClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if error is retryable on the next tick without consuming an attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Ledger(_) | EngineError::Database(_))
    }
}

/// Behavioral classification of a base-ledger broadcast rejection.
///
/// The node only gives us an error string, so classification is by message
/// content. Benign classes mean the transaction is (or will be) in the
/// mempool under this nonce and we should proceed to confirmation tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionClass {
    /// "already known" - an identical transaction is in the mempool
    AlreadyKnown,
    /// "nonce too low" - a transaction with this nonce was already mined
    NonceTooLow,
    /// RPC timeout, connection failure, 5xx - retry next tick
    Transient,
    /// Account balance below value + max gas cost
    InsufficientFunds,
    /// Fee below the node's replacement bump threshold
    Underpriced,
    /// Execution reverted during the node's pre-flight checks
    Reverted,
    /// Anything else the node refused
    Other,
}

impl RejectionClass {
    /// Benign rejections are treated as a successful broadcast
    pub fn is_benign(&self) -> bool {
        matches!(self, RejectionClass::AlreadyKnown | RejectionClass::NonceTooLow)
    }
}

/// Classify a broadcast error message from the node
pub fn classify_rejection(message: &str) -> RejectionClass {
    let msg = message.to_lowercase();

    if msg.contains("already known") || msg.contains("known transaction") {
        RejectionClass::AlreadyKnown
    } else if msg.contains("nonce too low") {
        RejectionClass::NonceTooLow
    } else if msg.contains("insufficient funds") {
        RejectionClass::InsufficientFunds
    } else if msg.contains("underpriced") || msg.contains("gas too low") {
        RejectionClass::Underpriced
    } else if msg.contains("execution reverted") || msg.contains("revert") {
        RejectionClass::Reverted
    } else if msg.contains("timeout")
        || msg.contains("connection")
        || msg.contains("503")
        || msg.contains("502")
        || msg.contains("unknown")
    {
        RejectionClass::Transient
    } else {
        RejectionClass::Other
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
