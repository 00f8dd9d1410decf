//! Base-ledger access
//!
//! The engine talks to the ledger through the `LedgerClient` capability
//! trait; orchestrators and the confirmation tracker are parameterized by it
//! rather than by a concrete provider.

pub mod provider;

pub use provider::EthersLedger;

use crate::error::EngineResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Gas price parameters, legacy or EIP-1559 depending on chain mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Raise the fee by `percent`, the minimum the mempool replacement
    /// policy accepts is 10%
    pub fn increased(&self, percent: u64) -> GasPrice {
        let bump = |v: U256| v + v * U256::from(percent) / U256::from(100u64);
        match self {
            GasPrice::Legacy { gas_price } => GasPrice::Legacy {
                gas_price: bump(*gas_price),
            },
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: bump(*max_fee_per_gas),
                max_priority_fee_per_gas: bump(*max_priority_fee_per_gas),
            },
        }
    }

    /// Component-wise maximum against another price of the same mode.
    /// Mixed modes keep `self`.
    pub fn max(&self, other: &GasPrice) -> GasPrice {
        match (self, other) {
            (GasPrice::Legacy { gas_price: a }, GasPrice::Legacy { gas_price: b }) => {
                GasPrice::Legacy {
                    gas_price: (*a).max(*b),
                }
            }
            (
                GasPrice::Eip1559 {
                    max_fee_per_gas: af,
                    max_priority_fee_per_gas: ap,
                },
                GasPrice::Eip1559 {
                    max_fee_per_gas: bf,
                    max_priority_fee_per_gas: bp,
                },
            ) => GasPrice::Eip1559 {
                max_fee_per_gas: (*af).max(*bf),
                max_priority_fee_per_gas: (*ap).max(*bp),
            },
            _ => self.clone(),
        }
    }

    /// True if `current` exceeds this price by more than `percent`
    pub fn below_by_percent(&self, current: &GasPrice, percent: u64) -> bool {
        let exceeded = |stored: U256, cur: U256| {
            cur > stored + stored * U256::from(percent) / U256::from(100u64)
        };
        match (self, current) {
            (GasPrice::Legacy { gas_price: a }, GasPrice::Legacy { gas_price: b }) => {
                exceeded(*a, *b)
            }
            (
                GasPrice::Eip1559 {
                    max_priority_fee_per_gas: ap,
                    ..
                },
                GasPrice::Eip1559 {
                    max_priority_fee_per_gas: bp,
                    ..
                },
            ) => exceeded(*ap, *bp),
            _ => false,
        }
    }

    /// Worst-case cost of a broadcast at this price
    pub fn max_cost(&self, gas_limit: U256) -> U256 {
        match self {
            GasPrice::Legacy { gas_price } => gas_limit * *gas_price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

/// A new canonical head observed on the base ledger
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

/// Receipt details resolved for a broadcast hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub tx_hash: H256,
    /// Ledger execution status: true for status=1
    pub success: bool,
    pub block_number: u64,
    pub block_hash: H256,
}

/// Capability set the engine needs from the base ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Next account nonce as the ledger sees it
    async fn get_nonce(&self, address: Address) -> EngineResult<u64>;

    async fn get_balance(&self, address: Address) -> EngineResult<U256>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> EngineResult<U256>;

    /// Current gas price in the chain's fee mode
    async fn gas_price(&self) -> EngineResult<GasPrice>;

    /// Broadcast a signed raw transaction, returning its hash
    async fn send_raw_transaction(&self, raw: Bytes) -> EngineResult<H256>;

    async fn get_receipt(&self, hash: H256) -> EngineResult<Option<ReceiptInfo>>;

    async fn block_number(&self) -> EngineResult<u64>;

    /// Stream of new canonical heads
    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent>;
}
