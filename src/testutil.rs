//! Shared test doubles

use crate::chain::{BlockEvent, GasPrice, LedgerClient, ReceiptInfo};
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Scriptable in-memory ledger
pub(crate) struct MockLedger {
    pub next_nonce: AtomicU64,
    pub balance: Mutex<U256>,
    pub receipts: DashMap<H256, ReceiptInfo>,
    pub broadcast_error: Mutex<Option<String>>,
    pub sent: Mutex<Vec<H256>>,
    pub block_tx: broadcast::Sender<BlockEvent>,
}

impl MockLedger {
    pub fn new(next_nonce: u64) -> Arc<Self> {
        let (block_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            next_nonce: AtomicU64::new(next_nonce),
            balance: Mutex::new(U256::MAX),
            receipts: DashMap::new(),
            broadcast_error: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            block_tx,
        })
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn set_broadcast_error(&self, message: Option<&str>) {
        *self.broadcast_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn add_receipt(&self, hash: H256, success: bool, block_number: u64, block_hash: H256) {
        self.receipts.insert(
            hash,
            ReceiptInfo {
                tx_hash: hash,
                success,
                block_number,
                block_hash,
            },
        );
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn get_nonce(&self, _address: Address) -> EngineResult<u64> {
        Ok(self.next_nonce.load(Ordering::SeqCst))
    }
    async fn get_balance(&self, _address: Address) -> EngineResult<U256> {
        Ok(*self.balance.lock().unwrap())
    }
    async fn estimate_gas(&self, _tx: &TypedTransaction) -> EngineResult<U256> {
        Ok(U256::from(21_000u64))
    }
    async fn gas_price(&self) -> EngineResult<GasPrice> {
        Ok(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(100u64),
            max_priority_fee_per_gas: U256::from(10u64),
        })
    }
    async fn send_raw_transaction(&self, raw: Bytes) -> EngineResult<H256> {
        if let Some(message) = self.broadcast_error.lock().unwrap().clone() {
            return Err(EngineError::Broadcast(message));
        }
        let hash = H256::from(keccak256(&raw));
        self.sent.lock().unwrap().push(hash);
        Ok(hash)
    }
    async fn get_receipt(&self, hash: H256) -> EngineResult<Option<ReceiptInfo>> {
        Ok(self.receipts.get(&hash).map(|r| r.clone()))
    }
    async fn block_number(&self) -> EngineResult<u64> {
        Ok(0)
    }
    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.block_tx.subscribe()
    }
}
