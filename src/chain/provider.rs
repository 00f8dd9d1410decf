//! Ledger provider with multi-RPC support and automatic failover

use super::{BlockEvent, GasPrice, LedgerClient, ReceiptInfo};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Multi-provider ledger client with automatic failover
pub struct EthersLedger {
    config: ChainConfig,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    block_tx: broadcast::Sender<BlockEvent>,
}

impl EthersLedger {
    pub fn new(config: ChainConfig) -> EngineResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(EngineError::Config(
                "No valid RPC providers configured".to_string(),
            ));
        }

        let (block_tx, _) = broadcast::channel(1024);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            block_tx,
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Spawn the new-head poll loop feeding `subscribe_blocks`
    pub fn spawn_block_feed(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let ledger = self.clone();
        let mut shutdown = shutdown;
        let poll_interval = Duration::from_millis(self.config.block_poll_interval_ms);

        tokio::spawn(async move {
            let mut last_number: Option<u64> = None;
            info!(
                "Block feed started for chain {} polling every {:?}",
                ledger.config.chain_id, poll_interval
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Block feed exiting for chain {}", ledger.config.chain_id);
                            return;
                        }
                    }
                }

                let head = match ledger.block_number().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Failed to get block number: {}", e);
                        continue;
                    }
                };

                let from = match last_number {
                    Some(n) if head > n => n + 1,
                    Some(_) => continue,
                    None => head,
                };

                for number in from..=head {
                    match ledger.fetch_block_event(number).await {
                        Ok(Some(event)) => {
                            let _ = ledger.block_tx.send(event);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Failed to fetch block {}: {}", number, e);
                            break;
                        }
                    }
                }
                last_number = Some(head);
            }
        });
    }

    async fn fetch_block_event(&self, number: u64) -> EngineResult<Option<BlockEvent>> {
        let block = self
            .http()
            .get_block(number)
            .await
            .map_err(|e| EngineError::Ledger(e.to_string()))?;

        Ok(block.map(|b| BlockEvent {
            number,
            hash: b.hash.unwrap_or_default(),
            parent_hash: b.parent_hash,
        }))
    }

    async fn estimate_eip1559_fees(&self) -> EngineResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| EngineError::GasPrice(e.to_string()))?
            .ok_or_else(|| EngineError::GasPrice("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| EngineError::GasPrice("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        // Cap at configured max
        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, priority_fee))
    }
}

#[async_trait]
impl LedgerClient for EthersLedger {
    async fn get_nonce(&self, address: Address) -> EngineResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_count(address, None).await {
                Ok(nonce) => return Ok(nonce.as_u64()),
                Err(e) => {
                    warn!("Failed to get nonce for {:?}: {}", address, e);
                    self.failover();
                }
            }
        }
        Err(EngineError::Ledger("All providers failed".to_string()))
    }

    async fn get_balance(&self, address: Address) -> EngineResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| EngineError::Ledger(e.to_string()))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> EngineResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| EngineError::GasPrice(e.to_string()))
    }

    async fn gas_price(&self) -> EngineResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| EngineError::GasPrice(e.to_string()))?;
                Ok(GasPrice::Legacy { gas_price: price })
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> EngineResult<H256> {
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => Err(EngineError::Broadcast(e.to_string())),
        }
    }

    async fn get_receipt(&self, hash: H256) -> EngineResult<Option<ReceiptInfo>> {
        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| EngineError::Ledger(e.to_string()))?;

        Ok(receipt.and_then(|r| {
            let block_number = r.block_number?.as_u64();
            Some(ReceiptInfo {
                tx_hash: r.transaction_hash,
                success: r.status == Some(1.into()),
                block_number,
                block_hash: r.block_hash.unwrap_or_default(),
            })
        }))
    }

    async fn block_number(&self) -> EngineResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }
        Err(EngineError::Ledger("All providers failed".to_string()))
    }

    fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.block_tx.subscribe()
    }
}
