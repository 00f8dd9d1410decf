//! Signing key access
//!
//! Orchestrators never touch key material; they hand a prepared transaction
//! to a `KeyStore` and get back signed bytes.

use crate::config::WalletConfig;
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use std::collections::HashMap;
use tracing::info;

/// Capability to sign transactions for held addresses
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Sign `tx` with the key for `from`, returning the raw signed payload
    async fn sign_transaction(&self, from: Address, tx: &TypedTransaction) -> EngineResult<Bytes>;
}

/// Capability to enumerate the addresses a key store holds
pub trait KeyStoreListable: KeyStore {
    fn list_addresses(&self) -> Vec<Address>;
}

/// In-process key store backed by local wallets
pub struct LocalKeyStore {
    wallets: HashMap<Address, LocalWallet>,
}

impl LocalKeyStore {
    /// Load wallets from the configured environment variable (comma-separated
    /// hex keys). Keystore-file loading would go through the same constructor.
    pub fn load(config: &WalletConfig, chain_id: u64) -> EngineResult<Self> {
        let env_name = config
            .private_keys_env
            .as_deref()
            .unwrap_or("PUBTX_PRIVATE_KEYS");

        let raw = std::env::var(env_name).map_err(|_| {
            EngineError::Config(format!(
                "No signing keys configured. Set {} or configure a keystore",
                env_name
            ))
        })?;

        let mut wallets = HashMap::new();
        for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            let wallet: LocalWallet = key
                .parse()
                .map_err(|e| EngineError::Signing(format!("Invalid private key: {}", e)))?;
            let wallet = wallet.with_chain_id(chain_id);
            wallets.insert(wallet.address(), wallet);
        }

        if wallets.is_empty() {
            return Err(EngineError::Config(format!("{} holds no keys", env_name)));
        }

        info!("Key store loaded {} signing addresses", wallets.len());
        Ok(Self { wallets })
    }

    pub fn from_wallets(wallets: Vec<LocalWallet>, chain_id: u64) -> Self {
        let wallets = wallets
            .into_iter()
            .map(|w| {
                let w = w.with_chain_id(chain_id);
                (w.address(), w)
            })
            .collect();
        Self { wallets }
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    async fn sign_transaction(&self, from: Address, tx: &TypedTransaction) -> EngineResult<Bytes> {
        let wallet = self
            .wallets
            .get(&from)
            .ok_or(EngineError::KeyNotFound(from))?;

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| EngineError::Signing(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}

impl KeyStoreListable for LocalKeyStore {
    fn list_addresses(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }
}
