//! Configuration management for the public transaction engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub gas: GasOracleConfig,
    #[serde(default)]
    pub fueling: FuelingConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on concurrently running orchestrators
    #[serde(default = "default_max_in_flight_orchestrators")]
    pub max_in_flight_orchestrators: usize,
    /// Engine poll tick
    #[serde(default = "default_engine_interval_ms")]
    pub interval_ms: u64,
    /// Reap threshold for orchestrators sitting in Stale
    #[serde(default = "default_max_stale_time_ms")]
    pub max_stale_time_ms: u64,
    /// Reap threshold for orchestrators sitting in Idle
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,
    /// Fairness eviction threshold, also the pause duration
    #[serde(default = "default_max_overload_process_time_ms")]
    pub max_overload_process_time_ms: u64,
    /// Hot cache of transactions by id, larger than the orchestrator pool
    /// so entries survive orchestrator swapping
    #[serde(default = "default_transaction_cache_capacity")]
    pub transaction_cache_capacity: usize,
}

impl EngineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
    pub fn max_stale_time(&self) -> Duration {
        Duration::from_millis(self.max_stale_time_ms)
    }
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }
    pub fn max_overload_process_time(&self) -> Duration {
        Duration::from_millis(self.max_overload_process_time_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight_orchestrators: default_max_in_flight_orchestrators(),
            interval_ms: default_engine_interval_ms(),
            max_stale_time_ms: default_max_stale_time_ms(),
            max_idle_time_ms: default_max_idle_time_ms(),
            max_overload_process_time_ms: default_max_overload_process_time_ms(),
            transaction_cache_capacity: default_transaction_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Orchestrator processing tick
    #[serde(default = "default_orchestrator_interval_ms")]
    pub interval_ms: u64,
    /// Cap on the in-flight queue per signing address
    #[serde(default = "default_max_in_flight_txs")]
    pub max_in_flight_txs: usize,
    /// Broadcast attempts before a transaction is Suspended
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Re-broadcast a Submitted transaction with a bumped fee after this long
    /// without a receipt
    #[serde(default = "default_resubmit_interval_secs")]
    pub resubmit_interval_secs: u64,
    /// Minimum fee bump, and the threshold below current price that forces one
    #[serde(default = "default_replacement_percent")]
    pub replacement_percent: u64,
    /// Suspended nonces tolerated before the orchestrator stops advancing
    #[serde(default = "default_suspended_nonce_gap")]
    pub suspended_nonce_gap: usize,
    /// Per-broadcast deadline, independent of the engine loop
    #[serde(default = "default_broadcast_timeout_secs")]
    pub broadcast_timeout_secs: u64,
    /// Empty refills before Idle degrades to Stale
    #[serde(default = "default_empty_ticks_to_stale")]
    pub empty_ticks_to_stale: u32,
}

impl OrchestratorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
    pub fn resubmit_interval(&self) -> Duration {
        Duration::from_secs(self.resubmit_interval_secs)
    }
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_orchestrator_interval_ms(),
            max_in_flight_txs: default_max_in_flight_txs(),
            max_attempts: default_max_attempts(),
            resubmit_interval_secs: default_resubmit_interval_secs(),
            replacement_percent: default_replacement_percent(),
            suspended_nonce_gap: default_suspended_nonce_gap(),
            broadcast_timeout_secs: default_broadcast_timeout_secs(),
            empty_ticks_to_stale: default_empty_ticks_to_stale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            factor: default_retry_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    /// Blocks on top of the inclusion block before a receipt is final
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// New-head poll interval for the confirmation feed
    #[serde(default = "default_block_poll_interval_ms")]
    pub block_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    #[default]
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasOracleConfig {
    /// Snapshot TTL; concurrent callers inside the window share one fetch
    #[serde(default = "default_gas_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for GasOracleConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_gas_cache_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FuelingConfig {
    /// Funding address fueling transactions are drawn from
    pub source_address: Option<String>,
    /// Gas limit used for fueling value transfers
    #[serde(default = "default_fueling_gas_limit")]
    pub gas_limit: u64,
}

fn default_fueling_gas_limit() -> u64 {
    21_000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WalletConfig {
    pub keystore_path: Option<String>,
    /// Environment variable holding comma-separated signing keys
    pub private_keys_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_max_in_flight_orchestrators() -> usize {
    50
}
fn default_engine_interval_ms() -> u64 {
    5_000
}
fn default_max_stale_time_ms() -> u64 {
    60_000
}
fn default_max_idle_time_ms() -> u64 {
    10_000
}
fn default_max_overload_process_time_ms() -> u64 {
    600_000
}
fn default_transaction_cache_capacity() -> usize {
    1_000
}
fn default_orchestrator_interval_ms() -> u64 {
    1_000
}
fn default_max_in_flight_txs() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    5
}
fn default_resubmit_interval_secs() -> u64 {
    30
}
fn default_replacement_percent() -> u64 {
    10
}
fn default_suspended_nonce_gap() -> usize {
    1
}
fn default_broadcast_timeout_secs() -> u64 {
    30
}
fn default_empty_ticks_to_stale() -> u32 {
    3
}
fn default_retry_initial_delay_ms() -> u64 {
    250
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_retry_factor() -> f64 {
    2.0
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_confirmation_blocks() -> u64 {
    12
}
fn default_max_gas_price_gwei() -> u64 {
    500
}
fn default_block_poll_interval_ms() -> u64 {
    2_000
}
fn default_gas_cache_ttl_ms() -> u64 {
    3_000
}
fn default_metrics_port() -> u16 {
    9090
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("PUBTX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain has no RPC URLs configured");
        }
        if self.engine.max_in_flight_orchestrators == 0 {
            anyhow::bail!("max_in_flight_orchestrators must be at least 1");
        }
        if self.orchestrator.max_in_flight_txs == 0 {
            anyhow::bail!("max_in_flight_txs must be at least 1");
        }
        if let Some(addr) = &self.fueling.source_address {
            addr.parse::<ethers::types::Address>()
                .map_err(|e| anyhow::anyhow!("Invalid fueling source address {}: {}", addr, e))?;
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
