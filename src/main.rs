//! Public transaction submission engine
//!
//! Drives pending public transactions through nonce assignment, gas pricing,
//! signing, broadcast and block-confirmation tracking against a base ledger,
//! with per-signer orchestrators scheduled fairly under a bounded pool.

use anyhow::{Context, Result};
use ethers::types::U256;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod chain;
mod config;
mod confirm;
mod engine;
mod error;
mod events;
mod fueling;
mod gas;
mod keystore;
mod metrics;
mod orchestrator;
mod retry;
mod store;
#[cfg(test)]
mod testutil;
mod types;

use chain::EthersLedger;
use config::Settings;
use confirm::ConfirmationTracker;
use engine::PubTxEngine;
use events::EventDispatcher;
use fueling::{CompletedNonceCache, FuelingManager};
use gas::GasPriceOracle;
use keystore::{KeyStoreListable, LocalKeyStore};
use metrics::MetricsServer;
use orchestrator::OrchestratorContext;
use retry::RetryPolicy;
use store::{InMemoryTxStore, SqlTxStore, TransactionStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!(
        "Starting public transaction engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    let settings = Settings::load()?;
    info!("Loaded configuration for chain {}", settings.chain.chain_id);

    let store_dyn: Arc<dyn TransactionStore> = if settings.database.url == "memory" {
        info!("Using ephemeral in-memory transaction store");
        Arc::new(InMemoryTxStore::new())
    } else {
        let store = Arc::new(SqlTxStore::new(&settings.database).await?);
        info!("Database connection established");
        store.run_migrations().await?;
        store
    };

    let ledger = Arc::new(EthersLedger::new(settings.chain.clone())?);
    info!("Ledger providers initialized");

    let keys = Arc::new(LocalKeyStore::load(
        &settings.wallet,
        settings.chain.chain_id,
    )?);
    info!(
        "Signing keys available for {} addresses",
        keys.list_addresses().len()
    );

    let gas_oracle = Arc::new(GasPriceOracle::new(
        ledger.clone(),
        std::time::Duration::from_millis(settings.gas.cache_ttl_ms),
    ));

    let completed = Arc::new(CompletedNonceCache::new());
    let dispatcher = EventDispatcher::new();
    let tracker = Arc::new(ConfirmationTracker::new(
        ledger.clone(),
        settings.chain.confirmation_blocks,
    ));

    let fueling = match &settings.fueling.source_address {
        Some(source) => {
            let source = source
                .parse()
                .with_context(|| format!("Invalid fueling source address {}", source))?;
            Some(Arc::new(FuelingManager::new(
                store_dyn.clone(),
                completed.clone(),
                source,
                U256::from(settings.fueling.gas_limit),
            )))
        }
        None => None,
    };

    let ctx = OrchestratorContext {
        store: store_dyn,
        ledger: ledger.clone(),
        keys,
        gas: gas_oracle,
        fueling,
        tracker,
        completed,
        dispatcher,
        retry: RetryPolicy::new(&settings.retry),
        chain_id: settings.chain.chain_id,
    };

    let pubtx_engine = PubTxEngine::new(
        settings.engine.clone(),
        settings.orchestrator.clone(),
        ctx,
    );

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    pubtx_engine.start();
    ledger.spawn_block_feed(pubtx_engine.shutdown_signal());
    info!("Engine is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    pubtx_engine.stop().await;
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pubtx_engine=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
