//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Orchestrator pool state
//! - Transaction submission and confirmation
//! - Fueling activity
//! - Engine poll latency

use crate::error::EngineResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_gauge_vec, register_histogram, Counter, Encoder,
    Gauge, GaugeVec, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Orchestrator pool metrics
    pub static ref ORCHESTRATORS_BY_STATE: GaugeVec = register_gauge_vec!(
        "pubtx_orchestrators_by_state",
        "Orchestrators currently in each lifecycle state",
        &["state"]
    ).unwrap();

    pub static ref ORCHESTRATOR_FREE_SLOTS: Gauge = register_gauge!(
        "pubtx_orchestrator_free_slots",
        "Unused orchestrator pool slots"
    ).unwrap();

    pub static ref ENGINE_POLL_SECONDS: Histogram = register_histogram!(
        "pubtx_engine_poll_seconds",
        "Engine poll loop duration",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: Counter = register_counter!(
        "pubtx_transactions_submitted_total",
        "Total transaction broadcasts to the base ledger"
    ).unwrap();

    pub static ref TX_CONFIRMED: Counter = register_counter!(
        "pubtx_transactions_confirmed_total",
        "Total transactions confirmed successfully"
    ).unwrap();

    pub static ref TX_FAILED: Counter = register_counter!(
        "pubtx_transactions_failed_total",
        "Total transactions with a failed receipt"
    ).unwrap();

    pub static ref TX_SUSPENDED: Counter = register_counter!(
        "pubtx_transactions_suspended_total",
        "Total transactions suspended after attempt saturation"
    ).unwrap();

    // Fueling metrics
    pub static ref FUELING_REQUESTED: Counter = register_counter!(
        "pubtx_fueling_transactions_total",
        "Total fueling transactions created"
    ).unwrap();

    // Ledger metrics
    pub static ref REORGS_DETECTED: Counter = register_counter!(
        "pubtx_reorgs_detected_total",
        "Total reorgs observed by the confirmation tracker"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::EngineError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::EngineError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_pool_state(counts: &std::collections::HashMap<&'static str, usize>, free_slots: usize) {
    for (state, count) in counts {
        ORCHESTRATORS_BY_STATE
            .with_label_values(&[state])
            .set(*count as f64);
    }
    ORCHESTRATOR_FREE_SLOTS.set(free_slots as f64);
}

pub fn record_poll_duration(seconds: f64) {
    ENGINE_POLL_SECONDS.observe(seconds);
}

pub fn record_tx_submitted() {
    TX_SUBMITTED.inc();
}

pub fn record_tx_confirmed() {
    TX_CONFIRMED.inc();
}

pub fn record_tx_failed() {
    TX_FAILED.inc();
}

pub fn record_tx_suspended() {
    TX_SUSPENDED.inc();
}

pub fn record_fueling_requested() {
    FUELING_REQUESTED.inc();
}

pub fn record_reorg() {
    REORGS_DETECTED.inc();
}
