//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation and resyncs
//! - Transaction submission
//! - Gas price refreshes
//! - Filter streams and the pending transaction fanout

use crate::error::{PipeError, PipeResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::U256;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::future::Future;
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Nonce metrics
    pub static ref NONCE_ALLOCATED: IntCounter = register_int_counter!(
        "txpipe_nonces_allocated_total",
        "Total nonces handed out"
    ).unwrap();

    pub static ref NONCE_RESYNCS: IntCounterVec = register_int_counter_vec!(
        "txpipe_nonce_resyncs_total",
        "Nonce syncs with the node by trigger",
        &["trigger"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: IntCounter = register_int_counter!(
        "txpipe_transactions_submitted_total",
        "Total transactions accepted by the node"
    ).unwrap();

    pub static ref TX_FAILED: IntCounterVec = register_int_counter_vec!(
        "txpipe_transactions_failed_total",
        "Total failed submissions by reason",
        &["reason"]
    ).unwrap();

    // Gas metrics
    pub static ref GAS_PRICE_GWEI: Gauge = register_gauge!(
        "txpipe_gas_price_gwei",
        "Last gas price reported by the node"
    ).unwrap();

    pub static ref GAS_REFRESH_FAILURES: IntCounter = register_int_counter!(
        "txpipe_gas_refresh_failures_total",
        "Total failed gas price refreshes"
    ).unwrap();

    // Stream metrics
    pub static ref FILTER_ITEMS: IntCounterVec = register_int_counter_vec!(
        "txpipe_filter_items_total",
        "Items delivered by filter streams",
        &["kind"]
    ).unwrap();

    pub static ref FILTER_REINSTALLS: IntCounterVec = register_int_counter_vec!(
        "txpipe_filter_reinstalls_total",
        "Filters reinstalled after expiring on the node",
        &["kind"]
    ).unwrap();

    pub static ref FILTER_POLL_ERRORS: IntCounterVec = register_int_counter_vec!(
        "txpipe_filter_poll_errors_total",
        "Transient filter poll failures",
        &["kind"]
    ).unwrap();

    pub static ref FANOUT_RESOLVED: IntCounter = register_int_counter!(
        "txpipe_fanout_resolved_total",
        "Pending transactions resolved by hash"
    ).unwrap();

    pub static ref FANOUT_DROPPED: IntCounter = register_int_counter!(
        "txpipe_fanout_dropped_total",
        "Pending transaction hashes that could not be resolved"
    ).unwrap();

    pub static ref FANOUT_IN_FLIGHT: IntGauge = register_int_gauge!(
        "txpipe_fanout_in_flight",
        "Transaction lookups currently in flight"
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

    /// Serve `/metrics` until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> PipeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| PipeError::Config(format!("Cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| PipeError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> PipeResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| PipeError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| PipeError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_nonce_allocated() {
    NONCE_ALLOCATED.inc();
}

pub fn record_nonce_resync(trigger: &str) {
    NONCE_RESYNCS.with_label_values(&[trigger]).inc();
}

pub fn record_tx_submitted() {
    TX_SUBMITTED.inc();
}

pub fn record_tx_failed(reason: &str) {
    TX_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_gas_price(wei: U256) {
    // lossy above 2^64 wei, which no real gas price reaches
    let gwei = wei.low_u128() as f64 / 1e9;
    GAS_PRICE_GWEI.set(gwei);
}

pub fn record_gas_refresh_failure() {
    GAS_REFRESH_FAILURES.inc();
}

pub fn record_filter_items(kind: &str, count: usize) {
    FILTER_ITEMS.with_label_values(&[kind]).inc_by(count as u64);
}

pub fn record_filter_reinstall(kind: &str) {
    FILTER_REINSTALLS.with_label_values(&[kind]).inc();
}

pub fn record_filter_poll_error(kind: &str) {
    FILTER_POLL_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_fanout_resolved() {
    FANOUT_RESOLVED.inc();
}

pub fn record_fanout_dropped() {
    FANOUT_DROPPED.inc();
}

pub fn record_fanout_in_flight(in_flight: usize) {
    FANOUT_IN_FLIGHT.set(in_flight as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_output_lists_recorded_metrics() {
        record_filter_reinstall("logs");
        record_gas_price(U256::from(5_000_000_000u64));

        let text = render().unwrap();
        assert!(text.contains("txpipe_filter_reinstalls_total{kind=\"logs\"}"));
        assert!(text.contains("txpipe_gas_price_gwei"));
    }
}
