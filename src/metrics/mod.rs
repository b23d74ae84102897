//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - RPC endpoint health and failover
//! - Transaction submission, retries and confirmation
//! - Oracle queries by source
//! - Distribution outcomes, treasury balances and alerts

use crate::error::{DispersalError, DispersalResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // RPC metrics
    pub static ref RPC_ENDPOINT_HEALTHY: GaugeVec = register_gauge_vec!(
        "dispersal_rpc_endpoint_healthy",
        "RPC endpoint health (1=healthy, 0=unhealthy)",
        &["chain_id", "endpoint"]
    ).unwrap();

    pub static ref RPC_ENDPOINT_LATENCY: GaugeVec = register_gauge_vec!(
        "dispersal_rpc_endpoint_latency_seconds",
        "Latency of the last liveness probe",
        &["chain_id", "endpoint"]
    ).unwrap();

    pub static ref RPC_FAILOVERS: CounterVec = register_counter_vec!(
        "dispersal_rpc_failovers_total",
        "Total RPC endpoint rebinds",
        &["chain_id"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "dispersal_transactions_submitted_total",
        "Total transactions broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "dispersal_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "dispersal_transactions_failed_total",
        "Total transactions failed by reason",
        &["chain_id", "reason"]
    ).unwrap();

    pub static ref TX_RETRIES: CounterVec = register_counter_vec!(
        "dispersal_transaction_retries_total",
        "Total submission retries by cause",
        &["chain_id", "cause"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "dispersal_transaction_latency_seconds",
        "Submission to confirmation latency",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Oracle metrics
    pub static ref ORACLE_QUERIES: CounterVec = register_counter_vec!(
        "dispersal_oracle_queries_total",
        "Total price queries by source and outcome",
        &["source", "outcome"]
    ).unwrap();

    pub static ref ORACLE_LATENCY: HistogramVec = register_histogram_vec!(
        "dispersal_oracle_latency_seconds",
        "Price query latency",
        &["source"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Distribution metrics
    pub static ref DISTRIBUTIONS: CounterVec = register_counter_vec!(
        "dispersal_distributions_total",
        "Total per-chain distributions by outcome",
        &["chain_id", "outcome"]
    ).unwrap();

    pub static ref TREASURY_BALANCE: GaugeVec = register_gauge_vec!(
        "dispersal_treasury_native_balance",
        "Treasury native balance in whole units",
        &["chain_id"]
    ).unwrap();

    pub static ref INTENT_TRANSITIONS: CounterVec = register_counter_vec!(
        "dispersal_intent_transitions_total",
        "Total aggregate intent status changes",
        &["status"]
    ).unwrap();

    pub static ref ALERTS: CounterVec = register_counter_vec!(
        "dispersal_alerts_total",
        "Total alerts raised by severity",
        &["severity"]
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

    pub async fn run(&self) -> DispersalResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DispersalError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| DispersalError::Internal(format!("Metrics server stopped: {}", e)))
    }
}

async fn metrics_handler() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

// Helper functions to record metrics

pub fn record_endpoint_health(chain_id: u64, endpoint: &str, healthy: bool, latency_secs: f64) {
    let labels = [chain_id.to_string(), endpoint.to_string()];
    let labels = [labels[0].as_str(), labels[1].as_str()];
    RPC_ENDPOINT_HEALTHY
        .with_label_values(&labels)
        .set(if healthy { 1.0 } else { 0.0 });
    if healthy {
        RPC_ENDPOINT_LATENCY
            .with_label_values(&labels)
            .set(latency_secs);
    }
}

pub fn record_failover(chain_id: u64) {
    RPC_FAILOVERS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64, latency_secs: f64) {
    let chain = chain_id.to_string();
    TX_CONFIRMED.with_label_values(&[&chain]).inc();
    TX_LATENCY.with_label_values(&[&chain]).observe(latency_secs);
}

pub fn record_tx_failed(chain_id: u64, reason: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc();
}

pub fn record_tx_retry(chain_id: u64, cause: &str) {
    TX_RETRIES
        .with_label_values(&[&chain_id.to_string(), cause])
        .inc();
}

pub fn record_oracle_query(source: &str, success: bool, latency_secs: f64) {
    ORACLE_QUERIES
        .with_label_values(&[source, if success { "success" } else { "failure" }])
        .inc();
    ORACLE_LATENCY
        .with_label_values(&[source])
        .observe(latency_secs);
}

pub fn record_distribution(chain_id: u64, outcome: &str) {
    DISTRIBUTIONS
        .with_label_values(&[&chain_id.to_string(), outcome])
        .inc();
}

pub fn record_treasury_balance(chain_id: u64, balance: f64) {
    TREASURY_BALANCE
        .with_label_values(&[&chain_id.to_string()])
        .set(balance);
}

pub fn record_intent_status(status: &str) {
    INTENT_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn record_alert(severity: &str) {
    ALERTS.with_label_values(&[severity]).inc();
}
