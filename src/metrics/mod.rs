//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and block height
//! - Transaction lifecycle events
//! - Pending transactions per chain
//! - Error rates

use crate::error::{RelayerError, RelayerResult};
use crate::events::LifecycleEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "treasury_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "treasury_chain_block_height",
        "Last block processed per chain",
        &["chain_id"]
    ).unwrap();

    // Lifecycle metrics
    pub static ref LIFECYCLE_EVENTS: CounterVec = register_counter_vec!(
        "treasury_lifecycle_events_total",
        "Total lifecycle events by type",
        &["chain_id", "event_type"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "treasury_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_RETRIED: CounterVec = register_counter_vec!(
        "treasury_transactions_retried_total",
        "Total replacement transactions with bumped fees",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_INCLUDED: CounterVec = register_counter_vec!(
        "treasury_transactions_included_total",
        "Total transactions included",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CANCELLED: CounterVec = register_counter_vec!(
        "treasury_transactions_cancelled_total",
        "Total transactions cancelled",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILURES: CounterVec = register_counter_vec!(
        "treasury_transaction_failures_total",
        "Total failed retries, cancellations and block passes",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref TX_PENDING: GaugeVec = register_gauge_vec!(
        "treasury_transactions_pending",
        "Transactions currently tracked",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "treasury_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "treasury_health_check_failure_total",
        "Total failed health checks",
        &[]
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

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_pending(chain_id: u64, pending: usize) {
    TX_PENDING
        .with_label_values(&[&chain_id.to_string()])
        .set(pending as f64);
}

pub fn record_event(chain_id: u64, event: &LifecycleEvent) {
    let chain = chain_id.to_string();
    LIFECYCLE_EVENTS
        .with_label_values(&[&chain, event.name()])
        .inc();

    match event {
        LifecycleEvent::Submitted { .. } => TX_SUBMITTED.with_label_values(&[&chain]).inc(),
        LifecycleEvent::Retry { .. } => TX_RETRIED.with_label_values(&[&chain]).inc(),
        LifecycleEvent::Included { .. } => TX_INCLUDED.with_label_values(&[&chain]).inc(),
        LifecycleEvent::Cancel { .. } => TX_CANCELLED.with_label_values(&[&chain]).inc(),
        LifecycleEvent::RetryFailed { .. }
        | LifecycleEvent::CancelFailed { .. }
        | LifecycleEvent::ProcessingBlockFailed { .. } => TX_FAILURES
            .with_label_values(&[&chain, event.name()])
            .inc(),
    }
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_events_show_up_in_exposition() {
        record_event(
            424242,
            &LifecycleEvent::RetryFailed {
                id: Uuid::new_v4(),
                error: "underpriced".to_string(),
            },
        );
        record_pending(424242, 3);

        let text = render().unwrap();
        assert!(text.contains("treasury_transaction_failures_total"));
        assert!(text.contains("kind=\"retry_failed\""));
        assert!(text.contains("treasury_transactions_pending{chain_id=\"424242\"} 3"));
    }
}
