//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swap creation and status transitions
//! - Transactions sent
//! - Lock contention and polling
//! - Balance sync failures

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    pub static ref SWAPS_CREATED: CounterVec = register_counter_vec!(
        "swap_orchestrator_swaps_created_total",
        "Total swaps created",
        &["provider", "from", "to"]
    ).expect("metric registration");

    pub static ref STATUS_TRANSITIONS: CounterVec = register_counter_vec!(
        "swap_orchestrator_status_transitions_total",
        "Total history status transitions",
        &["kind", "status"]
    ).expect("metric registration");

    pub static ref TX_SENT: CounterVec = register_counter_vec!(
        "swap_orchestrator_transactions_sent_total",
        "Total transactions submitted",
        &["chain"]
    ).expect("metric registration");

    pub static ref LOCK_CONTENTION: CounterVec = register_counter_vec!(
        "swap_orchestrator_lock_contention_total",
        "Failed lock attempts per chain",
        &["chain"]
    ).expect("metric registration");

    pub static ref POLL_ATTEMPTS: CounterVec = register_counter_vec!(
        "swap_orchestrator_poll_attempts_total",
        "Poll invocations by the retry scheduler",
        &["outcome"]
    ).expect("metric registration");

    pub static ref BALANCE_SYNC_FAILURES: CounterVec = register_counter_vec!(
        "swap_orchestrator_balance_sync_failures_total",
        "Balance fetch failures per asset",
        &["asset"]
    ).expect("metric registration");

    pub static ref SWAP_DURATION: HistogramVec = register_histogram_vec!(
        "swap_orchestrator_swap_duration_seconds",
        "Time from swap creation to terminal status",
        &["provider"],
        vec![60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 21600.0, 86400.0]
    ).expect("metric registration");
}

/// Routes exposing the default Prometheus registry
pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_swap_created(provider: &str, from: &str, to: &str) {
    SWAPS_CREATED.with_label_values(&[provider, from, to]).inc();
}

pub fn record_status_transition(kind: &str, status: &str) {
    STATUS_TRANSITIONS.with_label_values(&[kind, status]).inc();
}

pub fn record_tx_sent(chain: &str) {
    TX_SENT.with_label_values(&[chain]).inc();
}

pub fn record_lock_contention(chain: &str) {
    LOCK_CONTENTION.with_label_values(&[chain]).inc();
}

pub fn record_poll_attempt(outcome: &str) {
    POLL_ATTEMPTS.with_label_values(&[outcome]).inc();
}

pub fn record_balance_failure(asset: &str) {
    BALANCE_SYNC_FAILURES.with_label_values(&[asset]).inc();
}

pub fn record_swap_duration(provider: &str, secs: f64) {
    SWAP_DURATION.with_label_values(&[provider]).observe(secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_are_exported() {
        record_swap_created("fastbtc", "BTC", "RBTC");
        record_lock_contention("bitcoin");
        let body = metrics_handler().await.unwrap();
        assert!(body.contains("swap_orchestrator_swaps_created_total"));
        assert!(body.contains("swap_orchestrator_lock_contention_total"));
    }
}
