//! Prometheus metrics for the send pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "notifyd";

lazy_static! {
    /// Notifications accepted per channel
    pub static ref NOTIFICATIONS_ACCEPTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifications_accepted_total", METRIC_PREFIX),
        "Notifications accepted for delivery",
        &["channel"]
    ).unwrap();

    /// Provider send attempts by outcome
    pub static ref PROVIDER_SEND_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_provider_send_total", METRIC_PREFIX),
        "Provider send attempts",
        &["provider", "result"]
    ).unwrap();

    /// Terminal notification outcomes
    pub static ref NOTIFICATIONS_TERMINAL_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifications_terminal_total", METRIC_PREFIX),
        "Notifications reaching a terminal state",
        &["status"]
    ).unwrap();

    /// Quota rejections at acceptance
    pub static ref QUOTA_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_quota_rejected_total", METRIC_PREFIX),
        "Send requests rejected for quota exhaustion"
    ).unwrap();

    /// Shards currently owned by this process
    pub static ref SHARDS_OWNED: IntGauge = register_int_gauge!(
        format!("{}_shards_owned", METRIC_PREFIX),
        "Scheduler shards currently owned by this process"
    ).unwrap();

    /// Scheduler batch send latency
    pub static ref SCHEDULER_BATCH_SECONDS: Histogram = register_histogram!(
        format!("{}_scheduler_batch_seconds", METRIC_PREFIX),
        "Latency of one scheduler scan-and-send iteration",
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]
    ).unwrap();

    /// Tenant callback attempts by outcome
    pub static ref CALLBACK_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_callback_attempts_total", METRIC_PREFIX),
        "Result callback delivery attempts",
        &["result"]
    ).unwrap();

    /// Transaction check-back attempts by verdict
    pub static ref TX_CHECK_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_tx_check_total", METRIC_PREFIX),
        "Transaction check-back calls",
        &["verdict"]
    ).unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
