// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the sync transport.
//!
//! Metrics are registered once in the global default registry through
//! `lazy_static`, so every connection and dispatcher in the process shares them.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Connection ---
    /// 1 while the broker connection is considered active, 0 otherwise.
    pub static ref BROKER_CONNECTED: Gauge =
        register_gauge!("fleetsync_broker_connected", "Whether the broker connection is active (1) or not (0).").unwrap();
    /// Active/inactive transitions, labeled `lost` or `restored`.
    pub static ref CONNECTION_TRANSITIONS_TOTAL: CounterVec =
        register_counter_vec!("fleetsync_connection_transitions_total", "Broker connectivity transitions.", &["direction"]).unwrap();
    /// Failed broker operations, labeled by error kind.
    pub static ref BROKER_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("fleetsync_broker_errors_total", "Failed broker operations by error kind.", &["kind"]).unwrap();
    pub static ref SUBSCRIBE_RETRIES_TOTAL: Counter =
        register_counter!("fleetsync_subscribe_retries_total", "Subscription attempts retried after a failure.").unwrap();
    /// Latency of single request/response broker operations.
    pub static ref OPERATION_LATENCY_SECONDS: Histogram =
        register_histogram!("fleetsync_operation_latency_seconds", "Latency of broker operations in seconds.").unwrap();

    // --- Dispatch ---
    pub static ref MESSAGES_PUBLISHED_TOTAL: Counter =
        register_counter!("fleetsync_messages_published_total", "Messages published to the broker.").unwrap();
    /// Messages handed to a channel handler, labeled by logical channel.
    pub static ref MESSAGES_DELIVERED_TOTAL: CounterVec =
        register_counter_vec!("fleetsync_messages_delivered_total", "Messages delivered to channel handlers.", &["channel"]).unwrap();
    /// Messages dropped before reaching a handler, labeled by reason.
    pub static ref MESSAGES_DROPPED_TOTAL: CounterVec =
        register_counter_vec!("fleetsync_messages_dropped_total", "Messages dropped before delivery.", &["reason"]).unwrap();
    pub static ref HANDLER_PANICS_TOTAL: Counter =
        register_counter!("fleetsync_handler_panics_total", "Channel handler invocations that panicked.").unwrap();

    // --- Routing ---
    /// Routed commands, labeled by command tag.
    pub static ref COMMANDS_ROUTED_TOTAL: CounterVec =
        register_counter_vec!("fleetsync_commands_routed_total", "Commands handled by the action router.", &["tag"]).unwrap();
    pub static ref DECODE_FAILURES_TOTAL: Counter =
        register_counter!("fleetsync_decode_failures_total", "Frames that could not be decoded.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
