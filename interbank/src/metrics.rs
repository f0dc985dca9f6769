//! Prometheus metrics for the interbank core

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    /// Inbound messages by type and outcome
    pub static ref INBOUND_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "interbank_inbound_messages_total",
        "Total inbound interbank messages",
        &["message_type", "outcome"]
    )
    .unwrap();

    /// Votes this bank cast
    pub static ref VOTES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "interbank_votes_total",
        "Votes cast on inbound messages",
        &["message_type", "vote"]
    )
    .unwrap();

    /// Outbound delivery attempts by type and status
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "interbank_delivery_attempts_total",
        "Outbound delivery attempts",
        &["message_type", "status"]
    )
    .unwrap();

    /// Outbound delivery attempt duration
    pub static ref DELIVERY_DURATION: HistogramVec = register_histogram_vec!(
        "interbank_delivery_duration_seconds",
        "Outbound delivery attempt duration in seconds",
        &["message_type"]
    )
    .unwrap();

    /// Duplicate inbound messages answered from the stored response
    pub static ref REPLAYS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "interbank_replays_total",
        "Duplicate inbound messages answered by replay",
        &["message_type"]
    )
    .unwrap();
}

/// Default registry in the text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
