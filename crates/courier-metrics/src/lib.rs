//! Prometheus metrics for courier bus clients
//!
//! Provides centralized metrics collection for monitoring:
//! - Produce throughput, latency and circuit-breaker rejections
//! - Consume outcomes and handler retries
//! - Dead-letter routing
//! - Circuit breaker state

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge, register_histogram, register_int_counter_vec, Encoder, Gauge,
    Histogram, IntCounterVec, TextEncoder,
};

// ============================================================================
// Produce Metrics
// ============================================================================

/// Successful produce operations per topic
pub static PRODUCE_SUCCESS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_produce_success_total",
            "Total number of successful produce operations"
        ),
        &["topic"]
    )
    .expect("Failed to register PRODUCE_SUCCESS metric")
});

/// Produce operations that reached the transport and failed
pub static PRODUCE_FAILURE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_produce_failure_total",
            "Total number of failed produce operations"
        ),
        &["topic"]
    )
    .expect("Failed to register PRODUCE_FAILURE metric")
});

/// Produce operations rejected by an open circuit
pub static PRODUCE_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_produce_rejected_total",
            "Produce calls rejected without a network attempt (circuit open)"
        ),
        &["topic"]
    )
    .expect("Failed to register PRODUCE_REJECTED metric")
});

/// Produce latency histogram
pub static PRODUCE_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "courier_produce_latency_seconds",
        "Produce round-trip latency in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register PRODUCE_LATENCY metric")
});

// ============================================================================
// Consume Metrics
// ============================================================================

/// Messages handled successfully per topic
pub static CONSUME_SUCCESS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_consume_success_total",
            "Total number of successfully handled messages"
        ),
        &["topic"]
    )
    .expect("Failed to register CONSUME_SUCCESS metric")
});

/// Handler retries per topic
pub static HANDLER_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_handler_retries_total",
            "Total number of handler retries after a failure"
        ),
        &["topic"]
    )
    .expect("Failed to register HANDLER_RETRIES metric")
});

// ============================================================================
// Dead-Letter Metrics
// ============================================================================

/// Messages routed to a dead-letter topic, by reason ("parse" | "handler")
pub static DLQ_ROUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_dlq_routed_total",
            "Messages forwarded to a dead-letter topic"
        ),
        &["topic", "reason"]
    )
    .expect("Failed to register DLQ_ROUTED metric")
});

/// Dead-letter publishes that failed (message dropped)
pub static DLQ_PUBLISH_FAILURE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "courier_dlq_publish_failure_total",
            "Dead-letter publishes that failed"
        ),
        &["topic"]
    )
    .expect("Failed to register DLQ_PUBLISH_FAILURE metric")
});

// ============================================================================
// Circuit Breaker Metrics
// ============================================================================

/// Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)
pub static CIRCUIT_BREAKER_STATE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(opts!(
        "courier_circuit_breaker_state",
        "Produce circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)"
    ))
    .expect("Failed to register CIRCUIT_BREAKER_STATE metric")
});

// ============================================================================
// Metrics Collection
// ============================================================================

/// Gather all registered metrics and encode as Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
