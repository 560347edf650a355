/*!
 * # Metrics Module
 *
 * Prometheus collectors for the payment reconciliation and cache layers.
 *
 * - Cache hits, misses, backend errors and background write failures
 * - Webhook events by event type and outcome
 * - Dead-lettered gateway events
 * - Payment intents / checkout sessions created, refunds by outcome
 *
 * Exposed in Prometheus text format at `/metrics`.
 */

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    IntCounter, IntCounterVec, TextEncoder,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to export metrics: {0}")]
    ExportError(String),
}

lazy_static! {
    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "cache_hits_total",
        "Total number of cache hits"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = register_int_counter!(
        "cache_misses_total",
        "Total number of cache misses"
    ).unwrap();

    pub static ref CACHE_BACKEND_ERRORS: IntCounterVec = register_int_counter_vec!(
        "cache_backend_errors_total",
        "Cache backend errors swallowed by the cache service",
        &["operation"]
    ).unwrap();

    pub static ref CACHE_BACKGROUND_WRITE_FAILURES: IntCounter = register_int_counter!(
        "cache_background_write_failures_total",
        "Background cache writes that failed or timed out"
    ).unwrap();

    // Payment metrics
    pub static ref WEBHOOK_EVENTS: IntCounterVec = register_int_counter_vec!(
        "payment_webhook_events_total",
        "Gateway webhook events received, by type and outcome",
        &["event_type", "outcome"]
    ).unwrap();

    pub static ref WEBHOOK_DEAD_LETTERS: IntCounter = register_int_counter!(
        "payment_webhook_dead_letters_total",
        "Verified gateway events that could not be correlated with an order"
    ).unwrap();

    pub static ref PAYMENT_INTENTS_CREATED: IntCounter = register_int_counter!(
        "payment_intents_created_total",
        "Payment intents created with the gateway"
    ).unwrap();

    pub static ref CHECKOUT_SESSIONS_CREATED: IntCounter = register_int_counter!(
        "checkout_sessions_created_total",
        "Checkout sessions created with the gateway"
    ).unwrap();

    pub static ref REFUNDS: IntCounterVec = register_int_counter_vec!(
        "payment_refunds_total",
        "Refunds issued, by gateway-reported outcome",
        &["outcome"]
    ).unwrap();

    pub static ref GATEWAY_REQUEST_DURATION: Histogram = register_histogram!(
        "payment_gateway_request_duration_seconds",
        "Latency of payment gateway API calls in seconds"
    ).unwrap();
}

pub fn record_webhook_event(event_type: &str, outcome: &str) {
    WEBHOOK_EVENTS
        .with_label_values(&[event_type, outcome])
        .inc();
}

pub fn record_cache_backend_error(operation: &str) {
    CACHE_BACKEND_ERRORS.with_label_values(&[operation]).inc();
}

/// Renders every registered collector in Prometheus text format
pub async fn metrics_handler() -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| MetricsError::ExportError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::ExportError(e.to_string()))
}
