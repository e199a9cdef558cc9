//! Prometheus metrics for the Ripple server.
//!
//! This module provides:
//! - Result cache metrics (hits, misses, evictions)
//! - Invalidation metrics (changes processed per source)
//! - Delivery metrics (sends, retries, drops, live connections)
//!
//! Provider errors are counted by `ripple-cache` itself under
//! `cache_errors_total{op}` and show up in the same registry.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";

    // Invalidation metrics
    pub const INVALIDATIONS_TOTAL: &str = "invalidations_total";
    pub const PREDICATE_FAILURES_TOTAL: &str = "predicate_failures_total";

    // Delivery metrics
    pub const DELIVERY_EVENTS_TOTAL: &str = "delivery_events_total";
    pub const DELIVERY_RETRIES_TOTAL: &str = "delivery_retries_total";
    pub const DELIVERY_DROPPED_TOTAL: &str = "delivery_dropped_total";
    pub const SUBSCRIBER_CONNECTIONS: &str = "subscriber_connections";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Cache Metrics
// =============================================================================

pub fn record_cache_hit(function: &str) {
    counter!(names::CACHE_HITS_TOTAL, "function" => function.to_string()).increment(1);
}

pub fn record_cache_miss(function: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "function" => function.to_string()).increment(1);
}

pub fn record_evictions(count: usize) {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
}

// =============================================================================
// Invalidation Metrics
// =============================================================================

pub fn record_invalidation(source: &str) {
    counter!(names::INVALIDATIONS_TOTAL, "source" => source.to_string()).increment(1);
}

pub fn record_predicate_failure(function: &str, kind: &'static str) {
    counter!(
        names::PREDICATE_FAILURES_TOTAL,
        "function" => function.to_string(),
        "kind" => kind
    )
    .increment(1);
}

// =============================================================================
// Delivery Metrics
// =============================================================================

/// Record a delivery attempt outcome (`sent`, `full`, `closed`, `replayed`).
pub fn record_delivery(outcome: &'static str) {
    counter!(names::DELIVERY_EVENTS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_delivery_retry() {
    counter!(names::DELIVERY_RETRIES_TOTAL).increment(1);
}

pub fn record_delivery_dropped() {
    counter!(names::DELIVERY_DROPPED_TOTAL).increment(1);
}

pub fn increment_connections() {
    gauge!(names::SUBSCRIBER_CONNECTIONS).increment(1.0);
}

pub fn decrement_connections() {
    gauge!(names::SUBSCRIBER_CONNECTIONS).decrement(1.0);
}
