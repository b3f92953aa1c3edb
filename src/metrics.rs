// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Cache hits and misses per entity type
//! - Pending-write queue and flush outcomes
//! - Dead letters
//! - Publish / dispatch of mutation envelopes
//! - Coordinator state and cache backoff
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only emits through the `metrics` facade. Installing a recorder
//! (Prometheus exporter or otherwise) is up to the host process.
//!
//! # Usage
//!
//! ```rust,no_run
//! use entity_relay::metrics;
//! use std::time::Duration;
//!
//! metrics::record_cache_lookup("User", true);
//! metrics::record_flush("users", 10, 1, 0, Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Cache Repository Metrics
// =============================================================================

/// Record a cache lookup by id.
pub fn record_cache_lookup(entity_type: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("relay_cache_lookups_total", "entity_type" => entity_type.to_string(), "result" => result)
        .increment(1);
}

/// Record a filtered scan over cached records, and whether it fell through to the store.
pub fn record_cache_scan(entity_type: &str, scanned: usize, fell_through: bool) {
    histogram!("relay_cache_scan_size", "entity_type" => entity_type.to_string()).record(scanned as f64);
    if fell_through {
        counter!("relay_cache_scan_fallthrough_total", "entity_type" => entity_type.to_string())
            .increment(1);
    }
}

/// Record a write enqueued for the flush loop.
pub fn record_pending_enqueued(entity_type: &str, kind: &str) {
    counter!(
        "relay_pending_enqueued_total",
        "entity_type" => entity_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Current pending-write queue depth for a repository.
pub fn set_pending_depth(repository: &str, depth: usize) {
    gauge!("relay_pending_depth", "repository" => repository.to_string()).set(depth as f64);
}

/// Record a rejected save on a non-receiver.
pub fn record_not_authoritative(entity_type: &str) {
    counter!("relay_not_authoritative_total", "entity_type" => entity_type.to_string()).increment(1);
}

// =============================================================================
// Flush Metrics
// =============================================================================

/// Record one drain of a repository's pending-write queue.
pub fn record_flush(
    repository: &str,
    applied: usize,
    requeued: usize,
    dead_lettered: usize,
    duration: Duration,
) {
    let repo = repository.to_string();

    counter!("relay_flush_applied_total", "repository" => repo.clone()).increment(applied as u64);
    if requeued > 0 {
        counter!("relay_flush_requeued_total", "repository" => repo.clone())
            .increment(requeued as u64);
    }
    if dead_lettered > 0 {
        counter!("relay_flush_dead_lettered_total", "repository" => repo.clone())
            .increment(dead_lettered as u64);
    }
    histogram!("relay_flush_duration_seconds", "repository" => repo).record(duration.as_secs_f64());
}

/// Record a flush that was skipped (another drain in progress or backing off).
pub fn record_flush_skipped(repository: &str, reason: &str) {
    counter!(
        "relay_flush_skipped_total",
        "repository" => repository.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a write moved to the dead-letter log.
pub fn record_dead_letter(entity_type: &str, kind: &str) {
    counter!(
        "relay_dead_letters_total",
        "entity_type" => entity_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a store retry (SQLITE_BUSY / SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("relay_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Replication Metrics
// =============================================================================

/// Record an envelope publish attempt.
pub fn record_publish(entity_type: &str, kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "relay_publish_total",
        "entity_type" => entity_type.to_string(),
        "kind" => kind.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record an inbound envelope dropped before reaching the queue.
pub fn record_envelope_dropped(channel: &str, reason: &str) {
    counter!(
        "relay_envelopes_dropped_total",
        "channel" => channel.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record one dispatched inbound action.
pub fn record_dispatch(entity_type: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "relay_dispatch_total",
        "entity_type" => entity_type.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Current inbound action queue depth.
pub fn set_inbound_depth(depth: usize) {
    gauge!("relay_inbound_depth").set(depth as f64);
}

// =============================================================================
// Coordinator Metrics
// =============================================================================

/// Gauge for coordinator state.
pub fn set_coordinator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("relay_coordinator_state").set(value);
}

/// Record a flush tick skipped because the cache was unreachable.
pub fn record_cache_backoff(delay: Duration) {
    counter!("relay_cache_backoffs_total").increment(1);
    histogram!("relay_cache_backoff_seconds").record(delay.as_secs_f64());
}

/// Record a cache command latency.
pub fn record_cache_latency(operation: &str, duration: Duration) {
    histogram!("relay_cache_operation_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; the tests make sure the
    // macros accept every label combination.

    #[test]
    fn test_cache_metrics() {
        record_cache_lookup("User", true);
        record_cache_lookup("User", false);
        record_cache_scan("User", 0, true);
        record_cache_scan("User", 42, false);
        record_cache_latency("mget", Duration::from_micros(300));
    }

    #[test]
    fn test_pending_metrics() {
        record_pending_enqueued("User", "SAVE");
        set_pending_depth("users", 3);
        set_pending_depth("users", 0);
        record_not_authoritative("User");
    }

    #[test]
    fn test_flush_metrics() {
        record_flush("users", 10, 0, 0, Duration::from_millis(5));
        record_flush("users", 0, 3, 1, Duration::ZERO);
        record_flush_skipped("users", "busy");
        record_dead_letter("User", "DELETE");
        record_store_retry("upsert");
    }

    #[test]
    fn test_replication_metrics() {
        record_publish("User", "SAVE", true);
        record_publish("User", "SAVE", false);
        record_envelope_dropped("mutation:User", "self_origin");
        record_dispatch("User", true);
        set_inbound_depth(7);
    }

    #[test]
    fn test_coordinator_metrics() {
        for state in ["Created", "Running", "ShuttingDown", "Stopped", "Bogus"] {
            set_coordinator_state(state);
        }
        record_cache_backoff(Duration::from_millis(200));
    }
}
