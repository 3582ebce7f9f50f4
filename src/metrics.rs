//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Gateway call outcomes (success, rejection, fallback, short-circuit)
//! - Circuit breaker state and transitions
//! - Outbox backlog and relay throughput
//! - Event consumption and cache merge stats
//! - Engine lifecycle state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `consistency_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state.
//!
//! # Usage
//!
//! ```rust,no_run
//! use consistency_engine::metrics;
//!
//! // In the gateway after a successful billing call
//! metrics::record_gateway_success();
//!
//! // In the relay after a cycle
//! metrics::record_outbox_pending(3);
//! ```

use metrics::{counter, gauge};

// =============================================================================
// Gateway Metrics
// =============================================================================

/// Record a billing call that completed against the live service.
pub fn record_gateway_success() {
    counter!("consistency_gateway_calls_total", "outcome" => "success").increment(1);
}

/// Record an explicit rejection from the billing service.
pub fn record_gateway_rejection() {
    counter!("consistency_gateway_calls_total", "outcome" => "rejected").increment(1);
}

/// Record a call deferred after exhausting the retry budget.
pub fn record_gateway_fallback() {
    counter!("consistency_gateway_calls_total", "outcome" => "fallback").increment(1);
}

/// Record a call short-circuited by the open breaker.
pub fn record_gateway_short_circuit() {
    counter!("consistency_gateway_calls_total", "outcome" => "short_circuit").increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record a circuit state transition and update the state gauge
/// (0=closed, 1=half_open, 2=open).
pub fn record_circuit_transition(circuit_name: &str, from: &str, to: &str) {
    counter!(
        "consistency_circuit_transitions_total",
        "circuit" => circuit_name.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);

    let value = match to {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("consistency_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

// =============================================================================
// Outbox Metrics
// =============================================================================

/// Record one outbox row acknowledged by the channel.
pub fn record_outbox_published() {
    counter!("consistency_outbox_published_total").increment(1);
}

/// Gauge of rows still awaiting publish.
pub fn record_outbox_pending(pending: u64) {
    gauge!("consistency_outbox_pending").set(pending as f64);
}

// =============================================================================
// Consumer and Cache Metrics
// =============================================================================

/// Record an event consumed from a topic (decoded, handed to the cache).
pub fn record_event_consumed(topic: &str) {
    counter!("consistency_events_consumed_total", "topic" => topic.to_string()).increment(1);
}

/// Record a poisoned message skipped on a topic.
pub fn record_event_poisoned(topic: &str) {
    counter!("consistency_events_poisoned_total", "topic" => topic.to_string()).increment(1);
}

/// Record a cache read by outcome ("hit", "stale", "miss").
pub fn record_cache_read(outcome: &str) {
    counter!("consistency_cache_reads_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a retry of a billing call attempt.
pub fn record_retry_attempt() {
    counter!("consistency_gateway_retries_total").increment(1);
}

/// Record a cursor flush batch.
pub fn record_cursor_flush(flushed: usize) {
    counter!("consistency_cursor_flushes_total").increment(1);
    counter!("consistency_cursor_flushed_total").increment(flushed as u64);
}

/// Record a cache merge that applied.
pub fn record_cache_apply() {
    counter!("consistency_cache_merges_total", "outcome" => "applied").increment(1);
}

/// Record a cache merge skipped as out-of-date.
pub fn record_cache_skip() {
    counter!("consistency_cache_merges_total", "outcome" => "skipped").increment(1);
}

// =============================================================================
// Engine Lifecycle
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting (0=created, 2=running, ...)
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("consistency_engine_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state. These tests verify the
    // functions don't panic; full integration testing would use
    // metrics-util's DebuggingRecorder.

    #[test]
    fn test_gateway_outcomes() {
        record_gateway_success();
        record_gateway_rejection();
        record_gateway_fallback();
        record_gateway_short_circuit();
    }

    #[test]
    fn test_circuit_transitions_all_states() {
        record_circuit_transition("billing", "closed", "open");
        record_circuit_transition("billing", "open", "half_open");
        record_circuit_transition("billing", "half_open", "closed");
        // Unknown state maps to -1 on the gauge
        record_circuit_transition("billing", "closed", "unknown");
    }

    #[test]
    fn test_outbox_metrics() {
        record_outbox_published();
        record_outbox_pending(0);
        record_outbox_pending(100);
    }

    #[test]
    fn test_consumer_metrics() {
        record_event_consumed("patient.created");
        record_event_poisoned("patient.updated");
        record_event_consumed("");
    }

    #[test]
    fn test_cache_metrics() {
        record_cache_apply();
        record_cache_skip();
        record_cache_read("hit");
    }

    #[test]
    fn test_cursor_flush_metrics() {
        record_cursor_flush(0);
        record_cursor_flush(3);
    }

    #[test]
    fn test_set_engine_state_all_states() {
        set_engine_state("Created");
        set_engine_state("Connecting");
        set_engine_state("Running");
        set_engine_state("ShuttingDown");
        set_engine_state("Stopped");
        set_engine_state("Failed");
        set_engine_state("Unknown");
    }
}
