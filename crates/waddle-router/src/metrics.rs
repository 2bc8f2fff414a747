//! Routing metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be installed by
//! the host application. Without one every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-router"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for stanzas routed.
pub fn stanzas_routed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.router.stanzas")
        .with_description("Total stanzas handed to the routers")
        .with_unit("stanza")
        .build()
}

/// Counter for error replies generated instead of delivery.
pub fn bounces() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.router.bounces")
        .with_description("Total stanzas bounced back to their sender")
        .with_unit("stanza")
        .build()
}

/// Counter for messages handed to the offline store.
pub fn offline_stores() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.router.offline")
        .with_description("Total messages handed to the offline store")
        .with_unit("message")
        .build()
}

/// Counter for carbon copies delivered.
pub fn carbons_sent() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.router.carbons")
        .with_description("Total message carbons delivered")
        .with_unit("message")
        .build()
}

/// Counter for interceptor vetoes.
pub fn interceptor_rejections() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.router.interceptor.rejections")
        .with_description("Total stanzas rejected by packet interceptors")
        .with_unit("stanza")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for sessions known to this node.
pub fn sessions_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.sessions.active")
        .with_description("Current number of sessions on this node")
        .with_unit("session")
        .build()
}

/// Gauge for items waiting in a processing channel.
pub fn channel_queue_size() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.channel.queue")
        .with_description("Items waiting in a processing channel")
        .with_unit("item")
        .build()
}

/// Gauge for workers of a processing channel.
pub fn channel_workers() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.channel.workers")
        .with_description("Workers alive in a processing channel")
        .with_unit("worker")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

/// Histogram for routing latency.
pub fn routing_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("xmpp.router.latency")
        .with_description("Time spent routing one stanza")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a stanza entering the routers.
pub fn record_stanza(stanza_type: &str) {
    stanzas_routed().add(1, &[KeyValue::new("type", stanza_type.to_string())]);
}

/// Record a bounce with its error condition.
pub fn record_bounce(stanza_type: &str, condition: &str) {
    bounces().add(
        1,
        &[
            KeyValue::new("type", stanza_type.to_string()),
            KeyValue::new("condition", condition.to_string()),
        ],
    );
}

/// Record an offline store attempt.
pub fn record_offline_store(stored: bool) {
    offline_stores().add(
        1,
        &[KeyValue::new("result", if stored { "stored" } else { "refused" })],
    );
}

/// Record a carbon copy.
pub fn record_carbon(direction: &str) {
    carbons_sent().add(1, &[KeyValue::new("direction", direction.to_string())]);
}

/// Record an interceptor veto.
pub fn record_interceptor_rejection(stanza_type: &str, processed: bool) {
    interceptor_rejections().add(
        1,
        &[
            KeyValue::new("type", stanza_type.to_string()),
            KeyValue::new("stage", if processed { "post" } else { "pre" }),
        ],
    );
}

/// Record the session count of one kind.
pub fn record_session_count(count: i64, kind: &str) {
    sessions_active().record(count, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record processing channel backpressure signals.
pub fn record_channel_state(channel: &str, queued: usize, workers: usize) {
    let attrs = [KeyValue::new("channel", channel.to_string())];
    channel_queue_size().record(queued as i64, &attrs);
    channel_workers().record(workers as i64, &attrs);
}

/// Record routing latency in milliseconds.
pub fn record_routing_latency(latency_ms: f64, stanza_type: &str) {
    routing_latency().record(latency_ms, &[KeyValue::new("type", stanza_type.to_string())]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_provider_is_noop() {
        record_stanza("message");
        record_bounce("iq", "service-unavailable");
        record_offline_store(false);
        record_channel_state("stanza", 3, 4);
        record_routing_latency(1.5, "presence");
    }
}
