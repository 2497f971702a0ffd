//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a configured provider these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("expression-resolver")
}

/// Counter: keys newly placed on a queue.
/// Labels: `queue`.
pub fn queue_adds() -> Counter<u64> {
    meter()
        .u64_counter("resolver.queue.adds")
        .with_description("Number of keys placed on the work queue")
        .build()
}

/// Counter: rate-limited requeues.
/// Labels: `queue`.
pub fn queue_retries() -> Counter<u64> {
    meter()
        .u64_counter("resolver.queue.retries")
        .with_description("Number of rate-limited requeues")
        .build()
}

/// Counter: change notifications seen by the cache.
/// Labels: `kind` ("added" | "updated" | "deleted" | "malformed").
pub fn cache_events() -> Counter<u64> {
    meter()
        .u64_counter("resolver.cache.events")
        .with_description("Change notifications processed by the cache")
        .build()
}

/// Counter: reconcile outcomes.
/// Labels: `result` ("ok" | "retry" | "dropped"), `error`.
pub fn reconciles() -> Counter<u64> {
    meter()
        .u64_counter("resolver.reconcile.total")
        .with_description("Reconcile attempts by outcome")
        .build()
}

/// Histogram: reconcile duration in milliseconds.
pub fn reconcile_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("resolver.reconcile.duration_ms")
        .with_description("Reconcile duration in milliseconds")
        .with_unit("ms")
        .build()
}
