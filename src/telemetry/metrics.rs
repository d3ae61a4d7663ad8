//! Metric instrument factories for dirqueue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a registered provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for dirqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dirqueue")
}

/// Counter: enqueue calls.
/// Labels: `result` ("ok" | "error").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("dirqueue.jobs.enqueued")
        .with_description("Number of enqueue calls")
        .build()
}

/// Counter: hard-link name collisions hit while publishing.
/// Labels: `stage` ("data" | "control").
pub fn link_collisions() -> Counter<u64> {
    meter()
        .u64_counter("dirqueue.link.collisions")
        .with_description("Number of hard-link name collisions")
        .build()
}

/// Histogram: payload size of enqueued jobs.
pub fn payload_bytes() -> Histogram<u64> {
    meter()
        .u64_histogram("dirqueue.payload.bytes")
        .with_description("Payload size of enqueued jobs")
        .with_unit("By")
        .build()
}

/// Histogram: wall time of an enqueue call in milliseconds.
pub fn enqueue_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dirqueue.enqueue.duration_ms")
        .with_description("Enqueue duration in milliseconds")
        .with_unit("ms")
        .build()
}
