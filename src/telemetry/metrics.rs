//! Metric instrument factories for studio-ops.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"studio-ops"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for studio-ops instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("studio-ops")
}

/// Counter: enqueue attempts.
/// Labels: `job_type`, `result` ("ok" | "duplicate").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("studio_ops.jobs.enqueued")
        .with_description("Number of jobs enqueued or refused as duplicates")
        .build()
}

/// Counter: job state transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("studio_ops.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: running jobs returned to the queue after their claim expired.
pub fn jobs_stale_requeued() -> Counter<u64> {
    meter()
        .u64_counter("studio_ops.jobs.stale_requeued")
        .with_description("Number of stale jobs requeued")
        .build()
}

/// Counter: jobs failed because no handler is registered for their type.
/// Labels: `job_type`.
pub fn jobs_unhandled() -> Counter<u64> {
    meter()
        .u64_counter("studio_ops.jobs.unhandled")
        .with_description("Jobs with no registered workflow handler")
        .build()
}

/// Counter: provisioning items by outcome.
/// Labels: `mode`, `outcome` ("created" | "error").
pub fn provisioning_items() -> Counter<u64> {
    meter()
        .u64_counter("studio_ops.provisioning.items")
        .with_description("Provisioning plan items processed")
        .build()
}

/// Counter: quarantine moves.
/// Labels: `outcome` ("moved" | "blocked" | "error").
pub fn integrity_moves() -> Counter<u64> {
    meter()
        .u64_counter("studio_ops.integrity.moves")
        .with_description("Quarantine moves executed, blocked, or failed")
        .build()
}

/// Counter: workflow lock try-acquire outcomes.
/// Labels: `workflow`, `result` ("acquired" | "busy").
pub fn lock_attempts() -> Counter<u64> {
    meter()
        .u64_counter("studio_ops.lock.attempts")
        .with_description("Workflow lock acquisition attempts")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("studio_ops.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
