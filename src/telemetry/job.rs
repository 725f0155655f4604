//! Job execution span helpers.

use tracing::Span;

use crate::model::job::JobId;

/// Start a span covering one job attempt.
///
/// `job.state` is declared empty and filled in by [`record_state_transition`].
pub fn start_job_span(job_type: &str, job_id: &JobId, attempt: u32) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.type" = job_type,
        "job.id" = %job_id,
        "job.attempt" = attempt,
        "job.state" = tracing::field::Empty,
    )
}

/// Record a job state transition on `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
