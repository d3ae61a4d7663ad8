//! Enqueue span helpers.

use std::path::Path;

use tracing::Span;

/// Start a span for one enqueue call.
///
/// `job.name` and `job.size` are declared empty and filled in by
/// [`record_published`] once the job is visible.
pub fn start_enqueue_span(root: &Path, priority: u8) -> Span {
    tracing::debug_span!(
        "enqueue",
        "queue.root" = %root.display(),
        "job.priority" = priority,
        "job.name" = tracing::field::Empty,
        "job.size" = tracing::field::Empty,
    )
}

/// Record the published job on its span.
pub fn record_published(span: &Span, name: &str, size: u64) {
    span.record("job.name", name);
    span.record("job.size", size);
    span.in_scope(|| {
        tracing::debug!(name, size, "job enqueued");
    });
}
