//! Lazy span buffer for rebalance operations opened before the new
//! generation id is known.
//!
//! Grounded on the original's `_pending_rebalancing_spans: Deque[Span]`,
//! `_on_span_generation_known`, and its `murmur2`-derived trace id. Built
//! on `tracing::Span` rather than an OpenTracing client, since `tracing` is
//! this corpus's observability crate.

use std::collections::VecDeque;

use tracing::Span;

use crate::partitioner::murmur2;

const REPLACE_WITH_MEMBER_ID_SUFFIX: &str = ".REPLACE_WITH_MEMBER_ID";

/// A span opened before its trace id could be assigned, paired with the
/// operation name it should carry once finalized. A plain wrapper struct
/// rather than a span subclass, since `tracing::Span` cannot be subclassed
/// to intercept `finish()` the way the original's tracer allowed.
pub struct PendingSpan {
    span: Span,
    operation_name: String,
}

impl PendingSpan {
    pub fn new(span: Span, operation_name: impl Into<String>) -> Self {
        PendingSpan {
            span,
            operation_name: operation_name.into(),
        }
    }
}

/// Holds spans opened while the generation id for the in-progress rebalance
/// is still `DEFAULT_GENERATION_ID`, and finalizes them in FIFO order once
/// it becomes known, or cancels them if superseded by a new rebalance.
#[derive(Default)]
pub struct LazySpanBuffer {
    pending: VecDeque<PendingSpan>,
}

impl LazySpanBuffer {
    pub fn new() -> Self {
        LazySpanBuffer::default()
    }

    /// Opens a lazily-finalized span for a rebalance operation. If the
    /// caller already knows the generation is unresolved, the returned
    /// span should be pushed via [`LazySpanBuffer::defer`] rather than
    /// finalized immediately.
    pub fn start_rebalancing_span(&self, operation_name: &str) -> Span {
        tracing::info_span!(
            "rebalancing",
            operation = operation_name,
            operation_name = tracing::field::Empty,
            trace_id = tracing::field::Empty,
            kafka_generation = tracing::field::Empty,
            kafka_member_id = tracing::field::Empty,
            kafka_coordinator_id = tracing::field::Empty,
        )
    }

    pub fn start_coordinator_span(&self, operation_name: &str) -> Span {
        tracing::info_span!(
            "coordinator",
            operation = operation_name,
            operation_name = tracing::field::Empty,
            trace_id = tracing::field::Empty,
            kafka_generation = tracing::field::Empty,
            kafka_member_id = tracing::field::Empty,
            kafka_coordinator_id = tracing::field::Empty,
        )
    }

    /// Defers a span until the generation id is known.
    pub fn defer(&mut self, span: Span, operation_name: impl Into<String>) {
        self.pending.push_back(PendingSpan::new(span, operation_name.into()));
    }

    /// Drains the queue once `generation` and `member_id` are known,
    /// stamping every pending span with the derived trace id and renaming
    /// any `.REPLACE_WITH_MEMBER_ID`-suffixed operation.
    pub fn on_generation_id_known(&mut self, app_id: &str, generation: i32, member_id: &str, coordinator_id: Option<i32>) {
        let trace_id = murmur2(format!("reb-{app_id}-{generation}").as_bytes());
        while let Some(pending) = self.pending.pop_front() {
            let operation_name = rename_for_member(&pending.operation_name, member_id);
            let span = pending.span;
            span.record("trace_id", trace_id);
            span.record("operation_name", &operation_name.as_str());
            span.record("kafka_generation", generation);
            span.record("kafka_member_id", member_id);
            if let Some(coordinator_id) = coordinator_id {
                span.record("kafka_coordinator_id", coordinator_id);
            }
            drop(span);
        }
    }

    /// Drains and cancels every pending span, appending `" (CANCELLED)"` to
    /// its operation name, because a new rebalance superseded the one that
    /// opened them before their generation became known.
    pub fn flush_spans(&mut self) {
        while let Some(pending) = self.pending.pop_front() {
            let operation_name = format!("{} (CANCELLED)", pending.operation_name);
            let span = pending.span;
            span.record("operation_name", &operation_name.as_str());
            drop(span);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Opens a span as a child of `parent`. When `lazy` is true, the
    /// returned span must still be deferred with [`LazySpanBuffer::defer`];
    /// when false it is a normal span a caller finalizes immediately by
    /// letting it drop.
    pub fn traced_from_parent_span(&self, parent: &Span, operation_name: &str, lazy: bool) -> Span {
        if lazy {
            self.start_rebalancing_span(operation_name)
        } else {
            tracing::info_span!(parent: parent, "traced", operation = operation_name)
        }
    }
}

fn rename_for_member(operation_name: &str, member_id: &str) -> String {
    if let Some(base) = operation_name.strip_suffix(REPLACE_WITH_MEMBER_ID_SUFFIX) {
        let _ = base;
        format!("rebalancing node {member_id}")
    } else {
        operation_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_matches_murmur2_of_canonical_string() {
        let app_id = "myapp";
        let generation = 42;
        let expected = murmur2(format!("reb-{app_id}-{generation}").as_bytes());
        let actual = murmur2(b"reb-myapp-42");
        assert_eq!(expected, actual);
    }

    #[test]
    fn replace_with_member_id_suffix_is_renamed() {
        let renamed = rename_for_member("rebalance.REPLACE_WITH_MEMBER_ID", "m7");
        assert_eq!(renamed, "rebalancing node m7");
    }

    #[test]
    fn operation_without_suffix_is_unchanged() {
        let renamed = rename_for_member("rebalance.start", "m7");
        assert_eq!(renamed, "rebalance.start");
    }

    #[test]
    fn deferred_spans_drain_in_fifo_order() {
        let mut buffer = LazySpanBuffer::new();
        let span_a = buffer.start_rebalancing_span("a");
        buffer.defer(span_a, "a");
        let span_b = buffer.start_rebalancing_span("b");
        buffer.defer(span_b, "b");
        assert_eq!(buffer.pending_count(), 2);
        buffer.on_generation_id_known("app", 42, "m7", Some(1));
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn flush_spans_cancels_pending_queue() {
        let mut buffer = LazySpanBuffer::new();
        let span = buffer.start_rebalancing_span("op");
        buffer.defer(span, "op");
        buffer.flush_spans();
        assert_eq!(buffer.pending_count(), 0);
    }
}
