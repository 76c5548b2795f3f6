//! Rebalance listener and generation tracking.
//!
//! Grounded on `rdkafka::consumer::{ConsumerContext, Rebalance}` as used in
//! the PostHog `StatefulConsumerContext` reference (pre_rebalance /
//! post_rebalance dispatched onto a Tokio handle via an mpsc channel), and
//! on the original's two-phase `on_partitions_revoked` /
//! `on_partitions_assigned` contract. `pre_rebalance` cannot return a
//! future (librdkafka's callback is synchronous), so the synchronous half
//! runs unconditionally inline and the asynchronous half is forwarded
//! through a channel drained by a background task — the idiomatic Rust
//! translation of "synchronous prologue, returned awaitable".
//!
//! REDESIGN FLAG R2: the original driver reads the coordinator's actual
//! generation id and member id straight off the group protocol state it
//! owns. `rdkafka`'s safe `ConsumerContext` callbacks expose neither —
//! librdkafka keeps that protocol exchange internal. This context falls
//! back to a monotonic counter bumped once per confirmed `Rebalance::Assign`
//! for the generation, and a process-local UUID minted once per session for
//! the member id. Neither matches the broker's own numbering, but both are
//! stable and non-constant for the life of the session, which is what
//! stale-commit detection on `ConsumerRecord.generation_id` and span
//! correlation actually need.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use rdkafka::client::ClientContext;
use rdkafka::consumer::{ConsumerContext, Rebalance};
use rdkafka::TopicPartitionList;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::callbacks::WorkerCallbacks;
use crate::consumer::tracing_spans::LazySpanBuffer;
use crate::types::{TopicPartition, DEFAULT_GENERATION_ID};

const REBALANCE_CHANNEL_CAPACITY: usize = 32;

/// The async half of a rebalance, forwarded from the synchronous
/// `pre_rebalance`/`post_rebalance` callbacks to a background task.
pub enum RebalanceEvent {
    Revoked(HashSet<TopicPartition>),
    Assigned(HashSet<TopicPartition>, i32),
}

/// rdkafka client/consumer context driving the two-phase rebalance
/// contract and generation tracking. Cloned into the `StreamConsumer`
/// builder; holds only `Arc`-shared state so clones are cheap and every
/// clone observes the same generation.
#[derive(Clone)]
pub struct RebalanceContext {
    callbacks: Arc<dyn WorkerCallbacks>,
    sender: mpsc::Sender<RebalanceEvent>,
    generation_id: Arc<AtomicI32>,
    coordinator_id: Arc<std::sync::atomic::AtomicI32>,
    member_id: Arc<String>,
    app_id: Arc<String>,
    spans: Arc<std::sync::Mutex<LazySpanBuffer>>,
    time_started_millis: Arc<AtomicI64>,
}

impl RebalanceContext {
    /// Builds a context plus the receiver a background task should drain
    /// with [`run_rebalance_worker`]. Called once per `ConsumerSession`.
    pub fn new(
        callbacks: Arc<dyn WorkerCallbacks>,
        app_id: impl Into<String>,
    ) -> (Self, mpsc::Receiver<RebalanceEvent>) {
        let (sender, receiver) = mpsc::channel(REBALANCE_CHANNEL_CAPACITY);
        let context = RebalanceContext {
            callbacks,
            sender,
            generation_id: Arc::new(AtomicI32::new(DEFAULT_GENERATION_ID)),
            coordinator_id: Arc::new(std::sync::atomic::AtomicI32::new(-1)),
            member_id: Arc::new(Uuid::new_v4().to_string()),
            app_id: Arc::new(app_id.into()),
            spans: Arc::new(std::sync::Mutex::new(LazySpanBuffer::new())),
            time_started_millis: Arc::new(AtomicI64::new(0)),
        };
        (context, receiver)
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id.load(Ordering::SeqCst)
    }

    pub fn coordinator_id(&self) -> Option<i32> {
        match self.coordinator_id.load(Ordering::SeqCst) {
            -1 => None,
            id => Some(id),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Advances the locally-tracked generation counter by one and returns
    /// the new value. Called once per confirmed `Rebalance::Assign`; see
    /// REDESIGN FLAG R2 above.
    fn bump_generation(&self) -> i32 {
        self.generation_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        // Synchronous prologue: must run unconditionally, even if nothing
        // ever polls the channel send below.
        self.callbacks.on_rebalance_start();

        if let Rebalance::Revoke(partitions) = rebalance {
            let revoked = to_tp_set(partitions);

            let mut spans = self.spans.lock().unwrap();
            if spans.pending_count() > 0 {
                // A prior rebalance never reached a confirmed assignment
                // before this one started; its spans are stale.
                warn!(pending = spans.pending_count(), "new rebalance supersedes unresolved spans");
                spans.flush_spans();
            }
            let span = spans.start_rebalancing_span("rebalance.revoke");
            let _noted = spans.traced_from_parent_span(&span, "revoke.partitions_noted", false);
            spans.defer(span, "rebalance.revoke.REPLACE_WITH_MEMBER_ID");
            drop(spans);

            if let Err(err) = self.sender.try_send(RebalanceEvent::Revoked(revoked)) {
                error!(error = %err, "rebalance event channel full, revoke handler delayed");
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            let assigned = to_tp_set(partitions);
            let generation = self.bump_generation();

            let mut spans = self.spans.lock().unwrap();
            let span = spans.start_coordinator_span("rebalance.assign");
            spans.defer(span, "rebalance.assign");
            spans.on_generation_id_known(&self.app_id, generation, &self.member_id, self.coordinator_id());
            drop(spans);

            if let Err(err) = self.sender.try_send(RebalanceEvent::Assigned(assigned, generation)) {
                error!(error = %err, "rebalance event channel full, assign handler delayed");
            }
        }
    }
}

fn to_tp_set(partitions: &TopicPartitionList) -> HashSet<TopicPartition> {
    partitions
        .elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic().to_string(), e.partition()))
        .collect()
}

/// Drains rebalance events onto the worker's callbacks. Spawned once at
/// `ConsumerSession::start`, runs until the sender half is dropped.
pub async fn run_rebalance_worker(
    callbacks: Arc<dyn WorkerCallbacks>,
    mut receiver: mpsc::Receiver<RebalanceEvent>,
) {
    while let Some(event) = receiver.recv().await {
        match event {
            RebalanceEvent::Revoked(revoked) => {
                callbacks.on_partitions_revoked(revoked).await;
            }
            RebalanceEvent::Assigned(assigned, generation) => {
                callbacks.on_partitions_assigned(assigned, generation).await;
            }
        }
    }
    warn!("rebalance worker exiting, sender dropped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use crate::types::{PendingMessage, RecordMetadata};

    #[derive(Default)]
    struct RecordingCallbacks {
        rebalance_start_calls: AtomicUsize,
        revoked_called: AtomicBool,
        assigned_generation: AtomicI32,
    }

    #[async_trait]
    impl WorkerCallbacks for RecordingCallbacks {
        fn on_rebalance_start(&self) {
            self.rebalance_start_calls.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_partitions_revoked(&self, _revoked: HashSet<TopicPartition>) {
            self.revoked_called.store(true, Ordering::SeqCst);
        }
        async fn on_partitions_assigned(&self, _assigned: HashSet<TopicPartition>, generation: i32) {
            self.assigned_generation.store(generation, Ordering::SeqCst);
        }
        fn on_send_initiated(&self, _topic: &str, _message: &PendingMessage, _key_size: usize, _value_size: usize) -> u64 { 0 }
        fn on_published(&self, _message: &PendingMessage, _state: u64, _metadata: &RecordMetadata) {}
        fn on_produce_message(&self, _message: &PendingMessage) {}
        fn on_threaded_producer_buffer_processed(&self, _queue_size: usize) {}
        fn acks_enabled_for(&self, _topic: &str) -> bool { true }
        fn stream_inbound_time(&self, _tp: &TopicPartition) -> Option<f64> { None }
    }

    #[tokio::test]
    async fn revoke_event_reaches_worker_via_channel() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (context, receiver) = RebalanceContext::new(callbacks.clone(), "app");
        let handle = tokio::spawn(run_rebalance_worker(callbacks.clone(), receiver));

        context.callbacks.on_rebalance_start();
        let mut revoked = HashSet::new();
        revoked.insert(TopicPartition::new("t", 0));
        context.sender.send(RebalanceEvent::Revoked(revoked)).await.unwrap();
        drop(context);

        handle.await.unwrap();
        assert!(callbacks.revoked_called.load(Ordering::SeqCst));
        assert_eq!(callbacks.rebalance_start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn assign_event_carries_generation() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (context, receiver) = RebalanceContext::new(callbacks.clone(), "app");
        context.generation_id.store(7, Ordering::SeqCst);
        let handle = tokio::spawn(run_rebalance_worker(callbacks.clone(), receiver));

        let mut assigned = HashSet::new();
        assigned.insert(TopicPartition::new("t", 0));
        context.sender.send(RebalanceEvent::Assigned(assigned, 7)).await.unwrap();
        drop(context);

        handle.await.unwrap();
        assert_eq!(callbacks.assigned_generation.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn bump_generation_is_monotonic_and_leaves_the_sentinel() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (context, _receiver) = RebalanceContext::new(callbacks, "app");
        assert_eq!(context.generation_id(), DEFAULT_GENERATION_ID);
        let first = context.bump_generation();
        let second = context.bump_generation();
        assert!(first > DEFAULT_GENERATION_ID);
        assert!(second > first);
        assert_eq!(context.generation_id(), second);
    }

    #[test]
    fn member_id_is_generated_once_and_stable() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (context, _receiver) = RebalanceContext::new(callbacks, "app");
        let first_read = context.member_id().to_string();
        assert!(!first_read.is_empty());
        assert_eq!(first_read, context.member_id());
    }

    #[test]
    fn assign_drains_pending_spans_via_generation_known() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let (context, _receiver) = RebalanceContext::new(callbacks, "app");
        {
            let mut spans = context.spans.lock().unwrap();
            let span = spans.start_rebalancing_span("revoke");
            spans.defer(span, "revoke");
            assert_eq!(spans.pending_count(), 1);
        }
        let generation = context.bump_generation();
        context
            .spans
            .lock()
            .unwrap()
            .on_generation_id_known(&context.app_id, generation, context.member_id(), None);
        assert_eq!(context.spans.lock().unwrap().pending_count(), 0);
    }
}
