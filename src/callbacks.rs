//! The collaborator surface this crate calls back into. A host application
//! supplies one implementation per worker; the transport core never knows
//! about the stream runtime beyond this trait.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::types::{PendingMessage, RecordMetadata, TopicPartition};

/// Hooks the stream runtime implements to react to rebalances, production
/// completions, and per-topic policy questions. Grounded on the original's
/// `ConsumerRebalanceListener` + `Producer` callback surface and on
/// `mz-storage`'s `OffsetCommitter` trait for the async-trait pattern.
#[async_trait]
pub trait WorkerCallbacks: Send + Sync {
    /// Fired synchronously, before any suspension, whenever a revoke begins.
    /// Must never be missed even if the caller drops the returned future.
    fn on_rebalance_start(&self);

    /// The asynchronous half of a revoke: flush in-flight work for the
    /// revoked partitions before the group rejoins.
    async fn on_partitions_revoked(&self, revoked: HashSet<TopicPartition>);

    /// Fired once the new generation id is known for an assignment.
    async fn on_partitions_assigned(&self, assigned: HashSet<TopicPartition>, generation: i32);

    /// Fired just before a message is handed to the broker client. Returns
    /// an opaque state value threaded through to `on_published`.
    fn on_send_initiated(
        &self,
        topic: &str,
        message: &PendingMessage,
        key_size: usize,
        value_size: usize,
    ) -> u64;

    /// Fired from the send-completion path with the state returned by
    /// `on_send_initiated`.
    fn on_published(&self, message: &PendingMessage, state: u64, metadata: &RecordMetadata);

    /// Fired before a message is queued, independent of `on_send_initiated`.
    fn on_produce_message(&self, message: &PendingMessage);

    /// Sensor hook fired after the thread-isolated producer drains a batch.
    fn on_threaded_producer_buffer_processed(&self, queue_size: usize);

    /// Whether records on `topic` require explicit acknowledgement before
    /// their offsets are eligible for commit.
    fn acks_enabled_for(&self, topic: &str) -> bool;

    /// The wall-clock time (seconds since the epoch) of the most recent
    /// inbound record delivered for `tp`, if any has been reported yet.
    fn stream_inbound_time(&self, tp: &TopicPartition) -> Option<f64>;
}
