//! Consumer session: wraps a group-joined broker consumer, drives
//! subscription, fetch, seek, position, highwater queries, and offset
//! commits.
//!
//! Built on `rdkafka::consumer::StreamConsumer`, the idiomatic async
//! rdkafka entry point (as opposed to `mz-storage`'s raw `BaseConsumer`,
//! which that crate drives by hand because it lives inside a non-async
//! Timely operator; this crate's host is async-native).

pub mod rebalance;
pub mod tracing_spans;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Headers;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{error, info, warn};

use crate::addr::{credentials_to_settings, server_list, BrokerUrl};
use crate::callbacks::WorkerCallbacks;
use crate::config::{AutoOffsetReset, ConsumerConfig};
use crate::error::{Result, TransportError};
use crate::types::{ConsumerRecord, OffsetAndMetadata, TimestampType, TopicPartition};

use rebalance::RebalanceContext;

const DEFAULT_BROKER_PORT: u16 = 9092;
const FETCH_MAX_WAIT_MS: u32 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unstarted,
    Started,
    Stopped,
}

/// A group-joined (or, in `client_only` mode, plain) Kafka consumer plus
/// the bookkeeping the watchdog and rebalance listener need.
pub struct ConsumerSession {
    consumer: StreamConsumer<RebalanceContext>,
    context: RebalanceContext,
    state: Mutex<SessionState>,
    paused: AtomicBool,
    closed: AtomicBool,
    time_started: Instant,
    max_poll_records: u32,
    broker_request_timeout: Duration,
    /// Updated before every commit RPC so the watchdog never reports a
    /// false positive for an in-flight commit.
    tp_last_committed_at: Mutex<HashMap<TopicPartition, Instant>>,
    /// Wall-clock timestamp (seconds since start) of the most recent poll
    /// issued for each TP, read by the watchdog's "no recent fetch" check.
    tp_last_polled_at: Mutex<HashMap<TopicPartition, Instant>>,
}

impl ConsumerSession {
    /// Constructs (but does not start) a consumer session. Fails eagerly
    /// if `session_timeout > request_timeout`.
    pub fn new(
        config: &ConsumerConfig,
        callbacks: Arc<dyn WorkerCallbacks>,
        app_id: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;

        let (context, receiver) = RebalanceContext::new(callbacks.clone(), app_id);
        tokio::spawn(rebalance::run_rebalance_worker(callbacks, receiver));

        let mut client_config = ClientConfig::new();
        let brokers: Vec<BrokerUrl> = config.bootstrap_servers.clone();
        client_config.set("bootstrap.servers", server_list(&brokers, DEFAULT_BROKER_PORT).join(","));
        client_config.set("client.id", &config.client_id);
        client_config.set("session.timeout.ms", config.session_timeout.as_millis().to_string());
        client_config.set("socket.timeout.ms", config.request_timeout.as_millis().to_string());
        client_config.set("rebalance.timeout.ms", config.rebalance_timeout.as_millis().to_string());
        client_config.set("heartbeat.interval.ms", config.heartbeat_interval.as_millis().to_string());
        client_config.set("max.poll.interval.ms", config.max_poll_interval.as_millis().to_string());
        client_config.set(
            "max.partition.fetch.bytes",
            config.max_partition_fetch_bytes.to_string(),
        );
        client_config.set("fetch.wait.max.ms", FETCH_MAX_WAIT_MS.to_string());
        client_config.set("check.crcs", config.check_crcs.to_string());
        client_config.set("isolation.level", config.isolation_level());
        client_config.set("metadata.max.age.ms", config.metadata_max_age.as_millis().to_string());
        client_config.set(
            "connections.max.idle.ms",
            config.connections_max_idle.as_millis().to_string(),
        );
        client_config.set("enable.auto.commit", config.client_only.to_string());
        client_config.set(
            "auto.offset.reset",
            match config.auto_offset_reset {
                AutoOffsetReset::Earliest => "earliest",
                AutoOffsetReset::Latest => "latest",
                AutoOffsetReset::None => "none",
            },
        );
        if !config.client_only {
            client_config.set("group.id", &config.group_id);
            if let Some(instance_id) = &config.group_instance_id {
                client_config.set("group.instance.id", instance_id);
            }
            let assignor = match config.assignor() {
                crate::config::Assignor::RoundRobin => "roundrobin".to_string(),
                crate::config::Assignor::Custom(name) => name,
            };
            client_config.set("partition.assignment.strategy", assignor);
        }
        if let Some(api_version) = &config.api_version {
            client_config.set("broker.version.fallback", api_version);
        }

        let auth = credentials_to_settings(config.credentials.as_ref(), None)?;
        for (key, value) in auth {
            client_config.set(&key, &value);
        }

        let consumer: StreamConsumer<RebalanceContext> =
            client_config.create_with_context(context.clone())?;

        Ok(ConsumerSession {
            consumer,
            context,
            state: Mutex::new(SessionState::Unstarted),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            time_started: Instant::now(),
            max_poll_records: config.max_poll_records,
            broker_request_timeout: config.request_timeout,
            tp_last_committed_at: Mutex::new(HashMap::new()),
            tp_last_polled_at: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(&self) {
        *self.state.lock().unwrap() = SessionState::Started;
    }

    /// Atomically re-subscribes to `topics`; each call triggers a broker
    /// rebalance handled by the registered [`RebalanceContext`].
    pub fn subscribe(&self, topics: &[String]) -> Result<()> {
        self.ensure_started()?;
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs)?;
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Fetches a batch bounded by `max_poll_records`. Returns an empty map
    /// while paused. Fails with `ConsumerStopped` once closed.
    pub async fn get_many(
        &self,
        active_partitions: &HashSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<ConsumerRecord>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConsumerStopped);
        }
        let mut out: HashMap<TopicPartition, Vec<ConsumerRecord>> = HashMap::new();
        if self.paused.load(Ordering::SeqCst) {
            return Ok(out);
        }

        let generation = self.context.generation_id();
        let deadline = Instant::now() + timeout;
        let mut collected: u32 = 0;

        while collected < self.max_poll_records && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    let tp = TopicPartition::new(message.topic().to_string(), message.partition());
                    if !active_partitions.is_empty() && !active_partitions.contains(&tp) {
                        continue;
                    }
                    self.mark_polled(&tp);
                    let record = to_consumer_record(&message, generation);
                    out.entry(tp).or_default().push(record);
                    collected += 1;
                }
                Ok(Err(KafkaError::PartitionEOF(_))) => continue,
                Ok(Err(err)) => return Err(TransportError::from(err)),
                Err(_) => break,
            }
        }

        Ok(out)
    }

    fn mark_polled(&self, tp: &TopicPartition) {
        self.tp_last_polled_at.lock().unwrap().insert(tp.clone(), Instant::now());
    }

    pub fn last_polled_at(&self, tp: &TopicPartition) -> Option<Instant> {
        self.tp_last_polled_at.lock().unwrap().get(tp).copied()
    }

    pub fn last_committed_at(&self, tp: &TopicPartition) -> Option<Instant> {
        self.tp_last_committed_at.lock().unwrap().get(tp).copied()
    }

    pub fn time_started(&self) -> Instant {
        self.time_started
    }

    /// Commits only the TPs present in the current assignment at call
    /// time; everything else is silently filtered out. Updates
    /// `tp_last_committed_at` for every submitted TP before issuing the
    /// commit RPC.
    pub fn commit(&self, offsets: &HashMap<TopicPartition, OffsetAndMetadata>) -> Result<bool> {
        let assignment = self.assignment()?;
        let filtered: HashMap<&TopicPartition, &OffsetAndMetadata> = offsets
            .iter()
            .filter(|(tp, _)| assignment.contains(*tp))
            .collect();
        if filtered.is_empty() {
            return Ok(true);
        }

        let now = Instant::now();
        {
            let mut last_committed = self.tp_last_committed_at.lock().unwrap();
            for tp in filtered.keys() {
                last_committed.insert((*tp).clone(), now);
            }
        }

        let mut tpl = TopicPartitionList::new();
        for (tp, offset_and_metadata) in &filtered {
            tpl.add_partition_offset(
                &tp.topic,
                tp.partition,
                Offset::Offset(offset_and_metadata.offset),
            )?;
        }

        match self.consumer.commit(&tpl, rdkafka::consumer::CommitMode::Sync) {
            Ok(()) => Ok(true),
            Err(err) => {
                if is_rebalanced_commit_failure(&err) {
                    warn!(error = %err, "commit failed: already rebalanced, will retry next tick");
                    Ok(false)
                } else {
                    error!(error = %err, "commit failed fatally, crashing consumer session");
                    Err(TransportError::from(err))
                }
            }
        }
    }

    pub fn position(&self, tp: &TopicPartition) -> Result<Option<i64>> {
        let positions = self.consumer.position()?;
        Ok(positions
            .elements()
            .iter()
            .find(|e| e.topic() == tp.topic && e.partition() == tp.partition)
            .and_then(|e| e.offset().to_raw()))
    }

    pub fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.consumer
            .seek(&tp.topic, tp.partition, Offset::Offset(offset), self.broker_request_timeout)?;
        Ok(())
    }

    pub fn seek_to_beginning(&self, tps: &[TopicPartition]) -> Result<()> {
        for tp in tps {
            self.consumer
                .seek(&tp.topic, tp.partition, Offset::Beginning, self.broker_request_timeout)?;
        }
        Ok(())
    }

    /// Seeks every currently assigned partition to its last committed
    /// offset.
    pub fn seek_to_committed(&self) -> Result<()> {
        let assignment = self.consumer.assignment()?;
        let committed = self.consumer.committed_offsets(assignment, self.broker_request_timeout)?;
        for element in committed.elements() {
            if let Some(offset) = element.offset().to_raw() {
                self.consumer.seek(
                    element.topic(),
                    element.partition(),
                    Offset::Offset(offset),
                    self.broker_request_timeout,
                )?;
            }
        }
        Ok(())
    }

    /// Seeks `partitions` to `offset` and then awaits `position()` for
    /// each, bounded by the configured broker request timeout, so callers
    /// observe the seek has taken effect before resuming the fetch loop.
    pub async fn seek_wait(&self, partitions: &[(TopicPartition, i64)]) -> Result<HashMap<TopicPartition, Option<i64>>> {
        for (tp, offset) in partitions {
            self.seek(tp, *offset)?;
        }
        let mut result = HashMap::new();
        let deadline = Instant::now() + self.broker_request_timeout;
        for (tp, _) in partitions {
            if Instant::now() >= deadline {
                break;
            }
            result.insert(tp.clone(), self.position(tp)?);
        }
        Ok(result)
    }

    pub fn earliest_offsets(&self, tp: &TopicPartition) -> Result<i64> {
        let (low, _high) = self
            .consumer
            .fetch_watermarks(&tp.topic, tp.partition, self.broker_request_timeout)?;
        Ok(low)
    }

    pub fn highwaters(&self, tp: &TopicPartition) -> Result<i64> {
        let (_low, high) = self
            .consumer
            .fetch_watermarks(&tp.topic, tp.partition, self.broker_request_timeout)?;
        Ok(high)
    }

    /// In transactional mode this would be the last stable offset; rdkafka
    /// does not expose that distinctly from `fetch_watermarks`, so both
    /// modes currently return the high watermark.
    pub fn highwater(&self, tp: &TopicPartition) -> Result<i64> {
        self.highwaters(tp)
    }

    /// The group metadata object for this consumer's current join, needed
    /// by `TransactionRegistry::commit_transactions` to send offsets to a
    /// transaction under the right generation and member id. `None` in
    /// `client_only` mode, where the consumer never joins a group.
    pub fn group_metadata(&self) -> Result<rdkafka::consumer::ConsumerGroupMetadata> {
        self.consumer
            .group_metadata()
            .ok_or_else(|| TransportError::NotReady("consumer group metadata unavailable".into()))
    }

    pub fn assignment(&self) -> Result<HashSet<TopicPartition>> {
        let tpl = self.consumer.assignment()?;
        Ok(tpl
            .elements()
            .iter()
            .map(|e| TopicPartition::new(e.topic().to_string(), e.partition()))
            .collect())
    }

    /// Number of partitions known for `topic` from the latest metadata
    /// snapshot. `None` means "unknown, retry later", not an error.
    pub fn topic_partitions(&self, topic: &str) -> Option<usize> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), Duration::from_secs(5))
            .ok()?;
        metadata.topics().iter().find(|t| t.name() == topic).map(|t| t.partitions().len())
    }

    fn ensure_started(&self) -> Result<()> {
        if *self.state.lock().unwrap() != SessionState::Started {
            return Err(TransportError::ConsumerNotStarted);
        }
        Ok(())
    }

    /// Idempotent. Marks the session closed; subsequent `get_many` calls
    /// fail with `ConsumerStopped`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock().unwrap() = SessionState::Stopped;
        info!("consumer session closed");
    }
}

fn is_rebalanced_commit_failure(err: &KafkaError) -> bool {
    matches!(
        err,
        KafkaError::ConsumerCommit(rdkafka::types::RDKafkaErrorCode::IllegalGeneration)
            | KafkaError::ConsumerCommit(rdkafka::types::RDKafkaErrorCode::RebalanceInProgress)
    )
}

fn to_consumer_record(message: &rdkafka::message::BorrowedMessage<'_>, generation_id: i32) -> ConsumerRecord {
    let headers = message
        .headers()
        .map(|h| {
            h.iter()
                .map(|header| (header.key.to_string(), header.value.map(|v| v.to_vec()).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    ConsumerRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message.timestamp().to_millis().map(|ms| ms as f64 / 1000.0),
        timestamp_type: match message.timestamp() {
            rdkafka::Timestamp::NotAvailable => TimestampType::NotAvailable,
            rdkafka::Timestamp::CreateTime(_) => TimestampType::CreateTime,
            rdkafka::Timestamp::LogAppendTime(_) => TimestampType::LogAppendTime,
        },
        headers,
        key: message.key().map(|k| k.to_vec()),
        value: message.payload().map(|v| v.to_vec()),
        checksum: None,
        serialized_key_size: message.key().map(|k| k.len()),
        serialized_value_size: message.payload().map(|v| v.len()),
        tp: TopicPartition::new(message.topic().to_string(), message.partition()),
        generation_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebalanced_commit_failure_is_not_fatal() {
        let err = KafkaError::ConsumerCommit(rdkafka::types::RDKafkaErrorCode::IllegalGeneration);
        assert!(is_rebalanced_commit_failure(&err));
    }

    #[test]
    fn other_commit_failure_is_fatal() {
        let err = KafkaError::ConsumerCommit(rdkafka::types::RDKafkaErrorCode::UnknownTopicOrPartition);
        assert!(!is_rebalanced_commit_failure(&err));
    }
}
