//! Core value types shared by every component of the transport core.

use std::collections::BTreeMap;

/// The sentinel generation id meaning "not yet known", mirroring
/// `OffsetCommitRequest.DEFAULT_GENERATION_ID` from the upstream aiokafka
/// protocol module.
pub const DEFAULT_GENERATION_ID: i32 = -1;

/// Maximum length, in bytes, of a Kafka topic name.
pub const TOPIC_NAME_MAX_LEN: usize = 249;

/// A topic name plus a partition index. Value type: equality and hashing are
/// by field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Shorthand used throughout the crate for a topic-partition pair.
pub type TP = TopicPartition;

/// An offset to commit plus opaque metadata. Offsets are next-to-read
/// positions, not last-read positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    pub offset: i64,
    pub metadata: String,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        OffsetAndMetadata {
            offset,
            metadata: String::new(),
        }
    }
}

/// Whether a record's timestamp was assigned by the producer or the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    NotAvailable,
    CreateTime,
    LogAppendTime,
}

/// A single consumed record, delivered upward to the stream runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<f64>,
    pub timestamp_type: TimestampType,
    pub headers: Vec<(String, Vec<u8>)>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub checksum: Option<u32>,
    pub serialized_key_size: Option<usize>,
    pub serialized_value_size: Option<usize>,
    pub tp: TopicPartition,
    /// The generation observed at the most recent `on_partitions_assigned`
    /// for this record's partition. Used to drop stale commits raced by a
    /// rebalance.
    pub generation_id: i32,
}

/// A message awaiting transmission by the producer.
#[derive(Debug, Clone, Default)]
pub struct PendingMessage {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub partition: Option<i32>,
    pub timestamp: Option<f64>,
    pub headers: Option<Vec<(String, Vec<u8>)>>,
}

/// What the broker reports back after a message is durably produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
}

/// Opaque TLS material threaded through to the broker client's
/// configuration. This crate never interprets certificate bytes itself; the
/// host supplies the rdkafka config keys it needs.
#[derive(Debug, Clone, Default)]
pub struct TlsContext {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
}

/// A pluggable source of SASL/OAUTHBEARER tokens.
pub trait OAuthTokenProvider: std::fmt::Debug + Send + Sync {
    fn token(&self) -> String;
}

/// The four credential shapes this transport core knows how to translate
/// into broker-client configuration.
#[derive(Debug, Clone)]
pub enum Credentials {
    Ssl {
        tls: Option<TlsContext>,
    },
    SaslPlain {
        username: String,
        password: String,
        tls: Option<TlsContext>,
    },
    SaslOAuth {
        mechanism: String,
        token_provider: std::sync::Arc<dyn OAuthTokenProvider>,
        tls: Option<TlsContext>,
    },
    SaslGssapi {
        service_name: String,
        domain_name: String,
        tls: Option<TlsContext>,
    },
}

/// `(coordinator_id, generation_id, member_id)`.
#[derive(Debug, Clone, Default)]
pub struct GenerationState {
    pub coordinator_id: Option<i32>,
    pub generation_id: i32,
    pub member_id: String,
}

impl GenerationState {
    pub fn is_known(&self) -> bool {
        self.generation_id != DEFAULT_GENERATION_ID
    }
}

/// An rdkafka `ClientConfig`-shaped map of string settings. Kept as a plain
/// `BTreeMap` (rather than depending on `rdkafka::ClientConfig` directly) so
/// pure functions like `server_list`/`credentials_to_settings` stay
/// unit-testable without constructing a real client config object.
pub type ConfigMap = BTreeMap<String, String>;
