//! Error taxonomy for the transport core.
//!
//! Recoverable conditions (producer fencing, rebalance-related commit
//! failures, an already-existing topic when the caller didn't ask for
//! `ensure_created`) are handled internally and never surfaced; only
//! configuration errors, send failures, and consumer-stop propagate
//! through this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("consumer thread not yet started")]
    ConsumerNotStarted,

    #[error("improperly configured: {0}")]
    ImproperlyConfigured(String),

    #[error("topic name {name:?} is too long (max={max_len})")]
    InvalidTopicName { name: String, max_len: usize },

    #[error("topic {name:?} already exists")]
    TopicAlreadyExists { name: String },

    #[error("controller not found; no broker reachable")]
    ControllerNotFound,

    #[error("error while sending: {0}")]
    ProducerSendError(String),

    #[error("consumer stopped")]
    ConsumerStopped,

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

pub type Result<T> = std::result::Result<T, TransportError>;
