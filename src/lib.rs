//! Kafka transport core of a stream-processing worker: the consumer
//! session, partition-assignment lifecycle, offset commit discipline, the
//! producer (plain and transactional), topic administration, and the
//! liveness watchdog.
//!
//! This crate is a library only — no CLI, no configuration-file loading.
//! A host application embeds it and supplies bootstrap configuration plus
//! an implementation of [`callbacks::WorkerCallbacks`].

pub mod addr;
pub mod admin;
pub mod callbacks;
pub mod config;
pub mod consumer;
pub mod error;
pub mod partitioner;
pub mod producer;
pub mod types;
pub mod watchdog;

pub use callbacks::WorkerCallbacks;
pub use config::{ConsumerConfig, ProducerConfig};
pub use consumer::ConsumerSession;
pub use error::{Result, TransportError};
pub use producer::threaded::ThreadedProducerHandle;
pub use producer::transactional::TransactionRegistry;
pub use producer::Producer;
pub use types::{
    ConsumerRecord, Credentials, GenerationState, OffsetAndMetadata, PendingMessage,
    RecordMetadata, TopicPartition, TP,
};
