//! Plain async producer plus the transactional and thread-isolated
//! variants.
//!
//! Built on `rdkafka::producer::FutureProducer`, whose `send` future is
//! the natural analogue of `AIOKafkaProducer.send_and_wait` in the
//! original driver.

pub mod threaded;
pub mod transactional;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;

use crate::addr::{credentials_to_settings, server_list};
use crate::config::ProducerConfig;
use crate::error::{Result, TransportError};
use crate::partitioner::{key_partition, DefaultPartitioner, KeyPartitioner};
use crate::producer::transactional::TransactionRegistry;
use crate::types::{PendingMessage, RecordMetadata};

const DEFAULT_BROKER_PORT: u16 = 9092;
/// Headers require a negotiated broker API version of at least 0.11.
const MIN_HEADERS_API_VERSION: (u32, u32) = (0, 11);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Unstarted,
    Started,
    Stopped,
}

/// The plain (non-transactional) producer. Transactional producers are
/// separate `FutureProducer` instances tracked by
/// [`transactional::TransactionRegistry`].
pub struct Producer {
    inner: FutureProducer,
    state: std::sync::Mutex<ProducerState>,
    started: AtomicBool,
    negotiated_api_version: std::sync::Mutex<Option<(u32, u32)>>,
    request_timeout: Duration,
    partitioner: Box<dyn KeyPartitioner>,
    /// Set via [`Producer::attach_transactions`] so a single call to
    /// [`Producer::flush`] drains both this producer's buffer and every
    /// live transaction producer's buffer.
    transactions: std::sync::Mutex<Option<Arc<TransactionRegistry>>>,
}

impl Producer {
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config.set(
            "bootstrap.servers",
            server_list(&config.bootstrap_servers, DEFAULT_BROKER_PORT).join(","),
        );
        client_config.set("client.id", &config.client_id);
        client_config.set("acks", config.effective_acks());
        client_config.set("linger.ms", config.linger.as_millis().to_string());
        client_config.set("batch.size", config.max_batch_size.to_string());
        client_config.set("message.max.bytes", config.max_request_size.to_string());
        client_config.set("compression.type", &config.compression);
        client_config.set("request.timeout.ms", config.request_timeout.as_millis().to_string());
        client_config.set("metadata.max.age.ms", config.metadata_max_age.as_millis().to_string());
        client_config.set(
            "connections.max.idle.ms",
            config.connections_max_idle.as_millis().to_string(),
        );
        client_config.set("enable.idempotence", config.enable_idempotence().to_string());
        if let Some(api_version) = &config.api_version {
            client_config.set("broker.version.fallback", api_version);
        }

        let auth = credentials_to_settings(config.credentials.as_ref(), None)?;
        for (key, value) in auth {
            client_config.set(&key, &value);
        }

        let inner: FutureProducer = client_config.create()?;

        Ok(Producer {
            inner,
            state: std::sync::Mutex::new(ProducerState::Unstarted),
            started: AtomicBool::new(false),
            negotiated_api_version: std::sync::Mutex::new(None),
            request_timeout: config.request_timeout,
            partitioner: Box::new(DefaultPartitioner::default()),
            transactions: std::sync::Mutex::new(None),
        })
    }

    /// Links a transaction registry into this producer's shutdown path so
    /// [`Producer::flush`] drains both buffers together.
    pub fn attach_transactions(&self, registry: Arc<TransactionRegistry>) {
        *self.transactions.lock().unwrap() = Some(registry);
    }

    pub fn start(&self) {
        *self.state.lock().unwrap() = ProducerState::Started;
        self.started.store(true, Ordering::SeqCst);
    }

    fn ensure_started(&self) -> Result<()> {
        if *self.state.lock().unwrap() != ProducerState::Started {
            return Err(TransportError::NotReady("producer not started".into()));
        }
        Ok(())
    }

    /// `true` iff the negotiated broker API version is at least 0.11;
    /// fails with `NotReady` if no connection has been established yet.
    pub fn supports_headers(&self) -> Result<bool> {
        let negotiated = self.negotiated_api_version.lock().unwrap();
        match *negotiated {
            Some(version) => Ok(version >= MIN_HEADERS_API_VERSION),
            None => Err(TransportError::NotReady("no broker connection established".into())),
        }
    }

    /// Records the negotiated API version as reported by the broker
    /// client context; called once a connection handshake completes.
    pub fn set_negotiated_api_version(&self, version: (u32, u32)) {
        *self.negotiated_api_version.lock().unwrap() = Some(version);
    }

    /// Asks the broker client's partitioner for the destination partition
    /// of `key` on `topic`, using the current cluster metadata. Returns
    /// `None` if metadata for `topic` isn't available yet, distinct from
    /// [`crate::partitioner::key_partition`], which operates over a
    /// manually supplied partition list rather than live metadata.
    pub fn key_partition(&self, topic: &str, key: Option<&[u8]>) -> Option<i32> {
        let metadata = self
            .inner
            .client()
            .fetch_metadata(Some(topic), self.request_timeout)
            .ok()?;
        let topic_metadata = metadata.topics().iter().find(|t| t.name() == topic)?;
        let all_partitions: Vec<i32> = topic_metadata.partitions().iter().map(|p| p.id()).collect();
        let available_partitions: Vec<i32> = topic_metadata
            .partitions()
            .iter()
            .filter(|p| p.leader() >= 0)
            .map(|p| p.id())
            .collect();
        key_partition(self.partitioner.as_ref(), key, None, &all_partitions, &available_partitions)
    }

    /// Enqueues `message` and awaits broker acknowledgement, the direct
    /// analogue of `send_and_wait` in the original driver.
    pub async fn send_and_wait(&self, message: PendingMessage) -> Result<RecordMetadata> {
        self.ensure_started()?;

        let include_headers = self.supports_headers().unwrap_or(false);
        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&message.topic);
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }
        if let Some(value) = message.value.as_deref() {
            record = record.payload(value);
        }
        if let Some(partition) = message.partition {
            record = record.partition(partition);
        }
        // Timestamps travel in seconds on this crate's API; the wire
        // format wants milliseconds.
        if let Some(timestamp) = message.timestamp {
            record = record.timestamp((timestamp * 1000.0) as i64);
        }
        let mut headers = rdkafka::message::OwnedHeaders::new();
        if include_headers {
            if let Some(pairs) = &message.headers {
                for (key, value) in pairs {
                    headers = headers.insert(rdkafka::message::Header {
                        key,
                        value: Some(value.as_slice()),
                    });
                }
                record = record.headers(headers);
            }
        }

        match self.inner.send(record, Timeout::After(self.request_timeout)).await {
            Ok((partition, offset)) => Ok(RecordMetadata {
                topic: message.topic,
                partition,
                offset,
                timestamp: message.timestamp.map(|t| (t * 1000.0) as i64),
            }),
            Err((err, _owned_message)) => Err(TransportError::ProducerSendError(err.to_string())),
        }
    }

    /// Flushes this producer's own buffer, then every live transaction
    /// producer's buffer if a [`TransactionRegistry`] was attached via
    /// [`Producer::attach_transactions`].
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.inner.flush(timeout)?;
        let registry = self.transactions.lock().unwrap().clone();
        if let Some(registry) = registry {
            registry.flush_all(timeout)?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        *self.state.lock().unwrap() = ProducerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_headers_before_connection_is_not_ready() {
        let producer = ProducerHarness::unstarted();
        assert!(matches!(
            producer.supports_headers(),
            Err(TransportError::NotReady(_))
        ));
    }

    #[test]
    fn supports_headers_true_at_or_above_0_11() {
        let producer = ProducerHarness::unstarted();
        producer.set_negotiated_api_version((2, 3));
        assert!(producer.supports_headers().unwrap());
    }

    #[test]
    fn supports_headers_false_below_0_11() {
        let producer = ProducerHarness::unstarted();
        producer.set_negotiated_api_version((0, 10));
        assert!(!producer.supports_headers().unwrap());
    }

    /// A producer exercising only the pure negotiated-version bookkeeping,
    /// without constructing a real `FutureProducer` (which requires a
    /// reachable broker to configure against in some rdkafka versions).
    struct ProducerHarness {
        negotiated_api_version: std::sync::Mutex<Option<(u32, u32)>>,
    }

    impl ProducerHarness {
        fn unstarted() -> Self {
            ProducerHarness {
                negotiated_api_version: std::sync::Mutex::new(None),
            }
        }

        fn set_negotiated_api_version(&self, version: (u32, u32)) {
            *self.negotiated_api_version.lock().unwrap() = Some(version);
        }

        fn supports_headers(&self) -> Result<bool> {
            match *self.negotiated_api_version.lock().unwrap() {
                Some(version) => Ok(version >= MIN_HEADERS_API_VERSION),
                None => Err(TransportError::NotReady("no broker connection established".into())),
            }
        }
    }
}
