//! Per-transactional-id producer registry: begin/commit/abort, "send
//! offsets to transaction", and fencing cleanup.
//!
//! Grounded on the original's `map<id, (producer, mutex)>` and its
//! `begin_transaction` / `commit_transaction` / `abort_transaction` /
//! `commit_transactions` / `stop_transaction` methods.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseProducer, Producer as _};
use rdkafka::{ClientConfig, TopicPartitionList};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::addr::{credentials_to_settings, server_list, BrokerUrl};
use crate::error::{Result, TransportError};
use crate::types::{Credentials, TopicPartition};

const DEFAULT_BROKER_PORT: u16 = 9092;
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// A single transactional-id's producer plus the mutex serializing all
/// operations against it. Creation of the pair is itself protected by
/// `TransactionRegistry`'s outer lock to prevent double-init.
struct TransactionSlot {
    producer: BaseProducer,
    lock: AsyncMutex<()>,
}

/// `transactional_id -> (producer, mutex)`. At most one producer per id;
/// entries are removed on `ProducerFenced`.
pub struct TransactionRegistry {
    bootstrap_servers: Vec<BrokerUrl>,
    credentials: Option<Credentials>,
    slots: std::sync::Mutex<HashMap<String, Arc<TransactionSlot>>>,
}

impl TransactionRegistry {
    pub fn new(bootstrap_servers: Vec<BrokerUrl>, credentials: Option<Credentials>) -> Self {
        TransactionRegistry {
            bootstrap_servers,
            credentials,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create_slot(&self, transactional_id: &str) -> Result<Arc<TransactionSlot>> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(transactional_id) {
            return Ok(slot.clone());
        }

        let mut client_config = ClientConfig::new();
        client_config.set(
            "bootstrap.servers",
            server_list(&self.bootstrap_servers, DEFAULT_BROKER_PORT).join(","),
        );
        client_config.set("transactional.id", transactional_id);
        client_config.set("acks", "all");
        client_config.set("enable.idempotence", "true");
        client_config.set(
            "transaction.timeout.ms",
            TRANSACTION_TIMEOUT.as_millis().to_string(),
        );
        let auth = credentials_to_settings(self.credentials.as_ref(), None)?;
        for (key, value) in auth {
            client_config.set(&key, &value);
        }

        let producer: BaseProducer = client_config.create()?;
        producer.init_transactions(TRANSACTION_TIMEOUT)?;

        let slot = Arc::new(TransactionSlot {
            producer,
            lock: AsyncMutex::new(()),
        });
        slots.insert(transactional_id.to_string(), slot.clone());
        Ok(slot)
    }

    /// Creates the producer for `id` if it doesn't already exist, then
    /// begins a transaction on it under its mutex.
    pub async fn begin_transaction(&self, transactional_id: &str) -> Result<()> {
        let slot = self.get_or_create_slot(transactional_id)?;
        let _guard = slot.lock.lock().await;
        self.begin_on_slot(transactional_id, &slot)
    }

    /// Idempotent variant for callers that don't track whether a
    /// transaction producer already exists for `id`.
    pub async fn maybe_begin_transaction(&self, transactional_id: &str) -> Result<()> {
        self.begin_transaction(transactional_id).await
    }

    fn begin_on_slot(&self, transactional_id: &str, slot: &TransactionSlot) -> Result<()> {
        match slot.producer.begin_transaction() {
            Ok(()) => Ok(()),
            Err(err) if is_fenced(&err) => {
                self.evict_fenced(transactional_id);
                Ok(())
            }
            Err(err) => Err(TransportError::from(err)),
        }
    }

    pub async fn commit_transaction(&self, transactional_id: &str) -> Result<()> {
        let slot = match self.lookup(transactional_id) {
            Some(slot) => slot,
            None => {
                warn!(id = transactional_id, "commit_transaction: unknown transactional id, no-op");
                return Ok(());
            }
        };
        let _guard = slot.lock.lock().await;
        match slot.producer.commit_transaction(TRANSACTION_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(err) if is_fenced(&err) => {
                self.evict_fenced(transactional_id);
                Ok(())
            }
            Err(err) => Err(TransportError::from(err)),
        }
    }

    pub async fn abort_transaction(&self, transactional_id: &str) -> Result<()> {
        let slot = match self.lookup(transactional_id) {
            Some(slot) => slot,
            None => {
                warn!(id = transactional_id, "abort_transaction: unknown transactional id, no-op");
                return Ok(());
            }
        };
        let _guard = slot.lock.lock().await;
        match slot.producer.abort_transaction(TRANSACTION_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(err) if is_fenced(&err) => {
                self.evict_fenced(transactional_id);
                Ok(())
            }
            Err(err) => Err(TransportError::from(err)),
        }
    }

    /// For each id: `send_offsets_to_transaction` then `commit_transaction`,
    /// serialized under that id's mutex; if `start_new`, immediately
    /// `begin_transaction` again under the same lock.
    ///
    /// `group_metadata` must come from the same, group-joined consumer whose
    /// offsets are being committed (see [`crate::consumer::ConsumerSession::group_metadata`]) —
    /// a throwaway consumer constructed just to read this would report a
    /// generation and member id the coordinator never assigned to anything.
    pub async fn commit_transactions(
        &self,
        offsets_by_id: HashMap<String, HashMap<TopicPartition, i64>>,
        group_metadata: &ConsumerGroupMetadata,
        start_new: bool,
    ) -> Result<()> {
        for (transactional_id, offsets) in offsets_by_id {
            let slot = self.get_or_create_slot(&transactional_id)?;
            let _guard = slot.lock.lock().await;

            let mut tpl = TopicPartitionList::new();
            for (tp, offset) in &offsets {
                tpl.add_partition_offset(&tp.topic, tp.partition, rdkafka::Offset::Offset(*offset))?;
            }

            match slot
                .producer
                .send_offsets_to_transaction(&tpl, group_metadata, TRANSACTION_TIMEOUT)
            {
                Ok(()) => {}
                Err(err) if is_fenced(&err) => {
                    self.evict_fenced(&transactional_id);
                    continue;
                }
                Err(err) => return Err(TransportError::from(err)),
            }

            match slot.producer.commit_transaction(TRANSACTION_TIMEOUT) {
                Ok(()) => {}
                Err(err) if is_fenced(&err) => {
                    self.evict_fenced(&transactional_id);
                    continue;
                }
                Err(err) => return Err(TransportError::from(err)),
            }

            if start_new {
                self.begin_on_slot(&transactional_id, &slot)?;
            }
        }
        Ok(())
    }

    /// Drops and stops the producer for `id`; a subsequent commit with the
    /// same id rejoins as a new instance (the broker fences the old one).
    pub fn stop_transaction(&self, transactional_id: &str) {
        self.slots.lock().unwrap().remove(transactional_id);
    }

    /// Flushes every live transaction producer's buffer, in addition to
    /// the plain producer's own `flush` (supplements the distilled thread-
    /// isolated-only flush with the plain producer's shutdown path).
    pub fn flush_all(&self, timeout: Duration) -> Result<()> {
        let slots: Vec<Arc<TransactionSlot>> = self.slots.lock().unwrap().values().cloned().collect();
        for slot in slots {
            slot.producer.flush(timeout)?;
        }
        Ok(())
    }

    fn lookup(&self, transactional_id: &str) -> Option<Arc<TransactionSlot>> {
        self.slots.lock().unwrap().get(transactional_id).cloned()
    }

    fn evict_fenced(&self, transactional_id: &str) {
        if self.slots.lock().unwrap().remove(transactional_id).is_some() {
            info!(id = transactional_id, "producer fenced, evicted from registry");
        }
    }

    /// Clears every tracked transaction producer. This registry's
    /// analogue of `admin::TopicAdministrator::stop()`'s waiters-map
    /// clear; callers tearing down a transactional producer should call
    /// both alongside the plain producer's own `stop`.
    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }
}

fn is_fenced(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::Fenced) | Some(RDKafkaErrorCode::InvalidProducerEpoch)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_error_codes_are_recognized() {
        assert!(is_fenced(&KafkaError::Transaction(RDKafkaErrorCode::Fenced)));
        assert!(is_fenced(&KafkaError::Transaction(RDKafkaErrorCode::InvalidProducerEpoch)));
        assert!(!is_fenced(&KafkaError::Transaction(RDKafkaErrorCode::OperationTimedOut)));
    }
}
