//! End-to-end scenarios that need a reachable broker. Run against a local
//! Kafka with `KAFKA_BOOTSTRAP_SERVERS` set, e.g. `docker run -p 9092:9092
//! confluentinc/cp-kafka`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kafka_transport::callbacks::WorkerCallbacks;
use kafka_transport::types::{PendingMessage, RecordMetadata, TopicPartition};

struct NoopCallbacks;

#[async_trait]
impl WorkerCallbacks for NoopCallbacks {
    fn on_rebalance_start(&self) {}
    async fn on_partitions_revoked(&self, _revoked: HashSet<TopicPartition>) {}
    async fn on_partitions_assigned(&self, _assigned: HashSet<TopicPartition>, _generation: i32) {}
    fn on_send_initiated(&self, _topic: &str, _message: &PendingMessage, _key_size: usize, _value_size: usize) -> u64 { 0 }
    fn on_published(&self, _message: &PendingMessage, _state: u64, _metadata: &RecordMetadata) {}
    fn on_produce_message(&self, _message: &PendingMessage) {}
    fn on_threaded_producer_buffer_processed(&self, _queue_size: usize) {}
    fn acks_enabled_for(&self, _topic: &str) -> bool { true }
    fn stream_inbound_time(&self, _tp: &TopicPartition) -> Option<f64> { None }
}

fn bootstrap() -> String {
    std::env::var("KAFKA_BOOTSTRAP_SERVERS").unwrap_or_else(|_| "localhost:9092".to_string())
}

/// S2: commit during rebalance only carries TPs present in the current
/// assignment.
#[tokio::test]
#[ignore = "requires a reachable Kafka broker"]
async fn s2_commit_filters_to_current_assignment() {
    use kafka_transport::config::{AutoOffsetReset, ConsumerConfig};

    let config = ConsumerConfig {
        group_id: "scenario-s2".into(),
        group_instance_id: None,
        client_id: "scenario-s2-client".into(),
        bootstrap_servers: vec![kafka_transport::addr::BrokerUrl::new(bootstrap(), None)],
        standby_replicas: 0,
        auto_offset_reset: AutoOffsetReset::Earliest,
        request_timeout: Duration::from_secs(10),
        session_timeout: Duration::from_secs(6),
        rebalance_timeout: Duration::from_secs(10),
        heartbeat_interval: Duration::from_secs(2),
        max_poll_records: 500,
        max_poll_interval: Duration::from_secs(300),
        max_partition_fetch_bytes: 1 << 20,
        check_crcs: true,
        in_transaction: false,
        metadata_max_age: Duration::from_secs(300),
        connections_max_idle: Duration::from_secs(540),
        credentials: None,
        api_version: None,
        client_only: false,
    };

    let session = kafka_transport::ConsumerSession::new(&config, Arc::new(NoopCallbacks), "scenario-s2")
        .expect("construct consumer session");
    session.start();
    session.subscribe(&["scenario-s2-topic".into()]).expect("subscribe");

    let mut offsets = HashMap::new();
    offsets.insert(
        TopicPartition::new("scenario-s2-topic", 0),
        kafka_transport::OffsetAndMetadata::new(100),
    );
    offsets.insert(
        TopicPartition::new("scenario-s2-topic", 1),
        kafka_transport::OffsetAndMetadata::new(50),
    );

    let result = session.commit(&offsets).expect("commit");
    assert!(result);
}

/// S4: two concurrent `create_topic` calls for the same name share one
/// underlying attempt and both observe success.
#[tokio::test]
#[ignore = "requires a reachable Kafka broker"]
async fn s4_concurrent_create_topic_is_single_flight() {
    use kafka_transport::admin::{CreateTopicOptions, TopicAdministrator};

    let admin = Arc::new(TopicAdministrator::new(bootstrap()).expect("construct admin client"));

    let a = {
        let admin = admin.clone();
        tokio::spawn(async move {
            admin.create_topic("scenario-s4-topic", 3, 1, CreateTopicOptions::default()).await
        })
    };
    let b = {
        let admin = admin.clone();
        tokio::spawn(async move {
            admin.create_topic("scenario-s4-topic", 3, 1, CreateTopicOptions::default()).await
        })
    };

    let (result_a, result_b) = tokio::join!(a, b);
    assert!(result_a.unwrap().is_ok());
    assert!(result_b.unwrap().is_ok());
}

/// S3: transactional commit-with-offsets. `send_offsets_to_transaction`
/// then `commit_transaction`, and with `start_new=true` a fresh
/// `begin_transaction` on the same producer, all serialized under tx1's
/// lock. Uses the committing consumer's own group metadata, not a
/// throwaway one.
#[tokio::test]
#[ignore = "requires a reachable Kafka broker"]
async fn s3_transactional_commit_with_offsets() {
    use kafka_transport::config::{AutoOffsetReset, ConsumerConfig};
    use kafka_transport::TransactionRegistry;

    let consumer_config = ConsumerConfig {
        group_id: "scenario-s3".into(),
        group_instance_id: None,
        client_id: "scenario-s3-client".into(),
        bootstrap_servers: vec![kafka_transport::addr::BrokerUrl::new(bootstrap(), None)],
        standby_replicas: 0,
        auto_offset_reset: AutoOffsetReset::Earliest,
        request_timeout: Duration::from_secs(10),
        session_timeout: Duration::from_secs(6),
        rebalance_timeout: Duration::from_secs(10),
        heartbeat_interval: Duration::from_secs(2),
        max_poll_records: 500,
        max_poll_interval: Duration::from_secs(300),
        max_partition_fetch_bytes: 1 << 20,
        check_crcs: true,
        in_transaction: true,
        metadata_max_age: Duration::from_secs(300),
        connections_max_idle: Duration::from_secs(540),
        credentials: None,
        api_version: None,
        client_only: false,
    };
    let session = kafka_transport::ConsumerSession::new(&consumer_config, Arc::new(NoopCallbacks), "scenario-s3")
        .expect("construct consumer session");
    session.start();
    session.subscribe(&["scenario-s3-topic".into()]).expect("subscribe");
    let group_metadata = session.group_metadata().expect("group metadata available after join");

    let registry = Arc::new(TransactionRegistry::new(
        vec![kafka_transport::addr::BrokerUrl::new(bootstrap(), None)],
        None,
    ));
    registry.begin_transaction("tx1").await.expect("begin transaction");

    let mut offsets = HashMap::new();
    let mut tx1_offsets = HashMap::new();
    tx1_offsets.insert(TopicPartition::new("scenario-s3-topic", 0), 7);
    offsets.insert("tx1".to_string(), tx1_offsets);

    registry
        .commit_transactions(offsets, &group_metadata, true)
        .await
        .expect("send offsets, commit, and begin the next transaction");
}
