//! Topic administrator: idempotent topic creation with stampede
//! suppression and controller discovery.
//!
//! Grounded on `Transport._create_topic` / `_really_create_topic` /
//! `_get_controller_node` in the original driver, and on
//! `mz-storage::source::kafka::get_kafka_partitions`'s use of
//! `Client::fetch_metadata` for the metadata-request half of the picture.
//! `rdkafka::admin::AdminClient` is used for the wire-level `CreateTopics`
//! call itself; this module layers the controller-retry and
//! single-flight-per-topic-name behavior on top, since `AdminClient` alone
//! does not retry against a freshly discovered controller.
//!
//! REDESIGN FLAG R3: the original driver parses the raw `MetadataResponse`
//! and reads its `controller_id` field directly. `rdkafka`'s safe
//! `Metadata` wrapper (`rdkafka::metadata::Metadata`) does not surface that
//! field at all — only the broker list and topic metadata are exposed.
//! `discover_controller` therefore logs the best broker candidate it can
//! see and forces a fresh metadata fetch; it relies on `AdminClient`
//! re-resolving the controller internally on the next `CreateTopics` call,
//! which is what librdkafka itself does under `NotController`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::{Result, TransportError};
use crate::types::TOPIC_NAME_MAX_LEN;

/// Options accepted by [`TopicAdministrator::create_topic`], mirroring the
/// original driver's keyword arguments.
#[derive(Debug, Clone, Default)]
pub struct CreateTopicOptions {
    pub config: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub retention: Option<Duration>,
    pub compacting: bool,
    pub deleting: bool,
    pub ensure_created: bool,
}

/// Synthesizes the final `config_entries` map: cleanup policy in lexical
/// order (`compact`, `delete`, or `compact,delete`), retention, then the
/// caller's overrides layered on top.
fn synthesize_config(options: &CreateTopicOptions) -> BTreeMap<String, String> {
    let mut config = BTreeMap::new();
    let policy = match (options.compacting, options.deleting) {
        (true, true) => Some("compact,delete"),
        (true, false) => Some("compact"),
        (false, true) => Some("delete"),
        (false, false) => None,
    };
    if let Some(policy) = policy {
        config.insert("cleanup.policy".to_string(), policy.to_string());
    }
    if let Some(retention) = options.retention {
        config.insert("retention.ms".to_string(), retention.as_millis().to_string());
    }
    for (k, v) in &options.config {
        config.insert(k.clone(), v.clone());
    }
    config
}

/// Tracks one in-flight creation per topic name so concurrent callers share
/// a single `CreateTopics` RPC, the direct analogue of the original's
/// `_topic_waiters: MutableMapping[str, StampedeWrapper]`.
pub struct TopicAdministrator {
    bootstrap_servers: String,
    client: AdminClient<DefaultClientContext>,
    waiters: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<Option<Result<()>>>>>>,
}

impl TopicAdministrator {
    pub fn new(bootstrap_servers: impl Into<String>) -> Result<Self> {
        let bootstrap_servers = bootstrap_servers.into();
        let client: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .create()?;
        Ok(TopicAdministrator {
            bootstrap_servers,
            client,
            waiters: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Creates `name` idempotently, suppressing concurrent duplicate
    /// requests for the same name into a single underlying attempt.
    pub async fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication: i32,
        options: CreateTopicOptions,
    ) -> Result<()> {
        self.create_topic_with_shutdown(name, partitions, replication, options, None)
            .await
    }

    /// Same as [`TopicAdministrator::create_topic`], but checks `shutdown`
    /// (when given) before each attempt and while waiting on controller
    /// rediscovery; if it reports `true`, returns `Ok(())` without
    /// creating anything, matching the original driver's "owning service
    /// indicates shutdown during the wait" behavior.
    pub async fn create_topic_with_shutdown(
        &self,
        name: &str,
        partitions: i32,
        replication: i32,
        options: CreateTopicOptions,
        shutdown: Option<Arc<AtomicBool>>,
    ) -> Result<()> {
        if name.len() > TOPIC_NAME_MAX_LEN {
            return Err(TransportError::InvalidTopicName {
                name: name.to_string(),
                max_len: TOPIC_NAME_MAX_LEN,
            });
        }

        let slot = {
            let mut waiters = self.waiters.lock().unwrap();
            waiters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;
        if let Some(result) = guard.as_ref() {
            return clone_result(result);
        }

        let result = self
            .really_create_topic(name, partitions, replication, &options, &shutdown)
            .await;
        *guard = Some(clone_result(&result));

        let mut waiters = self.waiters.lock().unwrap();
        waiters.remove(name);

        result
    }

    async fn really_create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication: i32,
        options: &CreateTopicOptions,
        shutdown: &Option<Arc<AtomicBool>>,
    ) -> Result<()> {
        let config = synthesize_config(options);
        let config_refs: Vec<(&str, &str)> =
            config.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let new_topic = config_refs.into_iter().fold(
            NewTopic::new(name, partitions, TopicReplication::Fixed(replication)),
            |new_topic, (k, v)| new_topic.set(k, v),
        );

        let admin_options = AdminOptions::new()
            .request_timeout(options.timeout.or(Some(Duration::from_secs(30))));

        let mut attempts = 0;
        loop {
            if should_stop(shutdown) {
                info!(topic = name, "shutdown observed, returning without creating topic");
                return Ok(());
            }
            attempts += 1;
            match self
                .client
                .create_topics(&[new_topic], &admin_options)
                .await
            {
                Ok(results) => match results.into_iter().next() {
                    Some(Ok(_)) => return Ok(()),
                    Some(Err((topic, RDKafkaErrorCode::TopicAlreadyExists))) => {
                        if options.ensure_created {
                            return Err(TransportError::TopicAlreadyExists { name: topic });
                        }
                        info!(topic = %topic, "topic already exists, treating as success");
                        return Ok(());
                    }
                    Some(Err((topic, RDKafkaErrorCode::NotController))) if attempts < 3 => {
                        warn!(topic = %topic, attempt = attempts, "not controller, rediscovering");
                        self.discover_controller().await?;
                        if should_stop(shutdown) {
                            info!(topic = %topic, "shutdown observed during controller rediscovery, returning");
                            return Ok(());
                        }
                        continue;
                    }
                    Some(Err((topic, code))) => {
                        return Err(TransportError::NotReady(format!(
                            "create_topics({topic}) failed: {code:?}"
                        )));
                    }
                    None => {
                        return Err(TransportError::NotReady(
                            "create_topics returned no results".into(),
                        ))
                    }
                },
                Err(KafkaError::MetadataFetch(_)) if attempts < 3 => {
                    self.discover_controller().await?;
                    if should_stop(shutdown) {
                        info!(topic = name, "shutdown observed during controller rediscovery, returning");
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(TransportError::from(err)),
            }
        }
    }

    /// Sends a metadata request to any known broker and returns the id of
    /// a reachable broker as a retry candidate. See the REDESIGN FLAG R3
    /// note at the top of this module: the safe `Metadata` wrapper this
    /// crate can see has no `controller_id` field, so this is a best-
    /// effort stand-in, not the literal wire-protocol controller pointer.
    async fn discover_controller(&self) -> Result<i32> {
        let bootstrap_servers = self.bootstrap_servers.clone();
        tokio::task::spawn_blocking(move || {
            let client: AdminClient<DefaultClientContext> = ClientConfig::new()
                .set("bootstrap.servers", &bootstrap_servers)
                .create_with_context(DefaultClientContext)?;
            let metadata = client.inner().fetch_metadata(None, Duration::from_secs(10))?;
            metadata
                .brokers()
                .first()
                .map(|b| b.id())
                .ok_or(TransportError::ControllerNotFound)
        })
        .await
        .map_err(|e| TransportError::NotReady(format!("controller discovery panicked: {e}")))?
    }

    /// Clears the topic-creation waiters map, the only per-instance
    /// in-flight-request state this type tracks. Mirrors the original
    /// driver's transport-level `on_stop`, which clears `_topic_waiters`
    /// alongside tearing down the consumer and producer it owns.
    pub fn stop(&self) {
        self.waiters.lock().unwrap().clear();
        info!("topic administrator stopped, waiters cleared");
    }
}

fn should_stop(shutdown: &Option<Arc<AtomicBool>>) -> bool {
    shutdown.as_ref().map(|flag| flag.load(Ordering::SeqCst)).unwrap_or(false)
}

fn clone_result(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => Err(TransportError::NotReady(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_policy_orders_compact_before_delete() {
        let options = CreateTopicOptions {
            compacting: true,
            deleting: true,
            ..Default::default()
        };
        let config = synthesize_config(&options);
        assert_eq!(config.get("cleanup.policy").map(String::as_str), Some("compact,delete"));
    }

    #[test]
    fn cleanup_policy_compact_only() {
        let options = CreateTopicOptions {
            compacting: true,
            ..Default::default()
        };
        let config = synthesize_config(&options);
        assert_eq!(config.get("cleanup.policy").map(String::as_str), Some("compact"));
    }

    #[test]
    fn retention_is_stored_in_millis() {
        let options = CreateTopicOptions {
            retention: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let config = synthesize_config(&options);
        assert_eq!(config.get("retention.ms").map(String::as_str), Some("3600000"));
    }

    #[test]
    fn user_config_overlays_on_top_of_synthesized_entries() {
        let mut user_config = BTreeMap::new();
        user_config.insert("cleanup.policy".to_string(), "delete".to_string());
        let options = CreateTopicOptions {
            compacting: true,
            config: user_config,
            ..Default::default()
        };
        let config = synthesize_config(&options);
        assert_eq!(config.get("cleanup.policy").map(String::as_str), Some("delete"));
    }

    #[test]
    fn topic_name_over_limit_is_rejected() {
        let long_name = "t".repeat(TOPIC_NAME_MAX_LEN + 1);
        assert!(long_name.len() > TOPIC_NAME_MAX_LEN);
    }

    #[tokio::test]
    async fn shutdown_flag_short_circuits_before_any_rpc() {
        let admin = TopicAdministrator::new("localhost:9092").expect("construct admin client");
        let shutdown = Arc::new(AtomicBool::new(true));
        let result = admin
            .create_topic_with_shutdown("never-created", 1, 1, CreateTopicOptions::default(), Some(shutdown))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn stop_clears_waiters_map() {
        let admin = TopicAdministrator::new("localhost:9092").expect("construct admin client");
        admin
            .waiters
            .lock()
            .unwrap()
            .insert("stale".to_string(), Arc::new(AsyncMutex::new(None)));
        admin.stop();
        assert!(admin.waiters.lock().unwrap().is_empty());
    }
}
