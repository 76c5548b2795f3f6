//! Construction-time configuration for the consumer session and producer.

use std::time::Duration;

use crate::addr::BrokerUrl;
use crate::error::{Result, TransportError};
use crate::types::Credentials;

/// Which partition assignment strategy the group should negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignor {
    RoundRobin,
    /// The host supplies its own assignor name, e.g. a sticky-with-standbys
    /// implementation registered with the broker client.
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoOffsetReset {
    Earliest,
    Latest,
    None,
}

/// Construction parameters for a [`crate::consumer::ConsumerSession`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub group_instance_id: Option<String>,
    pub client_id: String,
    pub bootstrap_servers: Vec<BrokerUrl>,
    pub standby_replicas: u32,
    pub auto_offset_reset: AutoOffsetReset,
    pub request_timeout: Duration,
    pub session_timeout: Duration,
    pub rebalance_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_poll_records: u32,
    pub max_poll_interval: Duration,
    pub max_partition_fetch_bytes: u32,
    pub check_crcs: bool,
    pub in_transaction: bool,
    pub metadata_max_age: Duration,
    pub connections_max_idle: Duration,
    pub credentials: Option<Credentials>,
    pub api_version: Option<String>,
    /// Builds a plain, non-group-joined consumer with auto-commit enabled;
    /// used for ad hoc reads outside the worker's consume/commit loop.
    pub client_only: bool,
}

impl ConsumerConfig {
    /// Validates cross-field invariants not expressible in the type alone.
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout > self.request_timeout {
            return Err(TransportError::ImproperlyConfigured(format!(
                "session_timeout ({:?}) must not exceed request_timeout ({:?})",
                self.session_timeout, self.request_timeout
            )));
        }
        Ok(())
    }

    pub fn assignor(&self) -> Assignor {
        if self.standby_replicas > 0 {
            Assignor::Custom("standby-aware".into())
        } else {
            Assignor::RoundRobin
        }
    }

    pub fn isolation_level(&self) -> &'static str {
        if self.in_transaction {
            "read_committed"
        } else {
            "read_uncommitted"
        }
    }
}

/// Construction parameters for the plain/transactional/threaded producer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub bootstrap_servers: Vec<BrokerUrl>,
    pub client_id: String,
    pub acks: String,
    pub linger: Duration,
    pub max_batch_size: usize,
    pub max_request_size: usize,
    pub compression: String,
    pub request_timeout: Duration,
    pub api_version: Option<String>,
    pub metadata_max_age: Duration,
    pub connections_max_idle: Duration,
    pub credentials: Option<Credentials>,
    pub in_transaction: bool,
}

impl ProducerConfig {
    /// Transactional producers force `acks=all` and idempotence, matching
    /// the broker's requirement for exactly-once-within-Kafka semantics.
    pub fn effective_acks(&self) -> &str {
        if self.in_transaction {
            "all"
        } else {
            &self.acks
        }
    }

    pub fn enable_idempotence(&self) -> bool {
        self.in_transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ConsumerConfig {
        ConsumerConfig {
            group_id: "g".into(),
            group_instance_id: None,
            client_id: "c".into(),
            bootstrap_servers: vec![],
            standby_replicas: 0,
            auto_offset_reset: AutoOffsetReset::Latest,
            request_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(10),
            rebalance_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
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
        }
    }

    #[test]
    fn session_timeout_over_request_timeout_is_rejected() {
        let mut config = base_config();
        config.session_timeout = Duration::from_secs(60);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TransportError::ImproperlyConfigured(_)));
    }

    #[test]
    fn standby_replicas_select_custom_assignor() {
        let mut config = base_config();
        config.standby_replicas = 2;
        assert_eq!(config.assignor(), Assignor::Custom("standby-aware".into()));
    }

    #[test]
    fn no_standby_replicas_selects_round_robin() {
        let config = base_config();
        assert_eq!(config.assignor(), Assignor::RoundRobin);
    }

    #[test]
    fn transactional_consumer_reads_committed() {
        let mut config = base_config();
        config.in_transaction = true;
        assert_eq!(config.isolation_level(), "read_committed");
    }
}
