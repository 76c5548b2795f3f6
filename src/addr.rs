//! Addressing & auth adapter.
//!
//! Pure functions that turn broker URLs and a [`Credentials`] variant into
//! the string settings an rdkafka `ClientConfig` expects.

use crate::error::{Result, TransportError};
use crate::types::{ConfigMap, Credentials, TlsContext};

const DEFAULT_HOST: &str = "127.0.0.1";

/// A broker URL as parsed from configuration: `host` may be empty (meaning
/// "use the default host") and `port` may be absent (meaning "use the
/// caller-supplied default port").
#[derive(Debug, Clone, Default)]
pub struct BrokerUrl {
    pub host: String,
    pub port: Option<u16>,
}

impl BrokerUrl {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        BrokerUrl {
            host: host.into(),
            port,
        }
    }
}

fn canon_host(host: &str) -> &str {
    host
}

/// Formats a single host for inclusion in a Kafka `bootstrap.servers`
/// string, bracketing it if it looks like an IPv6 address.
fn format_host(host: &str) -> String {
    let host = if host.is_empty() { DEFAULT_HOST } else { canon_host(host) };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Converts a list of broker URLs to the list of `host:port` strings
/// rdkafka's `bootstrap.servers` setting expects.
pub fn server_list(urls: &[BrokerUrl], default_port: u16) -> Vec<String> {
    urls.iter()
        .map(|u| format!("{}:{}", format_host(&u.host), u.port.unwrap_or(default_port)))
        .collect()
}

fn apply_tls(config: &mut ConfigMap, tls: &Option<TlsContext>) {
    if let Some(tls) = tls {
        if let Some(ca) = &tls.ca_location {
            config.insert("ssl.ca.location".into(), ca.clone());
        }
        if let Some(cert) = &tls.certificate_location {
            config.insert("ssl.certificate.location".into(), cert.clone());
        }
        if let Some(key) = &tls.key_location {
            config.insert("ssl.key.location".into(), key.clone());
        }
    }
}

/// Translates a [`Credentials`] variant (plus any bare TLS context, used
/// when no other credentials are configured) into rdkafka `ClientConfig`
/// entries. When both are absent, yields plaintext.
pub fn credentials_to_settings(
    credentials: Option<&Credentials>,
    tls_context: Option<&TlsContext>,
) -> Result<ConfigMap> {
    let mut config = ConfigMap::new();
    match credentials {
        Some(Credentials::Ssl { tls }) => {
            config.insert("security.protocol".into(), "SSL".into());
            apply_tls(&mut config, tls);
        }
        Some(Credentials::SaslPlain { username, password, tls }) => {
            config.insert(
                "security.protocol".into(),
                if tls.is_some() { "SASL_SSL".into() } else { "SASL_PLAINTEXT".into() },
            );
            config.insert("sasl.mechanism".into(), "PLAIN".into());
            config.insert("sasl.username".into(), username.clone());
            config.insert("sasl.password".into(), password.clone());
            apply_tls(&mut config, tls);
        }
        Some(Credentials::SaslOAuth { mechanism, tls, .. }) => {
            config.insert(
                "security.protocol".into(),
                if tls.is_some() { "SASL_SSL".into() } else { "SASL_PLAINTEXT".into() },
            );
            config.insert("sasl.mechanism".into(), mechanism.clone());
            apply_tls(&mut config, tls);
        }
        Some(Credentials::SaslGssapi { service_name, domain_name, tls }) => {
            config.insert(
                "security.protocol".into(),
                if tls.is_some() { "SASL_SSL".into() } else { "SASL_PLAINTEXT".into() },
            );
            config.insert("sasl.mechanism".into(), "GSSAPI".into());
            config.insert("sasl.kerberos.service.name".into(), service_name.clone());
            config.insert("sasl.kerberos.kinit.cmd".into(), format!("kinit {domain_name}"));
            apply_tls(&mut config, tls);
        }
        None => {
            if let Some(tls) = tls_context {
                config.insert("security.protocol".into(), "SSL".into());
                apply_tls(&mut config, &Some(tls.clone()));
            } else {
                config.insert("security.protocol".into(), "PLAINTEXT".into());
            }
        }
    }
    Ok(config)
}

/// Unknown credential combinations fail construction eagerly; kept as a
/// separate helper so callers building from loosely-typed configuration
/// (e.g. deserialized JSON) have a place to raise `ImproperlyConfigured`
/// without going through the `Credentials` enum at all.
pub fn reject_unknown_credentials(kind: &str) -> Result<()> {
    Err(TransportError::ImproperlyConfigured(format!(
        "unsupported credentials variant: {kind}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_list_round_trips_ipv6() {
        let urls = vec![BrokerUrl::new("::1", Some(1234))];
        let out = server_list(&urls, 9092);
        assert_eq!(out, vec!["[::1]:1234".to_string()]);
    }

    #[test]
    fn server_list_defaults_port() {
        let urls = vec![BrokerUrl::new("host", None)];
        let out = server_list(&urls, 9092);
        assert_eq!(out, vec!["host:9092".to_string()]);
    }

    #[test]
    fn server_list_defaults_empty_host() {
        let urls = vec![BrokerUrl::new("", None)];
        let out = server_list(&urls, 9092);
        assert_eq!(out, vec!["127.0.0.1:9092".to_string()]);
    }

    #[test]
    fn no_credentials_no_tls_is_plaintext() {
        let config = credentials_to_settings(None, None).unwrap();
        assert_eq!(config.get("security.protocol").map(String::as_str), Some("PLAINTEXT"));
    }

    #[test]
    fn sasl_plain_sets_mechanism_and_protocol() {
        let creds = Credentials::SaslPlain {
            username: "u".into(),
            password: "p".into(),
            tls: None,
        };
        let config = credentials_to_settings(Some(&creds), None).unwrap();
        assert_eq!(config.get("security.protocol").map(String::as_str), Some("SASL_PLAINTEXT"));
        assert_eq!(config.get("sasl.mechanism").map(String::as_str), Some("PLAIN"));
        assert_eq!(config.get("sasl.username").map(String::as_str), Some("u"));
    }

    #[test]
    fn bare_tls_context_without_credentials_is_ssl() {
        let tls = TlsContext {
            ca_location: Some("/ca.pem".into()),
            ..Default::default()
        };
        let config = credentials_to_settings(None, Some(&tls)).unwrap();
        assert_eq!(config.get("security.protocol").map(String::as_str), Some("SSL"));
        assert_eq!(config.get("ssl.ca.location").map(String::as_str), Some("/ca.pem"));
    }
}
