//! Configuration handling for the netsession node.
//!
//! Values come from a YAML file, then `NETSESSION_*` environment variables,
//! then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use clap::ValueEnum;
use netsession_session::{IdleConfig, IdleKind, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Wire protocol spoken by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// 16-byte header + body
    #[default]
    Tlv,
    /// RFC 6455 WebSocket
    #[value(alias = "ws")]
    Websocket,
    /// HTTP/1.1 with Content-Length bodies
    Http,
}

/// TLS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to certificate chain (PEM)
    pub cert_file: String,
    /// Path to private key (PEM)
    pub key_file: String,
    /// Path to CA certificate (PEM); when set, clients must present a cert
    pub ca_file: String,
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Protocol to serve
    pub protocol: Protocol,
    /// Listen address
    pub listen: SocketAddr,
    /// Refuse connections beyond this many open sessions; 0 is unlimited
    pub max_clients: usize,
    /// Codec maximum message size; 0 keeps the codec default
    pub max_message_size: usize,
    /// Idle detection
    pub idle: IdleConfig,
    /// Per-session settings
    pub session: SessionConfig,
    /// TLS settings
    pub tls: TlsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tlv,
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            max_clients: 0,
            max_message_size: 0,
            idle: IdleConfig {
                kind: IdleKind::Both,
                threshold: Duration::from_secs(60),
            },
            session: SessionConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from `config_path` and the environment. A missing or unparsable
    /// file falls back to defaults with a warning.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Self {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_yaml(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({:#}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        info!(
            "Final configuration: protocol={:?}, listen={}, idle={:?}/{:?}, max_clients={}",
            config.protocol, config.listen, config.idle.kind, config.idle.threshold, config.max_clients
        );
        config
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("invalid node configuration")
    }

    /// Apply `NETSESSION_*` overrides from `lookup`. Unparsable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("NETSESSION_PROTOCOL") {
            match Protocol::from_str(&value, true) {
                Ok(protocol) => {
                    self.protocol = protocol;
                    info!("Protocol overridden by environment: {:?}", protocol);
                }
                Err(e) => warn!("Ignoring NETSESSION_PROTOCOL: {}", e),
            }
        }

        if let Some(value) = lookup("NETSESSION_LISTEN") {
            match value.parse() {
                Ok(addr) => {
                    self.listen = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring NETSESSION_LISTEN: invalid address '{}'", value),
            }
        }

        if let Some(value) = lookup("NETSESSION_MAX_CLIENTS") {
            match value.parse() {
                Ok(max) => self.max_clients = max,
                Err(_) => warn!("Ignoring NETSESSION_MAX_CLIENTS: '{}'", value),
            }
        }

        if let Some(value) = lookup("NETSESSION_IDLE_TIMEOUT") {
            match humantime::parse_duration(&value) {
                Ok(threshold) => {
                    self.idle.threshold = threshold;
                    info!("Idle timeout overridden by environment: {:?}", threshold);
                }
                Err(e) => warn!("Ignoring NETSESSION_IDLE_TIMEOUT: {}", e),
            }
        }

        if let Some(value) = lookup("NETSESSION_TLS_ENABLED") {
            self.tls.enabled = value.eq_ignore_ascii_case("true") || value == "1";
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsession_session::{DispatchMode, OverflowPolicy};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.protocol, Protocol::Tlv);
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.idle.threshold, Duration::from_secs(60));
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
protocol: websocket
listen: 127.0.0.1:9100
max_clients: 64
idle:
  kind: either
  threshold: 2m
session:
  buffer_size: 16384
  dispatch: ordered
  outbound:
    max_depth: 256
    policy: keep_new
tls:
  enabled: true
  cert_file: /etc/netsession/cert.pem
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path());

        assert_eq!(config.protocol, Protocol::Websocket);
        assert_eq!(config.listen, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_clients, 64);
        assert_eq!(config.idle.kind, IdleKind::Either);
        assert_eq!(config.idle.threshold, Duration::from_secs(120));
        assert_eq!(config.session.buffer_size, 16384);
        assert_eq!(config.session.dispatch, DispatchMode::Ordered);
        assert_eq!(config.session.outbound.max_depth, 256);
        assert_eq!(config.session.outbound.policy, OverflowPolicy::KeepNew);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.cert_file, "/etc/netsession/cert.pem");
        assert!(config.tls.key_file.is_empty());
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"protocol: [not, a, protocol]\n").unwrap();
        let config = NodeConfig::load_from_file(temp_file.path());
        assert_eq!(config.protocol, Protocol::Tlv);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("NETSESSION_PROTOCOL", "HTTP"),
            ("NETSESSION_LISTEN", "not-an-address"),
            ("NETSESSION_MAX_CLIENTS", "10"),
            ("NETSESSION_IDLE_TIMEOUT", "45s"),
            ("NETSESSION_TLS_ENABLED", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.max_clients, 10);
        assert_eq!(config.idle.threshold, Duration::from_secs(45));
        assert!(config.tls.enabled);
    }
}
