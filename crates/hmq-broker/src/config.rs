// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker configuration.

use hmq::TransportConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Broker configuration, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 5672)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Worker pool size (default: available parallelism)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// TCP listen backlog
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,

    /// Maximum inbound frame size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Bytes read per connection per unit of work
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,

    /// Enable TCP_NODELAY on client connections
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// Unacknowledged deliveries allowed per session (None = unlimited)
    #[serde(default = "default_prefetch_limit")]
    pub prefetch_limit: Option<usize>,

    /// Deliveries emitted per unit of work before yielding
    #[serde(default = "default_delivery_batch")]
    pub delivery_batch: usize,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    5672
}

fn default_worker_threads() -> usize {
    hmq::SchedulerConfig::default().pool_size
}

fn default_listen_backlog() -> u32 {
    128
}

fn default_max_message_size() -> usize {
    hmq::net::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_read_budget() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

fn default_prefetch_limit() -> Option<usize> {
    Some(256)
}

fn default_delivery_batch() -> usize {
    32
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            worker_threads: default_worker_threads(),
            listen_backlog: default_listen_backlog(),
            max_message_size: default_max_message_size(),
            read_budget: default_read_budget(),
            nodelay: true,
            prefetch_limit: default_prefetch_limit(),
            delivery_batch: default_delivery_batch(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Listener and pool settings for the transport.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            listen_address: Some(self.bind_address),
            listen_port: self.port,
            listen_backlog: self.listen_backlog,
            worker_threads: self.worker_threads,
            max_message_size: self.max_message_size,
            read_budget: self.read_budget,
            nodelay: self.nodelay,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery_batch == 0 {
            return Err(ConfigError::InvalidValue(
                "delivery_batch cannot be 0".into(),
            ));
        }
        if self.prefetch_limit == Some(0) {
            return Err(ConfigError::InvalidValue(
                "prefetch_limit cannot be 0 (use null for unlimited)".into(),
            ));
        }
        self.transport_config()
            .validate()
            .map_err(|e| ConfigError::InvalidValue(e.into()))
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 5672);
        assert_eq!(config.prefetch_limit, Some(256));
        assert!(config.worker_threads >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{ "port": 6000, "prefetch_limit": null }"#).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.prefetch_limit, None);
        assert_eq!(config.delivery_batch, 32);
        assert!(config.nodelay);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");

        let config = BrokerConfig {
            port: 7000,
            worker_threads: 3,
            prefetch_limit: Some(10),
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(loaded.port, 7000);
        assert_eq!(loaded.worker_threads, 3);
        assert_eq!(loaded.prefetch_limit, Some(10));
    }

    #[test]
    fn test_from_file_errors() {
        let missing = BrokerConfig::from_file(Path::new("/nonexistent/hmq/broker.json"));
        assert!(matches!(missing, Err(ConfigError::IoError(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let broken = BrokerConfig::from_file(file.path());
        assert!(matches!(broken, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation() {
        let zero_batch = BrokerConfig {
            delivery_batch: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let zero_prefetch = BrokerConfig {
            prefetch_limit: Some(0),
            ..Default::default()
        };
        assert!(zero_prefetch.validate().is_err());

        let zero_workers = BrokerConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_workers.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_transport_config() {
        let config = BrokerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9000,
            read_budget: 4096,
            ..Default::default()
        };
        let transport = config.transport_config();
        assert_eq!(transport.bind_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(transport.read_budget, 4096);
    }
}
