//! Server configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! changes. The binary applies command-line overrides on top.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use shared::MAX_MESSAGE_SIZE;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Password,
    Did,
}

/// Per-sender throttling of avatar movement relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub enabled: bool,
    pub min_interval_ms: u64,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_ms: 33,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub bind_addresses: Vec<IpAddr>,
    pub port: u16,
    pub auth_mode: AuthMode,
    pub password: String,
    pub statistics_enabled: bool,
    pub max_connections: usize,
    /// Lossy sends to a peer are skipped once this many frames are in flight.
    pub max_queue_depth: usize,
    pub challenge_timeout_ms: u64,
    pub resolve_timeout_ms: u64,
    pub peer_timeout_ms: u64,
    pub resend_interval_ms: u64,
    pub max_resends: u32,
    pub workers: usize,
    pub store_path: Option<PathBuf>,
    pub store_secret: String,
    /// Identities granted admin at startup, in addition to persisted ones.
    pub admins: Vec<String>,
    pub max_store_payload: usize,
    pub reduction: ReductionConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bind_addresses: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            port: shared::DEFAULT_PORT,
            auth_mode: AuthMode::Did,
            password: String::new(),
            statistics_enabled: false,
            max_connections: 256,
            max_queue_depth: 70,
            challenge_timeout_ms: 10_000,
            resolve_timeout_ms: 5_000,
            peer_timeout_ms: 10_000,
            resend_interval_ms: 200,
            max_resends: 25,
            workers: 4,
            store_path: None,
            store_secret: String::new(),
            admins: Vec::new(),
            max_store_payload: 64 * 1024,
            reduction: ReductionConfig::default(),
        }
    }
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Configuration = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addresses.is_empty() {
            return Err(ConfigError::Invalid("no bind address"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid("max_queue_depth must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.store_path.is_some() && self.store_secret.is_empty() {
            return Err(ConfigError::Invalid("store_path requires a store_secret"));
        }
        if self.auth_mode == AuthMode::Password && self.password.is_empty() {
            return Err(ConfigError::Invalid("password auth requires a password"));
        }
        // Stored documents travel back in a single reassembled message.
        if self.max_store_payload > MAX_MESSAGE_SIZE / 2 {
            return Err(ConfigError::Invalid("max_store_payload exceeds the message limit"));
        }
        Ok(())
    }

    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.bind_addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_queue_depth, 70);
        assert_eq!(config.auth_mode, AuthMode::Did);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "port": 9000, "auth_mode": "password", "password": "hunter2",
                        "reduction": { "enabled": true } }"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth_mode, AuthMode::Password);
        assert!(config.reduction.enabled);
        assert_eq!(config.reduction.min_interval_ms, 33);
        assert_eq!(config.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Configuration::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.bind_addresses.clear();
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.store_path = Some(PathBuf::from("store.json"));
        assert!(config.validate().is_err());
        config.store_secret = "s3cret".to_string();
        assert!(config.validate().is_ok());

        let mut config = Configuration::default();
        config.auth_mode = AuthMode::Password;
        assert!(config.validate().is_err());

        let mut config = Configuration::default();
        config.max_store_payload = MAX_MESSAGE_SIZE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socket_addrs_use_port() {
        let config = Configuration {
            bind_addresses: vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
            port: 5000,
            ..Configuration::default()
        };
        let addrs = config.socket_addrs();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|addr| addr.port() == 5000));
    }
}
