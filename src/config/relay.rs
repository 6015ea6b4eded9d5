//! Relay configuration
//!
//! Loads server and room settings from a TOML file. Every key is optional.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::server::DEFAULT_OUTBOUND_QUEUE;

/// Default endpoint path for WebSocket upgrades
pub const DEFAULT_PATH: &str = "/signal";

/// Default maximum inbound message size (64 KiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// `[server]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Request path accepted for WebSocket upgrades
    pub path: String,
    /// Allowed `Origin` patterns; `*` matches anything
    pub allowed_origins: Vec<String>,
    /// Per-connection outbound queue capacity
    pub outbound_queue: usize,
    /// Largest inbound message accepted, in bytes
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            path: DEFAULT_PATH.to_string(),
            allowed_origins: vec!["*".to_string()],
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// `[rooms]` table
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RoomSettings {
    /// Keep empty rooms instead of deleting them when the last member leaves
    pub retain_empty: bool,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub rooms: RoomSettings,
}

impl RelayConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the bind address and port when given on the command line
    pub fn with_overrides(mut self, bind: Option<String>, port: Option<u16>) -> Self {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if !server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/', got {:?}",
                server.path
            )));
        }
        if server.allowed_origins.is_empty() {
            return Err(ConfigError::Invalid(
                "server.allowed_origins cannot be empty".to_string(),
            ));
        }
        if let Some(pattern) = server
            .allowed_origins
            .iter()
            .find(|p| p.matches('*').count() > 1)
        {
            return Err(ConfigError::Invalid(format!(
                "origin pattern {:?} has more than one '*'",
                pattern
            )));
        }
        if server.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "server.outbound_queue must be at least 1".to_string(),
            ));
        }
        if server.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_message_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.server.path, "/signal");
        assert_eq!(config.server.allowed_origins, vec!["*".to_string()]);
        assert_eq!(config.server.port, 8080);
        assert!(!config.rooms.retain_empty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = RelayConfig::from_toml("").unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_partial_tables_keep_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            [server]
            port = 9443
            allowed_origins = ["https://*.example.com"]

            [rooms]
            retain_empty = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.path, "/signal");
        assert_eq!(config.server.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
        assert!(config.rooms.retain_empty);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "[server]\npath = \"/ws\"\nmax_message_size = 1024\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.server.max_message_size, 1024);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = RelayConfig::load(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = RelayConfig::from_toml("[server\nport = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        let result = RelayConfig::from_toml("[server]\nport = \"eighty\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_values() {
        for toml in [
            "[server]\npath = \"signal\"",
            "[server]\nallowed_origins = []",
            "[server]\nallowed_origins = [\"*.*\"]",
            "[server]\noutbound_queue = 0",
            "[server]\nmax_message_size = 0",
        ] {
            let result = RelayConfig::from_toml(toml);
            assert!(
                matches!(result, Err(ConfigError::Invalid(_))),
                "expected {:?} to be rejected",
                toml
            );
        }
    }

    #[test]
    fn test_cli_overrides() {
        let config = RelayConfig::default().with_overrides(Some("0.0.0.0".to_string()), None);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);

        let config = config.with_overrides(None, Some(3000));
        assert_eq!(config.server.port, 3000);
    }
}
