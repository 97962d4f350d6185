//! Configuration for the vault

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Ledger storage
    pub storage: StorageConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// HTTP server
    pub server: ServerConfig,

    /// Mutation writer
    pub writer: WriterConfig,

    /// Long-poll behaviour at the HTTP boundary
    pub long_poll: LongPollConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "ticket-vault".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            storage: StorageConfig::default(),
            rocksdb: RocksDBConfig::default(),
            server: ServerConfig::default(),
            writer: WriterConfig::default(),
            long_poll: LongPollConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Ledger storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// fsync every mutation before the cache advances
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/vault"),
            sync_writes: true,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Worker threads
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            workers: 1,
        }
    }
}

/// Mutation writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Bounded mailbox size; senders wait when it is full
    pub mailbox_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

/// Long-poll configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LongPollConfig {
    /// Give up waiting after this long and answer with the current snapshot.
    /// `None` waits until the threshold is crossed or the client leaves.
    pub timeout_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables (`TICKET_VAULT_*`)
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> crate::Result<()> {
        if let Some(path) = lookup("TICKET_VAULT_DB_PATH") {
            self.storage.data_dir = PathBuf::from(path);
        }

        if let Some(host) = lookup("TICKET_VAULT_HOST") {
            self.server.host = host;
        }

        if let Some(port) = lookup("TICKET_VAULT_PORT") {
            self.server.port = parse_env("TICKET_VAULT_PORT", &port)?;
        }

        if let Some(workers) = lookup("TICKET_VAULT_WORKERS") {
            self.server.workers = parse_env("TICKET_VAULT_WORKERS", &workers)?;
        }

        if let Some(json) = lookup("TICKET_VAULT_LOG_JSON") {
            self.logging.json = parse_env("TICKET_VAULT_LOG_JSON", &json)?;
        }

        if let Some(timeout) = lookup("TICKET_VAULT_LONG_POLL_TIMEOUT_MS") {
            self.long_poll.timeout_ms = Some(parse_env("TICKET_VAULT_LONG_POLL_TIMEOUT_MS", &timeout)?);
        }

        Ok(())
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.port == 0 {
            return Err(crate::Error::Config("Server port cannot be 0".to_string()));
        }

        if self.server.workers == 0 {
            return Err(crate::Error::Config("At least one worker is required".to_string()));
        }

        if self.writer.mailbox_capacity == 0 {
            return Err(crate::Error::Config("Writer mailbox capacity cannot be 0".to_string()));
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("Data directory is required".to_string()));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "ticket-vault");
        assert_eq!(config.server.port, 8000);
        assert!(config.storage.sync_writes);
        assert!(config.long_poll.timeout_ms.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TICKET_VAULT_DB_PATH", "/tmp/vault"),
            ("TICKET_VAULT_PORT", "9001"),
            ("TICKET_VAULT_WORKERS", "4"),
            ("TICKET_VAULT_LONG_POLL_TIMEOUT_MS", "30000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/vault"));
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.long_poll.timeout_ms, Some(30_000));
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "TICKET_VAULT_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8123

            [storage]
            data_dir = "/var/lib/vault"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8123);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/vault"));
        assert!(config.storage.sync_writes);
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
