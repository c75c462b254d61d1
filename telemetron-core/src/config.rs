//! Configuration for the collector and the agent
//!
//! Both structures deserialize from a JSON file with every field optional;
//! missing fields take the defaults below. Intervals are whole seconds on
//! disk and [`Duration`] in memory. Command-line flags and environment
//! variables are layered on top by the binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, TelemetronError};

pub const DEFAULT_ADDRESS: &str = "localhost:8080";
pub const DEFAULT_STORE_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_FILE_STORAGE_PATH: &str = "/tmp/metrics-db.json";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RATE_LIMIT: usize = 3;

/// (De)serialize a [`Duration`] as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Collector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, `host:port`
    pub address: String,
    /// Snapshot file, or the backing document for write-through storage
    pub file_storage_path: PathBuf,
    /// Snapshot period; zero switches to write-through file storage
    #[serde(with = "duration_secs")]
    pub store_interval: Duration,
    /// Seed the in-memory store from the snapshot file at startup
    pub restore: bool,
    /// PostgreSQL connection string; selects the relational backend
    #[serde(alias = "dsn")]
    pub database_dsn: Option<String>,
    /// Shared HMAC secret
    #[serde(alias = "key")]
    pub secret_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            file_storage_path: PathBuf::from(DEFAULT_FILE_STORAGE_PATH),
            store_interval: DEFAULT_STORE_INTERVAL,
            restore: true,
            database_dsn: None,
            secret_key: None,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; absent fields keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(TelemetronError::config("server address must not be empty"));
        }
        let uses_database = self.database_dsn.as_deref().is_some_and(|dsn| !dsn.is_empty());
        if !uses_database
            && self.store_interval.is_zero()
            && self.file_storage_path.as_os_str().is_empty()
        {
            return Err(TelemetronError::config(
                "store interval 0 requires a file storage path",
            ));
        }
        Ok(())
    }

    /// The configured secret, if signing is enabled
    pub fn secret(&self) -> Option<&str> {
        self.secret_key.as_deref().filter(|key| !key.is_empty())
    }
}

/// Agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector address, `host:port` or a full URL
    pub address: String,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub report_interval: Duration,
    /// Shared HMAC secret
    #[serde(alias = "key")]
    pub secret_key: Option<String>,
    /// Maximum concurrent outbound requests
    pub rate_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            secret_key: None,
            rate_limit: DEFAULT_RATE_LIMIT,
        }
    }
}

impl AgentConfig {
    /// Load from a JSON file; absent fields keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(TelemetronError::config("collector address must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(TelemetronError::config("poll interval must be positive"));
        }
        if self.report_interval.is_zero() {
            return Err(TelemetronError::config("report interval must be positive"));
        }
        if self.rate_limit == 0 {
            return Err(TelemetronError::config("rate limit must be at least 1"));
        }
        Ok(())
    }

    /// The configured secret, if signing is enabled
    pub fn secret(&self) -> Option<&str> {
        self.secret_key.as_deref().filter(|key| !key.is_empty())
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| {
        TelemetronError::config(format!("cannot read config file {}: {e}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        TelemetronError::config(format!("invalid config file {}: {e}", path.display()))
    })
}
