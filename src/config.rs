//! Configuration for the synchronization core.
//!
//! Loaded from TOML, then overridden by `CASEBOARD_*` environment
//! variables, then validated. Every section has working defaults, so an
//! empty file is a valid configuration. Durations are milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::mask::Masked;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CASEBOARD_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub realtime: RealtimeConfig,
    pub persist: PersistConfig,
    pub log: LogConfig,
}

/// Query cache defaults, used when a query passes no options of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long fetched data counts as fresh.
    pub stale_time_ms: u64,
    /// How long an unobserved entry is kept before removal.
    pub cache_time_ms: u64,
    /// Retries after the first failed attempt.
    pub retry: u32,
    /// Base retry delay; doubles on every attempt.
    pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 30_000,
            cache_time_ms: 300_000,
            retry: 3,
            retry_delay_ms: 1_000,
        }
    }
}

/// Realtime connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Delay before reconnect attempt `n` is `reconnect_delay_ms * n`.
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Ping interval while connected; 0 disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Opaque bearer token sent on connect.
    #[serde(skip_serializing)]
    pub token: Option<Masked<String>>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            reconnect_delay_ms: 3_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            token: None,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

/// Local write-through of selected slices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub enabled: bool,
    /// SQLite file; in-memory storage when unset.
    pub path: Option<PathBuf>,
    /// Storage key prefix; slices are stored under `<prefix>/<slice>`.
    pub key_prefix: String,
    pub debounce_ms: u64,
    /// Slice names written through.
    pub slices: Vec<String>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            key_prefix: "/caseboard".to_string(),
            debounce_ms: 750,
            slices: vec!["ui".to_string(), "session".to_string()],
        }
    }
}

impl PersistConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Storage key for one slice.
    pub fn slice_key(&self, slice: &str) -> String {
        format!("{}/{}", self.key_prefix.trim_end_matches('/'), slice)
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,caseboard_sync=debug".to_string(),
            json: false,
        }
    }
}

impl SyncConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(url) = var("REALTIME_URL") {
            self.realtime.url = url;
        }
        if let Some(token) = var("REALTIME_TOKEN") {
            self.realtime.token = Some(Masked::new(token));
        }
        if let Some(path) = var("PERSIST_PATH") {
            self.persist.path = Some(PathBuf::from(path));
        }
        if let Some(filter) = var("LOG") {
            self.log.filter = filter;
        }
        if let Some(json) = var("LOG_JSON") {
            self.log.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
    }

    /// Reject configurations the managers cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = &self.realtime.url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SyncError::Config(format!(
                "realtime.url must start with ws:// or wss://, got {}",
                url
            )));
        }
        if self.cache.retry > 10 {
            return Err(SyncError::Config("cache.retry must be at most 10".to_string()));
        }
        if self.persist.enabled {
            if !self.persist.key_prefix.starts_with('/') {
                return Err(SyncError::Config(
                    "persist.key_prefix must start with '/'".to_string(),
                ));
            }
            if self.persist.debounce_ms == 0 {
                return Err(SyncError::Config(
                    "persist.debounce_ms must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}
