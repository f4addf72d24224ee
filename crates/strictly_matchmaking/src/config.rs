//! Client configuration loaded from TOML.

use crate::persistence::PersistencePolicy;
use crate::poller::PollerTimings;
use crate::queue::QueueTimings;
use derive_getters::Getters;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Settings for a matchmaking client. Every field has a default, so an
/// empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the game server.
    #[serde(default = "default_server_url")]
    server_url: String,

    /// Delay between game polls.
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,

    /// Consecutive poll failures that stop polling.
    #[serde(default = "default_max_poll_failures")]
    max_poll_failures: u32,

    /// Base delay between queue status checks.
    #[serde(default = "default_status_check_interval_ms")]
    status_check_interval_ms: u64,

    /// Upper bound on the status-check delay.
    #[serde(default = "default_status_check_max_interval_ms")]
    status_check_max_interval_ms: u64,

    /// Period of the queue elapsed-time tick.
    #[serde(default = "default_ui_tick_ms")]
    ui_tick_ms: u64,

    /// Time in queue before giving up.
    #[serde(default = "default_queue_timeout_secs")]
    queue_timeout_secs: u64,

    /// Time in queue before the session is first persisted.
    #[serde(default = "default_min_persist_dwell_ms")]
    min_persist_dwell_ms: u64,

    /// Oldest restorable snapshot.
    #[serde(default = "default_max_snapshot_age_secs")]
    max_snapshot_age_secs: u64,

    /// SQLite file for persistence. In-memory when absent.
    #[serde(default)]
    store_path: Option<String>,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_poll_failures() -> u32 {
    3
}

fn default_status_check_interval_ms() -> u64 {
    3000
}

fn default_status_check_max_interval_ms() -> u64 {
    15_000
}

fn default_ui_tick_ms() -> u64 {
    1000
}

fn default_queue_timeout_secs() -> u64 {
    300
}

fn default_min_persist_dwell_ms() -> u64 {
    5000
}

fn default_max_snapshot_age_secs() -> u64 {
    600
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_failures: default_max_poll_failures(),
            status_check_interval_ms: default_status_check_interval_ms(),
            status_check_max_interval_ms: default_status_check_max_interval_ms(),
            ui_tick_ms: default_ui_tick_ms(),
            queue_timeout_secs: default_queue_timeout_secs(),
            min_persist_dwell_ms: default_min_persist_dwell_ms(),
            max_snapshot_age_secs: default_max_snapshot_age_secs(),
            store_path: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or holds
    /// a zero interval.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading config from file");
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e)))?;
        let config = Self::from_toml(&content)?;
        info!(server_url = %config.server_url, "Config loaded successfully");
        Ok(config)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed TOML or a zero interval.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::new(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("status_check_interval_ms", self.status_check_interval_ms),
            ("ui_tick_ms", self.ui_tick_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::new(format!("{} must be positive", name)));
        }
        if self.max_poll_failures == 0 {
            return Err(ConfigError::new("max_poll_failures must be positive"));
        }
        if self.status_check_max_interval_ms < self.status_check_interval_ms {
            return Err(ConfigError::new(
                "status_check_max_interval_ms must not be below status_check_interval_ms",
            ));
        }
        Ok(())
    }

    /// Returns a copy pointing at `server_url`.
    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    /// Returns a copy persisting to `store_path`.
    pub fn with_store_path(mut self, store_path: Option<String>) -> Self {
        self.store_path = store_path;
        self
    }

    /// Queue timer settings.
    pub fn queue_timings(&self) -> QueueTimings {
        QueueTimings::new(
            Duration::from_millis(self.status_check_interval_ms),
            Duration::from_millis(self.status_check_max_interval_ms),
            Duration::from_millis(self.ui_tick_ms),
            Duration::from_secs(self.queue_timeout_secs),
        )
    }

    /// Poller timer settings.
    pub fn poller_timings(&self) -> PollerTimings {
        PollerTimings::new(
            Duration::from_millis(self.poll_interval_ms),
            self.max_poll_failures,
        )
    }

    /// Persistence thresholds.
    pub fn persistence_policy(&self) -> PersistencePolicy {
        PersistencePolicy::new(
            Duration::from_millis(self.min_persist_dwell_ms),
            Duration::from_secs(self.max_snapshot_age_secs),
        )
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("Config error: {} at {}:{}", message, file, line)]
pub struct ConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ClientConfig::from_toml("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.queue_timings(), QueueTimings::default());
        assert_eq!(config.poller_timings(), PollerTimings::default());
        assert_eq!(config.persistence_policy(), PersistencePolicy::default());
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_toml(
            r#"
            server_url = "https://morris.example"
            poll_interval_ms = 500
            store_path = "/tmp/queue.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url(), "https://morris.example");
        assert_eq!(config.poller_timings().interval, Duration::from_millis(500));
        assert_eq!(config.store_path().as_deref(), Some("/tmp/queue.db"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = ClientConfig::from_toml("ui_tick_ms = 0").unwrap_err();
        assert!(err.message.contains("ui_tick_ms"));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        assert!(ClientConfig::from_toml("poll_interval_ms = \"fast\"").is_err());
    }
}
