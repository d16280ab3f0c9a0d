//! Relay configuration.

use crate::error::{RelayError, Result};
use crate::types::DEFAULT_EVENT_TYPE;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How much history each channel keeps.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep at most this many events per channel (None = unbounded).
    pub max_entries: Option<usize>,

    /// Drop events older than this (None = no age limit).
    #[serde(with = "opt_secs")]
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    /// Count-bounded retention.
    pub fn entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_age: None,
        }
    }

    /// Time-bounded retention.
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_entries: None,
            max_age: Some(max_age),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::entries(1000)
    }
}

/// Where history lives.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local history, lost on restart.
    #[default]
    Memory,

    /// One append-only log per channel under `path`.
    Log {
        path: PathBuf,
        /// fsync every N appends per channel (0 and 1 both mean every append).
        #[serde(default = "default_sync_every")]
        sync_every: u64,
    },
}

fn default_sync_every() -> u64 {
    100
}

/// Relay configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Backing store for history.
    pub backend: StoreBackend,

    /// Per-channel retention.
    pub retention: RetentionPolicy,

    /// Type given to bare-payload publishes.
    pub default_event_type: String,

    /// Live events buffered per session before it is dropped as lagging.
    /// Default: 1024
    pub live_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            retention: RetentionPolicy::default(),
            default_event_type: DEFAULT_EVENT_TYPE.to_string(),
            live_buffer: 1024,
        }
    }
}

impl RelayConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: RelayConfig =
            serde_json::from_str(s).map_err(|e| RelayError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.retention.max_entries == Some(0) {
            return Err(RelayError::InvalidConfig(
                "retention.max_entries must be at least 1".into(),
            ));
        }
        if self.retention.max_age == Some(Duration::ZERO) {
            return Err(RelayError::InvalidConfig(
                "retention.max_age must be positive".into(),
            ));
        }
        if self.default_event_type.is_empty() {
            return Err(RelayError::InvalidConfig(
                "default_event_type must not be empty".into(),
            ));
        }
        if self.live_buffer == 0 {
            return Err(RelayError::InvalidConfig(
                "live_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// `Option<Duration>` as whole seconds.
mod opt_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
