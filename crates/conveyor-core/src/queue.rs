use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Queue configuration stored in the `queues` column family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// How long a received message stays hidden before it can be redelivered.
    /// Must exceed worst-case processing latency.
    pub visibility_timeout_ms: u64,
    /// Messages older than this are dropped even if never consumed.
    pub retention_ms: u64,
    /// Default long-poll wait for receivers that don't specify one.
    pub receive_wait_ms: u64,
}

impl QueueConfig {
    /// Default visibility timeout: 30 seconds.
    pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;
    /// Default retention: 4 days.
    pub const DEFAULT_RETENTION_MS: u64 = 345_600_000;
    /// Default long-poll wait: 20 seconds.
    pub const DEFAULT_RECEIVE_WAIT_MS: u64 = 20_000;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout_ms: Self::DEFAULT_VISIBILITY_TIMEOUT_MS,
            retention_ms: Self::DEFAULT_RETENTION_MS,
            receive_wait_ms: Self::DEFAULT_RECEIVE_WAIT_MS,
        }
    }

    pub fn with_visibility_timeout_ms(mut self, ms: u64) -> Self {
        self.visibility_timeout_ms = ms;
        self
    }

    pub fn with_retention_ms(mut self, ms: u64) -> Self {
        self.retention_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "queue name must not be empty".into(),
            ));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "queue {}: visibility_timeout_ms must be > 0",
                self.name
            )));
        }
        if self.retention_ms <= self.visibility_timeout_ms {
            return Err(ConfigError::InvalidValue(format!(
                "queue {}: retention_ms must exceed visibility_timeout_ms",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("")
    }
}
