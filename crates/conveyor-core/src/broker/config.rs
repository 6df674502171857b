use serde::Deserialize;

use crate::error::ConfigError;

/// Scheduler configuration (channel capacity, idle timeout, retention sweep).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub command_channel_capacity: usize,
    /// Longest the scheduler parks between commands; also the lease reclaim
    /// cadence.
    pub idle_timeout_ms: u64,
    pub retention_sweep_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_channel_capacity: 10_000,
            idle_timeout_ms: 100,
            retention_sweep_interval_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.command_channel_capacity must be > 0".into(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.idle_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.command_channel_capacity, 10_000);
        assert_eq!(config.idle_timeout_ms, 100);
        assert_eq!(config.retention_sweep_interval_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_parsing_partial_config() {
        let config: SchedulerConfig = toml::from_str("idle_timeout_ms = 25").unwrap();
        assert_eq!(config.idle_timeout_ms, 25);
        assert_eq!(config.command_channel_capacity, 10_000);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = SchedulerConfig {
            command_channel_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
