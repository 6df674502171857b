//! Long-running queue consumers.
//!
//! A [`WorkerPool`] runs `desired_count` sequential workers against one
//! durable queue. Each worker long-polls, processes its batch in order, and
//! owns the retry policy the queue itself does not have: once a message has
//! been delivered `max_delivery_count` times without success it is moved to
//! the dead-letter store.

mod consumer;
mod pool;
mod utilization;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ConfigError, ProcessingError};
use crate::message::QueueMessage;

pub use consumer::Disposition;
pub use pool::WorkerPool;
pub use utilization::UtilizationTracker;

/// Business logic run by a worker for every received message.
///
/// Handlers must be idempotent: a message can be delivered again after its
/// visibility timeout lapses.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &QueueMessage) -> Result<(), ProcessingError>;
}

/// Worker pool configuration (queue, batch size, retry budget).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub name: String,
    pub queue: String,
    /// Messages requested per receive, `1..=10`.
    pub batch_size: usize,
    pub long_poll_ms: u64,
    /// Per-message wall-clock limit, further capped by whatever is left of
    /// the message's lease. Batch members whose lease lapsed while earlier
    /// members ran are skipped and left to redelivery.
    pub processing_timeout_ms: u64,
    pub max_delivery_count: u32,
    /// Pause after a failed receive before polling again.
    pub receive_error_backoff_ms: u64,
    pub utilization_sample_interval_ms: u64,
    /// Weight of the newest sample in the smoothed utilization, `(0, 1]`.
    pub utilization_smoothing: f64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "order-workers".to_string(),
            queue: "orders".to_string(),
            batch_size: 5,
            long_poll_ms: 20_000,
            processing_timeout_ms: 25_000,
            max_delivery_count: 3,
            receive_error_backoff_ms: 1_000,
            utilization_sample_interval_ms: 1_000,
            utilization_smoothing: 0.3,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.queue.is_empty() {
            return Err(ConfigError::InvalidValue(
                "worker_pool.name and worker_pool.queue must not be empty".into(),
            ));
        }
        if !(1..=crate::broker::MAX_RECEIVE_BATCH).contains(&self.batch_size) {
            return Err(ConfigError::InvalidValue(format!(
                "worker_pool.batch_size must be between 1 and {}",
                crate::broker::MAX_RECEIVE_BATCH
            )));
        }
        if self.processing_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "worker_pool.processing_timeout_ms must be > 0".into(),
            ));
        }
        if self.max_delivery_count == 0 {
            return Err(ConfigError::InvalidValue(
                "worker_pool.max_delivery_count must be >= 1".into(),
            ));
        }
        if self.utilization_sample_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "worker_pool.utilization_sample_interval_ms must be > 0".into(),
            ));
        }
        if !(self.utilization_smoothing > 0.0 && self.utilization_smoothing <= 1.0) {
            return Err(ConfigError::InvalidValue(
                "worker_pool.utilization_smoothing must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = WorkerPoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_delivery_count, 3);
        assert_eq!(config.long_poll_ms, 20_000);
    }

    #[test]
    fn rejects_out_of_range_batch_size() {
        let config = WorkerPoolConfig {
            batch_size: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_delivery_budget() {
        let config = WorkerPoolConfig {
            max_delivery_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_parsing_partial_config() {
        let config: WorkerPoolConfig =
            toml::from_str("queue = \"invoices\"\nbatch_size = 2").unwrap();
        assert_eq!(config.queue, "invoices");
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.processing_timeout_ms, 25_000);
    }
}
