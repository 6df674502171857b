use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::autoscale::ScalingConfig;
use crate::broker::SchedulerConfig;
use crate::error::ConfigError;
use crate::function::FunctionConfig;
use crate::queue::QueueConfig;
use crate::trigger::{ImageConfig, ObjectTriggerConfig};
use crate::worker::WorkerPoolConfig;

/// Top-level configuration, deserializable from TOML. Every section is
/// optional and falls back to its defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub queues: Vec<QueueConfig>,
    pub topic: TopicConfig,
    pub worker_pool: WorkerPoolConfig,
    pub autoscaling: ScalingConfig,
    pub function: FunctionConfig,
    pub object_trigger: ObjectTriggerConfig,
    pub image: ImageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// RocksDB directory. `CONVEYOR_DATA_DIR` overrides it.
    pub data_dir: String,
    /// Default `RUST_LOG` filter.
    pub log_level: String,
    /// Root of the local object store; buckets are its subdirectories.
    pub object_root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            log_level: "info".to_string(),
            object_root: "objects".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub name: String,
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: "orders".to_string(),
            subscriptions: vec![
                SubscriptionConfig::Queue {
                    queue: "orders".to_string(),
                },
                SubscriptionConfig::Function {
                    function: "order-processor".to_string(),
                },
            ],
        }
    }
}

/// A static topic subscription.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionConfig {
    Queue { queue: String },
    Function { function: String },
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            queues: vec![QueueConfig::new("orders")],
            topic: TopicConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            autoscaling: ScalingConfig::default(),
            function: FunctionConfig::default(),
            object_trigger: ObjectTriggerConfig::default(),
            image: ImageConfig::default(),
        }
    }
}

impl ConveyorConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Validate every section, then the references between them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.worker_pool.validate()?;
        self.autoscaling.validate()?;
        self.function.validate()?;
        self.object_trigger.validate()?;
        self.image.validate()?;

        let mut names = HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "queue {} declared twice",
                    queue.name
                )));
            }
        }

        if self.topic.name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "topic.name must not be empty".into(),
            ));
        }
        for subscription in &self.topic.subscriptions {
            match subscription {
                SubscriptionConfig::Queue { queue } if !names.contains(queue.as_str()) => {
                    return Err(ConfigError::InvalidValue(format!(
                        "topic subscription references unknown queue {queue}"
                    )));
                }
                SubscriptionConfig::Function { function } if *function != self.function.name => {
                    return Err(ConfigError::InvalidValue(format!(
                        "topic subscription references unknown function {function}"
                    )));
                }
                _ => {}
            }
        }

        let Some(pool_queue) = self.queue(&self.worker_pool.queue) else {
            return Err(ConfigError::InvalidValue(format!(
                "worker_pool.queue references unknown queue {}",
                self.worker_pool.queue
            )));
        };
        if self.worker_pool.processing_timeout_ms >= pool_queue.visibility_timeout_ms {
            return Err(ConfigError::InvalidValue(format!(
                "worker_pool.processing_timeout_ms ({}) must be below the visibility timeout of queue {} ({})",
                self.worker_pool.processing_timeout_ms,
                pool_queue.name,
                pool_queue.visibility_timeout_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ConveyorConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.data_dir, "data");
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[0].visibility_timeout_ms, 30_000);
        assert_eq!(config.queues[0].retention_ms, 345_600_000);
        assert_eq!(config.topic.subscriptions.len(), 2);
        assert_eq!(config.autoscaling.target_utilization_percent, 70.0);
        assert_eq!(config.function.reserved_concurrency, 10);
        assert_eq!(config.object_trigger.max_attempts, 3);
    }

    #[test]
    fn full_file() {
        let toml_str = r#"
            [server]
            data_dir = "/var/lib/conveyor"

            [[queues]]
            name = "orders"
            visibility_timeout_ms = 60000

            [[queues]]
            name = "audit"

            [topic]
            name = "order-events"

            [[topic.subscriptions]]
            type = "queue"
            queue = "orders"

            [[topic.subscriptions]]
            type = "queue"
            queue = "audit"

            [[topic.subscriptions]]
            type = "function"
            function = "fulfil"

            [worker_pool]
            queue = "orders"
            batch_size = 10
            max_delivery_count = 5

            [autoscaling]
            min_tasks = 2
            max_tasks = 8

            [function]
            name = "fulfil"
            reserved_concurrency = 4
        "#;
        let config = ConveyorConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.server.data_dir, "/var/lib/conveyor");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.queue("orders").unwrap().visibility_timeout_ms, 60_000);
        assert_eq!(config.queue("audit").unwrap().retention_ms, 345_600_000);
        assert_eq!(
            config.topic.subscriptions[2],
            SubscriptionConfig::Function {
                function: "fulfil".to_string()
            }
        );
        assert_eq!(config.worker_pool.batch_size, 10);
        assert_eq!(config.autoscaling.max_tasks, 8);
        assert_eq!(config.function.reserved_concurrency, 4);
    }

    #[test]
    fn dangling_subscription_is_rejected() {
        let toml_str = r#"
            [[topic.subscriptions]]
            type = "queue"
            queue = "missing"
        "#;
        let err = ConveyorConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("unknown queue missing"));
    }

    #[test]
    fn processing_timeout_must_fit_in_visibility_timeout() {
        let toml_str = r#"
            [worker_pool]
            processing_timeout_ms = 30000
        "#;
        assert!(matches!(
            ConveyorConfig::from_toml_str(toml_str),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn section_errors_surface() {
        assert!(ConveyorConfig::from_toml_str("[autoscaling]\nmin_tasks = 5\nmax_tasks = 2").is_err());
        assert!(matches!(
            ConveyorConfig::from_toml_str("[server\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ConveyorConfig::load("/nonexistent/conveyor.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
