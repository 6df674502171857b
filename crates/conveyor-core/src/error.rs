use std::time::Duration;

/// Low-level storage errors (RocksDB, serialization).
/// This is the error type for the `Storage` trait; storage operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors talking to the scheduler thread. Every async broker operation
/// embeds this via `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("scheduler command channel full")]
    ChannelFull,

    #[error("scheduler command channel disconnected")]
    ChannelDisconnected,

    #[error("scheduler dropped the reply channel")]
    ReplyDropped,

    #[error("failed to spawn scheduler thread: {0}")]
    SchedulerSpawn(String),

    #[error("scheduler thread panicked")]
    SchedulerPanicked,
}

// --- Per-operation error types ---

#[derive(Debug, thiserror::Error)]
pub enum CreateQueueError {
    #[error("queue already exists: {0}")]
    QueueAlreadyExists(String),

    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("receipt not found: {0}")]
    ReceiptNotFound(String),

    /// The message was redelivered after this receipt was issued; the newer
    /// receiver owns it now.
    #[error("stale receipt: {0}")]
    StaleReceipt(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("receipt not found: {0}")]
    ReceiptNotFound(String),

    #[error("stale receipt: {0}")]
    StaleReceipt(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum ListQueuesError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("failed to read configuration: {0}")]
    Io(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Failure returned by a processing function (worker handler, function
/// handler, object processor).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessingError {
    /// Worth retrying: redelivery or another attempt may succeed.
    #[error("transient processing error: {0}")]
    Transient(String),

    /// Retrying cannot help (malformed input, missing object).
    #[error("permanent processing error: {0}")]
    Permanent(String),

    #[error("processing timed out after {0:?}")]
    Timeout(Duration),
}

impl ProcessingError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ProcessingError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ProcessingError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProcessingError::Permanent(_))
    }
}

/// Errors dispatching work to the bounded function executor.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The reserved concurrency is in use and the wait backlog is full.
    #[error("function {function} throttled: {active} active of {limit} reserved, {queued} queued")]
    Throttled {
        function: String,
        active: usize,
        limit: usize,
        queued: usize,
    },

    #[error("function {0} is shut down")]
    ShutDown(String),
}

/// Errors delivering a published event to one subscriber.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object store io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(err: std::io::Error) -> Self {
        ObjectStoreError::Io(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("malformed notification: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Malformed(err.to_string())
    }
}

/// Terminal errors for a single object-created notification.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Processing cannot succeed for this object; a `Failure` result was
    /// committed so duplicates short-circuit.
    #[error("object {key} rejected: {reason}")]
    Rejected { key: String, reason: String },

    /// Transient failures exhausted the retry budget; the notification was
    /// moved to the dead-letter store.
    #[error("object {key} quarantined as {record_id} after {attempts} attempts: {last_error}")]
    Quarantined {
        key: String,
        record_id: uuid::Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("dead-letter record not found: {0}")]
    RecordNotFound(uuid::Uuid),

    #[error("cannot replay record {id}: {reason}")]
    Unsupported { id: uuid::Uuid, reason: String },

    #[error("replay payload is not a valid notification: {0}")]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from one autoscaler evaluation. None of them change the pool state.
#[derive(Debug, thiserror::Error)]
pub enum ScalingError {
    #[error("no utilization samples available yet")]
    NoSamples,

    #[error("invalid utilization sample: {0}")]
    InvalidSample(f64),

    #[error("desired count receiver closed")]
    ReceiverClosed,
}

/// Errors bringing up the pipeline runtime.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    CreateQueue(#[from] CreateQueueError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
