use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{ReplayError, StorageResult};
use crate::event::Event;
use crate::metrics::Metrics;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// Delivery or attempt budget exhausted on transient failures.
    MaxRetriesExceeded,
    /// The processor reported a permanent failure.
    ProcessingError,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::MaxRetriesExceeded => f.write_str("max_retries_exceeded"),
            DeadLetterReason::ProcessingError => f.write_str("processing_error"),
        }
    }
}

/// Which consumer path gave up on the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterSource {
    Queue { queue_id: String },
    Function { function: String },
    ObjectTrigger { pipeline: String },
}

impl DeadLetterSource {
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterSource::Queue { .. } => "queue",
            DeadLetterSource::Function { .. } => "function",
            DeadLetterSource::ObjectTrigger { .. } => "object_trigger",
        }
    }
}

impl fmt::Display for DeadLetterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterSource::Queue { queue_id } => write!(f, "queue:{queue_id}"),
            DeadLetterSource::Function { function } => write!(f, "function:{function}"),
            DeadLetterSource::ObjectTrigger { pipeline } => write!(f, "object_trigger:{pipeline}"),
        }
    }
}

/// The event as it was when the consumer gave up, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalMessage {
    pub event: Event,
    pub delivery_count: u32,
    pub first_received_at: Option<u64>,
    /// Receipt of the final delivery, for queue sources.
    pub receipt_handle: Option<String>,
}

impl OriginalMessage {
    pub fn new(event: Event, delivery_count: u32) -> Self {
        Self {
            event,
            delivery_count,
            first_received_at: None,
            receipt_handle: None,
        }
    }
}

/// Terminal record of an event no consumer could process. Never retried
/// automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub source: DeadLetterSource,
    pub original_message: OriginalMessage,
    pub reason: DeadLetterReason,
    pub error: String,
    /// Nanoseconds since the Unix epoch.
    pub moved_at: u64,
}

impl DeadLetterRecord {
    pub fn new(
        source: DeadLetterSource,
        original_message: OriginalMessage,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source,
            original_message,
            reason,
            error: error.into(),
            moved_at: crate::time::now_ns(),
        }
    }
}

/// Inspection and quarantine API over the `dead_letters` column family.
///
/// Queue messages are dead-lettered through the broker so removal from the
/// queue and the record write land in one batch; function and object-trigger
/// failures are recorded here directly.
#[derive(Clone)]
pub struct DeadLetterStore {
    storage: Arc<dyn Storage>,
    metrics: Arc<Metrics>,
}

impl DeadLetterStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_metrics(storage, Metrics::new())
    }

    pub fn with_metrics(storage: Arc<dyn Storage>, metrics: Metrics) -> Self {
        Self {
            storage,
            metrics: Arc::new(metrics),
        }
    }

    #[tracing::instrument(skip_all, fields(source = %source, %reason))]
    pub fn record(
        &self,
        source: DeadLetterSource,
        original_message: OriginalMessage,
        reason: DeadLetterReason,
        error: impl Into<String>,
    ) -> StorageResult<DeadLetterRecord> {
        let record = DeadLetterRecord::new(source, original_message, reason, error);
        self.storage.put_dead_letter(&record)?;
        self.metrics.record_dead_letter(record.source.kind());
        warn!(
            record_id = %record.id,
            event_id = %record.original_message.event.id,
            error = %record.error,
            "event moved to dead-letter store"
        );
        Ok(record)
    }

    pub fn list(&self) -> StorageResult<Vec<DeadLetterRecord>> {
        self.storage.list_dead_letters()
    }

    pub fn get(&self, id: &Uuid) -> StorageResult<Option<DeadLetterRecord>> {
        self.storage.get_dead_letter(id)
    }

    pub fn remove(&self, id: &Uuid) -> StorageResult<()> {
        self.storage.delete_dead_letter(id)
    }

    /// Re-enqueue a queue-sourced record to its original queue. The broker
    /// writes the new message and deletes the record atomically. Returns the
    /// new message id.
    #[tracing::instrument(skip(self, broker))]
    pub async fn replay_to_queue(&self, broker: &Broker, id: Uuid) -> Result<Uuid, ReplayError> {
        let message_id = broker.replay(id).await?;
        self.metrics.record_replay("queue");
        info!(%message_id, "dead-letter record replayed to queue");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RocksDbStorage;

    fn test_store() -> (DeadLetterStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
        (DeadLetterStore::new(storage), dir)
    }

    #[test]
    fn record_list_get_remove() {
        let (store, _dir) = test_store();
        let event = Event::new(b"order-1".to_vec());

        let record = store
            .record(
                DeadLetterSource::Function {
                    function: "process-order".to_string(),
                },
                OriginalMessage::new(event.clone(), 3),
                DeadLetterReason::MaxRetriesExceeded,
                "timed out",
            )
            .unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].original_message.event, event);
        assert_eq!(store.get(&record.id).unwrap(), Some(record.clone()));

        store.remove(&record.id).unwrap();
        assert!(store.get(&record.id).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn source_serializes_with_kind_tag() {
        let source = DeadLetterSource::ObjectTrigger {
            pipeline: "images".to_string(),
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["kind"], "object_trigger");
        assert_eq!(json["pipeline"], "images");
        assert_eq!(source.to_string(), "object_trigger:images");
    }

    #[test]
    fn records_metrics_by_source_kind() {
        let harness = crate::metrics::test_harness::MetricTestHarness::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
        let store = DeadLetterStore::with_metrics(storage, harness.metrics());

        store
            .record(
                DeadLetterSource::ObjectTrigger {
                    pipeline: "images".to_string(),
                },
                OriginalMessage::new(Event::new(vec![]), 1),
                DeadLetterReason::ProcessingError,
                "corrupt",
            )
            .unwrap();

        harness.assert_counter(
            "conveyor.dead_letter.recorded",
            &[("source", "object_trigger")],
            1,
        );
    }
}
