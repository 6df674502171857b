use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{ObjectCreatedNotification, ObjectProcessor, ObjectStore};
use crate::dead_letter::{DeadLetterReason, DeadLetterSource, DeadLetterStore, OriginalMessage};
use crate::error::{ConfigError, ObjectStoreError, ProcessingError, TriggerError};
use crate::event::Event;
use crate::metrics::Metrics;
use crate::results::{ProcessingResult, PutOutcome, ResultStatus, ResultStore};
use crate::time::{now_ms, now_ns};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectTriggerConfig {
    pub name: String,
    /// Attempts per notification on transient failures.
    pub max_attempts: u32,
    /// Backoff after attempt n is `retry_delay_ms * 2^(n-1)`.
    pub retry_delay_ms: u64,
    /// Per-attempt deadline covering fetch and processing.
    pub timeout_ms: u64,
}

impl Default for ObjectTriggerConfig {
    fn default() -> Self {
        Self {
            name: "image-pipeline".to_string(),
            max_attempts: 3,
            retry_delay_ms: 200,
            timeout_ms: 30_000,
        }
    }
}

impl ObjectTriggerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "object_trigger.name must not be empty".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "object_trigger.max_attempts must be >= 1".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "object_trigger.timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(1u64 << exp))
    }
}

/// How a notification was settled. All three are success from the
/// caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// This call committed the result.
    Processed(ProcessingResult),
    /// A result already existed; nothing was fetched or processed.
    Duplicate(ProcessingResult),
    /// Processed, but a concurrent handler committed first. Holds the
    /// winning record.
    LostRace(ProcessingResult),
}

impl TriggerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerOutcome::Processed(_) => "processed",
            TriggerOutcome::Duplicate(_) => "duplicate",
            TriggerOutcome::LostRace(_) => "lost_race",
        }
    }

    /// The record stored for the key after this call.
    pub fn result(&self) -> &ProcessingResult {
        match self {
            TriggerOutcome::Processed(r)
            | TriggerOutcome::Duplicate(r)
            | TriggerOutcome::LostRace(r) => r,
        }
    }
}

/// Idempotent processing of object-created notifications, keyed by object
/// key. At most one result is ever committed per key.
pub struct ObjectTriggerPipeline {
    config: ObjectTriggerConfig,
    store: Arc<dyn ObjectStore>,
    processor: Arc<dyn ObjectProcessor>,
    results: ResultStore,
    dead_letters: DeadLetterStore,
    metrics: Metrics,
    warm: AtomicBool,
}

impl ObjectTriggerPipeline {
    pub fn new(
        config: ObjectTriggerConfig,
        store: Arc<dyn ObjectStore>,
        processor: Arc<dyn ObjectProcessor>,
        results: ResultStore,
        dead_letters: DeadLetterStore,
    ) -> Self {
        Self {
            config,
            store,
            processor,
            results,
            dead_letters,
            metrics: Metrics::new(),
            warm: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    #[tracing::instrument(
        skip_all,
        fields(pipeline = %self.config.name, bucket = %notification.bucket, key = %notification.object_key)
    )]
    pub async fn handle(
        &self,
        notification: &ObjectCreatedNotification,
    ) -> Result<TriggerOutcome, TriggerError> {
        let result = self.settle(notification).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(TriggerError::Rejected { .. }) => "rejected",
            Err(TriggerError::Quarantined { .. }) => "quarantined",
            Err(TriggerError::Storage(_)) => "storage_error",
        };
        self.metrics.record_trigger_outcome(&self.config.name, label);
        result
    }

    async fn settle(
        &self,
        notification: &ObjectCreatedNotification,
    ) -> Result<TriggerOutcome, TriggerError> {
        let key = notification.object_key.as_str();

        if let Some(existing) = self.results.get(key)? {
            // A committed failure answers every later delivery the same way.
            if existing.status == ResultStatus::Failure {
                debug!("failure already committed, rejecting again");
                return Err(rejected(&existing));
            }
            debug!("result already committed, skipping");
            return Ok(TriggerOutcome::Duplicate(existing));
        }

        let is_cold_start = !self.warm.swap(true, Ordering::SeqCst);
        if is_cold_start {
            info!("cold start");
        }

        let first_attempt_at = now_ns();
        let max_attempts = self.config.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(notification).await {
                Ok(mut data) => {
                    data.insert("is_cold_start".into(), Value::from(is_cold_start));
                    data.insert("timestamp".into(), Value::from(now_ms() / 1000));
                    return self.commit(ProcessingResult::success(key, data));
                }
                Err(ProcessingError::Permanent(reason)) => {
                    warn!(attempt, %reason, "object rejected");
                    return match self.commit(ProcessingResult::failure(key, reason.clone()))? {
                        TriggerOutcome::LostRace(existing)
                            if existing.status == ResultStatus::Success =>
                        {
                            Ok(TriggerOutcome::LostRace(existing))
                        }
                        TriggerOutcome::LostRace(existing) => Err(rejected(&existing)),
                        _ => Err(TriggerError::Rejected {
                            key: key.to_string(),
                            reason,
                        }),
                    };
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.config.backoff(attempt);
                        warn!(attempt, max_attempts, error = %e, ?delay, "attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // Transient failures exhausted the budget.
        let event = Event::new(notification.to_json())
            .with_attribute("bucket", notification.bucket.clone())
            .with_attribute("object_key", notification.object_key.clone());
        let original = OriginalMessage {
            event,
            delivery_count: max_attempts,
            first_received_at: Some(first_attempt_at),
            receipt_handle: None,
        };
        let record = self.dead_letters.record(
            DeadLetterSource::ObjectTrigger {
                pipeline: self.config.name.clone(),
            },
            original,
            DeadLetterReason::MaxRetriesExceeded,
            last_error.clone(),
        )?;
        Err(TriggerError::Quarantined {
            key: key.to_string(),
            record_id: record.id,
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        notification: &ObjectCreatedNotification,
    ) -> Result<Map<String, Value>, ProcessingError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let work = async {
            let bytes = self
                .store
                .get_object(&notification.bucket, &notification.object_key)
                .await
                .map_err(|e| match e {
                    ObjectStoreError::NotFound { .. } | ObjectStoreError::InvalidKey(_) => {
                        ProcessingError::permanent(e.to_string())
                    }
                    ObjectStoreError::Io(_) => ProcessingError::transient(e.to_string()),
                })?;
            self.processor
                .process(&notification.object_key, &bytes)
                .await
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::Timeout(timeout)),
        }
    }

    fn commit(&self, result: ProcessingResult) -> Result<TriggerOutcome, TriggerError> {
        match self.results.put_if_absent(&result)? {
            PutOutcome::Committed => {
                info!(status = %result.status, "result committed");
                Ok(TriggerOutcome::Processed(result))
            }
            PutOutcome::AlreadyExists { existing } => {
                info!("concurrent handler committed first, discarding local result");
                Ok(TriggerOutcome::LostRace(existing))
            }
        }
    }
}

fn rejected(failure: &ProcessingResult) -> TriggerError {
    TriggerError::Rejected {
        key: failure.key.clone(),
        reason: failure
            .data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("an earlier delivery failed")
            .to_string(),
    }
}
