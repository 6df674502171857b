use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{MessageHandler, WorkerPoolConfig};
use crate::broker::Broker;
use crate::dead_letter::DeadLetterReason;
use crate::error::ProcessingError;
use crate::message::QueueMessage;
use crate::metrics::Metrics;
use crate::time::now_ns;

/// What a worker did with one received message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Acknowledged,
    /// Left unacknowledged; it becomes visible again when its lease expires.
    Released { error: String },
    DeadLettered {
        record_id: Uuid,
        reason: DeadLetterReason,
    },
    /// The broker refused the ack or dead-letter, usually because the lease
    /// lapsed and another worker now owns the message.
    Abandoned { error: String },
    /// The lease ran out before the handler was started. The message is
    /// already visible to other receivers, so it is left alone.
    LeaseExpired,
}

impl Disposition {
    fn label(&self) -> &'static str {
        match self {
            Disposition::Acknowledged => "acknowledged",
            Disposition::Released { .. } => "released",
            Disposition::DeadLettered { .. } => "dead_lettered",
            Disposition::Abandoned { .. } => "abandoned",
            Disposition::LeaseExpired => "lease_expired",
        }
    }
}

/// One sequential consumer. Never processes two messages at once.
pub(super) struct Worker {
    pub(super) id: usize,
    pub(super) broker: Arc<Broker>,
    pub(super) handler: Arc<dyn MessageHandler>,
    pub(super) config: Arc<WorkerPoolConfig>,
    /// Workers currently processing a batch, shared pool-wide.
    pub(super) busy: Arc<AtomicUsize>,
    pub(super) metrics: Metrics,
}

impl Worker {
    /// Poll-process loop. Returns when `stop` flips to true; a batch already
    /// received is always finished first.
    pub(super) async fn run(self, mut stop: watch::Receiver<bool>) {
        let pool = self.config.name.as_str();
        let queue = self.config.queue.as_str();
        let long_poll = Duration::from_millis(self.config.long_poll_ms);
        let backoff = Duration::from_millis(self.config.receive_error_backoff_ms);
        debug!(pool, worker = self.id, "worker started");

        loop {
            if *stop.borrow() {
                break;
            }

            let received = tokio::select! {
                res = self.broker.receive(queue, self.config.batch_size, Some(long_poll)) => res,
                _ = stop.changed() => break,
            };

            let batch = match received {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(pool, worker = self.id, error = %e, "receive failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop.changed() => break,
                    }
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            let _busy = BusyGuard::enter(&self.busy);
            for message in batch {
                self.process(message).await;
            }
        }

        debug!(pool, worker = self.id, "worker stopped");
    }

    #[tracing::instrument(
        skip_all,
        fields(worker = self.id, msg_id = %message.message_id, delivery = message.delivery_count)
    )]
    pub(super) async fn process(&self, message: QueueMessage) -> Disposition {
        let max = self.config.max_delivery_count;

        // Later messages of a batch wait for the earlier ones; their lease
        // may be gone by the time they come up.
        let lease_left = Duration::from_nanos(message.visible_after.saturating_sub(now_ns()));
        let disposition = if lease_left.is_zero() {
            debug!("lease lapsed before processing, skipping");
            Disposition::LeaseExpired
        } else if message.delivery_count > max {
            // Already over budget, e.g. the worker died mid-processing last time.
            self.quarantine(
                &message,
                DeadLetterReason::MaxRetriesExceeded,
                format!(
                    "delivered {} times, budget is {max}",
                    message.delivery_count
                ),
            )
            .await
        } else {
            let timeout = Duration::from_millis(self.config.processing_timeout_ms).min(lease_left);
            let outcome = match tokio::time::timeout(timeout, self.handler.handle(&message)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProcessingError::Timeout(timeout)),
            };

            match outcome {
                Ok(()) => match self.broker.acknowledge(&message.receipt_handle).await {
                    Ok(()) => Disposition::Acknowledged,
                    Err(e) => Disposition::Abandoned {
                        error: e.to_string(),
                    },
                },
                Err(e @ ProcessingError::Permanent(_)) => {
                    self.quarantine(&message, DeadLetterReason::ProcessingError, e.to_string())
                        .await
                }
                Err(e) if message.delivery_count >= max => {
                    self.quarantine(&message, DeadLetterReason::MaxRetriesExceeded, e.to_string())
                        .await
                }
                Err(e) => {
                    info!(error = %e, "processing failed, leaving message for redelivery");
                    Disposition::Released {
                        error: e.to_string(),
                    }
                }
            }
        };

        if let Disposition::Abandoned { error } = &disposition {
            warn!(%error, "broker rejected the message outcome");
        }
        self.metrics
            .record_worker_outcome(&self.config.queue, disposition.label());
        disposition
    }

    async fn quarantine(
        &self,
        message: &QueueMessage,
        reason: DeadLetterReason,
        error: String,
    ) -> Disposition {
        match self
            .broker
            .dead_letter(&message.receipt_handle, reason, error)
            .await
        {
            Ok(record_id) => Disposition::DeadLettered { record_id, reason },
            Err(e) => Disposition::Abandoned {
                error: e.to_string(),
            },
        }
    }
}

/// Marks the worker busy for one batch; released on drop, also when the
/// handler panics.
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(busy: &'a AtomicUsize) -> Self {
        busy.fetch_add(1, Ordering::SeqCst);
        Self(busy)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
