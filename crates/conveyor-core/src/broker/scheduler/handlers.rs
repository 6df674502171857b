use super::*;

use crate::broker::stats::QueueStats;
use crate::broker::MAX_RECEIVE_BATCH;
use crate::dead_letter::{
    DeadLetterReason, DeadLetterRecord, DeadLetterSource, OriginalMessage,
};
use crate::error::{
    AckError, CreateQueueError, DeadLetterError, EnqueueError, ListQueuesError, ReplayError,
    StatsError, StorageError,
};
use crate::message::{ReceiptHandle, StoredMessage};

/// Why a receipt handle could not be honored.
pub(super) enum ReceiptFault {
    NotFound(String),
    Stale(String),
    Storage(StorageError),
}

impl From<StorageError> for ReceiptFault {
    fn from(err: StorageError) -> Self {
        ReceiptFault::Storage(err)
    }
}

impl From<ReceiptFault> for AckError {
    fn from(fault: ReceiptFault) -> Self {
        match fault {
            ReceiptFault::NotFound(msg) => AckError::ReceiptNotFound(msg),
            ReceiptFault::Stale(msg) => AckError::StaleReceipt(msg),
            ReceiptFault::Storage(e) => AckError::Storage(e),
        }
    }
}

impl From<ReceiptFault> for DeadLetterError {
    fn from(fault: ReceiptFault) -> Self {
        match fault {
            ReceiptFault::NotFound(msg) => DeadLetterError::ReceiptNotFound(msg),
            ReceiptFault::Stale(msg) => DeadLetterError::StaleReceipt(msg),
            ReceiptFault::Storage(e) => DeadLetterError::Storage(e),
        }
    }
}

impl Scheduler {
    pub(super) fn handle_create_queue(
        &mut self,
        config: QueueConfig,
    ) -> Result<String, CreateQueueError> {
        config
            .validate()
            .map_err(|e| CreateQueueError::InvalidConfig(e.to_string()))?;

        // Check-then-put is safe: the scheduler is single-threaded, so no
        // concurrent command can create the same queue in between.
        if self.queues.contains_key(&config.name) || self.storage.get_queue(&config.name)?.is_some()
        {
            return Err(CreateQueueError::QueueAlreadyExists(config.name));
        }

        self.storage.put_queue(&config.name, &config)?;
        let name = config.name.clone();
        self.queues.insert(name.clone(), config);
        self.pending.entry(name.clone()).or_default();
        Ok(name)
    }

    pub(super) fn handle_enqueue(&mut self, message: StoredMessage) -> Result<Uuid, EnqueueError> {
        if !self.queues.contains_key(&message.queue_id) {
            return Err(EnqueueError::QueueNotFound(message.queue_id));
        }

        let msg_id = message.id;
        let key = keys::message_key(&message.queue_id, &msg_id);
        self.storage.put_message(&key, &message)?;

        self.metrics.record_enqueue(&message.queue_id);
        self.pending_push_back(&message.queue_id, msg_id);

        Ok(msg_id)
    }

    pub(super) fn handle_receive(
        &mut self,
        queue_id: &str,
        max_messages: usize,
        wait: Option<Duration>,
        reply: ReceiveReply,
    ) {
        if !(1..=MAX_RECEIVE_BATCH).contains(&max_messages) {
            let _ = reply.send(Err(ReceiveError::InvalidArgument(format!(
                "max_messages must be between 1 and {MAX_RECEIVE_BATCH}, got {max_messages}"
            ))));
            return;
        }
        let Some(config) = self.queues.get(queue_id) else {
            let _ = reply.send(Err(ReceiveError::QueueNotFound(queue_id.to_string())));
            return;
        };
        let wait = wait.unwrap_or(Duration::from_millis(config.receive_wait_ms));

        let batch = self.deliver(queue_id, max_messages);
        if !batch.is_empty() || wait.is_zero() {
            self.send_batch(reply, batch);
            return;
        }

        debug!(%queue_id, wait_ms = wait.as_millis() as u64, "no visible messages, parking receiver");
        self.waiters
            .entry(queue_id.to_string())
            .or_default()
            .push_back(Waiter {
                max_messages,
                deadline: Instant::now() + wait,
                reply,
            });
    }

    /// Find the message a receipt refers to and check that the receipt is
    /// from its latest delivery.
    ///
    /// A receipt whose visibility timeout lapsed is still honored as long as
    /// nobody has received the message since.
    pub(super) fn resolve_receipt(
        &self,
        receipt: &ReceiptHandle,
    ) -> Result<StoredMessage, ReceiptFault> {
        let queue_id = receipt.queue_id();
        let msg_id = receipt.msg_id();

        let message = self
            .storage
            .get_message(&keys::message_key(queue_id, &msg_id))?
            .ok_or_else(|| {
                ReceiptFault::NotFound(format!("message {msg_id} not found in queue {queue_id}"))
            })?;

        let current_delivery = match self.storage.get_lease(&keys::lease_key(queue_id, &msg_id))? {
            Some(value) => {
                let (delivery, _) = keys::parse_lease_value(&value).ok_or_else(|| {
                    StorageError::CorruptData(format!(
                        "lease value for message {msg_id} in queue {queue_id}"
                    ))
                })?;
                delivery
            }
            None => message.delivery_count,
        };

        if receipt.delivery() == 0 || receipt.delivery() > current_delivery {
            return Err(ReceiptFault::NotFound(format!(
                "no delivery {} for message {msg_id} in queue {queue_id}",
                receipt.delivery()
            )));
        }
        if receipt.delivery() < current_delivery {
            return Err(ReceiptFault::Stale(format!(
                "receipt is for delivery {} but message {msg_id} is on delivery {current_delivery}",
                receipt.delivery()
            )));
        }
        Ok(message)
    }

    /// Remove a message that a receipt resolved to from the in-memory indexes
    /// once the storage batch deleting it has been written.
    fn forget_message(&mut self, queue_id: &str, msg_id: &Uuid) {
        if self.leased.remove(msg_id).is_none() {
            self.pending_remove(queue_id, msg_id);
        }
    }

    pub(super) fn handle_ack(&mut self, receipt: &ReceiptHandle) -> Result<(), AckError> {
        let message = self.resolve_receipt(receipt)?;
        let queue_id = receipt.queue_id();

        let ops = self.delete_message_ops(queue_id, &message.id);
        self.storage.write_batch(ops)?;
        self.forget_message(queue_id, &message.id);

        self.metrics.record_ack(queue_id);
        Ok(())
    }

    pub(super) fn handle_dead_letter(
        &mut self,
        receipt: &ReceiptHandle,
        reason: DeadLetterReason,
        error: String,
    ) -> Result<Uuid, DeadLetterError> {
        let message = self.resolve_receipt(receipt)?;
        let queue_id = receipt.queue_id();

        let record = DeadLetterRecord::new(
            DeadLetterSource::Queue {
                queue_id: queue_id.to_string(),
            },
            OriginalMessage {
                event: message.event,
                delivery_count: message.delivery_count,
                first_received_at: message.first_received_at,
                receipt_handle: Some(receipt.to_string()),
            },
            reason,
            error,
        );

        // Message, lease and record move in one batch so the message is
        // never in both places or neither.
        let mut ops = self.delete_message_ops(queue_id, &message.id);
        ops.push(WriteBatchOp::PutDeadLetter {
            key: keys::dead_letter_key(&record.id),
            value: serde_json::to_vec(&record).map_err(StorageError::from)?,
        });
        self.storage.write_batch(ops)?;
        self.forget_message(queue_id, &message.id);

        self.metrics.record_queue_dead_letter(queue_id);
        self.metrics.record_dead_letter(record.source.kind());
        warn!(
            %queue_id,
            msg_id = %message.id,
            record_id = %record.id,
            delivery_count = record.original_message.delivery_count,
            %reason,
            error = %record.error,
            "message moved to dead-letter store"
        );
        Ok(record.id)
    }

    pub(super) fn handle_replay(&mut self, record_id: Uuid) -> Result<Uuid, ReplayError> {
        let record = self
            .storage
            .get_dead_letter(&record_id)?
            .ok_or(ReplayError::RecordNotFound(record_id))?;

        let DeadLetterSource::Queue { queue_id } = &record.source else {
            return Err(ReplayError::Unsupported {
                id: record_id,
                reason: format!("record came from {}, not a queue", record.source),
            });
        };
        if !self.queues.contains_key(queue_id) {
            return Err(EnqueueError::QueueNotFound(queue_id.clone()).into());
        }

        let message = StoredMessage::new(
            queue_id.clone(),
            record.original_message.event.clone(),
            crate::time::now_ns(),
        );
        let msg_id = message.id;
        self.storage.write_batch(vec![
            WriteBatchOp::PutMessage {
                key: keys::message_key(queue_id, &msg_id),
                value: serde_json::to_vec(&message).map_err(StorageError::from)?,
            },
            WriteBatchOp::DeleteDeadLetter {
                key: keys::dead_letter_key(&record_id),
            },
        ])?;

        self.metrics.record_enqueue(queue_id);
        self.metrics.record_replay(record.source.kind());
        self.pending_push_back(queue_id, msg_id);
        info!(%record_id, %queue_id, %msg_id, "dead-letter record replayed");

        self.serve_waiters(queue_id);
        Ok(msg_id)
    }

    fn queue_stats(&self, config: &QueueConfig) -> QueueStats {
        let queue_id = config.name.as_str();
        QueueStats {
            queue_id: queue_id.to_string(),
            depth: self.pending.get(queue_id).map_or(0, |p| p.len() as u64),
            in_flight: self
                .leased
                .values()
                .filter(|l| l.queue_id == queue_id)
                .count() as u64,
            waiting_receivers: self.waiters.get(queue_id).map_or(0, |w| w.len() as u64),
            visibility_timeout_ms: config.visibility_timeout_ms,
            retention_ms: config.retention_ms,
        }
    }

    pub(super) fn handle_get_stats(&self, queue_id: &str) -> Result<QueueStats, StatsError> {
        let config = self
            .queues
            .get(queue_id)
            .ok_or_else(|| StatsError::QueueNotFound(queue_id.to_string()))?;
        Ok(self.queue_stats(config))
    }

    pub(super) fn handle_list_queues(&self) -> Result<Vec<QueueStats>, ListQueuesError> {
        let mut stats: Vec<QueueStats> =
            self.queues.values().map(|c| self.queue_stats(c)).collect();
        stats.sort_by(|a, b| a.queue_id.cmp(&b.queue_id));
        Ok(stats)
    }
}
