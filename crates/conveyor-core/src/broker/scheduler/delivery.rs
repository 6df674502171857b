use super::*;

use crate::error::StorageResult;
use crate::message::{ReceiptHandle, StoredMessage};
use crate::time::{ms_to_ns, now_ns};

impl Scheduler {
    /// Lease up to `max` visible messages from the front of the queue.
    ///
    /// Messages past retention are dropped on the way. A storage failure stops
    /// the batch early and leaves the failing message visible.
    pub(super) fn deliver(&mut self, queue_id: &str, max: usize) -> Vec<QueueMessage> {
        let Some(config) = self.queues.get(queue_id).cloned() else {
            return Vec::new();
        };

        let now = now_ns();
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            let Some(msg_id) = self.pending.get_mut(queue_id).and_then(|p| p.pop_front()) else {
                break;
            };

            match self.lease_message(&config, msg_id, now) {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, %queue_id, %msg_id, "failed to lease message");
                    if let Some(p) = self.pending.get_mut(queue_id) {
                        p.push_front(msg_id);
                    }
                    break;
                }
            }
        }

        if !batch.is_empty() {
            self.metrics.record_receive(queue_id, batch.len() as u64);
        }
        batch
    }

    /// Persist a new lease for one message. Returns `None` if the message is
    /// gone or was dropped for exceeding retention.
    fn lease_message(
        &mut self,
        config: &QueueConfig,
        msg_id: Uuid,
        now: u64,
    ) -> StorageResult<Option<QueueMessage>> {
        let queue_id = config.name.as_str();
        let msg_key = keys::message_key(queue_id, &msg_id);
        let Some(mut message) = self.storage.get_message(&msg_key)? else {
            debug!(%queue_id, %msg_id, "pending entry without message, skipping");
            return Ok(None);
        };

        if Self::past_retention(&message, config, now) {
            self.drop_expired(&message)?;
            return Ok(None);
        }

        message.delivery_count += 1;
        let first_received_at = *message.first_received_at.get_or_insert(now);
        let expiry_ns = now.saturating_add(ms_to_ns(config.visibility_timeout_ms));

        self.storage.write_batch(vec![
            WriteBatchOp::PutMessage {
                key: msg_key,
                value: serde_json::to_vec(&message)?,
            },
            WriteBatchOp::PutLease {
                key: keys::lease_key(queue_id, &msg_id),
                value: keys::lease_value(message.delivery_count, expiry_ns),
            },
            WriteBatchOp::PutLeaseExpiry {
                key: keys::lease_expiry_key(expiry_ns, queue_id, &msg_id),
            },
        ])?;

        self.leased.insert(
            msg_id,
            LeaseEntry {
                queue_id: queue_id.to_string(),
                expiry_ns,
            },
        );

        Ok(Some(QueueMessage {
            message_id: msg_id,
            queue_id: queue_id.to_string(),
            receipt_handle: ReceiptHandle::new(queue_id, msg_id, message.delivery_count),
            delivery_count: message.delivery_count,
            first_received_at,
            visible_after: expiry_ns,
            event: message.event,
        }))
    }

    pub(super) fn past_retention(message: &StoredMessage, config: &QueueConfig, now: u64) -> bool {
        now.saturating_sub(message.enqueued_at) > ms_to_ns(config.retention_ms)
    }

    /// Delete a message that outlived its queue's retention period, whether
    /// or not it is in flight.
    pub(super) fn drop_expired(&mut self, message: &StoredMessage) -> StorageResult<()> {
        let ops = self.delete_message_ops(&message.queue_id, &message.id);
        self.storage.write_batch(ops)?;
        self.leased.remove(&message.id);
        self.pending_remove(&message.queue_id, &message.id);

        self.metrics.record_expired(&message.queue_id);
        warn!(
            queue_id = %message.queue_id,
            msg_id = %message.id,
            delivery_count = message.delivery_count,
            "message exceeded retention and was dropped"
        );
        Ok(())
    }

    /// Reply to a receiver. If it went away in the meantime, the batch is put
    /// back as though it had never been received.
    pub(super) fn send_batch(&mut self, reply: ReceiveReply, batch: Vec<QueueMessage>) {
        if let Err(Ok(unsent)) = reply.send(Ok(batch)) {
            if !unsent.is_empty() {
                debug!(count = unsent.len(), "receiver dropped, releasing leases");
                self.release(unsent);
            }
        }
    }

    /// Undo the leases of a batch that was never handed out.
    fn release(&mut self, batch: Vec<QueueMessage>) {
        for delivered in batch.into_iter().rev() {
            let queue_id = delivered.queue_id.as_str();
            let msg_id = delivered.message_id;
            let msg_key = keys::message_key(queue_id, &msg_id);

            let result = (|| -> StorageResult<()> {
                let Some(mut message) = self.storage.get_message(&msg_key)? else {
                    return Ok(());
                };
                message.delivery_count = message.delivery_count.saturating_sub(1);
                if message.delivery_count == 0 {
                    message.first_received_at = None;
                }
                self.storage.write_batch(vec![
                    WriteBatchOp::PutMessage {
                        key: msg_key.clone(),
                        value: serde_json::to_vec(&message)?,
                    },
                    WriteBatchOp::DeleteLease {
                        key: keys::lease_key(queue_id, &msg_id),
                    },
                    WriteBatchOp::DeleteLeaseExpiry {
                        key: keys::lease_expiry_key(delivered.visible_after, queue_id, &msg_id),
                    },
                ])
            })();

            match result {
                Ok(()) => {
                    self.leased.remove(&msg_id);
                    self.pending
                        .entry(queue_id.to_string())
                        .or_default()
                        .push_front(msg_id);
                }
                // The lease stays; the message reappears when it expires.
                Err(e) => warn!(error = %e, %queue_id, %msg_id, "failed to release lease"),
            }
        }
    }

    /// Hand visible messages to parked receivers, oldest waiter first.
    pub(super) fn serve_waiters(&mut self, queue_id: &str) {
        loop {
            let has_pending = self.pending.get(queue_id).is_some_and(|p| !p.is_empty());
            if !has_pending {
                break;
            }
            let Some(waiter) = self.waiters.get_mut(queue_id).and_then(|w| w.pop_front()) else {
                break;
            };
            if waiter.reply.is_closed() {
                continue;
            }

            let batch = self.deliver(queue_id, waiter.max_messages);
            if batch.is_empty() {
                // Everything pending was expired or unreadable; keep waiting.
                if let Some(w) = self.waiters.get_mut(queue_id) {
                    w.push_front(waiter);
                }
                break;
            }
            self.send_batch(waiter.reply, batch);
        }
    }

    /// Answer every long poll whose wait has elapsed with an empty batch.
    pub(super) fn expire_waiters(&mut self, now: Instant) {
        for waiters in self.waiters.values_mut() {
            let mut kept = VecDeque::with_capacity(waiters.len());
            for waiter in waiters.drain(..) {
                if waiter.deadline <= now || waiter.reply.is_closed() {
                    let _ = waiter.reply.send(Ok(Vec::new()));
                } else {
                    kept.push_back(waiter);
                }
            }
            *waiters = kept;
        }
    }

    /// On shutdown, parked receivers get an empty batch instead of an error.
    pub(super) fn release_all_waiters(&mut self) {
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.reply.send(Ok(Vec::new()));
            }
        }
    }
}
