use super::*;

use std::collections::BTreeSet;

use crate::time::now_ns;

impl Scheduler {
    /// Scan the `lease_expiry` CF for expired leases and reclaim them.
    ///
    /// For each expired lease:
    /// 1. Delete the lease and lease_expiry entries
    /// 2. Put the message back at the tail of its queue's visible list
    ///
    /// `delivery_count` is left alone; the next receive increments it.
    /// Returns the number of leases reclaimed.
    pub(super) fn reclaim_expired_leases(&mut self) -> u64 {
        let expired_keys = match self
            .storage
            .list_expired_leases(&keys::lease_expiry_upper_bound(now_ns()))
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to scan expired leases");
                return 0;
            }
        };

        let mut reclaimed = 0u64;
        let mut touched = BTreeSet::new();
        for expiry_key in expired_keys {
            let Some((queue_id, msg_id)) = keys::parse_lease_expiry_key(&expiry_key) else {
                warn!("corrupt lease_expiry key, skipping");
                continue;
            };

            let message_exists = match self
                .storage
                .get_message(&keys::message_key(&queue_id, &msg_id))
            {
                Ok(found) => found.is_some(),
                Err(e) => {
                    warn!(error = %e, %queue_id, %msg_id, "failed to read message for expired lease");
                    continue;
                }
            };

            if let Err(e) = self.storage.write_batch(vec![
                WriteBatchOp::DeleteLease {
                    key: keys::lease_key(&queue_id, &msg_id),
                },
                WriteBatchOp::DeleteLeaseExpiry { key: expiry_key },
            ]) {
                warn!(error = %e, %queue_id, %msg_id, "failed to reclaim expired lease");
                continue;
            }
            self.leased.remove(&msg_id);
            reclaimed += 1;

            if !message_exists {
                warn!(%queue_id, %msg_id, "orphaned lease_expiry entry, message not found");
                continue;
            }

            self.pending_push_back(&queue_id, msg_id);
            self.metrics.record_redelivery(&queue_id);
            debug!(%queue_id, %msg_id, "reclaimed expired lease");
            touched.insert(queue_id);
        }

        if reclaimed > 0 {
            info!(reclaimed, "reclaimed expired leases");
        }
        for queue_id in touched {
            self.serve_waiters(&queue_id);
        }
        reclaimed
    }

    /// Drop every message older than its queue's retention period.
    /// Returns the number of messages dropped.
    pub(super) fn sweep_retention(&mut self) -> u64 {
        let now = now_ns();
        let configs: Vec<QueueConfig> = self.queues.values().cloned().collect();

        let mut dropped = 0u64;
        for config in &configs {
            let messages = match self.storage.list_messages(&keys::message_prefix(&config.name)) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(queue = %config.name, error = %e, "failed to scan messages for retention");
                    continue;
                }
            };

            // Keys are in enqueue order, so the first young message ends the scan.
            for (_, message) in messages {
                if !Self::past_retention(&message, config, now) {
                    break;
                }
                match self.drop_expired(&message) {
                    Ok(()) => dropped += 1,
                    Err(e) => {
                        warn!(queue = %config.name, msg_id = %message.id, error = %e, "failed to drop expired message")
                    }
                }
            }
        }

        if dropped > 0 {
            info!(dropped, "retention sweep dropped messages");
        }
        dropped
    }

    /// Recover state after a crash or restart.
    ///
    /// RocksDB persists all data to disk, so queue definitions, messages, and
    /// leases survive restarts. Recovery does two things:
    /// 1. Reclaim expired leases so messages become visible again
    /// 2. Rebuild the visible and in-flight indexes by scanning the messages CF
    pub(super) fn recover(&mut self) {
        self.queues.clear();
        match self.storage.list_queues() {
            Ok(queues) => {
                for queue in queues {
                    self.queues.insert(queue.name.clone(), queue);
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to list queues during recovery");
                return;
            }
        }

        self.reclaim_expired_leases();

        // The full scan below rebuilds these from scratch
        self.pending.clear();
        self.leased.clear();

        let names: Vec<String> = self.queues.keys().cloned().collect();
        let mut message_count = 0usize;
        for name in &names {
            self.pending.entry(name.clone()).or_default();
            let messages = match self.storage.list_messages(&keys::message_prefix(name)) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(queue = %name, error = %e, "failed to scan messages during recovery");
                    continue;
                }
            };

            for (_, msg) in messages {
                message_count += 1;
                let lease = self
                    .storage
                    .get_lease(&keys::lease_key(name, &msg.id))
                    .ok()
                    .flatten()
                    .and_then(|value| keys::parse_lease_value(&value));

                match lease {
                    Some((_, expiry_ns)) => {
                        self.leased.insert(
                            msg.id,
                            LeaseEntry {
                                queue_id: name.clone(),
                                expiry_ns,
                            },
                        );
                    }
                    None => self.pending_push_back(name, msg.id),
                }
            }
        }

        info!(
            queue_count = names.len(),
            message_count, "recovery: queues and messages restored"
        );
    }
}
