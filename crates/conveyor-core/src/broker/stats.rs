use serde::Serialize;

use crate::error::StorageResult;
use crate::queue::QueueConfig;
use crate::storage::{keys, Storage};
use crate::time::now_ns;

/// Point-in-time view of one queue, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue_id: String,
    /// Visible messages waiting for a receiver.
    pub depth: u64,
    /// Received messages whose visibility timeout has not lapsed.
    pub in_flight: u64,
    /// Receivers parked in a long poll.
    pub waiting_receivers: u64,
    pub visibility_timeout_ms: u64,
    pub retention_ms: u64,
}

impl QueueStats {
    /// Count a queue's messages straight from storage, without starting a
    /// scheduler and without writing anything.
    ///
    /// A lease past its expiry counts as visible, since the next recovery
    /// reclaims it. Nobody long-polls a stopped broker, so
    /// `waiting_receivers` is always zero.
    pub fn read_from_storage(storage: &dyn Storage, config: &QueueConfig) -> StorageResult<Self> {
        let queue_id = config.name.as_str();
        let now = now_ns();
        let mut depth = 0;
        let mut in_flight = 0;

        for (_, message) in storage.list_messages(&keys::message_prefix(queue_id))? {
            let lease = storage.get_lease(&keys::lease_key(queue_id, &message.id))?;
            match lease.as_deref().and_then(keys::parse_lease_value) {
                Some((_, expiry_ns)) if expiry_ns > now => in_flight += 1,
                _ => depth += 1,
            }
        }

        Ok(Self {
            queue_id: queue_id.to_string(),
            depth,
            in_flight,
            waiting_receivers: 0,
            visibility_timeout_ms: config.visibility_timeout_ms,
            retention_ms: config.retention_ms,
        })
    }

    /// [`QueueStats::read_from_storage`] for every declared queue, by name.
    pub fn read_all_from_storage(storage: &dyn Storage) -> StorageResult<Vec<Self>> {
        let mut queues = storage.list_queues()?;
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
            .iter()
            .map(|config| Self::read_from_storage(storage, config))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::message::StoredMessage;
    use crate::storage::{RocksDbStorage, WriteBatchOp};

    fn store_message(storage: &dyn Storage, queue_id: &str) -> StoredMessage {
        let message = StoredMessage::new(queue_id, Event::new("o"), now_ns());
        storage
            .put_message(&keys::message_key(queue_id, &message.id), &message)
            .unwrap();
        message
    }

    fn lease(storage: &dyn Storage, queue_id: &str, message: &StoredMessage, expiry_ns: u64) {
        storage
            .write_batch(vec![
                WriteBatchOp::PutLease {
                    key: keys::lease_key(queue_id, &message.id),
                    value: keys::lease_value(1, expiry_ns),
                },
                WriteBatchOp::PutLeaseExpiry {
                    key: keys::lease_expiry_key(expiry_ns, queue_id, &message.id),
                },
            ])
            .unwrap();
    }

    #[test]
    fn offline_stats_split_visible_and_leased_without_reclaiming() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let config = QueueConfig::new("orders");
        storage.put_queue("orders", &config).unwrap();
        storage.put_queue("audit", &QueueConfig::new("audit")).unwrap();

        store_message(&storage, "orders");
        let held = store_message(&storage, "orders");
        lease(&storage, "orders", &held, now_ns() + 60_000_000_000);
        let lapsed = store_message(&storage, "orders");
        lease(&storage, "orders", &lapsed, 1);
        store_message(&storage, "audit");

        let stats = QueueStats::read_from_storage(&storage, &config).unwrap();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.waiting_receivers, 0);

        // The lapsed lease is only counted, not reclaimed.
        assert!(storage
            .get_lease(&keys::lease_key("orders", &lapsed.id))
            .unwrap()
            .is_some());

        let all = QueueStats::read_all_from_storage(&storage).unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.queue_id.as_str()).collect();
        assert_eq!(names, vec!["audit", "orders"]);
        assert_eq!(all[0].depth, 1);
    }
}
