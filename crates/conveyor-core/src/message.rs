use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

/// Persisted form of a queued message, stored in the `messages` column family.
/// Distinct from `QueueMessage`, which is what a receiver gets back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub queue_id: String,
    pub event: Event,
    pub delivery_count: u32,
    pub enqueued_at: u64,
    pub first_received_at: Option<u64>,
}

impl StoredMessage {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }

    pub fn new(queue_id: impl Into<String>, event: Event, enqueued_at: u64) -> Self {
        Self {
            id: Self::new_id(),
            queue_id: queue_id.into(),
            event,
            delivery_count: 0,
            enqueued_at,
            first_received_at: None,
        }
    }
}

/// Opaque token proving ownership of one delivery of a message.
///
/// Only the receipt from the latest delivery can acknowledge the message; a
/// receiver whose visibility timeout lapsed holds a stale receipt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle {
    queue_id: String,
    msg_id: Uuid,
    delivery: u32,
}

impl ReceiptHandle {
    pub(crate) fn new(queue_id: impl Into<String>, msg_id: Uuid, delivery: u32) -> Self {
        Self {
            queue_id: queue_id.into(),
            msg_id,
            delivery,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn msg_id(&self) -> Uuid {
        self.msg_id
    }

    pub fn delivery(&self) -> u32 {
        self.delivery
    }
}

/// Wire form: `{msg_id}.{delivery}.{queue_id}`. The queue id goes last so it
/// may contain dots.
impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.msg_id, self.delivery, self.queue_id)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed receipt handle: {0}")]
pub struct ParseReceiptError(String);

impl FromStr for ReceiptHandle {
    type Err = ParseReceiptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let (Some(id), Some(delivery), Some(queue_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseReceiptError(s.to_string()));
        };
        let msg_id = Uuid::parse_str(id).map_err(|_| ParseReceiptError(s.to_string()))?;
        let delivery = delivery
            .parse::<u32>()
            .map_err(|_| ParseReceiptError(s.to_string()))?;
        if queue_id.is_empty() {
            return Err(ParseReceiptError(s.to_string()));
        }
        Ok(Self::new(queue_id, msg_id, delivery))
    }
}

/// A message handed to a receiver by `receive`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub queue_id: String,
    pub event: Event,
    pub receipt_handle: ReceiptHandle,
    pub delivery_count: u32,
    pub first_received_at: u64,
    /// When the message becomes visible again unless acknowledged (ns).
    pub visible_after: u64,
}
