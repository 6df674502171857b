use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A published event. Immutable once published; the topic hands every
/// subscriber its own clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub payload: Vec<u8>,
    /// Publish time, nanoseconds since the Unix epoch.
    pub published_at: u64,
    pub attributes: HashMap<String, String>,
}

impl Event {
    /// Create an event with a fresh UUIDv7 id stamped with the current time.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::now_v7(),
            payload: payload.into(),
            published_at: crate::time::now_ns(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }
}
