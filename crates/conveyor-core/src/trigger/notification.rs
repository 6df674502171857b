use serde::{Deserialize, Serialize};

use crate::error::NotificationError;

pub const OBJECT_CREATED: &str = "ObjectCreated";

/// "An object was written at `bucket/object_key`." The object key is the
/// idempotency key for everything downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCreatedNotification {
    pub event_type: String,
    pub bucket: String,
    pub object_key: String,
    #[serde(default)]
    pub event_time: String,
}

impl ObjectCreatedNotification {
    pub fn new(bucket: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            event_type: OBJECT_CREATED.to_string(),
            bucket: bucket.into(),
            object_key: object_key.into(),
            event_time: String::new(),
        }
    }

    pub fn with_event_time(mut self, event_time: impl Into<String>) -> Self {
        self.event_time = event_time.into();
        self
    }

    pub fn to_json(&self) -> Vec<u8> {
        // A struct of plain strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Records")]
    records: Vec<EnvelopeRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRecord {
    #[serde(default)]
    event_name: String,
    #[serde(default)]
    event_time: String,
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Deserialize)]
struct S3Object {
    key: String,
}

/// Parse a raw notification body.
///
/// Accepts either a single direct notification or an S3-style envelope with
/// a `Records` array. Records that are not object-created events are
/// skipped, so the result may be empty. Envelope keys are URL-decoded.
pub fn parse_notifications(body: &[u8]) -> Result<Vec<ObjectCreatedNotification>, NotificationError> {
    let value: serde_json::Value = serde_json::from_slice(body)?;

    if value.get("Records").is_some() {
        let envelope: Envelope = serde_json::from_value(value)?;
        return Ok(envelope
            .records
            .into_iter()
            .filter(|r| r.event_name.starts_with(OBJECT_CREATED))
            .map(|r| ObjectCreatedNotification {
                event_type: OBJECT_CREATED.to_string(),
                bucket: r.s3.bucket.name,
                object_key: decode_object_key(&r.s3.object.key),
                event_time: r.event_time,
            })
            .collect());
    }

    let notification: ObjectCreatedNotification = serde_json::from_value(value)?;
    if notification.bucket.is_empty() || notification.object_key.is_empty() {
        return Err(NotificationError::Malformed(
            "bucket and objectKey must be non-empty".into(),
        ));
    }
    if notification.event_type.starts_with(OBJECT_CREATED) {
        Ok(vec![notification])
    } else {
        Ok(Vec::new())
    }
}

/// Decode an object key as it appears in an event envelope: `+` is a space
/// and `%XX` is a byte. Malformed escapes are kept literally; invalid UTF-8
/// is replaced.
pub fn decode_object_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
