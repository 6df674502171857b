//! Key encoding for RocksDB column families.
//!
//! All numeric values use big-endian encoding for correct lexicographic ordering.
//! Composite keys use `:` (0x3A) as separator.
//! Variable-length strings are length-prefixed with a big-endian u16.

use uuid::Uuid;

const SEPARATOR: u8 = b':';

/// Encode a u64 as 8 big-endian bytes.
fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Encode a variable-length string with a 2-byte big-endian length prefix.
/// Strings longer than `u16::MAX` bytes are truncated; queue names are
/// validated well below that.
fn encode_string(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    let mut buf = Vec::with_capacity(2 + len);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&bytes[..len]);
    buf
}

/// Decode a length-prefixed string starting at `pos`. Returns the string and
/// the position just past it.
fn decode_string(buf: &[u8], pos: usize) -> Option<(String, usize)> {
    let len_bytes: [u8; 2] = buf.get(pos..pos + 2)?.try_into().ok()?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    let start = pos + 2;
    let s = std::str::from_utf8(buf.get(start..start + len)?).ok()?;
    Some((s.to_string(), start + len))
}

/// Build a message key: `{queue_id}:{msg_id}`
///
/// UUIDv7 ids sort by creation time, so a prefix scan yields messages in
/// enqueue order.
pub fn message_key(queue_id: &str, msg_id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&encode_string(queue_id));
    key.push(SEPARATOR);
    key.extend_from_slice(msg_id.as_bytes());
    key
}

/// Build a prefix for iterating all messages in a queue.
pub fn message_prefix(queue_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(24);
    prefix.extend_from_slice(&encode_string(queue_id));
    prefix.push(SEPARATOR);
    prefix
}

/// Build a lease key. Same layout as the message key, in its own CF.
pub fn lease_key(queue_id: &str, msg_id: &Uuid) -> Vec<u8> {
    message_key(queue_id, msg_id)
}

/// Build a lease expiry key: `{expiry_ts_ns}:{queue_id}:{msg_id}`
///
/// Timestamp-first layout enables efficient "scan from earliest expiry" iteration.
pub fn lease_expiry_key(expiry_ts_ns: u64, queue_id: &str, msg_id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&encode_u64(expiry_ts_ns));
    key.push(SEPARATOR);
    key.extend_from_slice(&encode_string(queue_id));
    key.push(SEPARATOR);
    key.extend_from_slice(msg_id.as_bytes());
    key
}

/// Upper bound for scanning every lease expiry at or before `now_ns`.
pub fn lease_expiry_upper_bound(now_ns: u64) -> Vec<u8> {
    let mut up_to = Vec::with_capacity(40);
    up_to.extend_from_slice(&encode_u64(now_ns));
    up_to.extend_from_slice(&[0xFF; 32]);
    up_to
}

/// Parse `(queue_id, msg_id)` back out of a lease expiry key.
pub fn parse_lease_expiry_key(key: &[u8]) -> Option<(String, Uuid)> {
    if key.get(8) != Some(&SEPARATOR) {
        return None;
    }
    let (queue_id, pos) = decode_string(key, 9)?;
    if key.get(pos) != Some(&SEPARATOR) {
        return None;
    }
    let id_bytes: [u8; 16] = key.get(pos + 1..pos + 17)?.try_into().ok()?;
    Some((queue_id, Uuid::from_bytes(id_bytes)))
}

/// Encode a lease value: `{delivery}:{expiry_ts_ns}`
///
/// The delivery number ties the lease to one receipt handle.
pub fn lease_value(delivery: u32, expiry_ts_ns: u64) -> Vec<u8> {
    let mut val = Vec::with_capacity(13);
    val.extend_from_slice(&delivery.to_be_bytes());
    val.push(SEPARATOR);
    val.extend_from_slice(&encode_u64(expiry_ts_ns));
    val
}

/// Extract `(delivery, expiry_ts_ns)` from a lease value.
pub fn parse_lease_value(value: &[u8]) -> Option<(u32, u64)> {
    if value.len() != 13 || value[4] != SEPARATOR {
        return None;
    }
    let delivery: [u8; 4] = value[..4].try_into().ok()?;
    let expiry: [u8; 8] = value[5..].try_into().ok()?;
    Some((u32::from_be_bytes(delivery), u64::from_be_bytes(expiry)))
}

/// Dead-letter records are keyed by their UUIDv7 id, so iteration is in
/// quarantine order.
pub fn dead_letter_key(id: &Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

pub fn result_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_u64_lexicographic_order() {
        assert!(encode_u64(100) < encode_u64(200));
        assert!(encode_u64(0) < encode_u64(u64::MAX));
        assert!(encode_u64(1_000_000_000) < encode_u64(1_000_000_001));
    }

    #[test]
    fn message_keys_sort_by_queue_then_enqueue_order() {
        let id1 = Uuid::now_v7();
        let id2 = Uuid::now_v7();

        assert!(message_key("q1", &id1) < message_key("q1", &id2));
        assert!(message_key("q1", &id2) < message_key("q2", &id1));
        assert!(message_key("q1", &id1).starts_with(&message_prefix("q1")));
    }

    #[test]
    fn lease_expiry_keys_sort_by_timestamp_and_round_trip() {
        let id = Uuid::now_v7();
        let early = lease_expiry_key(1000, "orders", &id);
        let late = lease_expiry_key(2000, "orders", &id);
        assert!(early < late);
        assert!(late <= lease_expiry_upper_bound(2000));
        assert!(late > lease_expiry_upper_bound(1999));

        assert_eq!(parse_lease_expiry_key(&early), Some(("orders".to_string(), id)));
        assert_eq!(parse_lease_expiry_key(b"junk"), None);
    }

    #[test]
    fn lease_value_carries_delivery_and_expiry() {
        let value = lease_value(3, 5_000_000_000);
        assert_eq!(parse_lease_value(&value), Some((3, 5_000_000_000)));
        assert_eq!(parse_lease_value(&value[..8]), None);
    }

    #[test]
    fn different_length_queue_names_dont_collide() {
        let id = Uuid::now_v7();
        // "q" + ":" must never look like a prefix of "q:" + ...
        assert!(!message_key("q:", &id).starts_with(&message_prefix("q")));
        assert_ne!(message_key("a", &id), message_key("ab", &id));
    }
}
