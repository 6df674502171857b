use uuid::Uuid;

use crate::dead_letter::DeadLetterRecord;
use crate::error::StorageResult;
use crate::message::StoredMessage;
use crate::queue::QueueConfig;
use crate::results::{ProcessingResult, PutOutcome};

/// Represents a single operation in an atomic write batch.
#[derive(Debug)]
pub enum WriteBatchOp {
    PutMessage { key: Vec<u8>, value: Vec<u8> },
    DeleteMessage { key: Vec<u8> },
    PutLease { key: Vec<u8>, value: Vec<u8> },
    DeleteLease { key: Vec<u8> },
    PutLeaseExpiry { key: Vec<u8> },
    DeleteLeaseExpiry { key: Vec<u8> },
    PutDeadLetter { key: Vec<u8>, value: Vec<u8> },
    DeleteDeadLetter { key: Vec<u8> },
}

/// Storage trait for all persistence operations. Implementations must be thread-safe.
pub trait Storage: Send + Sync {
    // --- Message operations ---

    /// Store a message in the messages CF.
    fn put_message(&self, key: &[u8], message: &StoredMessage) -> StorageResult<()>;

    /// Retrieve a message by its full key.
    fn get_message(&self, key: &[u8]) -> StorageResult<Option<StoredMessage>>;

    /// Delete a message by its full key.
    fn delete_message(&self, key: &[u8]) -> StorageResult<()>;

    /// List messages whose keys start with the given prefix, in lexicographic order.
    fn list_messages(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, StoredMessage)>>;

    // --- Lease operations ---

    /// Retrieve a lease value by key.
    fn get_lease(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// List lease expiry keys that are <= the given upper bound, earliest first.
    fn list_expired_leases(&self, up_to_key: &[u8]) -> StorageResult<Vec<Vec<u8>>>;

    // --- Queue operations ---

    fn put_queue(&self, queue_id: &str, config: &QueueConfig) -> StorageResult<()>;

    fn get_queue(&self, queue_id: &str) -> StorageResult<Option<QueueConfig>>;

    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>>;

    // --- Dead-letter operations ---

    fn put_dead_letter(&self, record: &DeadLetterRecord) -> StorageResult<()>;

    fn get_dead_letter(&self, id: &Uuid) -> StorageResult<Option<DeadLetterRecord>>;

    fn delete_dead_letter(&self, id: &Uuid) -> StorageResult<()>;

    /// All dead-letter records, oldest first.
    fn list_dead_letters(&self) -> StorageResult<Vec<DeadLetterRecord>>;

    // --- Result operations ---

    fn get_result(&self, key: &str) -> StorageResult<Option<ProcessingResult>>;

    /// Write `result` only if no record exists for its key. Concurrent callers
    /// for the same key are serialized; exactly one observes `Committed`.
    fn put_result_if_absent(&self, result: &ProcessingResult) -> StorageResult<PutOutcome>;

    /// Unconditionally replace the record for `result.key`.
    fn put_result(&self, result: &ProcessingResult) -> StorageResult<()>;

    // --- Batch operations ---

    /// Atomically apply a batch of write operations across column families.
    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()>;

    /// Flush the write-ahead log so acknowledged writes survive a crash.
    fn flush(&self) -> StorageResult<()>;
}
