use std::path::Path;
use std::sync::{Arc, Mutex};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use uuid::Uuid;

use crate::dead_letter::DeadLetterRecord;
use crate::error::{StorageError, StorageResult};
use crate::message::StoredMessage;
use crate::queue::QueueConfig;
use crate::results::{ProcessingResult, PutOutcome};
use crate::storage::keys;
use crate::storage::traits::{Storage, WriteBatchOp};

const CF_MESSAGES: &str = "messages";
const CF_LEASES: &str = "leases";
const CF_LEASE_EXPIRY: &str = "lease_expiry";
const CF_QUEUES: &str = "queues";
const CF_DEAD_LETTERS: &str = "dead_letters";
const CF_RESULTS: &str = "results";

/// All column family names (excluding `default` which RocksDB creates automatically).
const COLUMN_FAMILIES: &[&str] = &[
    CF_MESSAGES,
    CF_LEASES,
    CF_LEASE_EXPIRY,
    CF_QUEUES,
    CF_DEAD_LETTERS,
    CF_RESULTS,
];

type DB = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed storage implementation.
pub struct RocksDbStorage {
    db: DB,
    /// Serializes check-then-put on the results CF.
    result_write_lock: Mutex<()>,
}

impl RocksDbStorage {
    /// Open or create a RocksDB database at the given path with all column families.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self {
            db,
            result_write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {name}")))
    }

    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }
}

impl Storage for RocksDbStorage {
    fn put_message(&self, key: &[u8], message: &StoredMessage) -> StorageResult<()> {
        let cf = self.cf(CF_MESSAGES)?;
        let value = serde_json::to_vec(message)?;
        self.db.put_cf(&cf, key, &value)?;
        Ok(())
    }

    fn get_message(&self, key: &[u8]) -> StorageResult<Option<StoredMessage>> {
        let cf = self.cf(CF_MESSAGES)?;
        match self.db.get_cf(&cf, key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn delete_message(&self, key: &[u8]) -> StorageResult<()> {
        let cf = self.cf(CF_MESSAGES)?;
        self.db.delete_cf(&cf, key)?;
        Ok(())
    }

    fn list_messages(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, StoredMessage)>> {
        self.scan_prefix(CF_MESSAGES, prefix)?
            .into_iter()
            .map(|(key, value)| -> StorageResult<_> {
                Ok((key, serde_json::from_slice(&value)?))
            })
            .collect()
    }

    fn get_lease(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_LEASES)?;
        Ok(self.db.get_cf(&cf, key)?.map(|v| v.to_vec()))
    }

    fn list_expired_leases(&self, up_to_key: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
        let cf = self.cf(CF_LEASE_EXPIRY)?;
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        let mut results = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.as_ref() > up_to_key {
                break;
            }
            results.push(key.to_vec());
        }
        Ok(results)
    }

    fn put_queue(&self, queue_id: &str, config: &QueueConfig) -> StorageResult<()> {
        let cf = self.cf(CF_QUEUES)?;
        let value = serde_json::to_vec(config)?;
        self.db.put_cf(&cf, queue_id.as_bytes(), &value)?;
        Ok(())
    }

    fn get_queue(&self, queue_id: &str) -> StorageResult<Option<QueueConfig>> {
        let cf = self.cf(CF_QUEUES)?;
        match self.db.get_cf(&cf, queue_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>> {
        self.scan_prefix(CF_QUEUES, b"")?
            .into_iter()
            .map(|(_, value)| -> StorageResult<_> { Ok(serde_json::from_slice(&value)?) })
            .collect()
    }

    fn put_dead_letter(&self, record: &DeadLetterRecord) -> StorageResult<()> {
        let cf = self.cf(CF_DEAD_LETTERS)?;
        let value = serde_json::to_vec(record)?;
        self.db
            .put_cf(&cf, keys::dead_letter_key(&record.id), &value)?;
        Ok(())
    }

    fn get_dead_letter(&self, id: &Uuid) -> StorageResult<Option<DeadLetterRecord>> {
        let cf = self.cf(CF_DEAD_LETTERS)?;
        match self.db.get_cf(&cf, keys::dead_letter_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn delete_dead_letter(&self, id: &Uuid) -> StorageResult<()> {
        let cf = self.cf(CF_DEAD_LETTERS)?;
        self.db.delete_cf(&cf, keys::dead_letter_key(id))?;
        Ok(())
    }

    fn list_dead_letters(&self) -> StorageResult<Vec<DeadLetterRecord>> {
        self.scan_prefix(CF_DEAD_LETTERS, b"")?
            .into_iter()
            .map(|(_, value)| -> StorageResult<_> { Ok(serde_json::from_slice(&value)?) })
            .collect()
    }

    fn get_result(&self, key: &str) -> StorageResult<Option<ProcessingResult>> {
        let cf = self.cf(CF_RESULTS)?;
        match self.db.get_cf(&cf, keys::result_key(key))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn put_result_if_absent(&self, result: &ProcessingResult) -> StorageResult<PutOutcome> {
        let _guard = self
            .result_write_lock
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;

        if let Some(existing) = self.get_result(&result.key)? {
            return Ok(PutOutcome::AlreadyExists { existing });
        }
        self.put_result(result)?;
        Ok(PutOutcome::Committed)
    }

    fn put_result(&self, result: &ProcessingResult) -> StorageResult<()> {
        let cf = self.cf(CF_RESULTS)?;
        let value = serde_json::to_vec(result)?;
        self.db.put_cf(&cf, keys::result_key(&result.key), &value)?;
        Ok(())
    }

    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let mut batch = WriteBatch::default();

        for op in ops {
            match op {
                WriteBatchOp::PutMessage { key, value } => {
                    batch.put_cf(&self.cf(CF_MESSAGES)?, &key, &value);
                }
                WriteBatchOp::DeleteMessage { key } => {
                    batch.delete_cf(&self.cf(CF_MESSAGES)?, &key);
                }
                WriteBatchOp::PutLease { key, value } => {
                    batch.put_cf(&self.cf(CF_LEASES)?, &key, &value);
                }
                WriteBatchOp::DeleteLease { key } => {
                    batch.delete_cf(&self.cf(CF_LEASES)?, &key);
                }
                WriteBatchOp::PutLeaseExpiry { key } => {
                    batch.put_cf(&self.cf(CF_LEASE_EXPIRY)?, &key, b"");
                }
                WriteBatchOp::DeleteLeaseExpiry { key } => {
                    batch.delete_cf(&self.cf(CF_LEASE_EXPIRY)?, &key);
                }
                WriteBatchOp::PutDeadLetter { key, value } => {
                    batch.put_cf(&self.cf(CF_DEAD_LETTERS)?, &key, &value);
                }
                WriteBatchOp::DeleteDeadLetter { key } => {
                    batch.delete_cf(&self.cf(CF_DEAD_LETTERS)?, &key);
                }
            }
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}
