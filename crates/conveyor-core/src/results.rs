use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::StorageResult;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Success,
    Failure,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => f.write_str("success"),
            ResultStatus::Failure => f.write_str("failure"),
        }
    }
}

/// Outcome of processing one keyed artifact. At most one committed record
/// exists per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub key: String,
    pub status: ResultStatus,
    pub data: Map<String, Value>,
    /// Nanoseconds since the Unix epoch.
    pub written_at: u64,
}

impl ProcessingResult {
    pub fn new(key: impl Into<String>, status: ResultStatus, data: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            status,
            data,
            written_at: crate::time::now_ns(),
        }
    }

    pub fn success(key: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::new(key, ResultStatus::Success, data)
    }

    /// A failure record carrying the error text under `"error"`.
    pub fn failure(key: impl Into<String>, error: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(error.into()));
        Self::new(key, ResultStatus::Failure, data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Committed,
    /// Another writer got there first; `existing` is the record that won.
    AlreadyExists { existing: ProcessingResult },
}

/// Keyed result store with first-writer-wins semantics.
#[derive(Clone)]
pub struct ResultStore {
    storage: Arc<dyn Storage>,
}

impl ResultStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    #[tracing::instrument(skip_all, fields(key = %result.key, status = %result.status))]
    pub fn put_if_absent(&self, result: &ProcessingResult) -> StorageResult<PutOutcome> {
        let outcome = self.storage.put_result_if_absent(result)?;
        if let PutOutcome::AlreadyExists { .. } = outcome {
            debug!("result already committed, keeping existing record");
        }
        Ok(outcome)
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<ProcessingResult>> {
        self.storage.get_result(key)
    }

    /// Replace whatever is stored for `result.key`. Operator use only; the
    /// pipeline never calls this.
    pub fn overwrite(&self, result: &ProcessingResult) -> StorageResult<()> {
        warn!(key = %result.key, status = %result.status, "overwriting committed result");
        self.storage.put_result(result)
    }
}
