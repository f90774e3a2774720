//! Durable sled-backed attempt and pattern storage.

use std::path::Path;
use std::sync::Arc;

use sled::{Db, Tree};

use crate::attempt::Attempt;
use crate::error::StorageError;
use crate::memory::PatternSnapshot;

const TREE_ATTEMPTS: &str = "flow_attempts";
const TREE_PATTERNS: &str = "flow_patterns";

/// What a backend holds for one flow. Attempts come back in ascending
/// attempt-number order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredFlow {
    pub attempts: Vec<Attempt>,
    pub patterns: PatternSnapshot,
}

/// Write-through backend for the memory store.
pub trait AttemptPersistence: Send + Sync {
    /// Insert or overwrite one attempt.
    fn put_attempt(&self, flow_api_name: &str, attempt: &Attempt) -> Result<(), StorageError>;

    fn put_patterns(
        &self,
        flow_api_name: &str,
        patterns: &PatternSnapshot,
    ) -> Result<(), StorageError>;

    fn load_flow(&self, flow_api_name: &str) -> Result<StoredFlow, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

/// Attempts keyed by `flow \0 attempt_number` (big-endian) so a prefix scan yields
/// them in numeric order; pattern sets keyed by flow name. Values are JSON.
#[derive(Clone)]
pub struct SledAttemptPersistence {
    db: Db,
    attempts: Tree,
    patterns: Tree,
}

impl SledAttemptPersistence {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let attempts = db.open_tree(TREE_ATTEMPTS)?;
        let patterns = db.open_tree(TREE_PATTERNS)?;
        Ok(Self {
            db,
            attempts,
            patterns,
        })
    }

    /// Open (or create) a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StorageError::Backend(format!(
                "Failed to open sled database at {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::new(db)
    }

    pub fn shared(db: Db) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn encode_attempt_key(flow_api_name: &str, attempt_number: u32) -> Vec<u8> {
        let mut key = attempt_prefix(flow_api_name);
        key.extend_from_slice(&attempt_number.to_be_bytes());
        key
    }
}

impl AttemptPersistence for SledAttemptPersistence {
    fn put_attempt(&self, flow_api_name: &str, attempt: &Attempt) -> Result<(), StorageError> {
        let key = Self::encode_attempt_key(flow_api_name, attempt.attempt_number);
        let value = serde_json::to_vec(attempt).map_err(|e| StorageError::Encode(e.to_string()))?;
        self.attempts.insert(key, value)?;
        Ok(())
    }

    fn put_patterns(
        &self,
        flow_api_name: &str,
        patterns: &PatternSnapshot,
    ) -> Result<(), StorageError> {
        let value =
            serde_json::to_vec(patterns).map_err(|e| StorageError::Encode(e.to_string()))?;
        self.patterns.insert(flow_api_name.as_bytes(), value)?;
        Ok(())
    }

    fn load_flow(&self, flow_api_name: &str) -> Result<StoredFlow, StorageError> {
        let mut attempts = Vec::new();
        for result in self.attempts.scan_prefix(attempt_prefix(flow_api_name)) {
            let (key, value) = result?;
            let attempt: Attempt =
                serde_json::from_slice(&value).map_err(|e| StorageError::Decode {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    message: e.to_string(),
                })?;
            attempts.push(attempt.normalize());
        }

        let patterns = match self.patterns.get(flow_api_name.as_bytes())? {
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| StorageError::Decode {
                key: flow_api_name.to_string(),
                message: e.to_string(),
            })?,
            None => PatternSnapshot::default(),
        };

        Ok(StoredFlow { attempts, patterns })
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn attempt_prefix(flow_api_name: &str) -> Vec<u8> {
    let mut prefix = flow_api_name.as_bytes().to_vec();
    prefix.push(0);
    prefix
}
