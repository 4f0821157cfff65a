//! The seam to the in-memory cache engine whose contents are kept warm.
//!
//! The snapshot format is owned entirely by the engine. The snapshot machinery only ever looks at
//! the existence, size and modification time of a snapshot file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;
use thiserror::Error;

/// An error raised by a [`CacheEngine`] while dumping or loading a snapshot.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The snapshot could not be written or read.
    #[error("snapshot I/O failed")]
    Io(#[from] std::io::Error),
    /// The snapshot contents could not be encoded or decoded.
    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// A process-local cache engine which can serialize its contents into a snapshot.
pub trait CacheEngine: Send + Sync {
    /// Writes the current contents of the engine into `file`.
    ///
    /// Writing nothing at all is allowed and signals that there is nothing worth publishing.
    fn dump(&self, file: &mut File) -> Result<(), EngineError>;

    /// Populates the engine from a previously dumped snapshot, returning the number of entries.
    fn load(&self, snapshot: &[u8]) -> Result<usize, EngineError>;
}

/// A simple string keyed cache of JSON values.
///
/// Snapshots are a single JSON object. An empty cache dumps zero bytes.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheEngine for MemoryEngine {
    fn dump(&self, file: &mut File) -> Result<(), EngineError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if entries.is_empty() {
            return Ok(());
        }

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &*entries)?;
        writer.flush()?;
        Ok(())
    }

    fn load(&self, snapshot: &[u8]) -> Result<usize, EngineError> {
        let loaded: BTreeMap<String, Value> = serde_json::from_slice(snapshot)?;
        let count = loaded.len();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.extend(loaded);
        Ok(count)
    }
}
