//! Generic persistent key-value store contract
//!
//! Settings, the persisted queue, and completed download records all live in
//! a host-provided persistent map. The host may back this with whatever it
//! likes; this crate only ships an in-memory implementation for tests and
//! headless use.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by a key-value backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// Backend I/O failure
    #[error("kv store I/O: {0}")]
    Io(String),

    /// Stored value could not be decoded
    #[error("kv store decode for key {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// A persistent string-keyed map of JSON values.
///
/// Implementations must be cheap to call from async context: the engine
/// invokes these from its controller task without `spawn_blocking`.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, KvError>;
    fn put(&self, key: &str, value: Value) -> Result<(), KvError>;
    fn remove(&self, key: &str) -> Result<(), KvError>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let map = self.map.lock().map_err(|e| KvError::Io(e.to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), KvError> {
        let mut map = self.map.lock().map_err(|e| KvError::Io(e.to_string()))?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        let mut map = self.map.lock().map_err(|e| KvError::Io(e.to_string()))?;
        map.remove(key);
        Ok(())
    }
}
