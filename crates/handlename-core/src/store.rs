//! Durable key-value storage for cache snapshots.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::StorageError;

/// Future returned by [`SnapshotStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Async durable store interface.
pub trait SnapshotStore: Send + Sync {
    /// Read the value stored under `storage_key`.
    fn get<'a>(&'a self, storage_key: &'a str) -> StoreFuture<'a, Option<Value>>;

    /// Replace the value stored under `storage_key`.
    fn set<'a>(&'a self, storage_key: &'a str, value: Value) -> StoreFuture<'a, ()>;
}

/// In-process store. Counts writes so callers can observe coalescing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without counting it as a write.
    #[must_use]
    pub fn with_value(self, storage_key: &str, value: Value) -> Self {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(storage_key.to_string(), value);
        self
    }

    /// Number of `set` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current value without going through the async interface.
    pub fn peek(&self, storage_key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(storage_key)
            .cloned()
    }
}

impl SnapshotStore for MemoryStore {
    fn get<'a>(&'a self, storage_key: &'a str) -> StoreFuture<'a, Option<Value>> {
        let value = self.peek(storage_key);
        Box::pin(async move { Ok(value) })
    }

    fn set<'a>(&'a self, storage_key: &'a str, value: Value) -> StoreFuture<'a, ()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(storage_key.to_string(), value);
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Box::pin(async { Ok(()) })
    }
}

/// JSON file holding one object of storage key → value.
///
/// Writes go to a sibling temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>, StorageError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        match serde_json::from_slice(&raw)? {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::Malformed(format!(
                "expected a JSON object in {}, found {}",
                self.path.display(),
                kind_name(&other)
            ))),
        }
    }

    async fn write_all(&self, map: Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(&Value::Object(map))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "snapshot file written");
        Ok(())
    }
}

impl SnapshotStore for JsonFileStore {
    fn get<'a>(&'a self, storage_key: &'a str) -> StoreFuture<'a, Option<Value>> {
        Box::pin(async move {
            let mut map = self.read_all().await?;
            Ok(map.remove(storage_key))
        })
    }

    fn set<'a>(&'a self, storage_key: &'a str, value: Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            // Corrupt contents are overwritten.
            let mut map = self.read_all().await.unwrap_or_default();
            map.insert(storage_key.to_string(), value);
            self.write_all(map).await
        })
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
