//! Backing store adapter and filesystem primitives
//!
//! A backing store is a single file holding a flat key → JSON value map.
//! It offers no atomicity beyond one `save()` call and does not serialize
//! concurrent writers; [`crate::commit`] layers the durability guarantees on top.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::codec::FlatMap;
use crate::errors::{PersistError, PersistResult};

#[cfg(test)]
pub(crate) mod testing;

/// Handle onto one backing file. Reads are served from the in-memory view
/// populated at open/reload time; writes stay in memory until `save()`.
#[async_trait]
pub trait BackingStore: Send + Sync {
    fn path(&self) -> &Path;
    async fn get(&self, key: &str) -> PersistResult<Option<Value>>;
    async fn set(&mut self, key: &str, value: Value) -> PersistResult<()>;
    async fn delete(&mut self, key: &str) -> PersistResult<bool>;
    async fn keys(&self) -> PersistResult<Vec<String>>;
    async fn save(&mut self) -> PersistResult<()>;
    async fn reload(&mut self) -> PersistResult<()>;
}

/// Opens backing store handles by path
#[async_trait]
pub trait StoreOpener: Send + Sync {
    async fn open(&self, path: &Path) -> PersistResult<Box<dyn BackingStore>>;
}

/// Filesystem primitives used by the commit protocol and profile deletion
#[async_trait]
pub trait FileOps: Send + Sync {
    async fn rename(&self, from: &Path, to: &Path) -> PersistResult<()>;
    async fn remove(&self, path: &Path) -> PersistResult<()>;
    async fn exists(&self, path: &Path) -> PersistResult<bool>;
}

/// Read every entry of a store into a flat map
pub async fn read_all(store: &dyn BackingStore) -> PersistResult<FlatMap> {
    let mut values = FlatMap::new();
    for key in store.keys().await? {
        if let Some(value) = store.get(&key).await? {
            values.insert(key, value);
        }
    }
    Ok(values)
}

/// Pretty-printed JSON object file
pub struct JsonFileStore {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl JsonFileStore {
    async fn read_entries(path: &Path) -> PersistResult<Map<String, Value>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(PersistError::io("read", path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(entries) => Ok(entries),
            other => Err(PersistError::Serialization(format!(
                "{} does not hold a key/value object (found {})",
                path.display(),
                json_kind(&other)
            ))),
        }
    }
}

#[async_trait]
impl BackingStore for JsonFileStore {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn get(&self, key: &str) -> PersistResult<Option<Value>> {
        Ok(self.entries.get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: Value) -> PersistResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> PersistResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    async fn save(&mut self) -> PersistResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistError::io("create_dir_all", parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| PersistError::io("write", &self.path, e))?;
        debug!(path = %self.path.display(), keys = self.entries.len(), "Saved backing store");
        Ok(())
    }

    async fn reload(&mut self) -> PersistResult<()> {
        self.entries = Self::read_entries(&self.path).await?;
        Ok(())
    }
}

/// Opens [`JsonFileStore`] handles
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStoreOpener;

#[async_trait]
impl StoreOpener for JsonStoreOpener {
    async fn open(&self, path: &Path) -> PersistResult<Box<dyn BackingStore>> {
        let entries = JsonFileStore::read_entries(path).await?;
        Ok(Box::new(JsonFileStore {
            path: path.to_path_buf(),
            entries,
        }))
    }
}

/// [`FileOps`] over `tokio::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioFs;

#[async_trait]
impl FileOps for TokioFs {
    async fn rename(&self, from: &Path, to: &Path) -> PersistResult<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| PersistError::io("rename", from, e))
    }

    async fn remove(&self, path: &Path) -> PersistResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| PersistError::io("remove", path, e))
    }

    async fn exists(&self, path: &Path) -> PersistResult<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistError::io("stat", path, e)),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
