//! Fault-injecting adapters for exercising rollback paths

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{BackingStore, FileOps, JsonStoreOpener, StoreOpener, TokioFs};
use crate::errors::{PersistError, PersistResult};

fn injected(op: &'static str, path: &Path) -> PersistError {
    PersistError::io(op, path, std::io::Error::other("injected fault"))
}

fn file_name_ends_with(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(suffix))
        .unwrap_or(false)
}

/// [`FileOps`] that fails renames/removes whose source file name ends with
/// an armed suffix
#[derive(Default)]
pub struct FaultyFs {
    rename_from: Mutex<Option<&'static str>>,
    remove_of: Mutex<Option<&'static str>>,
}

impl FaultyFs {
    pub fn fail_rename_from(&self, suffix: &'static str) {
        *self.rename_from.lock().unwrap() = Some(suffix);
    }

    pub fn fail_remove_of(&self, suffix: &'static str) {
        *self.remove_of.lock().unwrap() = Some(suffix);
    }

    pub fn heal(&self) {
        *self.rename_from.lock().unwrap() = None;
        *self.remove_of.lock().unwrap() = None;
    }
}

#[async_trait]
impl FileOps for FaultyFs {
    async fn rename(&self, from: &Path, to: &Path) -> PersistResult<()> {
        let armed = *self.rename_from.lock().unwrap();
        if let Some(suffix) = armed
            && file_name_ends_with(from, suffix)
        {
            return Err(injected("rename", from));
        }
        TokioFs.rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> PersistResult<()> {
        let armed = *self.remove_of.lock().unwrap();
        if let Some(suffix) = armed
            && file_name_ends_with(path, suffix)
        {
            return Err(injected("remove", path));
        }
        TokioFs.remove(path).await
    }

    async fn exists(&self, path: &Path) -> PersistResult<bool> {
        TokioFs.exists(path).await
    }
}

/// [`StoreOpener`] whose stores fail `save()` for file names ending with an
/// armed suffix. Stores opened before arming observe the fault too.
#[derive(Default)]
pub struct FaultyOpener {
    save_suffix: std::sync::Arc<Mutex<Option<&'static str>>>,
    partial_write: std::sync::Arc<AtomicBool>,
}

impl FaultyOpener {
    pub fn fail_save_of(&self, suffix: &'static str) {
        *self.save_suffix.lock().unwrap() = Some(suffix);
    }

    /// Leave a truncated file behind when the injected save fails
    pub fn with_partial_write(self) -> Self {
        self.partial_write.store(true, Ordering::SeqCst);
        self
    }

    pub fn heal(&self) {
        *self.save_suffix.lock().unwrap() = None;
    }
}

struct FaultyStore {
    inner: Box<dyn BackingStore>,
    save_suffix: std::sync::Arc<Mutex<Option<&'static str>>>,
    partial_write: std::sync::Arc<AtomicBool>,
}

#[async_trait]
impl StoreOpener for FaultyOpener {
    async fn open(&self, path: &Path) -> PersistResult<Box<dyn BackingStore>> {
        let inner = JsonStoreOpener.open(path).await?;
        Ok(Box::new(FaultyStore {
            inner,
            save_suffix: self.save_suffix.clone(),
            partial_write: self.partial_write.clone(),
        }))
    }
}

#[async_trait]
impl BackingStore for FaultyStore {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    async fn get(&self, key: &str) -> PersistResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&mut self, key: &str, value: Value) -> PersistResult<()> {
        self.inner.set(key, value).await
    }

    async fn delete(&mut self, key: &str) -> PersistResult<bool> {
        self.inner.delete(key).await
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        self.inner.keys().await
    }

    async fn save(&mut self) -> PersistResult<()> {
        let armed = *self.save_suffix.lock().unwrap();
        if let Some(suffix) = armed
            && file_name_ends_with(self.inner.path(), suffix)
        {
            if self.partial_write.load(Ordering::SeqCst) {
                let _ = tokio::fs::write(self.inner.path(), b"{ \"port\": 30").await;
            }
            return Err(injected("write", self.inner.path()));
        }
        self.inner.save().await
    }

    async fn reload(&mut self) -> PersistResult<()> {
        self.inner.reload().await
    }
}
