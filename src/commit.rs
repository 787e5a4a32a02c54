//! Atomic commit engine
//!
//! Writes a set of flat updates to a backing file so that, outside this
//! module, the file only ever holds the complete previous content or the
//! complete new content:
//!
//! 1. stage the new content in `<path>.tmp` and `save()` it
//! 2. move the current file aside to `<path>.bak`
//! 3. rename `<path>.tmp` over `<path>` (the visibility point)
//! 4. drop `<path>.bak`
//!
//! Any failure removes the staging file and renames `<path>.bak` back before
//! the error is returned. A crash can still leave `.tmp`/`.bak` behind;
//! [`CommitEngine::recover`] reconciles them at startup. Commits never run
//! it, so another writer's in-flight files are left alone.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backing::{BackingStore, FileOps, StoreOpener, read_all};
use crate::codec::{FlatMap, is_descendant};
use crate::config::SchemaDefaults;
use crate::constants::codec::TRANSIENT_KEYS;
use crate::constants::paths::{BAK_SUFFIX, TMP_SUFFIX};
use crate::errors::{PersistError, PersistResult};

/// How staged content relates to the file being replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Keep existing entries the updates do not touch
    Merge,
    /// The updates become the whole file
    Replace,
}

/// What [`CommitEngine::recover`] found and fixed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub removed_tmp: bool,
    pub restored_backup: bool,
    pub removed_backup: bool,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Keys held only in memory, never written to a backing file
fn is_transient(key: &str) -> bool {
    TRANSIENT_KEYS
        .iter()
        .any(|transient| key == *transient || is_descendant(key, transient))
}

/// `<path><suffix>` next to `path`
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub struct CommitEngine {
    opener: Arc<dyn StoreOpener>,
    fs: Arc<dyn FileOps>,
    defaults: Arc<SchemaDefaults>,
}

impl CommitEngine {
    pub fn new(
        opener: Arc<dyn StoreOpener>,
        fs: Arc<dyn FileOps>,
        defaults: Arc<SchemaDefaults>,
    ) -> Self {
        Self {
            opener,
            fs,
            defaults,
        }
    }

    pub(crate) fn opener(&self) -> &Arc<dyn StoreOpener> {
        &self.opener
    }

    pub(crate) fn fs(&self) -> &Arc<dyn FileOps> {
        &self.fs
    }

    pub(crate) fn defaults(&self) -> &Arc<SchemaDefaults> {
        &self.defaults
    }

    /// Merge `updates` into the file at `path`
    pub async fn commit(&self, path: &Path, updates: &FlatMap) -> PersistResult<()> {
        self.commit_with(path, updates, CommitMode::Merge).await
    }

    /// Make `updates` the entire content of the file at `path`
    pub async fn commit_replace(&self, path: &Path, updates: &FlatMap) -> PersistResult<()> {
        self.commit_with(path, updates, CommitMode::Replace).await
    }

    pub async fn commit_with(
        &self,
        path: &Path,
        updates: &FlatMap,
        mode: CommitMode,
    ) -> PersistResult<()> {
        let tmp = sibling(path, TMP_SUFFIX);
        let bak = sibling(path, BAK_SUFFIX);

        let mut moved_aside = false;
        match self
            .stage_and_swap(path, &tmp, &bak, updates, mode, &mut moved_aside)
            .await
        {
            Ok(()) => {
                debug!(path = %path.display(), keys = updates.len(), ?mode, "Committed settings");
                Ok(())
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "Commit failed, restoring previous file");
                self.roll_back(path, &tmp, &bak, moved_aside).await;
                Err(err)
            }
        }
    }

    async fn stage_and_swap(
        &self,
        path: &Path,
        tmp: &Path,
        bak: &Path,
        updates: &FlatMap,
        mode: CommitMode,
        moved_aside: &mut bool,
    ) -> PersistResult<()> {
        let mut staged = self.open_staging(tmp).await?;

        if mode == CommitMode::Merge {
            for (key, value) in self.read_current(path).await? {
                // an update owns its whole subtree, and replaces any enclosing object
                let shadowed = updates
                    .keys()
                    .any(|update| is_descendant(&key, update) || is_descendant(update, &key));
                if !shadowed && !is_transient(&key) {
                    staged.set(&key, value).await?;
                }
            }
        }

        for (key, value) in updates {
            if key.is_empty() || is_transient(key) {
                continue;
            }
            let value = if value.is_null() {
                self.defaults.default_for_key(key)
            } else {
                value.clone()
            };
            staged.set(key, value).await?;
        }

        staged.save().await?;

        if self.fs.exists(path).await? {
            self.fs.rename(path, bak).await?;
            *moved_aside = true;
        }

        self.fs.rename(tmp, path).await?;

        if *moved_aside {
            self.fs.remove(bak).await?;
        }
        Ok(())
    }

    /// Empty staging store at `tmp`, whatever a previous writer left there
    async fn open_staging(&self, tmp: &Path) -> PersistResult<Box<dyn BackingStore>> {
        let mut staged = match self.opener.open(tmp).await {
            Ok(staged) => staged,
            Err(PersistError::Serialization(e)) => {
                warn!(path = %tmp.display(), error = %e, "Replacing unreadable staging file");
                self.remove_if_exists(tmp).await?;
                self.opener.open(tmp).await?
            }
            Err(e) => return Err(e),
        };
        for key in staged.keys().await? {
            staged.delete(&key).await?;
        }
        Ok(staged)
    }

    /// Entries of the file being replaced. Unreadable content counts as
    /// empty, since the staged write supersedes it.
    async fn read_current(&self, path: &Path) -> PersistResult<FlatMap> {
        match self.opener.open(path).await {
            Ok(current) => read_all(current.as_ref()).await,
            Err(PersistError::Serialization(e)) => {
                warn!(path = %path.display(), error = %e, "Existing settings file is unreadable, overwriting it");
                Ok(FlatMap::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Undo a failed commit. The backup is only put back if this commit
    /// created it; an older `.bak` belongs to recovery.
    async fn roll_back(&self, path: &Path, tmp: &Path, bak: &Path, moved_aside: bool) {
        if let Err(e) = self.remove_if_exists(tmp).await {
            error!(path = %tmp.display(), error = %e, "Failed to remove staging file during rollback");
        }
        if !moved_aside {
            return;
        }

        match self.fs.exists(bak).await {
            Ok(true) => {
                if let Err(e) = self.remove_if_exists(path).await {
                    error!(path = %path.display(), error = %e, "Failed to clear target during rollback");
                }
                match self.fs.rename(bak, path).await {
                    Ok(()) => warn!(path = %path.display(), "Restored previous settings file from backup"),
                    Err(e) => error!(path = %bak.display(), error = %e, "Failed to restore backup"),
                }
            }
            Ok(false) => {}
            Err(e) => error!(path = %bak.display(), error = %e, "Failed to inspect backup during rollback"),
        }
    }

    async fn remove_if_exists(&self, path: &Path) -> PersistResult<bool> {
        if self.fs.exists(path).await? {
            self.fs.remove(path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reconcile files left behind by a crash mid-commit.
    ///
    /// A `.tmp` is never authoritative and is dropped. A `.bak` is the last
    /// good state only when `<path>` is missing (crash between moving the
    /// old file aside and renaming the new one in); otherwise it is stale.
    pub async fn recover(&self, path: &Path) -> PersistResult<RecoveryReport> {
        let tmp = sibling(path, TMP_SUFFIX);
        let bak = sibling(path, BAK_SUFFIX);
        let mut report = RecoveryReport::default();

        if self.remove_if_exists(&tmp).await? {
            warn!(path = %tmp.display(), "Discarded orphaned staging file");
            report.removed_tmp = true;
        }

        if self.fs.exists(&bak).await? {
            if self.fs.exists(path).await? {
                self.fs.remove(&bak).await?;
                info!(path = %bak.display(), "Removed stale backup");
                report.removed_backup = true;
            } else {
                self.fs.rename(&bak, path).await?;
                warn!(path = %path.display(), "Restored settings file from orphaned backup");
                report.restored_backup = true;
            }
        }

        Ok(report)
    }
}
