//! Reactive settings state
//!
//! [`SettingsStore`] is what the rest of the application talks to. It holds
//! the visible `Settings` snapshot behind a watch channel, routes every
//! mutation through the hydration gate, applies it optimistically and then
//! commits it to the active profile's file. A failed commit restores the
//! snapshot taken before the mutation, so a rejected change leaves nothing
//! behind in memory or on disk.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backing::{FileOps, JsonStoreOpener, StoreOpener, TokioFs, read_all};
use crate::codec::{self, FlatMap};
use crate::commit::{CommitEngine, CommitMode, RecoveryReport};
use crate::config::{SchemaDefaults, Settings, StoreConfig, User};
use crate::errors::{PersistError, PersistResult};
use crate::hydration::{HydrationGate, HydrationState};
use crate::profiles::{ProfileRegistry, ProfileRouter};

pub struct SettingsStore {
    config: StoreConfig,
    engine: Arc<CommitEngine>,
    router: ProfileRouter,
    gate: HydrationGate,
    state: watch::Sender<Arc<Settings>>,
    /// Held from snapshot to commit so one mutation never restores a
    /// snapshot that predates another's successful commit
    serial: Arc<Mutex<()>>,
}

impl SettingsStore {
    /// Store over JSON files in `config.data_dir`, holding platform defaults
    /// until hydrated
    pub fn open(config: StoreConfig) -> PersistResult<Arc<Self>> {
        Self::with_backends(
            config,
            Arc::new(JsonStoreOpener),
            Arc::new(TokioFs),
            &Settings::default(),
        )
    }

    pub fn with_backends(
        config: StoreConfig,
        opener: Arc<dyn StoreOpener>,
        fs: Arc<dyn FileOps>,
        defaults: &Settings,
    ) -> PersistResult<Arc<Self>> {
        let schema = Arc::new(SchemaDefaults::new(defaults)?);
        let engine = Arc::new(CommitEngine::new(opener, fs, schema));
        let router = ProfileRouter::new(&config.data_dir, engine.clone());
        let (state, _) = watch::channel(Arc::new(defaults.clone()));

        Ok(Arc::new(Self {
            config,
            engine,
            router,
            gate: HydrationGate::new(),
            state,
            serial: Arc::new(Mutex::new(())),
        }))
    }

    /// Current settings snapshot
    pub fn get(&self) -> Arc<Settings> {
        self.state.borrow().clone()
    }

    /// Receiver notified with every new snapshot, including rollbacks
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.state.subscribe()
    }

    pub fn is_hydrated(&self) -> bool {
        self.gate.is_hydrated()
    }

    pub async fn pending_operations(&self) -> usize {
        self.gate.pending_len().await
    }

    // --- hydration ---

    /// Load the registry and the active profile, then resolve the gate.
    ///
    /// Load failures are logged and leave the defaults in place; hydration
    /// itself never fails.
    pub async fn hydrate(&self) -> HydrationState {
        self.router.hydrate().await;

        let loaded = match self.load_active().await {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "Failed to load settings, keeping defaults");
                self.get().as_ref().clone()
            }
        };

        let applied = self
            .gate
            .resolve_with(HydrationState::Resolved, || {
                self.state.send_replace(Arc::new(loaded));
            })
            .await;
        if !applied {
            warn!("Hydration finished after the gate was resolved, loaded settings discarded; reload the store to pick them up");
        }
        self.gate.state()
    }

    pub fn spawn_hydration(self: &Arc<Self>) -> JoinHandle<HydrationState> {
        let this = self.clone();
        tokio::spawn(async move { this.hydrate().await })
    }

    /// Wait for hydration, forcing it after the configured timeout
    pub async fn await_hydration(&self) -> HydrationState {
        self.gate.await_hydration(self.config.hydration_timeout).await
    }

    async fn load_active(&self) -> PersistResult<Settings> {
        let path = self.router.resolve_active_store_path().await;
        let report = self.engine.recover(&path).await?;
        if !report.is_clean() {
            info!(path = %path.display(), ?report, "Reconciled leftover commit files");
        }

        let handle = self.router.active_store().await?;
        let mut store = handle.lock().await;
        store.reload().await?;
        let flat = read_all(store.as_ref()).await?;
        debug!(path = %path.display(), keys = flat.len(), "Read settings from disk");
        self.over_defaults(&flat)
    }

    async fn load_profile(&self, path: &Path) -> PersistResult<Settings> {
        self.engine.recover(path).await?;
        let store = self.engine.opener().open(path).await?;
        self.over_defaults(&read_all(store.as_ref()).await?)
    }

    fn over_defaults(&self, flat: &FlatMap) -> PersistResult<Settings> {
        let loaded = Value::Object(codec::unflatten(flat));
        match codec::deep_merge(self.engine.defaults().as_value(), &loaded) {
            Value::Object(object) => Settings::from_object(object),
            other => Err(PersistError::Serialization(format!(
                "settings merged into a non-object value: {other}"
            ))),
        }
    }

    /// Run `op` now, or after hydration if it has not resolved yet. Gated
    /// operations run one at a time.
    async fn gated<F, Fut, T>(self: &Arc<Self>, op: F) -> PersistResult<T>
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = PersistResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        self.gate
            .enqueue_or_run(move || async move {
                let _serial = this.serial.clone().lock_owned().await;
                op(this).await
            })
            .await
            .unwrap_or_else(|| {
                Err(PersistError::invalid(
                    "settings store closed before the operation ran",
                ))
            })
    }

    // --- mutations ---

    /// Deep-merge `patch` into the settings and persist the touched fields.
    /// `null` leaves reset to their defaults.
    pub async fn update(self: &Arc<Self>, patch: Value) -> PersistResult<()> {
        self.gated(move |this| async move { this.apply_update(patch).await })
            .await
    }

    async fn apply_update(&self, patch: Value) -> PersistResult<()> {
        let Value::Object(patch) = patch else {
            return Err(PersistError::invalid("settings update must be an object"));
        };

        let defaults = self.engine.defaults();
        let normalized: FlatMap = codec::flatten(&patch)
            .into_iter()
            .map(|(key, value)| {
                let value = if value.is_null() {
                    defaults.default_for_key(&key)
                } else {
                    value
                };
                (key, value)
            })
            .collect();
        let normalized = Value::Object(codec::unflatten(&normalized));

        let tx = Transaction::begin(self);
        let current = Value::Object(tx.before().to_object()?);
        let next = match codec::deep_merge(&current, &normalized) {
            Value::Object(object) => Settings::from_object(object)?,
            _ => return Err(PersistError::invalid("settings update must be an object")),
        };
        let touched = normalized
            .as_object()
            .map(|object| object.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        let updates = self.subtree_updates(&next, &touched)?;

        tx.apply(next, updates).commit(CommitMode::Merge).await
    }

    /// Flattened new values of each top-level field in `touched`, so the
    /// file holds exactly what memory holds for those fields
    fn subtree_updates(&self, next: &Settings, touched: &[String]) -> PersistResult<FlatMap> {
        let object = next.to_object()?;
        let mut updates = FlatMap::new();
        for key in touched {
            match object.get(key) {
                Some(value) => {
                    let mut single = Map::new();
                    single.insert(key.clone(), value.clone());
                    updates.extend(codec::flatten(&single));
                }
                None => {
                    updates.insert(key.clone(), self.engine.defaults().default_for_key(key));
                }
            }
        }
        Ok(updates)
    }

    /// Restore every field to its default; the file is rewritten to hold
    /// only the defaults
    pub async fn reset_all(self: &Arc<Self>) -> PersistResult<()> {
        self.gated(|this| async move {
            let next = this.engine.defaults().settings()?;
            let updates = next.flatten()?;
            Transaction::begin(&this)
                .apply(next, updates)
                .commit(CommitMode::Replace)
                .await?;
            info!("Reset all settings to defaults");
            Ok(())
        })
        .await
    }

    /// Restore one field (a flat key path) to its default
    pub async fn reset_field(self: &Arc<Self>, key: impl Into<String>) -> PersistResult<()> {
        let key = key.into();
        self.gated(move |this| async move { this.apply_reset_field(&key).await })
            .await
    }

    async fn apply_reset_field(&self, key: &str) -> PersistResult<()> {
        let defaults = self.engine.defaults();
        if key.is_empty() || !defaults.knows(key) {
            return Err(PersistError::invalid(format!("unknown settings key {key:?}")));
        }

        let tx = Transaction::begin(self);
        let mut object = tx.before().to_object()?;
        codec::replace_at(&mut object, key, defaults.default_for_key(key));
        let next = Settings::from_object(object)?;

        let top = key
            .split(crate::constants::codec::KEY_SEPARATOR)
            .next()
            .unwrap_or(key)
            .to_string();
        let updates = self.subtree_updates(&next, &[top])?;

        tx.apply(next, updates).commit(CommitMode::Merge).await?;
        debug!(key = %key, "Reset settings field");
        Ok(())
    }

    /// Merge account fields into `settings.user`
    pub async fn load_user(self: &Arc<Self>, user: User) -> PersistResult<()> {
        let mut patch = Map::new();
        patch.insert("user".to_string(), serde_json::to_value(user)?);
        self.update(Value::Object(patch)).await
    }

    // --- reload / reset signals ---

    /// Re-read the active file and merge it into the current state. Used
    /// after another process changed the file.
    pub async fn reload_store(self: &Arc<Self>) -> PersistResult<()> {
        self.gated(|this| async move {
            let handle = this.router.active_store().await?;
            let flat = {
                let mut store = handle.lock().await;
                store.reload().await?;
                read_all(store.as_ref()).await?
            };

            let current = Value::Object(this.get().to_object()?);
            let loaded = Value::Object(codec::unflatten(&flat));
            let next = match codec::deep_merge(&current, &loaded) {
                Value::Object(object) => Settings::from_object(object)?,
                other => {
                    return Err(PersistError::Serialization(format!(
                        "settings merged into a non-object value: {other}"
                    )));
                }
            };
            this.state.send_replace(Arc::new(next));
            debug!(keys = flat.len(), "Reloaded settings from disk");
            Ok(())
        })
        .await
    }

    /// Drop the cached handle onto the active file
    pub async fn reset_store(&self) {
        self.router.invalidate().await;
    }

    /// Reconcile leftover commit files for the active profile and the registry
    pub async fn recover(&self) -> PersistResult<RecoveryReport> {
        let path = self.router.resolve_active_store_path().await;
        let registry = self.engine.recover(&self.router.registry_path()).await?;
        let store = self.engine.recover(&path).await?;
        Ok(RecoveryReport {
            removed_tmp: registry.removed_tmp || store.removed_tmp,
            restored_backup: registry.restored_backup || store.restored_backup,
            removed_backup: registry.removed_backup || store.removed_backup,
        })
    }

    // --- profiles ---

    pub async fn registry(&self) -> ProfileRegistry {
        self.router.registry().await
    }

    /// Make `name` active and show its settings
    pub async fn switch_profile(self: &Arc<Self>, name: impl Into<String>) -> PersistResult<()> {
        let name = name.into();
        self.gated(move |this| async move {
            if !this.router.registry().await.contains(&name) {
                return Err(PersistError::invalid(format!("unknown profile {name:?}")));
            }
            let settings = this.load_profile(&this.router.store_path_for(&name)).await?;
            this.router.set_active_profile(&name).await?;
            this.state.send_replace(Arc::new(settings));
            Ok(())
        })
        .await
    }

    /// New profile seeded with the current settings
    pub async fn create_profile(self: &Arc<Self>, name: impl Into<String>) -> PersistResult<()> {
        let name = name.into();
        self.gated(move |this| async move {
            let seed = this.get();
            this.router.create_profile(&name, &seed).await
        })
        .await
    }

    /// Delete a profile; deleting the active one shows the default profile
    pub async fn delete_profile(self: &Arc<Self>, name: impl Into<String>) -> PersistResult<()> {
        let name = name.into();
        self.gated(move |this| async move {
            let was_active = this.router.active_profile().await == name;
            this.router.delete_profile(&name).await?;
            if was_active {
                let path = this.router.resolve_active_store_path().await;
                match this.load_profile(&path).await {
                    Ok(settings) => {
                        this.state.send_replace(Arc::new(settings));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to load default profile after delete, showing defaults");
                        this.state
                            .send_replace(Arc::new(this.engine.defaults().settings()?));
                    }
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn update_shortcut(
        self: &Arc<Self>,
        profile: impl Into<String>,
        shortcut: impl Into<String>,
    ) -> PersistResult<()> {
        let (profile, shortcut) = (profile.into(), shortcut.into());
        self.gated(move |this| async move {
            this.router.update_shortcut(&profile, &shortcut).await
        })
        .await
    }
}

/// Optimistic mutation: `begin` takes the snapshot, `apply` publishes the
/// new state, `commit` persists it or puts the snapshot back
struct Transaction<'a> {
    store: &'a SettingsStore,
    before: Arc<Settings>,
}

struct Applied<'a> {
    store: &'a SettingsStore,
    before: Arc<Settings>,
    updates: FlatMap,
}

impl<'a> Transaction<'a> {
    fn begin(store: &'a SettingsStore) -> Self {
        Self {
            store,
            before: store.get(),
        }
    }

    fn before(&self) -> &Settings {
        &self.before
    }

    fn apply(self, next: Settings, updates: FlatMap) -> Applied<'a> {
        self.store.state.send_replace(Arc::new(next));
        Applied {
            store: self.store,
            before: self.before,
            updates,
        }
    }
}

impl Applied<'_> {
    async fn commit(self, mode: CommitMode) -> PersistResult<()> {
        let path = self.store.router.resolve_active_store_path().await;
        match self.store.engine.commit_with(&path, &self.updates, mode).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(path = %path.display(), keys = self.updates.len(), error = %err, "Settings change rejected, restoring previous state");
                self.store.state.send_replace(self.before);
                Err(err)
            }
        }
    }
}
