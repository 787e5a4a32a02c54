//! Profile router
//!
//! Maps profile names to backing files (`default` → `store.bin`, anything
//! else → `store-<name>.bin`) and keeps the registry (`activeProfile`,
//! `profiles`, `shortcuts`) in `profiles.bin`. Owns the handle to the active
//! profile's backing store; switching or deleting the active profile drops
//! that handle so the next access re-opens the right file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backing::{BackingStore, read_all};
use crate::codec::FlatMap;
use crate::commit::CommitEngine;
use crate::config::Settings;
use crate::constants::paths::{
    BAK_SUFFIX, DEFAULT_STORE_FILE, PROFILE_STORE_PREFIX, PROFILES_FILE, STORE_EXTENSION,
    TMP_SUFFIX,
};
use crate::constants::profiles::{DEFAULT_PROFILE, KEY_ACTIVE_PROFILE, KEY_PROFILES, KEY_SHORTCUTS};
use crate::errors::{PersistError, PersistResult};

/// Shared handle onto the active profile's backing store
pub type SharedStore = Arc<Mutex<Box<dyn BackingStore>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRegistry {
    pub active_profile: String,
    pub profiles: Vec<String>,
    pub shortcuts: BTreeMap<String, String>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self {
            active_profile: DEFAULT_PROFILE.to_string(),
            profiles: vec![DEFAULT_PROFILE.to_string()],
            shortcuts: BTreeMap::new(),
        }
    }
}

impl ProfileRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.profiles.iter().any(|p| p == name)
    }

    /// Restore invariants on data read from disk: `default` always listed,
    /// no duplicates, active pointer names a listed profile
    fn normalized(mut self) -> Self {
        let mut seen = Vec::with_capacity(self.profiles.len() + 1);
        for name in self.profiles.drain(..) {
            if !name.is_empty() && !seen.contains(&name) {
                seen.push(name);
            }
        }
        if !seen.iter().any(|p| p == DEFAULT_PROFILE) {
            seen.insert(0, DEFAULT_PROFILE.to_string());
        }
        self.profiles = seen;

        if !self.contains(&self.active_profile) {
            warn!(profile = %self.active_profile, "Active profile not in registry, falling back to default");
            self.active_profile = DEFAULT_PROFILE.to_string();
        }
        let profiles = self.profiles.clone();
        self.shortcuts.retain(|name, _| profiles.contains(name));
        self
    }

    fn to_flat(&self) -> FlatMap {
        let mut flat = FlatMap::new();
        flat.insert(
            KEY_ACTIVE_PROFILE.to_string(),
            Value::String(self.active_profile.clone()),
        );
        flat.insert(
            KEY_PROFILES.to_string(),
            Value::Array(self.profiles.iter().cloned().map(Value::String).collect()),
        );
        flat.insert(
            KEY_SHORTCUTS.to_string(),
            Value::Object(
                self.shortcuts
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        flat
    }

    fn from_flat(flat: &FlatMap) -> PersistResult<Self> {
        let mut registry = Self::default();
        if let Some(value) = flat.get(KEY_ACTIVE_PROFILE) {
            registry.active_profile = serde_json::from_value(value.clone())?;
        }
        if let Some(value) = flat.get(KEY_PROFILES) {
            registry.profiles = serde_json::from_value(value.clone())?;
        }
        if let Some(value) = flat.get(KEY_SHORTCUTS) {
            registry.shortcuts = serde_json::from_value(value.clone())?;
        }
        Ok(registry.normalized())
    }
}

/// File name backing a profile
pub fn store_file_name(profile: &str) -> String {
    if profile == DEFAULT_PROFILE {
        DEFAULT_STORE_FILE.to_string()
    } else {
        format!("{PROFILE_STORE_PREFIX}{profile}{STORE_EXTENSION}")
    }
}

fn validate_new_name(name: &str, registry: &ProfileRegistry) -> PersistResult<()> {
    if name.trim().is_empty() {
        return Err(PersistError::invalid("profile name must not be empty"));
    }
    if name == DEFAULT_PROFILE {
        return Err(PersistError::invalid("the default profile already exists"));
    }
    if name.contains(['/', '\\']) || name.contains("..") || name.starts_with('.') {
        return Err(PersistError::invalid(format!(
            "profile name {name:?} must not contain path components"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(PersistError::invalid(format!(
            "profile name {name:?} contains control characters"
        )));
    }
    if registry.contains(name) {
        return Err(PersistError::invalid(format!("profile {name:?} already exists")));
    }
    Ok(())
}

struct ActiveHandle {
    profile: String,
    store: SharedStore,
}

pub struct ProfileRouter {
    data_dir: PathBuf,
    engine: Arc<CommitEngine>,
    registry: Mutex<ProfileRegistry>,
    handle: Mutex<Option<ActiveHandle>>,
}

impl ProfileRouter {
    pub fn new(data_dir: impl AsRef<Path>, engine: Arc<CommitEngine>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            engine,
            registry: Mutex::new(ProfileRegistry::default()),
            handle: Mutex::new(None),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(PROFILES_FILE)
    }

    pub fn store_path_for(&self, profile: &str) -> PathBuf {
        self.data_dir.join(store_file_name(profile))
    }

    /// Re-read the registry from disk. Unreadable registries fall back to
    /// the default registry so startup never fails on them.
    pub async fn hydrate(&self) -> ProfileRegistry {
        let loaded = match self.read_registry().await {
            Ok(registry) => registry,
            Err(e) => {
                error!(path = %self.registry_path().display(), error = %e, "Failed to load profile registry, using default");
                ProfileRegistry::default()
            }
        };

        let mut registry = self.registry.lock().await;
        if registry.active_profile != loaded.active_profile {
            self.invalidate().await;
        }
        *registry = loaded.clone();
        info!(active = %loaded.active_profile, count = loaded.profiles.len(), "Loaded profile registry");
        loaded
    }

    async fn read_registry(&self) -> PersistResult<ProfileRegistry> {
        let path = self.registry_path();
        self.engine.recover(&path).await?;
        let store = self.engine.opener().open(&path).await?;
        ProfileRegistry::from_flat(&read_all(store.as_ref()).await?)
    }

    async fn persist_registry(&self, registry: &ProfileRegistry) -> PersistResult<()> {
        self.engine
            .commit_replace(&self.registry_path(), &registry.to_flat())
            .await
    }

    pub async fn registry(&self) -> ProfileRegistry {
        self.registry.lock().await.clone()
    }

    pub async fn active_profile(&self) -> String {
        self.registry.lock().await.active_profile.clone()
    }

    pub async fn list_profiles(&self) -> Vec<String> {
        self.registry.lock().await.profiles.clone()
    }

    pub async fn resolve_active_store_path(&self) -> PathBuf {
        let active = self.active_profile().await;
        self.store_path_for(&active)
    }

    /// Handle onto the active profile's store, opened on first use
    pub async fn active_store(&self) -> PersistResult<SharedStore> {
        let profile = self.active_profile().await;
        let mut handle = self.handle.lock().await;
        if let Some(current) = handle.as_ref()
            && current.profile == profile
        {
            return Ok(current.store.clone());
        }

        let store = self
            .engine
            .opener()
            .open(&self.store_path_for(&profile))
            .await?;
        let store: SharedStore = Arc::new(Mutex::new(store));
        debug!(profile = %profile, "Opened backing store handle");
        *handle = Some(ActiveHandle {
            profile,
            store: store.clone(),
        });
        Ok(store)
    }

    /// Drop the cached active-store handle
    pub async fn invalidate(&self) {
        if let Some(old) = self.handle.lock().await.take() {
            debug!(profile = %old.profile, "Invalidated backing store handle");
        }
    }

    /// Apply `change` to the registry and persist it; restores the previous
    /// registry if persisting fails
    async fn mutate_registry(
        &self,
        change: impl FnOnce(&mut ProfileRegistry) -> PersistResult<()>,
    ) -> PersistResult<ProfileRegistry> {
        let mut registry = self.registry.lock().await;
        let snapshot = registry.clone();
        let result = match change(&mut registry) {
            Ok(()) => self.persist_registry(&registry).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            *registry = snapshot;
            return Err(err);
        }
        Ok(snapshot)
    }

    pub async fn set_active_profile(&self, name: &str) -> PersistResult<()> {
        let previous = self
            .mutate_registry(|registry| {
                if !registry.contains(name) {
                    return Err(PersistError::invalid(format!("unknown profile {name:?}")));
                }
                registry.active_profile = name.to_string();
                Ok(())
            })
            .await?;

        if previous.active_profile != name {
            self.invalidate().await;
            info!(from = %previous.active_profile, to = %name, "Switched active profile");
        }
        Ok(())
    }

    pub async fn update_shortcut(&self, profile: &str, shortcut: &str) -> PersistResult<()> {
        self.mutate_registry(|registry| {
            if !registry.contains(profile) {
                return Err(PersistError::invalid(format!("unknown profile {profile:?}")));
            }
            registry
                .shortcuts
                .insert(profile.to_string(), shortcut.to_string());
            Ok(())
        })
        .await?;
        info!(profile = %profile, shortcut = %shortcut, "Updated profile shortcut");
        Ok(())
    }

    /// Create a profile whose file starts as a full copy of `seed`.
    ///
    /// The file is written before the profile becomes visible in the list;
    /// a failure at either step leaves the list as it was.
    pub async fn create_profile(&self, name: &str, seed: &Settings) -> PersistResult<()> {
        let mut registry = self.registry.lock().await;
        validate_new_name(name, &registry)?;

        let path = self.store_path_for(name);
        let seed_fields: FlatMap = seed.to_object()?.into_iter().collect();
        self.engine.commit_replace(&path, &seed_fields).await?;

        let snapshot = registry.clone();
        registry.profiles.push(name.to_string());
        if let Err(err) = self.persist_registry(&registry).await {
            *registry = snapshot;
            if let Err(e) = self.remove_profile_files(name).await {
                warn!(profile = %name, error = %e, "Failed to remove seeded file after registry failure");
            }
            return Err(err);
        }

        info!(profile = %name, path = %path.display(), "Created profile");
        Ok(())
    }

    /// Delete a profile and its backing file. The default profile is
    /// rejected; deleting the active profile falls back to default.
    pub async fn delete_profile(&self, name: &str) -> PersistResult<()> {
        if name == DEFAULT_PROFILE {
            return Err(PersistError::invalid("the default profile cannot be deleted"));
        }

        let mut registry = self.registry.lock().await;
        if !registry.contains(name) {
            return Err(PersistError::invalid(format!("unknown profile {name:?}")));
        }

        let snapshot = registry.clone();
        registry.profiles.retain(|p| p != name);
        registry.shortcuts.remove(name);
        let was_active = registry.active_profile == name;
        if was_active {
            registry.active_profile = DEFAULT_PROFILE.to_string();
        }

        // registry first: a crash before the file is removed leaves an
        // orphan file, never a listed profile without one
        if let Err(err) = self.persist_registry(&registry).await {
            *registry = snapshot;
            return Err(err);
        }
        if let Err(err) = self.remove_profile_files(name).await {
            *registry = snapshot.clone();
            if let Err(e) = self.persist_registry(&snapshot).await {
                error!(profile = %name, error = %e, "Failed to restore profile registry after delete failure");
            }
            return Err(err);
        }
        drop(registry);

        if was_active {
            self.invalidate().await;
        }
        info!(profile = %name, fell_back = was_active, "Deleted profile");
        Ok(())
    }

    async fn remove_profile_files(&self, name: &str) -> PersistResult<()> {
        let fs = self.engine.fs();
        let path = self.store_path_for(name);
        if fs.exists(&path).await? {
            fs.remove(&path).await?;
        }
        for suffix in [TMP_SUFFIX, BAK_SUFFIX] {
            let leftover = crate::commit::sibling(&path, suffix);
            if let Ok(true) = fs.exists(&leftover).await
                && let Err(e) = fs.remove(&leftover).await
            {
                warn!(path = %leftover.display(), error = %e, "Failed to remove leftover profile file");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::testing::{FaultyFs, FaultyOpener};
    use crate::backing::{JsonStoreOpener, StoreOpener, TokioFs};
    use crate::config::SchemaDefaults;
    use serde_json::json;
    use tempfile::TempDir;

    fn engine_with(opener: Arc<dyn StoreOpener>, fs: Arc<dyn crate::backing::FileOps>) -> Arc<CommitEngine> {
        let defaults = Arc::new(SchemaDefaults::new(&Settings::for_platform("linux")).unwrap());
        Arc::new(CommitEngine::new(opener, fs, defaults))
    }

    fn router(dir: &TempDir) -> ProfileRouter {
        ProfileRouter::new(dir.path(), engine_with(Arc::new(JsonStoreOpener), Arc::new(TokioFs)))
    }

    #[test]
    fn test_store_file_names() {
        assert_eq!(store_file_name("default"), "store.bin");
        assert_eq!(store_file_name("work"), "store-work.bin");
    }

    #[test]
    fn test_normalized_restores_invariants() {
        let registry = ProfileRegistry {
            active_profile: "ghost".to_string(),
            profiles: vec!["work".to_string(), "work".to_string(), String::new()],
            shortcuts: BTreeMap::from([
                ("work".to_string(), "Ctrl+1".to_string()),
                ("ghost".to_string(), "Ctrl+2".to_string()),
            ]),
        }
        .normalized();
        assert_eq!(registry.profiles, vec!["default", "work"]);
        assert_eq!(registry.active_profile, "default");
        assert_eq!(registry.shortcuts.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_directory_has_default_registry() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        assert_eq!(router.hydrate().await, ProfileRegistry::default());
        assert_eq!(
            router.resolve_active_store_path().await,
            dir.path().join("store.bin")
        );
    }

    #[tokio::test]
    async fn test_create_seeds_file_and_persists_list() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        let mut seed = Settings::for_platform("linux");
        seed.port = 4040;

        router.create_profile("work", &seed).await.unwrap();
        assert_eq!(router.list_profiles().await, vec!["default", "work"]);

        let store = JsonStoreOpener
            .open(&dir.path().join("store-work.bin"))
            .await
            .unwrap();
        assert_eq!(store.get("port").await.unwrap(), Some(json!(4040)));
        assert_eq!(
            store.get("embeddedLLM").await.unwrap(),
            Some(json!({ "enabled": false, "model": "llama3.2:1b-instruct-q4_K_M", "port": 11434 }))
        );

        let reopened = self::router(&dir);
        assert_eq!(reopened.hydrate().await.profiles, vec!["default", "work"]);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        let seed = Settings::for_platform("linux");
        router.create_profile("work", &seed).await.unwrap();

        for name in ["", "  ", "default", "work", "../evil", "a/b", ".hidden"] {
            let err = router.create_profile(name, &seed).await.unwrap_err();
            assert!(err.is_invalid_operation(), "{name:?} should be rejected");
        }
        assert_eq!(router.list_profiles().await, vec!["default", "work"]);
    }

    #[tokio::test]
    async fn test_create_seed_failure_keeps_list() {
        let dir = TempDir::new().unwrap();
        let opener = Arc::new(FaultyOpener::default());
        let router = ProfileRouter::new(dir.path(), engine_with(opener.clone(), Arc::new(TokioFs)));
        opener.fail_save_of("store-work.bin.tmp");

        let result = router
            .create_profile("work", &Settings::for_platform("linux"))
            .await;
        assert!(result.is_err());
        assert_eq!(router.list_profiles().await, vec!["default"]);
        assert!(!dir.path().join("store-work.bin").exists());
    }

    #[tokio::test]
    async fn test_create_registry_failure_removes_seeded_file() {
        let dir = TempDir::new().unwrap();
        let opener = Arc::new(FaultyOpener::default());
        let router = ProfileRouter::new(dir.path(), engine_with(opener.clone(), Arc::new(TokioFs)));
        opener.fail_save_of("profiles.bin.tmp");

        let result = router
            .create_profile("work", &Settings::for_platform("linux"))
            .await;
        assert!(result.is_err());
        assert_eq!(router.list_profiles().await, vec!["default"]);
        assert!(!dir.path().join("store-work.bin").exists());
    }

    #[tokio::test]
    async fn test_delete_default_is_rejected() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        let err = router.delete_profile("default").await.unwrap_err();
        assert!(err.is_invalid_operation());
        assert_eq!(router.list_profiles().await, vec!["default"]);
    }

    #[tokio::test]
    async fn test_delete_unknown_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = router(&dir).delete_profile("nope").await.unwrap_err();
        assert!(err.is_invalid_operation());
    }

    #[tokio::test]
    async fn test_delete_active_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        router
            .create_profile("work", &Settings::for_platform("linux"))
            .await
            .unwrap();
        router.update_shortcut("work", "Super+Alt+1").await.unwrap();
        router.set_active_profile("work").await.unwrap();

        router.delete_profile("work").await.unwrap();

        let registry = router.registry().await;
        assert_eq!(registry.active_profile, "default");
        assert_eq!(registry.profiles, vec!["default"]);
        assert!(registry.shortcuts.is_empty());
        assert!(!dir.path().join("store-work.bin").exists());
        assert_eq!(self::router(&dir).hydrate().await, registry);
    }

    #[tokio::test]
    async fn test_delete_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        let fs = Arc::new(FaultyFs::default());
        let router = ProfileRouter::new(dir.path(), engine_with(Arc::new(JsonStoreOpener), fs.clone()));
        router
            .create_profile("work", &Settings::for_platform("linux"))
            .await
            .unwrap();
        router.update_shortcut("work", "Super+Alt+1").await.unwrap();
        router.set_active_profile("work").await.unwrap();
        let before = router.registry().await;

        fs.fail_remove_of("store-work.bin");
        let result = router.delete_profile("work").await;

        assert!(result.is_err());
        assert_eq!(router.registry().await, before);
        assert!(dir.path().join("store-work.bin").exists());
        fs.heal();
        assert_eq!(self::router(&dir).hydrate().await, before);
    }

    #[tokio::test]
    async fn test_switch_rejects_unknown_profile() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        let err = router.set_active_profile("ghost").await.unwrap_err();
        assert!(err.is_invalid_operation());
        assert_eq!(router.active_profile().await, "default");
    }

    #[tokio::test]
    async fn test_switch_replaces_cached_handle() {
        let dir = TempDir::new().unwrap();
        let router = router(&dir);
        router
            .create_profile("work", &Settings::for_platform("linux"))
            .await
            .unwrap();

        let first = router.active_store().await.unwrap();
        let again = router.active_store().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.lock().await.path(), dir.path().join("store.bin"));

        router.set_active_profile("work").await.unwrap();
        let switched = router.active_store().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &switched));
        assert_eq!(switched.lock().await.path(), dir.path().join("store-work.bin"));
    }

    #[tokio::test]
    async fn test_shortcut_for_unknown_profile_rejected() {
        let dir = TempDir::new().unwrap();
        let err = router(&dir).update_shortcut("ghost", "Ctrl+G").await.unwrap_err();
        assert!(err.is_invalid_operation());
    }
}
