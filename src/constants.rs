//! Application-wide constants
//!
//! This module contains all magic numbers and string literals used throughout
//! the crate, providing a single source of truth for constant values.

/// On-disk layout of the application data directory
pub mod paths {
    /// Directory name under the platform local-data dir
    pub const APP_DIR: &str = "settings-vault";

    /// Backing file for the `default` profile
    pub const DEFAULT_STORE_FILE: &str = "store.bin";

    /// Prefix for non-default profile files (`store-<name>.bin`)
    pub const PROFILE_STORE_PREFIX: &str = "store-";

    /// Extension shared by every profile backing file
    pub const STORE_EXTENSION: &str = ".bin";

    /// Profile registry (active profile, profile list, shortcuts)
    pub const PROFILES_FILE: &str = "profiles.bin";

    /// Suffix of the staging file written during a commit
    pub const TMP_SUFFIX: &str = ".tmp";

    /// Suffix of the last-known-good copy held during a commit
    pub const BAK_SUFFIX: &str = ".bak";
}

/// Profile registry constants
pub mod profiles {
    /// Distinguished profile that always exists and can never be deleted
    pub const DEFAULT_PROFILE: &str = "default";

    /// Registry key holding the active profile name
    pub const KEY_ACTIVE_PROFILE: &str = "activeProfile";

    /// Registry key holding the ordered profile list
    pub const KEY_PROFILES: &str = "profiles";

    /// Registry key holding the profile → shortcut mapping
    pub const KEY_SHORTCUTS: &str = "shortcuts";
}

/// Flatten/merge codec constants
pub mod codec {
    /// Separator joining nested field names into a flat key path.
    /// Field names come from the schema and never contain it.
    pub const KEY_SEPARATOR: char = '.';

    /// Discriminant field of tagged-union entries; objects carrying it are
    /// merged and flattened as one unit
    pub const UNION_TAG: &str = "provider";

    /// Top-level fields kept in memory only; commits skip them
    pub const TRANSIENT_KEYS: &[&str] = &["customSettings"];
}

/// Hydration gate constants
pub mod hydration {
    /// Default time to wait for the initial load before forcing resolution
    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
}

/// Environment variable names read by [`crate::config::StoreConfig`]
pub mod env {
    /// Overrides the application data directory
    pub const DATA_DIR: &str = "SETTINGS_VAULT_DIR";

    /// Overrides the hydration timeout (milliseconds, decimal or 0x-hex)
    pub const HYDRATION_TIMEOUT_MS: &str = "SETTINGS_VAULT_HYDRATION_TIMEOUT_MS";

    /// Log level for the companion CLI
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}
