//! Runtime configuration for the settings store
//!
//! Resolution order: explicit overrides (CLI flags) > environment > defaults.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, warn};

use crate::constants::{self, paths};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding `profiles.bin` and every profile's backing file
    pub data_dir: PathBuf,
    /// How long `await_hydration` waits before forcing resolution
    pub hydration_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            hydration_timeout: Duration::from_millis(constants::hydration::DEFAULT_TIMEOUT_MS),
        }
    }
}

fn default_data_dir() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(paths::APP_DIR);
    path
}

impl StoreConfig {
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(
            env::var(constants::env::DATA_DIR).ok().as_deref(),
            env::var(constants::env::HYDRATION_TIMEOUT_MS).ok().as_deref(),
        );
        config
    }

    /// Apply raw override strings; invalid values are logged and ignored
    pub fn apply_overrides(&mut self, data_dir: Option<&str>, timeout_ms: Option<&str>) {
        if let Some(dir) = data_dir.map(str::trim) {
            if dir.is_empty() {
                warn!(var = constants::env::DATA_DIR, "Empty data dir override ignored");
            } else {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Some(raw) = timeout_ms
            && let Some(ms) = parse_millis(raw)
        {
            self.hydration_timeout = Duration::from_millis(ms);
        }
    }
}

/// Accepts decimal or `0x`-prefixed hex
fn parse_millis(raw: &str) -> Option<u64> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed
        .inspect_err(|e| error!(value = %raw, error = ?e, "failed to parse hydration timeout"))
        .ok()
}
