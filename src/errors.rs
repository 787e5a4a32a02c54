//! Error taxonomy for the persistence engine.
//!
//! Every commit-path failure is reported through [`PersistError`] only after
//! in-memory state has been rolled back, so callers can treat an `Err` as
//! "nothing changed". Hydration timeouts are not errors: they end in
//! [`crate::hydration::HydrationState::TimedOut`].

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    /// A filesystem operation failed.
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value could not be represented in (or read back from) the backing store.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The request was rejected before any state was touched.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

impl PersistError {
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
