//! Persistent, profile-aware settings with atomic commits and a hydration
//! gate for operations issued before the initial load.

pub mod backing;
pub mod codec;
pub mod commit;
pub mod config;
pub mod constants;
pub mod errors;
pub mod hydration;
pub mod profiles;
pub mod state;

pub use config::{Settings, StoreConfig, User};
pub use errors::{PersistError, PersistResult};
pub use hydration::HydrationState;
pub use state::SettingsStore;
