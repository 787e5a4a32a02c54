//! Configuration for the settings store
//!
//! This module provides two pieces:
//! - **schema**: the `Settings` object and its defaults
//! - **options**: `StoreConfig`, where files live and how long hydration may take

pub mod options;
pub mod schema;

// Re-export commonly used types
pub use options::StoreConfig;
pub use schema::{SchemaDefaults, Settings, User};
