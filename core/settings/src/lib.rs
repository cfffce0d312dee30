//! Storage settings for the record store.
//!
//! Holds the map of configured providers, which one is active, and where the
//! audit trail is written. [`StorageSettingsService`] resolves configured
//! providers through the provider factory and caches them.

pub mod config;
pub mod service;

pub use config::{
    default_settings_path, ProviderSettings, SettingsVersion, StorageSettings, SETTINGS_FILENAME,
};
pub use service::{ProviderTestResult, StorageSettingsService};
