//! Provider factory for tag-based provider construction.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use eqms_audit::AuditTrail;
use eqms_common::{Error, Result};

use crate::local::{LocalConfig, LocalFileStorageProvider};
use crate::object::{AzureConfig, GcsConfig, MemoryConfig, ObjectStoreProvider, S3Config};
use crate::provider::StorageProvider;
use crate::sharepoint::create_sharepoint_provider;

/// Factory function type for creating providers.
pub type ProviderFactory =
    Box<dyn Fn(Value, AuditTrail) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

/// Parse a provider config, treating `null` as an empty object.
pub fn parse_config<T: DeserializeOwned>(tag: &str, config: Value) -> Result<T> {
    let config = match config {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(config)
        .map_err(|e| Error::Configuration(format!("Invalid {} config: {}", tag, e)))
}

/// Registry of storage provider factories keyed by provider tag.
pub struct StorageProviderFactory {
    factories: HashMap<String, ProviderFactory>,
}

impl StorageProviderFactory {
    /// Create a new empty factory.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Factory knowing every built-in provider:
    /// `local`, `memory`, `s3`, `azure`, `gcp` and `sharepoint`.
    pub fn with_default_providers() -> Self {
        let mut factory = Self::new();
        factory.insert(
            "local",
            Box::new(|config, audit| {
                let config: LocalConfig = parse_config("local", config)?;
                Ok(Arc::new(LocalFileStorageProvider::from_config(config, audit)?))
            }),
        );
        factory.insert(
            "memory",
            Box::new(|config, audit| {
                let config: MemoryConfig = parse_config("memory", config)?;
                Ok(Arc::new(ObjectStoreProvider::memory(config, audit)?))
            }),
        );
        factory.insert(
            "s3",
            Box::new(|config, audit| {
                let config: S3Config = parse_config("s3", config)?;
                Ok(Arc::new(ObjectStoreProvider::s3(config, audit)?))
            }),
        );
        factory.insert(
            "azure",
            Box::new(|config, audit| {
                let config: AzureConfig = parse_config("azure", config)?;
                Ok(Arc::new(ObjectStoreProvider::azure(config, audit)?))
            }),
        );
        factory.insert(
            "gcp",
            Box::new(|config, audit| {
                let config: GcsConfig = parse_config("gcp", config)?;
                Ok(Arc::new(ObjectStoreProvider::gcs(config, audit)?))
            }),
        );
        factory.insert("sharepoint", Box::new(create_sharepoint_provider));
        factory
    }

    fn insert(&mut self, name: &str, factory: ProviderFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Register a provider factory.
    ///
    /// # Preconditions
    /// - `name` must be unique within the factory
    ///
    /// # Postconditions
    /// - Factory is registered and can be resolved by name
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a provider by tag and configuration.
    ///
    /// # Errors
    /// - `NotFound` for an unknown tag
    /// - `Configuration` when the config does not fit the provider
    pub fn resolve(
        &self,
        name: &str,
        config: Value,
        audit: AuditTrail,
    ) -> Result<Arc<dyn StorageProvider>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Provider '{}' is not registered", name))
        })?;
        factory(config, audit)
    }

    /// Registered provider tags, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StorageProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_factory() -> ProviderFactory {
        Box::new(|config, audit| {
            let config: MemoryConfig = parse_config("memory", config)?;
            Ok(Arc::new(ObjectStoreProvider::memory(config, audit)?))
        })
    }

    #[test]
    fn test_register_and_resolve() {
        let mut factory = StorageProviderFactory::new();
        factory.register("test", memory_factory()).unwrap();

        let provider = factory
            .resolve("test", Value::Null, AuditTrail::in_memory())
            .unwrap();
        assert_eq!(provider.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut factory = StorageProviderFactory::new();
        factory.register("test", memory_factory()).unwrap();

        let result = factory.register("test", memory_factory());
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let factory = StorageProviderFactory::with_default_providers();
        let result = factory.resolve("dropbox", Value::Null, AuditTrail::in_memory());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_providers_sorted() {
        let factory = StorageProviderFactory::with_default_providers();
        assert_eq!(
            factory.providers(),
            vec!["azure", "gcp", "local", "memory", "s3", "sharepoint"]
        );
        assert!(factory.has_provider("local"));
        assert!(!factory.has_provider("dropbox"));
    }

    #[test]
    fn test_resolve_local() {
        let temp = TempDir::new().unwrap();
        let factory = StorageProviderFactory::with_default_providers();
        let provider = factory
            .resolve(
                "local",
                serde_json::json!({ "root": temp.path().join("records") }),
                AuditTrail::in_memory(),
            )
            .unwrap();
        assert_eq!(provider.name(), "local");
        assert!(temp.path().join("records").is_dir());
    }

    #[test]
    fn test_invalid_config_is_configuration_error() {
        let factory = StorageProviderFactory::with_default_providers();
        for (tag, config) in [
            ("local", serde_json::json!({})),
            ("s3", serde_json::json!({ "bucket": "b" })),
            ("azure", serde_json::json!({ "account": 1 })),
            ("sharepoint", serde_json::json!({ "site_id": "s" })),
        ] {
            let result = factory.resolve(tag, config, AuditTrail::in_memory());
            assert!(
                matches!(result, Err(Error::Configuration(_))),
                "{} accepted a bad config",
                tag
            );
        }
    }
}
