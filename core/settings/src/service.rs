//! Settings service: provider map, active provider and provider cache.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use eqms_audit::{AuditTrail, JsonlAuditSink};
use eqms_common::{Error, Result};
use eqms_storage::{ConnectionReport, StorageProvider, StorageProviderFactory};

use crate::config::{validate_key, ProviderSettings, StorageSettings};

/// Connection test outcome for one configured provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderTestResult {
    pub key: String,
    pub provider_type: String,
    /// Probe report, when the provider could be constructed.
    pub report: Option<ConnectionReport>,
    /// Construction error otherwise.
    pub error: Option<String>,
}

impl ProviderTestResult {
    pub fn connected(&self) -> bool {
        self.report.as_ref().map(|r| r.connected).unwrap_or(false)
    }
}

/// Owns the storage settings and hands out configured providers.
///
/// Providers are built on first use and cached until their settings change.
/// All providers share one audit trail.
pub struct StorageSettingsService {
    factory: StorageProviderFactory,
    settings: RwLock<StorageSettings>,
    path: Option<PathBuf>,
    audit: AuditTrail,
    cache: RwLock<HashMap<String, Arc<dyn StorageProvider>>>,
}

impl StorageSettingsService {
    /// Load settings from `path`, falling back to defaults when the file is missing.
    ///
    /// # Postconditions
    /// - Audit trail continues the chain in the configured audit log
    ///
    /// # Errors
    /// - Settings file unreadable or invalid
    /// - Audit log unreadable
    pub async fn load(path: impl AsRef<Path>, factory: StorageProviderFactory) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let settings = match fs::read_to_string(&path).await {
            Ok(json) => StorageSettings::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No settings file, using defaults");
                StorageSettings::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.validate()?;

        let audit = match &settings.audit_log {
            Some(log) => AuditTrail::resume(Arc::new(JsonlAuditSink::open(log).await?)).await?,
            None => AuditTrail::in_memory(),
        };

        Ok(Self::build(factory, settings, Some(path), audit))
    }

    /// Service over settings that are never written to disk, with an in-memory audit trail.
    ///
    /// # Errors
    /// - Settings invalid
    pub fn in_memory(settings: StorageSettings, factory: StorageProviderFactory) -> Result<Self> {
        settings.validate()?;
        Ok(Self::build(factory, settings, None, AuditTrail::in_memory()))
    }

    fn build(
        factory: StorageProviderFactory,
        settings: StorageSettings,
        path: Option<PathBuf>,
        audit: AuditTrail,
    ) -> Self {
        Self {
            factory,
            settings: RwLock::new(settings),
            path,
            audit,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Settings file backing this service, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn factory(&self) -> &StorageProviderFactory {
        &self.factory
    }

    /// Audit trail shared by every provider this service builds.
    pub fn audit_trail(&self) -> AuditTrail {
        self.audit.clone()
    }

    /// Snapshot of the current settings.
    pub async fn settings(&self) -> StorageSettings {
        self.settings.read().await.clone()
    }

    /// Write the settings file. A no-op for in-memory services.
    ///
    /// The file is replaced atomically.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = self.settings.read().await.to_json()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, json).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %path.display(), "Saved storage settings");
        Ok(())
    }

    /// Add or replace a provider entry.
    ///
    /// # Errors
    /// - `InvalidInput` for a malformed key or an unregistered provider type
    /// - `NotPermitted` when disabling the active provider
    pub async fn upsert_provider(&self, key: &str, provider: ProviderSettings) -> Result<()> {
        validate_key(key)?;
        if !self.factory.has_provider(&provider.provider_type) {
            return Err(Error::InvalidInput(format!(
                "Unknown provider type '{}' (available: {})",
                provider.provider_type,
                self.factory.providers().join(", ")
            )));
        }

        let mut settings = self.settings.write().await;
        if settings.active_provider == key && !provider.enabled {
            return Err(Error::NotPermitted(format!(
                "Cannot disable the active provider '{}'",
                key
            )));
        }
        settings.providers.insert(key.to_string(), provider);
        settings.touch();
        self.cache.write().await.remove(key);

        info!(key, "Provider settings updated");
        Ok(())
    }

    /// Remove a provider entry.
    ///
    /// # Errors
    /// - `NotFound` for an unknown key
    /// - `NotPermitted` for the active provider
    pub async fn remove_provider(&self, key: &str) -> Result<ProviderSettings> {
        let mut settings = self.settings.write().await;
        if settings.active_provider == key {
            return Err(Error::NotPermitted(format!(
                "Cannot remove the active provider '{}'",
                key
            )));
        }
        let removed = settings
            .providers
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not configured", key)))?;
        settings.touch();
        self.cache.write().await.remove(key);

        info!(key, "Provider removed");
        Ok(removed)
    }

    /// Make a configured, enabled provider the active one.
    pub async fn set_active(&self, key: &str) -> Result<()> {
        let mut settings = self.settings.write().await;
        match settings.providers.get(key) {
            None => {
                return Err(Error::NotFound(format!(
                    "Provider '{}' is not configured",
                    key
                )))
            }
            Some(provider) if !provider.enabled => {
                return Err(Error::NotPermitted(format!(
                    "Provider '{}' is disabled",
                    key
                )))
            }
            Some(_) => {}
        }
        settings.active_provider = key.to_string();
        settings.touch();

        info!(key, "Active provider changed");
        Ok(())
    }

    /// Enable or disable a provider. The active provider cannot be disabled.
    pub async fn set_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        let mut settings = self.settings.write().await;
        if !enabled && settings.active_provider == key {
            return Err(Error::NotPermitted(format!(
                "Cannot disable the active provider '{}'",
                key
            )));
        }
        let provider = settings
            .providers
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not configured", key)))?;
        provider.enabled = enabled;
        settings.touch();
        self.cache.write().await.remove(key);
        Ok(())
    }

    /// Provider configured under `key`, built on first use.
    ///
    /// # Errors
    /// - `NotFound` for an unknown key
    /// - `NotPermitted` for a disabled provider
    /// - Whatever the provider factory reports for its configuration
    pub async fn provider(&self, key: &str) -> Result<Arc<dyn StorageProvider>> {
        if let Some(provider) = self.cache.read().await.get(key) {
            return Ok(provider.clone());
        }

        // Lock order: settings, then cache. Holding both keeps a concurrent
        // upsert from invalidating between our read and our insert.
        let settings = self.settings.read().await;
        let mut cache = self.cache.write().await;
        if let Some(provider) = cache.get(key) {
            return Ok(provider.clone());
        }

        let entry = settings
            .providers
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not configured", key)))?;
        if !entry.enabled {
            return Err(Error::NotPermitted(format!("Provider '{}' is disabled", key)));
        }

        let provider = self
            .factory
            .resolve(&entry.provider_type, entry.config.clone(), self.audit.clone())?;
        cache.insert(key.to_string(), provider.clone());

        debug!(key, provider_type = %entry.provider_type, "Provider constructed");
        Ok(provider)
    }

    /// The active provider.
    pub async fn active_provider(&self) -> Result<Arc<dyn StorageProvider>> {
        let key = self.settings.read().await.active_provider.clone();
        self.provider(&key).await
    }

    /// Probe every enabled provider concurrently.
    pub async fn test_all(&self) -> Vec<ProviderTestResult> {
        let entries: Vec<(String, String)> = {
            let settings = self.settings.read().await;
            settings
                .providers
                .iter()
                .filter(|(_, p)| p.enabled)
                .map(|(key, p)| (key.clone(), p.provider_type.clone()))
                .collect()
        };

        join_all(entries.into_iter().map(|(key, provider_type)| async move {
            match self.provider(&key).await {
                Ok(provider) => ProviderTestResult {
                    key,
                    provider_type,
                    report: Some(provider.test_connection().await),
                    error: None,
                },
                Err(e) => ProviderTestResult {
                    key,
                    provider_type,
                    report: None,
                    error: Some(e.to_string()),
                },
            }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use eqms_storage::{FileMetadata, UploadOptions};
    use eqms_common::StoragePath;
    use tempfile::TempDir;

    fn memory_settings() -> StorageSettings {
        let mut settings = StorageSettings::defaults_in(Path::new("/unused"));
        settings.providers.clear();
        settings
            .providers
            .insert("mem".to_string(), ProviderSettings::new("memory", serde_json::Value::Null));
        settings.active_provider = "mem".to_string();
        settings.audit_log = None;
        settings
    }

    fn service() -> StorageSettingsService {
        StorageSettingsService::in_memory(
            memory_settings(),
            StorageProviderFactory::with_default_providers(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_provider_is_cached() {
        let service = service();
        let first = service.provider("mem").await.unwrap();
        let second = service.active_provider().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_upsert_invalidates_cache() {
        let service = service();
        let first = service.provider("mem").await.unwrap();
        service
            .upsert_provider("mem", ProviderSettings::new("memory", serde_json::json!({"prefix": "x"})))
            .await
            .unwrap();
        let second = service.provider("mem").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upsert_never_leaves_stale_provider() {
        let service = Arc::new(service());
        let temp = TempDir::new().unwrap();
        let local = |dir: &str| {
            ProviderSettings::new(
                "local",
                serde_json::json!({ "root": temp.path().join(dir) }),
            )
        };
        service.upsert_provider("docs", local("old")).await.unwrap();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        service.provider("docs").await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for round in 0..20 {
            service
                .upsert_provider("docs", local(&format!("root-{}", round)))
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
        for reader in readers {
            reader.await.unwrap();
        }

        let provider = service.provider("docs").await.unwrap();
        provider
            .upload(
                &StoragePath::parse("/x.txt").unwrap(),
                b"x".to_vec(),
                FileMetadata::default(),
                UploadOptions::default(),
            )
            .await
            .unwrap();
        assert!(temp.path().join("root-19").join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_upsert_rejects_unknown_type() {
        let service = service();
        let err = service
            .upsert_provider("box", ProviderSettings::new("dropbox", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = service
            .upsert_provider("bad key", ProviderSettings::new("memory", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_active_provider_is_protected() {
        let service = service();
        assert!(matches!(
            service.remove_provider("mem").await,
            Err(Error::NotPermitted(_))
        ));
        assert!(matches!(
            service.set_enabled("mem", false).await,
            Err(Error::NotPermitted(_))
        ));
        let mut disabled = ProviderSettings::new("memory", serde_json::Value::Null);
        disabled.enabled = false;
        assert!(matches!(
            service.upsert_provider("mem", disabled).await,
            Err(Error::NotPermitted(_))
        ));
    }

    #[tokio::test]
    async fn test_set_active() {
        let service = service();
        assert!(matches!(service.set_active("nope").await, Err(Error::NotFound(_))));

        service
            .upsert_provider("archive", ProviderSettings::new("memory", serde_json::Value::Null))
            .await
            .unwrap();
        service.set_enabled("archive", false).await.unwrap();
        assert!(matches!(
            service.set_active("archive").await,
            Err(Error::NotPermitted(_))
        ));
        assert!(matches!(
            service.provider("archive").await,
            Err(Error::NotPermitted(_))
        ));

        service.set_enabled("archive", true).await.unwrap();
        service.set_active("archive").await.unwrap();
        assert_eq!(service.settings().await.active_provider, "archive");

        let removed = service.remove_provider("mem").await.unwrap();
        assert_eq!(removed.provider_type, "memory");
        assert!(matches!(service.remove_provider("mem").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_providers_share_audit_trail() {
        let service = service();
        service
            .upsert_provider("other", ProviderSettings::new("memory", serde_json::Value::Null))
            .await
            .unwrap();

        let path = StoragePath::parse("/a.txt").unwrap();
        for key in ["mem", "other"] {
            service
                .provider(key)
                .await
                .unwrap()
                .upload(&path, b"a".to_vec(), FileMetadata::default(), UploadOptions::default())
                .await
                .unwrap();
        }

        let entries = service.audit_trail().entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }

    #[tokio::test]
    async fn test_test_all_reports_each_enabled_provider() {
        let service = service();
        service
            .upsert_provider("broken", ProviderSettings::new("local", serde_json::json!({})))
            .await
            .unwrap();
        let mut off = ProviderSettings::new("memory", serde_json::Value::Null);
        off.enabled = false;
        service.upsert_provider("off", off).await.unwrap();

        let results = service.test_all().await;
        assert_eq!(results.len(), 2);
        let broken = results.iter().find(|r| r.key == "broken").unwrap();
        assert!(!broken.connected());
        assert!(broken.error.is_some());
        let mem = results.iter().find(|r| r.key == "mem").unwrap();
        assert!(mem.connected());
    }

    #[tokio::test]
    async fn test_load_and_save_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cfg").join("storage-settings.json");

        let mut settings = memory_settings();
        settings.audit_log = Some(temp.path().join("audit.jsonl"));
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, settings.to_json().unwrap()).await.unwrap();

        let service = StorageSettingsService::load(&path, StorageProviderFactory::with_default_providers())
            .await
            .unwrap();
        assert!(service.audit_trail().is_durable());
        service
            .upsert_provider("second", ProviderSettings::new("memory", serde_json::Value::Null))
            .await
            .unwrap();
        service.save().await.unwrap();

        let reloaded =
            StorageSettingsService::load(&path, StorageProviderFactory::with_default_providers())
                .await
                .unwrap();
        assert!(reloaded.settings().await.providers.contains_key("second"));
        assert_eq!(reloaded.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("storage-settings.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let result =
            StorageSettingsService::load(&path, StorageProviderFactory::with_default_providers()).await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
