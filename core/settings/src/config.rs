//! Storage settings document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eqms_common::{Error, Result};

/// Settings file name inside the configuration directory.
pub const SETTINGS_FILENAME: &str = "storage-settings.json";

/// Settings format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsVersion {
    pub major: u32,
    pub minor: u32,
}

impl SettingsVersion {
    /// Current settings format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for SettingsVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

fn default_true() -> bool {
    true
}

/// One configured provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Factory tag (e.g., "local", "s3", "sharepoint").
    pub provider_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Provider-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ProviderSettings {
    pub fn new(provider_type: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            provider_type: provider_type.into(),
            enabled: true,
            description: None,
            config,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Provider map, active provider and audit location.
///
/// Stored as pretty-printed JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub version: SettingsVersion,
    /// Key of the provider used when none is named explicitly.
    pub active_provider: String,
    pub providers: BTreeMap<String, ProviderSettings>,
    /// JSON-lines audit file. Without one the trail is kept in memory.
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
    pub modified_at: DateTime<Utc>,
}

impl StorageSettings {
    /// Defaults below `data_dir`: one local provider and a file audit trail.
    ///
    /// # Postconditions
    /// - `active_provider` is `local`, rooted at `<data_dir>/storage`
    /// - Audit entries go to `<data_dir>/audit.jsonl`
    pub fn defaults_in(data_dir: &Path) -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "local".to_string(),
            ProviderSettings::new(
                "local",
                serde_json::json!({ "root": data_dir.join("storage") }),
            )
            .with_description("Local filesystem"),
        );

        Self {
            version: SettingsVersion::CURRENT,
            active_provider: "local".to_string(),
            providers,
            audit_log: Some(data_dir.join("audit.jsonl")),
            modified_at: Utc::now(),
        }
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// - `Configuration` for an incompatible version, an empty provider type,
    ///   or an active provider that is missing or disabled
    pub fn validate(&self) -> Result<()> {
        if !self.version.is_compatible() {
            return Err(Error::Configuration(format!(
                "Unsupported settings version {}.{}",
                self.version.major, self.version.minor
            )));
        }

        for (key, provider) in &self.providers {
            validate_key(key)?;
            if provider.provider_type.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "Provider '{}' has no provider_type",
                    key
                )));
            }
        }

        match self.providers.get(&self.active_provider) {
            Some(provider) if provider.enabled => Ok(()),
            Some(_) => Err(Error::Configuration(format!(
                "Active provider '{}' is disabled",
                self.active_provider
            ))),
            None => Err(Error::Configuration(format!(
                "Active provider '{}' is not configured",
                self.active_provider
            ))),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Serialize settings to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eqms");
        Self::defaults_in(&data_dir)
    }
}

/// Provider keys are short identifiers: ASCII letters, digits, `-` and `_`.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidInput(format!(
            "Invalid provider key '{}'",
            key
        )));
    }
    Ok(())
}

/// Default settings file: `<config dir>/eqms/storage-settings.json`.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eqms")
        .join(SETTINGS_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_version_compatibility() {
        assert!(SettingsVersion::CURRENT.is_compatible());
        assert!(SettingsVersion { major: 1, minor: 7 }.is_compatible());
        assert!(!SettingsVersion { major: 2, minor: 0 }.is_compatible());
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = StorageSettings::defaults_in(Path::new("/srv/eqms"));
        settings.validate().unwrap();
        assert_eq!(settings.active_provider, "local");
        assert_eq!(
            settings.providers["local"].config["root"],
            serde_json::json!("/srv/eqms/storage")
        );
        assert_eq!(settings.audit_log, Some(PathBuf::from("/srv/eqms/audit.jsonl")));
    }

    #[test]
    fn test_validate_active_provider() {
        let mut settings = StorageSettings::defaults_in(Path::new("/srv/eqms"));
        settings.active_provider = "s3".to_string();
        assert!(matches!(settings.validate(), Err(Error::Configuration(_))));

        let mut settings = StorageSettings::defaults_in(Path::new("/srv/eqms"));
        settings.providers.get_mut("local").unwrap().enabled = false;
        assert!(matches!(settings.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_version() {
        let mut settings = StorageSettings::defaults_in(Path::new("/srv/eqms"));
        settings.version = SettingsVersion { major: 2, minor: 0 };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("s3-eu_1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("with space").is_err());
        assert!(validate_key("../etc").is_err());
    }

    #[test]
    fn test_settings_json() {
        let settings = StorageSettings::defaults_in(Path::new("/srv/eqms"));
        let restored = StorageSettings::from_json(&settings.to_json().unwrap()).unwrap();
        assert_eq!(restored, settings);

        // Omitted fields take their defaults.
        let minimal = StorageSettings::from_json(
            r#"{
                "active_provider": "mem",
                "providers": { "mem": { "provider_type": "memory" } },
                "modified_at": "2024-05-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        assert!(minimal.providers["mem"].enabled);
        assert_eq!(minimal.version, SettingsVersion::CURRENT);
        assert!(minimal.audit_log.is_none());
        minimal.validate().unwrap();
    }
}
