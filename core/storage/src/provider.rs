//! Storage provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use eqms_audit::{AuditAction, AuditDraft, AuditEntry, AuditTrail};
use eqms_common::{Error, Result, StoragePath};

use crate::checksum;
use crate::sidecar::ensure_object_path;

/// Standards the record store is labelled for.
pub const COMPLIANCE_STANDARDS: [&str; 3] = ["ISO 13485", "21 CFR Part 11", "IEC 62304"];

/// Who performs an operation and why. Carried into audit entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub user_id: Option<String>,
    pub reason: Option<String>,
}

impl OperationContext {
    /// Context attributed to a user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            reason: None,
        }
    }

    /// Context for unattended operations.
    pub fn system() -> Self {
        Self::default()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn draft(&self, action: AuditAction, provider: &str, path: &StoragePath) -> AuditDraft {
        AuditDraft::new(action, provider, path.to_string_path())
            .user(self.user_id.clone(), self.reason.clone())
    }
}

/// Client-supplied document metadata, stored in the sidecar record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Controlled document identifier (e.g. `SOP-0042`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Record family (`sop`, `capa`, `audit`, `supplier`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_years: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Partial update of [`FileMetadata`].
///
/// `Some` fields replace stored values, `tags` are merged, and
/// `remove_tags` are dropped after the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub retention_years: Option<u32>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
}

/// Sidecar record describing a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMetadata {
    pub path: String,
    pub size: u64,
    /// Lowercase hex digest of the content.
    pub checksum: String,
    pub checksum_algorithm: String,
    /// 1 on first upload, incremented on each overwrite.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub uploaded_by: Option<String>,
    #[serde(default)]
    pub metadata: FileMetadata,
}

/// Listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub path: String,
    pub name: String,
    /// Size in bytes (None for directories).
    pub size: Option<u64>,
    pub is_directory: bool,
    /// Last modification time, when the backend reports one.
    pub modified: Option<DateTime<Utc>>,
    /// ETag or revision ID.
    pub etag: Option<String>,
    /// Provider-specific metadata.
    pub provider_data: Option<serde_json::Value>,
}

/// Options for [`StorageProvider::upload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Replace an existing object. When false an existing object is an error.
    pub overwrite: bool,
    /// Create missing parent directories.
    pub create_parents: bool,
    /// Refuse providers that do not encrypt at rest.
    pub require_encryption: bool,
    /// Reject the upload unless the content hashes to this value.
    pub expected_checksum: Option<String>,
    pub context: OperationContext,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            create_parents: true,
            require_encryption: false,
            expected_checksum: None,
            context: OperationContext::default(),
        }
    }
}

/// Options for [`StorageProvider::download`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Compare content against the sidecar checksum, when there is one.
    pub verify_checksum: bool,
    pub context: OperationContext,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            context: OperationContext::default(),
        }
    }
}

/// Options for [`StorageProvider::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    pub recursive: bool,
    pub limit: Option<usize>,
    pub context: OperationContext,
}

/// Outcome of an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub file_path: String,
    pub checksum: String,
    pub size: u64,
    pub version: u32,
    /// The audit entry recorded for this upload, unless the sink rejected it.
    pub audit_log: Option<AuditEntry>,
}

/// Features a provider supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Backend keeps prior object versions on its own.
    pub versioning: bool,
    /// Copies happen without streaming content through this process.
    pub server_side_copy: bool,
    pub atomic_move: bool,
    pub metadata_update: bool,
    pub encryption_at_rest: bool,
    pub max_object_size: Option<u64>,
}

/// Compliance-relevant properties of a configured provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceProfile {
    /// Audit entries go to a durable sink.
    pub audit_trail: bool,
    pub checksum_verification: bool,
    pub encryption_at_rest: bool,
    /// Durable audit trail plus checksums: usable for Part 11 electronic records.
    pub electronic_records: bool,
    pub standards: Vec<String>,
}

impl ComplianceProfile {
    pub fn new(audit: &AuditTrail, encryption_at_rest: bool) -> Self {
        let durable = audit.is_durable();
        Self {
            audit_trail: durable,
            checksum_verification: true,
            encryption_at_rest,
            electronic_records: durable,
            standards: COMPLIANCE_STANDARDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Result of a single reachability probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub provider: String,
    pub connected: bool,
    pub latency_ms: u64,
    pub capabilities: ProviderCapabilities,
    pub compliance: ComplianceProfile,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Storage provider trait for different backends.
///
/// Every operation records one audit entry, whether it succeeds or fails.
/// Implementations handle their own authentication; none of them retry.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Provider tag (e.g., "local", "s3", "sharepoint").
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    fn compliance(&self) -> ComplianceProfile;

    /// Store content and its sidecar record.
    ///
    /// # Postconditions
    /// - Content is stored at `path`
    /// - Sidecar holds the SHA-256 checksum and `metadata`
    /// - Version is 1 for new objects, previous + 1 on overwrite
    ///
    /// # Errors
    /// - `AlreadyExists` when the object exists and `overwrite` is false
    /// - `Integrity` when `expected_checksum` does not match
    /// - `Unsupported` when encryption is required but not offered
    /// - `InvalidInput` for root/sidecar paths or oversize content
    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        metadata: FileMetadata,
        options: UploadOptions,
    ) -> Result<UploadResult>;

    /// Read complete content.
    ///
    /// # Errors
    /// - `NotFound`, `InvalidInput` for directories
    /// - `Integrity` when verification is on and the sidecar checksum differs
    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<Vec<u8>>;

    /// Check if a path exists (object or directory).
    async fn exists(&self, path: &StoragePath) -> Result<bool>;

    /// List a directory. Sidecars are never listed.
    async fn list(&self, path: &StoragePath, options: ListOptions) -> Result<Vec<ObjectInfo>>;

    /// Delete an object and its sidecar.
    async fn delete(&self, path: &StoragePath, ctx: &OperationContext) -> Result<()>;

    /// Move an object (and its sidecar) to a new path.
    async fn move_object(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo>;

    /// Copy an object (and its sidecar) to a new path.
    async fn copy(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo>;

    /// Read the sidecar record, synthesising one for objects without it.
    async fn get_metadata(&self, path: &StoragePath, ctx: &OperationContext)
        -> Result<StoredMetadata>;

    /// Patch the document metadata of an object.
    async fn update_metadata(
        &self,
        path: &StoragePath,
        update: MetadataUpdate,
        ctx: &OperationContext,
    ) -> Result<StoredMetadata>;

    /// Probe reachability once.
    async fn test_connection(&self) -> ConnectionReport;
}

/// Record the audit entry for an operation outcome and pass the outcome on.
pub(crate) async fn audited<T>(audit: &AuditTrail, draft: AuditDraft, result: Result<T>) -> Result<T> {
    let draft = match &result {
        Ok(_) => draft,
        Err(e) => draft.failed(e.to_string()),
    };
    audit.record_or_warn(draft).await;
    result
}

/// Checks shared by every provider before content is written.
///
/// Returns the content checksum.
pub(crate) fn preflight_upload(
    capabilities: &ProviderCapabilities,
    path: &StoragePath,
    data: &[u8],
    options: &UploadOptions,
) -> Result<String> {
    ensure_object_path(path)?;

    if options.require_encryption && !capabilities.encryption_at_rest {
        return Err(Error::Unsupported(
            "Provider does not encrypt data at rest".to_string(),
        ));
    }

    if let Some(max) = capabilities.max_object_size {
        if data.len() as u64 > max {
            return Err(Error::InvalidInput(format!(
                "Object is {} bytes, provider limit is {} bytes",
                data.len(),
                max
            )));
        }
    }

    let digest = checksum::sha256_hex(data);
    if let Some(expected) = &options.expected_checksum {
        checksum::verify(expected, &digest)?;
    }
    Ok(digest)
}

/// Finish an upload: record the audit entry and build the result.
pub(crate) async fn finish_upload(
    audit: &AuditTrail,
    provider: &str,
    path: &StoragePath,
    options: &UploadOptions,
    outcome: Result<StoredMetadata>,
) -> Result<UploadResult> {
    let draft = options.context.draft(AuditAction::Upload, provider, path);
    match outcome {
        Ok(record) => {
            let draft = draft.checksum(Some(record.checksum.clone())).details(serde_json::json!({
                "size": record.size,
                "version": record.version,
            }));
            let entry = audit.record_or_warn(draft).await;
            Ok(UploadResult {
                success: true,
                file_path: record.path,
                checksum: record.checksum,
                size: record.size,
                version: record.version,
                audit_log: entry,
            })
        }
        Err(e) => {
            audit.record_or_warn(draft.failed(e.to_string())).await;
            Err(e)
        }
    }
}

/// Run a probe and wrap its outcome in a report.
pub(crate) async fn probe_report<F>(provider: &dyn StorageProvider, audit: &AuditTrail, probe: F) -> ConnectionReport
where
    F: std::future::Future<Output = Result<()>>,
{
    let started = Instant::now();
    let outcome = probe.await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let draft = AuditDraft::new(AuditAction::ConnectionTest, provider.name(), "/")
        .details(serde_json::json!({ "latency_ms": latency_ms }));
    let error = outcome.err().map(|e| e.to_string());
    let draft = match &error {
        Some(message) => draft.failed(message.clone()),
        None => draft,
    };
    audit.record_or_warn(draft).await;

    ConnectionReport {
        provider: provider.name().to_string(),
        connected: error.is_none(),
        latency_ms,
        capabilities: provider.capabilities(),
        compliance: provider.compliance(),
        error,
        checked_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> ProviderCapabilities {
        ProviderCapabilities {
            versioning: false,
            server_side_copy: true,
            atomic_move: true,
            metadata_update: true,
            encryption_at_rest: false,
            max_object_size: Some(4),
        }
    }

    #[test]
    fn test_upload_options_defaults() {
        let options = UploadOptions::default();
        assert!(options.overwrite);
        assert!(options.create_parents);
        assert!(!options.require_encryption);
        assert!(DownloadOptions::default().verify_checksum);
    }

    #[test]
    fn test_preflight_rejects_missing_encryption() {
        let path = StoragePath::parse("/a.pdf").unwrap();
        let options = UploadOptions {
            require_encryption: true,
            ..Default::default()
        };
        let err = preflight_upload(&caps(), &path, b"ab", &options).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_preflight_rejects_oversize() {
        let path = StoragePath::parse("/a.pdf").unwrap();
        let err = preflight_upload(&caps(), &path, b"abcde", &UploadOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_preflight_checks_expected_checksum() {
        let path = StoragePath::parse("/a.pdf").unwrap();
        let good = UploadOptions {
            expected_checksum: Some(checksum::sha256_hex(b"ab").to_uppercase()),
            ..Default::default()
        };
        assert_eq!(
            preflight_upload(&caps(), &path, b"ab", &good).unwrap(),
            checksum::sha256_hex(b"ab")
        );

        let bad = UploadOptions {
            expected_checksum: Some("00".repeat(32)),
            ..Default::default()
        };
        let err = preflight_upload(&caps(), &path, b"ab", &bad).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_preflight_rejects_reserved_paths() {
        let options = UploadOptions::default();
        assert!(preflight_upload(&caps(), &StoragePath::root(), b"", &options).is_err());
        let sidecar = StoragePath::parse("/a.pdf.meta.json").unwrap();
        assert!(preflight_upload(&caps(), &sidecar, b"", &options).is_err());
    }

    #[test]
    fn test_compliance_follows_sink_durability() {
        let profile = ComplianceProfile::new(&AuditTrail::in_memory(), true);
        assert!(!profile.audit_trail);
        assert!(!profile.electronic_records);
        assert!(profile.encryption_at_rest);
        assert_eq!(profile.standards.len(), 3);
    }

    #[test]
    fn test_file_metadata_serialization_skips_empty() {
        let metadata = FileMetadata {
            document_id: Some("SOP-0042".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"document_id":"SOP-0042"}"#);

        let restored: FileMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, metadata);
    }
}
