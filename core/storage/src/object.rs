//! Object store providers: S3, Azure Blob, Google Cloud Storage and an
//! in-process store, all behind the `object_store` crate.
//!
//! Directories are virtual. A directory exists while at least one object
//! lives below its prefix, and listing uses the store's delimiter support.

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use eqms_audit::{AuditAction, AuditTrail};
use eqms_common::{Error, Result, SecretString, StoragePath};

use crate::checksum;
use crate::provider::{
    audited, finish_upload, preflight_upload, probe_report, ComplianceProfile, ConnectionReport,
    DownloadOptions, FileMetadata, ListOptions, MetadataUpdate, ObjectInfo, OperationContext,
    ProviderCapabilities, StorageProvider, StoredMetadata, UploadOptions, UploadResult,
};
use crate::sidecar::{
    ensure_not_reserved, ensure_object_path, is_sidecar_name, sidecar_path, Replaced,
};

/// Amazon S3 (or S3-compatible) bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<SecretString>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    /// Bucket enforces server-side encryption.
    #[serde(default)]
    pub server_side_encryption: bool,
}

/// Azure Blob Storage container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    #[serde(default)]
    pub access_key: Option<SecretString>,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Talk to a local Azurite emulator.
    #[serde(default)]
    pub use_emulator: bool,
}

/// Google Cloud Storage bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsConfig {
    pub bucket: String,
    #[serde(default)]
    pub service_account_path: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

/// In-process store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub prefix: Option<String>,
}

fn build_error(kind: &str, err: object_store::Error) -> Error {
    Error::Configuration(format!("Invalid {} configuration: {}", kind, err))
}

fn map_store_error(err: object_store::Error, path: &StoragePath) -> Error {
    match err {
        object_store::Error::NotFound { .. } => {
            Error::NotFound(format!("Object not found: {}", path))
        }
        object_store::Error::AlreadyExists { .. } => {
            Error::AlreadyExists(format!("Object already exists: {}", path))
        }
        object_store::Error::NotImplemented => {
            Error::Unsupported("Operation not supported by this store".to_string())
        }
        other => Error::Storage(other.to_string()),
    }
}

fn decode_part(part: &str) -> String {
    percent_decode_str(part).decode_utf8_lossy().into_owned()
}

/// Storage provider over any [`ObjectStore`].
pub struct ObjectStoreProvider {
    name: String,
    store: Arc<dyn ObjectStore>,
    prefix: Vec<String>,
    encryption_at_rest: bool,
    audit: AuditTrail,
}

impl std::fmt::Debug for ObjectStoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreProvider")
            .field("name", &self.name)
            .field("store", &self.store)
            .field("prefix", &self.prefix)
            .field("encryption_at_rest", &self.encryption_at_rest)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreProvider {
    /// Wrap a store.
    ///
    /// `prefix` is a `/`-separated path under which all records live.
    ///
    /// # Errors
    /// - `InvalidInput` if the prefix is not a valid path
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        prefix: Option<&str>,
        encryption_at_rest: bool,
        audit: AuditTrail,
    ) -> Result<Self> {
        let prefix = StoragePath::parse(prefix.unwrap_or(""))?.components().to_vec();
        let name = name.into();
        info!(provider = %name, prefix = %prefix.join("/"), "Object store provider ready");
        Ok(Self {
            name,
            store,
            prefix,
            encryption_at_rest,
            audit,
        })
    }

    pub fn s3(config: S3Config, audit: AuditTrail) -> Result<Self> {
        if config.access_key_id.is_some() != config.secret_access_key.is_some() {
            return Err(Error::Configuration(
                "S3 access_key_id and secret_access_key must be given together".to_string(),
            ));
        }
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_allow_http(config.allow_http);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key_id) = &config.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret.expose());
        }
        let store = builder.build().map_err(|e| build_error("s3", e))?;
        Self::new(
            "s3",
            Arc::new(store),
            config.prefix.as_deref(),
            config.server_side_encryption,
            audit,
        )
    }

    pub fn azure(config: AzureConfig, audit: AuditTrail) -> Result<Self> {
        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(&config.account)
            .with_container_name(&config.container)
            .with_use_emulator(config.use_emulator);
        if let Some(key) = &config.access_key {
            builder = builder.with_access_key(key.expose());
        }
        let store = builder.build().map_err(|e| build_error("azure", e))?;
        // Azure Storage Service Encryption cannot be disabled.
        Self::new("azure", Arc::new(store), config.prefix.as_deref(), true, audit)
    }

    pub fn gcs(config: GcsConfig, audit: AuditTrail) -> Result<Self> {
        let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(&config.bucket);
        if let Some(path) = &config.service_account_path {
            builder = builder.with_service_account_path(path);
        }
        let store = builder.build().map_err(|e| build_error("gcp", e))?;
        Self::new("gcp", Arc::new(store), config.prefix.as_deref(), true, audit)
    }

    pub fn memory(config: MemoryConfig, audit: AuditTrail) -> Result<Self> {
        Self::new(
            "memory",
            Arc::new(InMemory::new()),
            config.prefix.as_deref(),
            false,
            audit,
        )
    }

    fn location(&self, path: &StoragePath) -> ObjectPath {
        ObjectPath::from_iter(
            self.prefix
                .iter()
                .chain(path.components())
                .map(String::as_str),
        )
    }

    /// Map a store location back to a logical path, if it lies under the prefix.
    fn logical_path(&self, location: &ObjectPath) -> Option<StoragePath> {
        let parts: Vec<String> = location.parts().map(|p| decode_part(p.as_ref())).collect();
        if parts.len() < self.prefix.len() || parts[..self.prefix.len()] != self.prefix[..] {
            return None;
        }
        StoragePath::from_components(parts[self.prefix.len()..].to_vec()).ok()
    }

    fn list_prefix<'a>(location: &'a ObjectPath) -> Option<&'a ObjectPath> {
        if location.as_ref().is_empty() {
            None
        } else {
            Some(location)
        }
    }

    fn object_info(&self, path: &StoragePath, meta: &ObjectMeta) -> ObjectInfo {
        ObjectInfo {
            path: path.to_string_path(),
            name: path.name().unwrap_or("/").to_string(),
            size: Some(meta.size as u64),
            is_directory: false,
            modified: Some(meta.last_modified),
            etag: meta.e_tag.clone(),
            provider_data: meta
                .version
                .as_ref()
                .map(|v| serde_json::json!({ "version": v })),
        }
    }

    fn directory_info(path: &StoragePath) -> ObjectInfo {
        ObjectInfo {
            path: path.to_string_path(),
            name: path.name().unwrap_or("/").to_string(),
            size: None,
            is_directory: true,
            modified: None,
            etag: None,
            provider_data: None,
        }
    }

    async fn head(&self, path: &StoragePath) -> Result<Option<ObjectMeta>> {
        match self.store.head(&self.location(path)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_store_error(e, path)),
        }
    }

    /// A virtual directory exists when something lives below it.
    async fn is_directory(&self, path: &StoragePath) -> Result<bool> {
        if path.is_root() {
            return Ok(true);
        }
        let location = self.location(path);
        let listing = self
            .store
            .list_with_delimiter(Some(&location))
            .await
            .map_err(|e| map_store_error(e, path))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    async fn read(&self, path: &StoragePath) -> Result<Vec<u8>> {
        let result = self
            .store
            .get(&self.location(path))
            .await
            .map_err(|e| map_store_error(e, path))?;
        let bytes = result.bytes().await.map_err(|e| map_store_error(e, path))?;
        Ok(bytes.to_vec())
    }

    async fn write(&self, path: &StoragePath, data: Vec<u8>) -> Result<()> {
        self.store
            .put(&self.location(path), PutPayload::from(data))
            .await
            .map_err(|e| map_store_error(e, path))?;
        Ok(())
    }

    async fn read_sidecar(&self, path: &StoragePath) -> Result<Option<StoredMetadata>> {
        let sidecar = sidecar_path(path)?;
        match self.read(&sidecar).await {
            Ok(bytes) => Ok(Some(StoredMetadata::from_bytes(&bytes)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_sidecar(&self, path: &StoragePath, record: &StoredMetadata) -> Result<()> {
        self.write(&sidecar_path(path)?, record.to_bytes()?).await
    }

    async fn remove_sidecar(&self, path: &StoragePath) -> Result<()> {
        let sidecar = sidecar_path(path)?;
        match self.store.delete(&self.location(&sidecar)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_store_error(e, &sidecar)),
        }
    }

    /// Existing object metadata, or the right error for a missing/directory path.
    async fn require_object(&self, path: &StoragePath) -> Result<ObjectMeta> {
        ensure_object_path(path)?;
        match self.head(path).await? {
            Some(meta) => Ok(meta),
            None if self.is_directory(path).await? => Err(Error::InvalidInput(format!(
                "Path is a directory: {}",
                path
            ))),
            None => Err(Error::NotFound(format!("Object not found: {}", path))),
        }
    }

    async fn upload_inner(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        metadata: FileMetadata,
        options: &UploadOptions,
    ) -> Result<StoredMetadata> {
        let checksum = preflight_upload(&self.capabilities(), path, &data, options)?;

        if !options.create_parents {
            if let Some(parent) = path.parent() {
                if !self.is_directory(&parent).await? {
                    return Err(Error::NotFound(format!(
                        "Parent directory not found: {}",
                        parent
                    )));
                }
            }
        }

        let existing = self.head(path).await?;
        if existing.is_none() && self.is_directory(path).await? {
            return Err(Error::InvalidInput(format!("Path is a directory: {}", path)));
        }
        if existing.is_some() && !options.overwrite {
            return Err(Error::AlreadyExists(format!("Object already exists: {}", path)));
        }
        let previous = if existing.is_some() {
            self.read_sidecar(path).await?
        } else {
            None
        };
        let replaced = Replaced::new(
            existing.is_some(),
            previous.as_ref(),
            existing.as_ref().map(|meta| meta.last_modified),
        );

        let record = StoredMetadata::for_upload(
            path,
            data.len() as u64,
            checksum,
            metadata,
            replaced,
            options.context.user_id.clone(),
        );

        // Sidecar first: content is never visible without its record.
        self.write_sidecar(path, &record).await?;
        if let Err(e) = self.write(path, data).await {
            let rollback = match &previous {
                Some(previous) => self.write_sidecar(path, previous).await,
                None => self.remove_sidecar(path).await,
            };
            if let Err(rollback) = rollback {
                warn!(provider = %self.name, path = %path, error = %rollback, "Failed to restore sidecar");
            }
            return Err(e);
        }

        debug!(provider = %self.name, path = %path, version = record.version, "Stored object");
        Ok(record)
    }

    async fn download_inner(&self, path: &StoragePath, options: &DownloadOptions) -> Result<Vec<u8>> {
        self.require_object(path).await?;
        let data = self.read(path).await?;

        if options.verify_checksum {
            if let Some(record) = self.read_sidecar(path).await? {
                checksum::verify(&record.checksum, &checksum::sha256_hex(&data))?;
            }
        }
        Ok(data)
    }

    async fn list_inner(&self, path: &StoragePath, options: &ListOptions) -> Result<Vec<ObjectInfo>> {
        ensure_not_reserved(path)?;
        let location = self.location(path);
        let prefix = Self::list_prefix(&location);
        let mut results = Vec::new();

        if options.recursive {
            let metas: Vec<ObjectMeta> = self
                .store
                .list(prefix)
                .try_collect()
                .await
                .map_err(|e| map_store_error(e, path))?;

            let mut directories = BTreeSet::new();
            for meta in &metas {
                let Some(child) = self.logical_path(&meta.location) else {
                    continue;
                };
                if child.name().map(is_sidecar_name).unwrap_or(true) {
                    continue;
                }
                let mut ancestor = child.parent();
                while let Some(dir) = ancestor {
                    if dir == *path || !path.is_ancestor_of(&dir) {
                        break;
                    }
                    ancestor = dir.parent();
                    directories.insert(dir);
                }
                results.push(self.object_info(&child, meta));
            }
            results.extend(directories.iter().map(Self::directory_info));
        } else {
            let listing = self
                .store
                .list_with_delimiter(prefix)
                .await
                .map_err(|e| map_store_error(e, path))?;

            for dir in &listing.common_prefixes {
                if let Some(child) = self.logical_path(dir) {
                    results.push(Self::directory_info(&child));
                }
            }
            for meta in &listing.objects {
                let Some(child) = self.logical_path(&meta.location) else {
                    continue;
                };
                if child.name().map(is_sidecar_name).unwrap_or(true) {
                    continue;
                }
                results.push(self.object_info(&child, meta));
            }
        }

        if results.is_empty() && !path.is_root() {
            if self.head(path).await?.is_some() {
                return Err(Error::InvalidInput("Not a directory".to_string()));
            }
            if !self.is_directory(path).await? {
                return Err(Error::NotFound(format!("Directory not found: {}", path)));
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn delete_inner(&self, path: &StoragePath) -> Result<()> {
        self.require_object(path).await?;
        self.store
            .delete(&self.location(path))
            .await
            .map_err(|e| map_store_error(e, path))?;
        self.remove_sidecar(path).await
    }

    /// Validate a transfer and return the source object metadata.
    async fn check_transfer(&self, from: &StoragePath, to: &StoragePath) -> Result<ObjectMeta> {
        ensure_object_path(from)?;
        ensure_object_path(to)?;
        if from == to {
            return Err(Error::InvalidInput(format!(
                "Source and destination are the same: {}",
                from
            )));
        }
        let meta = match self.require_object(from).await {
            Err(Error::InvalidInput(_)) => {
                return Err(Error::InvalidInput(format!(
                    "Directories cannot be transferred in an object store: {}",
                    from
                )))
            }
            other => other?,
        };
        if self.head(to).await?.is_some() || self.is_directory(to).await? {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }
        Ok(meta)
    }

    async fn move_inner(&self, from: &StoragePath, to: &StoragePath) -> Result<ObjectInfo> {
        self.check_transfer(from, to).await?;

        self.store
            .rename(&self.location(from), &self.location(to))
            .await
            .map_err(|e| map_store_error(e, from))?;

        if let Some(record) = self.read_sidecar(from).await? {
            self.write_sidecar(to, &record.moved_to(to)).await?;
            self.remove_sidecar(from).await?;
        }

        let meta = self
            .head(to)
            .await?
            .ok_or_else(|| Error::Storage(format!("Moved object vanished: {}", to)))?;
        Ok(self.object_info(to, &meta))
    }

    async fn copy_inner(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo> {
        self.check_transfer(from, to).await?;

        self.store
            .copy(&self.location(from), &self.location(to))
            .await
            .map_err(|e| map_store_error(e, from))?;

        if let Some(record) = self.read_sidecar(from).await? {
            self.write_sidecar(to, &record.copied_to(to, ctx.user_id.clone()))
                .await?;
        }

        let meta = self
            .head(to)
            .await?
            .ok_or_else(|| Error::Storage(format!("Copied object vanished: {}", to)))?;
        Ok(self.object_info(to, &meta))
    }

    async fn metadata_inner(&self, path: &StoragePath) -> Result<StoredMetadata> {
        let meta = self.require_object(path).await?;
        if let Some(record) = self.read_sidecar(path).await? {
            return Ok(record);
        }
        let data = self.read(path).await?;
        Ok(StoredMetadata::synthesized(path, &data, Some(meta.last_modified)))
    }

    async fn update_metadata_inner(
        &self,
        path: &StoragePath,
        update: &MetadataUpdate,
    ) -> Result<StoredMetadata> {
        let mut record = self.metadata_inner(path).await?;
        update.apply(&mut record);
        self.write_sidecar(path, &record).await?;
        Ok(record)
    }

    async fn probe(&self) -> Result<()> {
        let root = StoragePath::root();
        let location = self.location(&root);
        self.store
            .list_with_delimiter(Self::list_prefix(&location))
            .await
            .map_err(|e| map_store_error(e, &root))?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            versioning: false,
            server_side_copy: true,
            atomic_move: false,
            metadata_update: true,
            encryption_at_rest: self.encryption_at_rest,
            max_object_size: None,
        }
    }

    fn compliance(&self) -> ComplianceProfile {
        ComplianceProfile::new(&self.audit, self.encryption_at_rest)
    }

    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        metadata: FileMetadata,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        let outcome = self.upload_inner(path, data, metadata, &options).await;
        finish_upload(&self.audit, &self.name, path, &options, outcome).await
    }

    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<Vec<u8>> {
        let result = self.download_inner(path, &options).await;
        let draft = options.context.draft(AuditAction::Download, &self.name, path);
        audited(&self.audit, draft, result).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        ensure_not_reserved(path)?;
        if self.head(path).await?.is_some() {
            return Ok(true);
        }
        self.is_directory(path).await
    }

    async fn list(&self, path: &StoragePath, options: ListOptions) -> Result<Vec<ObjectInfo>> {
        let result = self.list_inner(path, &options).await;
        let draft = options.context.draft(AuditAction::List, &self.name, path);
        audited(&self.audit, draft, result).await
    }

    async fn delete(&self, path: &StoragePath, ctx: &OperationContext) -> Result<()> {
        let result = self.delete_inner(path).await;
        audited(&self.audit, ctx.draft(AuditAction::Delete, &self.name, path), result).await
    }

    async fn move_object(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo> {
        let result = self.move_inner(from, to).await;
        let draft = ctx
            .draft(AuditAction::Move, &self.name, from)
            .target(to.to_string_path());
        audited(&self.audit, draft, result).await
    }

    async fn copy(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo> {
        let result = self.copy_inner(from, to, ctx).await;
        let draft = ctx
            .draft(AuditAction::Copy, &self.name, from)
            .target(to.to_string_path());
        audited(&self.audit, draft, result).await
    }

    async fn get_metadata(
        &self,
        path: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<StoredMetadata> {
        let result = self.metadata_inner(path).await;
        let draft = ctx.draft(AuditAction::MetadataRead, &self.name, path);
        audited(&self.audit, draft, result).await
    }

    async fn update_metadata(
        &self,
        path: &StoragePath,
        update: MetadataUpdate,
        ctx: &OperationContext,
    ) -> Result<StoredMetadata> {
        let result = self.update_metadata_inner(path, &update).await;
        let draft = ctx
            .draft(AuditAction::MetadataUpdate, &self.name, path)
            .details(serde_json::to_value(&update).unwrap_or_default());
        audited(&self.audit, draft, result).await
    }

    async fn test_connection(&self) -> ConnectionReport {
        probe_report(self, &self.audit, self.probe()).await
    }
}
