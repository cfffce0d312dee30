//! SharePoint storage provider implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
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

use super::auth::{ClientCredentials, TokenManager, TokenSource};
use super::client::{DriveItem, DriveRef, GraphClient};

/// Largest payload accepted by a Graph simple upload.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 250 * 1024 * 1024;

/// SharePoint provider configuration.
///
/// Exactly one of `site_id` and `drive_id` selects the document library.
/// Authentication uses `access_token` when set, otherwise the
/// `tenant_id`/`client_id`/`client_secret` app registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharePointConfig {
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
    /// Folder inside the library under which all records live.
    #[serde(default)]
    pub root_folder: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<SecretString>,
    #[serde(default)]
    pub access_token: Option<SecretString>,
}

impl SharePointConfig {
    fn drive_ref(&self) -> Result<DriveRef> {
        match (&self.site_id, &self.drive_id) {
            (Some(site), None) => Ok(DriveRef::Site(site.clone())),
            (None, Some(drive)) => Ok(DriveRef::Drive(drive.clone())),
            _ => Err(Error::Configuration(
                "SharePoint needs exactly one of site_id and drive_id".to_string(),
            )),
        }
    }

    fn token_source(&self) -> Result<TokenSource> {
        if let Some(token) = &self.access_token {
            return Ok(TokenSource::Static(token.clone()));
        }
        match (&self.tenant_id, &self.client_id, &self.client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                Ok(TokenSource::ClientCredentials(ClientCredentials {
                    tenant_id: tenant_id.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                }))
            }
            _ => Err(Error::Configuration(
                "SharePoint needs access_token or tenant_id, client_id and client_secret"
                    .to_string(),
            )),
        }
    }
}

/// SharePoint storage provider.
///
/// Sidecars are ordinary drive items next to the content item.
pub struct SharePointProvider {
    client: GraphClient,
    root: Vec<String>,
    audit: AuditTrail,
}

impl SharePointProvider {
    /// Create a new SharePoint provider.
    ///
    /// No request is made here; use `test_connection` to check access.
    ///
    /// # Errors
    /// - `Configuration` for an ambiguous drive or missing credentials
    /// - `InvalidInput` for a malformed root folder
    pub fn new(config: SharePointConfig, audit: AuditTrail) -> Result<Self> {
        let drive = config.drive_ref()?;
        let tokens = Arc::new(TokenManager::new(config.token_source()?)?);
        let client = GraphClient::new(&drive, tokens)?;
        let root = StoragePath::parse(config.root_folder.as_deref().unwrap_or(""))?
            .components()
            .to_vec();

        info!(drive = ?drive, root = %root.join("/"), "SharePoint provider ready");
        Ok(Self {
            client,
            root,
            audit,
        })
    }

    /// Drive-relative components for a logical path.
    fn remote(&self, path: &StoragePath) -> Vec<String> {
        self.root
            .iter()
            .chain(path.components())
            .cloned()
            .collect()
    }

    fn object_info(path: &StoragePath, item: &DriveItem) -> ObjectInfo {
        let is_directory = item.is_folder();
        ObjectInfo {
            path: path.to_string_path(),
            name: path.name().unwrap_or("/").to_string(),
            size: if is_directory { None } else { item.size },
            is_directory,
            modified: item.last_modified_date_time,
            etag: item.e_tag.clone(),
            provider_data: Some(serde_json::json!({ "id": item.id })),
        }
    }

    async fn item(&self, path: &StoragePath) -> Result<Option<DriveItem>> {
        self.client.get_item(&self.remote(path)).await
    }

    /// Existing file item, or the right error for a missing/folder path.
    async fn require_file(&self, path: &StoragePath) -> Result<DriveItem> {
        ensure_object_path(path)?;
        match self.item(path).await? {
            Some(item) if item.is_folder() => {
                Err(Error::InvalidInput(format!("Path is a folder: {}", path)))
            }
            Some(item) => Ok(item),
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn read_sidecar(&self, path: &StoragePath) -> Result<Option<StoredMetadata>> {
        let sidecar = self.remote(&sidecar_path(path)?);
        match self.client.download(&sidecar).await {
            Ok(bytes) => Ok(Some(StoredMetadata::from_bytes(&bytes)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_sidecar(&self, path: &StoragePath, record: &StoredMetadata) -> Result<()> {
        let sidecar = self.remote(&sidecar_path(path)?);
        self.client.upload(&sidecar, record.to_bytes()?, true).await?;
        Ok(())
    }

    async fn remove_sidecar(&self, path: &StoragePath) -> Result<()> {
        let sidecar = self.remote(&sidecar_path(path)?);
        match self.client.delete(&sidecar).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Folder that will hold `path`, created on demand.
    async fn parent_folder(&self, path: &StoragePath, create: bool) -> Result<DriveItem> {
        let parent = path.parent().unwrap_or_else(StoragePath::root);
        if create {
            return self.client.ensure_folder(&self.remote(&parent)).await;
        }
        match self.item(&parent).await? {
            Some(item) if item.is_folder() => Ok(item),
            Some(_) => Err(Error::InvalidInput("Parent is a file".to_string())),
            None => Err(Error::NotFound(format!(
                "Parent directory not found: {}",
                parent
            ))),
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
        self.parent_folder(path, options.create_parents).await?;

        let existing = self.item(path).await?;
        if existing.as_ref().map(DriveItem::is_folder).unwrap_or(false) {
            return Err(Error::InvalidInput(format!("Path is a folder: {}", path)));
        }
        if existing.is_some() && !options.overwrite {
            return Err(Error::AlreadyExists(format!("File already exists: {}", path)));
        }
        let previous = if existing.is_some() {
            self.read_sidecar(path).await?
        } else {
            None
        };
        let replaced = Replaced::new(
            existing.is_some(),
            previous.as_ref(),
            existing.as_ref().and_then(|item| item.last_modified_date_time),
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
        if let Err(e) = self
            .client
            .upload(&self.remote(path), data, options.overwrite)
            .await
        {
            let rollback = match &previous {
                Some(previous) => self.write_sidecar(path, previous).await,
                None => self.remove_sidecar(path).await,
            };
            if let Err(rollback) = rollback {
                warn!(path = %path, error = %rollback, "Failed to restore sidecar");
            }
            return Err(e);
        }

        debug!(path = %path, version = record.version, "Stored SharePoint item");
        Ok(record)
    }

    async fn download_inner(&self, path: &StoragePath, options: &DownloadOptions) -> Result<Vec<u8>> {
        self.require_file(path).await?;
        let data = self.client.download(&self.remote(path)).await?;

        if options.verify_checksum {
            if let Some(record) = self.read_sidecar(path).await? {
                checksum::verify(&record.checksum, &checksum::sha256_hex(&data))?;
            }
        }
        Ok(data)
    }

    async fn list_inner(&self, path: &StoragePath, options: &ListOptions) -> Result<Vec<ObjectInfo>> {
        ensure_not_reserved(path)?;
        match self.item(path).await? {
            Some(item) if item.is_folder() => {}
            Some(_) => return Err(Error::InvalidInput("Not a directory".to_string())),
            None => return Err(Error::NotFound(format!("Directory not found: {}", path))),
        }

        let mut results = Vec::new();
        let mut pending = vec![path.clone()];

        while let Some(dir) = pending.pop() {
            for item in self.client.list_children(&self.remote(&dir)).await? {
                if !item.is_folder() && is_sidecar_name(&item.name) {
                    continue;
                }
                let Ok(child) = dir.join(&item.name) else {
                    continue;
                };
                if options.recursive && item.is_folder() {
                    pending.push(child.clone());
                }
                results.push(Self::object_info(&child, &item));
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn delete_inner(&self, path: &StoragePath) -> Result<()> {
        self.require_file(path).await?;
        self.client.delete(&self.remote(path)).await?;
        self.remove_sidecar(path).await
    }

    async fn check_transfer(&self, from: &StoragePath, to: &StoragePath) -> Result<DriveItem> {
        ensure_object_path(to)?;
        if from == to {
            return Err(Error::InvalidInput(format!(
                "Source and destination are the same: {}",
                from
            )));
        }
        let item = self.require_file(from).await?;
        if self.item(to).await?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }
        Ok(item)
    }

    async fn move_inner(&self, from: &StoragePath, to: &StoragePath) -> Result<ObjectInfo> {
        let item = self.check_transfer(from, to).await?;
        let parent = self.parent_folder(to, true).await?;
        let name = to
            .name()
            .ok_or_else(|| Error::InvalidInput("Destination has no name".to_string()))?;

        let moved = self.client.move_item(&item.id, &parent.id, name).await?;

        if let Some(record) = self.read_sidecar(from).await? {
            self.write_sidecar(to, &record.moved_to(to)).await?;
            self.remove_sidecar(from).await?;
        }
        Ok(Self::object_info(to, &moved))
    }

    /// Graph copies are asynchronous monitor jobs, so content is streamed through.
    async fn copy_inner(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo> {
        self.check_transfer(from, to).await?;
        self.parent_folder(to, true).await?;

        let data = self.client.download(&self.remote(from)).await?;
        let copied = self.client.upload(&self.remote(to), data, false).await?;

        if let Some(record) = self.read_sidecar(from).await? {
            self.write_sidecar(to, &record.copied_to(to, ctx.user_id.clone()))
                .await?;
        }
        Ok(Self::object_info(to, &copied))
    }

    async fn metadata_inner(&self, path: &StoragePath) -> Result<StoredMetadata> {
        let item = self.require_file(path).await?;
        if let Some(record) = self.read_sidecar(path).await? {
            return Ok(record);
        }
        let data = self.client.download(&self.remote(path)).await?;
        Ok(StoredMetadata::synthesized(
            path,
            &data,
            item.last_modified_date_time,
        ))
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
        self.client.drive().await?;
        if !self.root.is_empty() && self.client.get_item(&self.root).await?.is_none() {
            return Err(Error::NotFound(format!(
                "Root folder not found: /{}",
                self.root.join("/")
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for SharePointProvider {
    fn name(&self) -> &str {
        "sharepoint"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            // Document libraries keep version history.
            versioning: true,
            server_side_copy: false,
            atomic_move: true,
            metadata_update: true,
            encryption_at_rest: true,
            max_object_size: Some(SIMPLE_UPLOAD_LIMIT),
        }
    }

    fn compliance(&self) -> ComplianceProfile {
        ComplianceProfile::new(&self.audit, true)
    }

    async fn upload(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        metadata: FileMetadata,
        options: UploadOptions,
    ) -> Result<UploadResult> {
        let outcome = self.upload_inner(path, data, metadata, &options).await;
        finish_upload(&self.audit, self.name(), path, &options, outcome).await
    }

    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<Vec<u8>> {
        let result = self.download_inner(path, &options).await;
        let draft = options.context.draft(AuditAction::Download, self.name(), path);
        audited(&self.audit, draft, result).await
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        ensure_not_reserved(path)?;
        Ok(self.item(path).await?.is_some())
    }

    async fn list(&self, path: &StoragePath, options: ListOptions) -> Result<Vec<ObjectInfo>> {
        let result = self.list_inner(path, &options).await;
        let draft = options.context.draft(AuditAction::List, self.name(), path);
        audited(&self.audit, draft, result).await
    }

    async fn delete(&self, path: &StoragePath, ctx: &OperationContext) -> Result<()> {
        let result = self.delete_inner(path).await;
        audited(&self.audit, ctx.draft(AuditAction::Delete, self.name(), path), result).await
    }

    async fn move_object(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo> {
        let result = self.move_inner(from, to).await;
        let draft = ctx
            .draft(AuditAction::Move, self.name(), from)
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
            .draft(AuditAction::Copy, self.name(), from)
            .target(to.to_string_path());
        audited(&self.audit, draft, result).await
    }

    async fn get_metadata(
        &self,
        path: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<StoredMetadata> {
        let result = self.metadata_inner(path).await;
        let draft = ctx.draft(AuditAction::MetadataRead, self.name(), path);
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
            .draft(AuditAction::MetadataUpdate, self.name(), path)
            .details(serde_json::to_value(&update).unwrap_or_default());
        audited(&self.audit, draft, result).await
    }

    async fn test_connection(&self) -> ConnectionReport {
        probe_report(self, &self.audit, self.probe()).await
    }
}

/// Factory function for creating SharePoint providers.
pub fn create_sharepoint_provider(
    config: serde_json::Value,
    audit: AuditTrail,
) -> Result<Arc<dyn StorageProvider>> {
    let config: SharePointConfig = serde_json::from_value(config)
        .map_err(|e| Error::Configuration(format!("Invalid SharePoint config: {}", e)))?;
    Ok(Arc::new(SharePointProvider::new(config, audit)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_config() -> SharePointConfig {
        SharePointConfig {
            site_id: Some("contoso.sharepoint.com,1,2".to_string()),
            root_folder: Some("/QMS/Records".to_string()),
            access_token: Some(SecretString::new("token")),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_provider() {
        let provider = SharePointProvider::new(token_config(), AuditTrail::in_memory()).unwrap();
        assert_eq!(provider.name(), "sharepoint");
        assert_eq!(
            provider.remote(&StoragePath::parse("/capa/CAPA-1.pdf").unwrap()),
            vec!["QMS", "Records", "capa", "CAPA-1.pdf"]
        );
    }

    #[test]
    fn test_drive_selection_must_be_unambiguous() {
        let mut config = token_config();
        config.drive_id = Some("b!abc".to_string());
        let err = SharePointProvider::new(config, AuditTrail::in_memory()).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));

        let mut config = token_config();
        config.site_id = None;
        assert!(SharePointProvider::new(config, AuditTrail::in_memory()).is_err());
    }

    #[test]
    fn test_credentials_required() {
        let mut config = token_config();
        config.access_token = None;
        config.tenant_id = Some("tenant".to_string());
        let err = SharePointProvider::new(config.clone(), AuditTrail::in_memory())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));

        config.client_id = Some("client".to_string());
        config.client_secret = Some(SecretString::new("secret"));
        assert!(SharePointProvider::new(config, AuditTrail::in_memory()).is_ok());
    }

    #[test]
    fn test_capabilities() {
        let provider = SharePointProvider::new(token_config(), AuditTrail::in_memory()).unwrap();
        let caps = provider.capabilities();
        assert!(!caps.server_side_copy);
        assert_eq!(caps.max_object_size, Some(250 * 1024 * 1024));
        assert!(provider.compliance().encryption_at_rest);
    }

    #[tokio::test]
    async fn test_oversize_upload_rejected_before_network() {
        let audit = AuditTrail::in_memory();
        let provider = SharePointProvider::new(token_config(), audit.clone()).unwrap();
        let data = vec![0u8; SIMPLE_UPLOAD_LIMIT as usize + 1];
        let err = provider
            .upload(
                &StoragePath::parse("/big.bin").unwrap(),
                data,
                FileMetadata::default(),
                UploadOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(audit.entries().await.unwrap().len(), 1);
    }

    #[test]
    fn test_object_info_from_item() {
        let item: DriveItem = serde_json::from_value(serde_json::json!({
            "id": "01ABC",
            "name": "SOP-1.pdf",
            "size": 12,
            "file": {}
        }))
        .unwrap();
        let info = SharePointProvider::object_info(&StoragePath::parse("/sop/SOP-1.pdf").unwrap(), &item);
        assert_eq!(info.size, Some(12));
        assert!(!info.is_directory);
        assert_eq!(info.provider_data.unwrap()["id"], "01ABC");
    }

    #[test]
    fn test_factory_rejects_bad_config() {
        let result = create_sharepoint_provider(
            serde_json::json!({ "site_id": 42 }),
            AuditTrail::in_memory(),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
