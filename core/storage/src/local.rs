//! Local filesystem storage provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eqms_audit::{AuditAction, AuditTrail};
use eqms_common::{Error, Result, StoragePath};

use crate::checksum;
use crate::provider::{
    audited, finish_upload, preflight_upload, probe_report, ComplianceProfile, ConnectionReport,
    DownloadOptions, FileMetadata, ListOptions, MetadataUpdate, ObjectInfo, OperationContext,
    ProviderCapabilities, StorageProvider, StoredMetadata, UploadOptions, UploadResult,
};
use crate::sidecar::{
    ensure_not_reserved, ensure_object_path, is_sidecar_name, sidecar_path, Replaced,
};

/// Configuration for [`LocalFileStorageProvider`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding all records.
    pub root: PathBuf,
    /// Flush file contents to disk before the rename that publishes them.
    #[serde(default)]
    pub fsync: bool,
}

/// Local filesystem storage provider.
///
/// Stores records in a directory tree below `root`, each with a
/// `.meta.json` sidecar next to it. Writes go to a temporary file in the
/// target directory and are renamed into place.
pub struct LocalFileStorageProvider {
    root: PathBuf,
    fsync: bool,
    audit: AuditTrail,
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

impl LocalFileStorageProvider {
    /// Create a new local provider with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Root exists but is not a directory
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>, audit: AuditTrail) -> Result<Self> {
        Self::from_config(
            LocalConfig {
                root: root.as_ref().to_path_buf(),
                fsync: false,
            },
            audit,
        )
    }

    pub fn from_config(config: LocalConfig, audit: AuditTrail) -> Result<Self> {
        let root = config.root;

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        } else if !root.is_dir() {
            return Err(Error::Configuration(format!(
                "Storage root is not a directory: {}",
                root.display()
            )));
        }

        info!(root = %root.display(), "Local storage provider ready");
        Ok(Self {
            root,
            fsync: config.fsync,
            audit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a StoragePath to a filesystem path.
    fn to_fs_path(&self, path: &StoragePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn object_info(&self, path: &StoragePath, fs_meta: &std::fs::Metadata) -> ObjectInfo {
        let modified: Option<DateTime<Utc>> = fs_meta.modified().ok().map(|t| t.into());

        ObjectInfo {
            path: path.to_string_path(),
            name: path.name().unwrap_or("/").to_string(),
            size: if fs_meta.is_file() {
                Some(fs_meta.len())
            } else {
                None
            },
            is_directory: fs_meta.is_dir(),
            modified,
            etag: modified.map(|m| format!("{}-{}", m.timestamp(), fs_meta.len())),
            provider_data: None,
        }
    }

    /// Write via a temporary sibling and rename it over `target`.
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput("Target has no parent directory".to_string()))?;
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = parent.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));

        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            if self.fsync {
                file.sync_all().await?;
            }
            drop(file);
            fs::rename(&tmp, target).await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_sidecar(&self, path: &StoragePath) -> Result<Option<StoredMetadata>> {
        let sidecar = self.to_fs_path(&sidecar_path(path)?);
        match fs::read(&sidecar).await {
            Ok(bytes) => Ok(Some(StoredMetadata::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_sidecar(&self, path: &StoragePath, record: &StoredMetadata) -> Result<()> {
        let sidecar = self.to_fs_path(&sidecar_path(path)?);
        self.write_atomic(&sidecar, &record.to_bytes()?).await
    }

    async fn remove_sidecar(&self, path: &StoragePath) -> Result<()> {
        let sidecar = self.to_fs_path(&sidecar_path(path)?);
        match fs::remove_file(&sidecar).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure the parent directory of `fs_path` exists.
    async fn prepare_parent(&self, fs_path: &Path, create: bool) -> Result<()> {
        let Some(parent) = fs_path.parent() else {
            return Ok(());
        };
        if parent.is_dir() {
            return Ok(());
        }
        if parent.exists() {
            return Err(Error::InvalidInput("Parent is a file".to_string()));
        }
        if !create {
            return Err(Error::NotFound("Parent directory not found".to_string()));
        }
        fs::create_dir_all(parent).await?;
        Ok(())
    }

    async fn upload_inner(
        &self,
        path: &StoragePath,
        data: Vec<u8>,
        metadata: FileMetadata,
        options: &UploadOptions,
    ) -> Result<StoredMetadata> {
        let checksum = preflight_upload(&self.capabilities(), path, &data, options)?;
        let fs_path = self.to_fs_path(path);

        self.prepare_parent(&fs_path, options.create_parents).await?;

        if fs_path.is_dir() {
            return Err(Error::InvalidInput(format!("Path is a directory: {}", path)));
        }

        let existed = fs_path.exists();
        if existed && !options.overwrite {
            return Err(Error::AlreadyExists(format!("File already exists: {}", path)));
        }
        let (previous, modified) = if existed {
            let modified = fs::metadata(&fs_path)
                .await?
                .modified()
                .ok()
                .map(DateTime::<Utc>::from);
            (self.read_sidecar(path).await?, modified)
        } else {
            (None, None)
        };

        let record = StoredMetadata::for_upload(
            path,
            data.len() as u64,
            checksum,
            metadata,
            Replaced::new(existed, previous.as_ref(), modified),
            options.context.user_id.clone(),
        );

        // Sidecar first: content is never visible without its record.
        self.write_sidecar(path, &record).await?;
        if let Err(e) = self.write_atomic(&fs_path, &data).await {
            let rollback = match &previous {
                Some(previous) => self.write_sidecar(path, previous).await,
                None => self.remove_sidecar(path).await,
            };
            if let Err(rollback) = rollback {
                warn!(path = %path, error = %rollback, "Failed to restore sidecar");
            }
            return Err(e);
        }

        debug!(path = %path, version = record.version, "Stored object");
        Ok(record)
    }

    async fn download_inner(&self, path: &StoragePath, options: &DownloadOptions) -> Result<Vec<u8>> {
        ensure_object_path(path)?;
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput("Cannot download directory".to_string()));
        }

        let data = fs::read(&fs_path).await?;

        if options.verify_checksum {
            if let Some(record) = self.read_sidecar(path).await? {
                checksum::verify(&record.checksum, &checksum::sha256_hex(&data))?;
            }
        }

        Ok(data)
    }

    async fn list_inner(&self, path: &StoragePath, options: &ListOptions) -> Result<Vec<ObjectInfo>> {
        ensure_not_reserved(path)?;
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("Directory not found: {}", path)));
        }

        if !fs_path.is_dir() {
            return Err(Error::InvalidInput("Not a directory".to_string()));
        }

        let mut results = Vec::new();
        let mut pending = vec![path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(self.to_fs_path(&dir)).await?;

            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                let fs_meta = entry.metadata().await?;
                if !fs_meta.is_dir() && (is_sidecar_name(&name) || is_temp_name(&name)) {
                    continue;
                }
                let Ok(child) = dir.join(&name) else {
                    continue;
                };

                if options.recursive && fs_meta.is_dir() {
                    pending.push(child.clone());
                }
                results.push(self.object_info(&child, &fs_meta));
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn delete_inner(&self, path: &StoragePath) -> Result<()> {
        ensure_object_path(path)?;
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput(
                "Cannot delete a directory".to_string(),
            ));
        }

        fs::remove_file(&fs_path).await?;
        self.remove_sidecar(path).await
    }

    fn check_transfer(from: &StoragePath, to: &StoragePath) -> Result<()> {
        ensure_object_path(from)?;
        ensure_object_path(to)?;
        if from == to || from.is_ancestor_of(to) {
            return Err(Error::InvalidInput(format!(
                "Cannot transfer {} into {}",
                from, to
            )));
        }
        Ok(())
    }

    /// Rewrite the `path` field of sidecars below a moved directory.
    async fn relocate_sidecars(&self, dir: &StoragePath) -> Result<()> {
        let options = ListOptions {
            recursive: true,
            ..Default::default()
        };
        for info in self.list_inner(dir, &options).await? {
            if info.is_directory {
                continue;
            }
            let child = StoragePath::parse(&info.path)?;
            if let Some(record) = self.read_sidecar(&child).await? {
                if record.path != info.path {
                    self.write_sidecar(&child, &record.moved_to(&child)).await?;
                }
            }
        }
        Ok(())
    }

    async fn move_inner(&self, from: &StoragePath, to: &StoragePath) -> Result<ObjectInfo> {
        Self::check_transfer(from, to)?;
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !from_path.exists() {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if to_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        self.prepare_parent(&to_path, true).await?;
        fs::rename(&from_path, &to_path).await?;

        if to_path.is_dir() {
            self.relocate_sidecars(to).await?;
        } else if let Some(record) = self.read_sidecar(from).await? {
            self.write_sidecar(to, &record.moved_to(to)).await?;
            self.remove_sidecar(from).await?;
        }

        let fs_meta = fs::metadata(&to_path).await?;
        Ok(self.object_info(to, &fs_meta))
    }

    async fn copy_inner(
        &self,
        from: &StoragePath,
        to: &StoragePath,
        ctx: &OperationContext,
    ) -> Result<ObjectInfo> {
        Self::check_transfer(from, to)?;
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !from_path.exists() {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if from_path.is_dir() {
            return Err(Error::InvalidInput("Cannot copy directory".to_string()));
        }

        if to_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        self.prepare_parent(&to_path, true).await?;
        fs::copy(&from_path, &to_path).await?;

        if let Some(record) = self.read_sidecar(from).await? {
            self.write_sidecar(to, &record.copied_to(to, ctx.user_id.clone()))
                .await?;
        }

        let fs_meta = fs::metadata(&to_path).await?;
        Ok(self.object_info(to, &fs_meta))
    }

    async fn metadata_inner(&self, path: &StoragePath) -> Result<StoredMetadata> {
        ensure_object_path(path)?;
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("Path not found: {}", path)));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput("Directories have no metadata record".to_string()));
        }

        if let Some(record) = self.read_sidecar(path).await? {
            return Ok(record);
        }

        let data = fs::read(&fs_path).await?;
        let modified = fs::metadata(&fs_path)
            .await?
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(StoredMetadata::synthesized(path, &data, modified))
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

    /// Write, read back and remove a probe file in the root.
    async fn probe(&self) -> Result<()> {
        let probe = self.root.join(format!(".eqms-probe-{}.tmp", Uuid::new_v4()));
        let payload = b"probe";
        fs::write(&probe, payload).await?;
        let read_back = fs::read(&probe).await;
        fs::remove_file(&probe).await?;
        if read_back? != payload {
            return Err(Error::Storage("Probe file read back differently".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalFileStorageProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            versioning: false,
            server_side_copy: true,
            atomic_move: true,
            metadata_update: true,
            encryption_at_rest: false,
            max_object_size: None,
        }
    }

    fn compliance(&self) -> ComplianceProfile {
        ComplianceProfile::new(&self.audit, false)
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
        let fs_path = self.to_fs_path(path);
        Ok(fs_path.exists())
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

#[cfg(test)]
mod tests {
    use super::*;
    use eqms_audit::{verify_chain, AuditOutcome};
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalFileStorageProvider, AuditTrail) {
        let temp = TempDir::new().unwrap();
        let audit = AuditTrail::in_memory();
        let provider = LocalFileStorageProvider::new(temp.path(), audit.clone()).unwrap();
        (temp, provider, audit)
    }

    fn path(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    async fn put(provider: &LocalFileStorageProvider, p: &str, data: &[u8]) -> UploadResult {
        provider
            .upload(&path(p), data.to_vec(), FileMetadata::default(), UploadOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_upload_download() {
        let (temp, provider, _) = setup();
        let data = b"Hello, Local!".to_vec();

        let result = put(&provider, "/sop/SOP-001.pdf", &data).await;
        assert!(result.success);
        assert_eq!(result.file_path, "/sop/SOP-001.pdf");
        assert_eq!(result.checksum, checksum::sha256_hex(&data));
        assert_eq!(result.version, 1);
        assert!(result.audit_log.is_some());

        assert!(temp.path().join("sop/SOP-001.pdf.meta.json").exists());

        let downloaded = provider
            .download(&path("/sop/SOP-001.pdf"), DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn test_overwrite_bumps_version() {
        let (_temp, provider, _) = setup();
        put(&provider, "/a.txt", b"one").await;
        let second = put(&provider, "/a.txt", b"two").await;
        assert_eq!(second.version, 2);

        let options = UploadOptions {
            overwrite: false,
            ..Default::default()
        };
        let err = provider
            .upload(&path("/a.txt"), b"three".to_vec(), FileMetadata::default(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_upload_without_parent_creation() {
        let (_temp, provider, _) = setup();
        let options = UploadOptions {
            create_parents: false,
            ..Default::default()
        };
        let err = provider
            .upload(&path("/missing/a.txt"), vec![1], FileMetadata::default(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_download_detects_tampering() {
        let (temp, provider, _) = setup();
        put(&provider, "/rec.txt", b"original").await;
        std::fs::write(temp.path().join("rec.txt"), b"tampered").unwrap();

        let err = provider
            .download(&path("/rec.txt"), DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));

        let options = DownloadOptions {
            verify_checksum: false,
            ..Default::default()
        };
        let data = provider.download(&path("/rec.txt"), options).await.unwrap();
        assert_eq!(data, b"tampered");
    }

    #[tokio::test]
    async fn test_local_list_hides_sidecars() {
        let (_temp, provider, _) = setup();
        put(&provider, "/dir/file1.txt", &[1]).await;
        put(&provider, "/dir/file2.txt", &[2]).await;
        put(&provider, "/dir/sub/file3.txt", &[3]).await;

        let contents = provider.list(&path("/dir"), ListOptions::default()).await.unwrap();
        let names: Vec<_> = contents.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["file1.txt", "file2.txt", "sub"]);
        assert!(contents[2].is_directory);

        let options = ListOptions {
            recursive: true,
            ..Default::default()
        };
        let all = provider.list(&path("/dir"), options).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().any(|i| i.path == "/dir/sub/file3.txt"));

        let options = ListOptions {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(provider.list(&path("/dir"), options).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_errors() {
        let (_temp, provider, _) = setup();
        put(&provider, "/file.txt", &[1]).await;

        let err = provider.list(&path("/nope"), ListOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = provider
            .list(&path("/file.txt"), ListOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_sidecar() {
        let (temp, provider, _) = setup();
        put(&provider, "/a.txt", b"x").await;

        provider.delete(&path("/a.txt"), &OperationContext::system()).await.unwrap();
        assert!(!provider.exists(&path("/a.txt")).await.unwrap());
        assert!(!temp.path().join("a.txt.meta.json").exists());

        let err = provider
            .delete(&path("/a.txt"), &OperationContext::system())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_move_carries_sidecar() {
        let (_temp, provider, _) = setup();
        let metadata = FileMetadata {
            document_id: Some("CAPA-0007".to_string()),
            ..Default::default()
        };
        provider
            .upload(&path("/open/capa.pdf"), b"capa".to_vec(), metadata, UploadOptions::default())
            .await
            .unwrap();

        let ctx = OperationContext::user("qa.lead");
        let info = provider
            .move_object(&path("/open/capa.pdf"), &path("/closed/capa.pdf"), &ctx)
            .await
            .unwrap();
        assert_eq!(info.path, "/closed/capa.pdf");
        assert!(!provider.exists(&path("/open/capa.pdf")).await.unwrap());

        let record = provider.get_metadata(&path("/closed/capa.pdf"), &ctx).await.unwrap();
        assert_eq!(record.path, "/closed/capa.pdf");
        assert_eq!(record.metadata.document_id.as_deref(), Some("CAPA-0007"));
    }

    #[tokio::test]
    async fn test_move_directory_relocates_sidecars() {
        let (_temp, provider, _) = setup();
        put(&provider, "/2023/audit.pdf", b"a").await;

        let ctx = OperationContext::system();
        let info = provider
            .move_object(&path("/2023"), &path("/archive/2023"), &ctx)
            .await
            .unwrap();
        assert!(info.is_directory);

        let record = provider
            .get_metadata(&path("/archive/2023/audit.pdf"), &ctx)
            .await
            .unwrap();
        assert_eq!(record.path, "/archive/2023/audit.pdf");
    }

    #[tokio::test]
    async fn test_transfer_conflicts() {
        let (_temp, provider, _) = setup();
        put(&provider, "/a.txt", b"a").await;
        put(&provider, "/b.txt", b"b").await;
        let ctx = OperationContext::system();

        let err = provider.copy(&path("/a.txt"), &path("/b.txt"), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        let err = provider
            .move_object(&path("/missing.txt"), &path("/c.txt"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = provider
            .move_object(&path("/a.txt"), &path("/a.txt"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_copy_resets_version() {
        let (_temp, provider, _) = setup();
        put(&provider, "/a.txt", b"one").await;
        put(&provider, "/a.txt", b"two").await;

        let ctx = OperationContext::user("doc.control");
        provider.copy(&path("/a.txt"), &path("/copy/a.txt"), &ctx).await.unwrap();

        let record = provider.get_metadata(&path("/copy/a.txt"), &ctx).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.uploaded_by.as_deref(), Some("doc.control"));
        assert_eq!(record.checksum, checksum::sha256_hex(b"two"));
        assert_eq!(
            provider.download(&path("/copy/a.txt"), DownloadOptions::default()).await.unwrap(),
            b"two"
        );
    }

    #[tokio::test]
    async fn test_metadata_synthesized_without_sidecar() {
        let (temp, provider, _) = setup();
        std::fs::write(temp.path().join("legacy.txt"), b"legacy").unwrap();

        let record = provider
            .get_metadata(&path("/legacy.txt"), &OperationContext::system())
            .await
            .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.size, 6);
        assert_eq!(record.checksum, checksum::sha256_hex(b"legacy"));
    }

    #[tokio::test]
    async fn test_update_metadata() {
        let (_temp, provider, _) = setup();
        put(&provider, "/sop.pdf", b"sop").await;

        let update = MetadataUpdate {
            revision: Some("C".to_string()),
            ..Default::default()
        };
        let ctx = OperationContext::user("qa.lead").with_reason("periodic review");
        let record = provider.update_metadata(&path("/sop.pdf"), update, &ctx).await.unwrap();
        assert_eq!(record.metadata.revision.as_deref(), Some("C"));
        assert_eq!(record.version, 1);

        let reread = provider.get_metadata(&path("/sop.pdf"), &ctx).await.unwrap();
        assert_eq!(reread, record);
    }

    #[tokio::test]
    async fn test_reserved_names_rejected() {
        let (_temp, provider, _) = setup();
        let err = provider
            .upload(
                &path("/x.meta.json"),
                vec![1],
                FileMetadata::default(),
                UploadOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = provider
            .upload(
                &path("/report.meta.json/doc.pdf"),
                vec![1],
                FileMetadata::default(),
                UploadOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        put(&provider, "/a.txt", b"a").await;
        let err = provider.exists(&path("/a.txt.meta.json")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(provider.exists(&StoragePath::root()).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_shows_directory_with_reserved_suffix() {
        let (temp, provider, _) = setup();
        std::fs::create_dir(temp.path().join("x.meta.json")).unwrap();
        put(&provider, "/a.txt", b"a").await;

        let names: Vec<_> = provider
            .list(&StoragePath::root(), ListOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "x.meta.json"]);
    }

    #[tokio::test]
    async fn test_overwrite_of_untracked_file_is_version_two() {
        let (temp, provider, _) = setup();
        std::fs::write(temp.path().join("legacy.txt"), b"from before").unwrap();
        let ctx = OperationContext::default();

        let before = provider.get_metadata(&path("/legacy.txt"), &ctx).await.unwrap();
        assert_eq!(before.version, 1);

        let options = UploadOptions {
            overwrite: true,
            ..Default::default()
        };
        provider
            .upload(&path("/legacy.txt"), b"revised".to_vec(), FileMetadata::default(), options)
            .await
            .unwrap();

        let after = provider.get_metadata(&path("/legacy.txt"), &ctx).await.unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn test_failed_sidecar_write_publishes_nothing() {
        let (temp, provider, _) = setup();
        std::fs::create_dir(temp.path().join("new.txt.meta.json")).unwrap();

        let err = provider
            .upload(&path("/new.txt"), b"data".to_vec(), FileMetadata::default(), UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_) | Error::Storage(_)));
        assert!(!temp.path().join("new.txt").exists());
    }

    struct RejectingSink;

    #[async_trait]
    impl eqms_audit::AuditSink for RejectingSink {
        async fn append(&self, _entry: &eqms_audit::AuditEntry) -> Result<()> {
            Err(Error::Storage("audit volume full".to_string()))
        }

        async fn entries(&self) -> Result<Vec<eqms_audit::AuditEntry>> {
            Ok(Vec::new())
        }

        fn is_durable(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_upload_survives_audit_failure() {
        let temp = TempDir::new().unwrap();
        let audit = AuditTrail::new(std::sync::Arc::new(RejectingSink));
        let provider = LocalFileStorageProvider::new(temp.path(), audit).unwrap();

        let result = put(&provider, "/a.txt", b"a").await;
        assert!(result.success);
        assert!(result.audit_log.is_none());
        let data = provider.download(&path("/a.txt"), DownloadOptions::default()).await.unwrap();
        assert_eq!(data, b"a");
    }

    #[tokio::test]
    async fn test_every_operation_audited() {
        let (_temp, provider, audit) = setup();
        let ctx = OperationContext::user("qa.lead");
        put(&provider, "/a.txt", b"a").await;
        provider.download(&path("/a.txt"), DownloadOptions::default()).await.unwrap();
        let _ = provider.delete(&path("/missing.txt"), &ctx).await;

        let entries = audit.entries().await.unwrap();
        let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Upload, AuditAction::Download, AuditAction::Delete]
        );
        assert_eq!(entries[0].checksum.as_deref(), Some(checksum::sha256_hex(b"a").as_str()));
        assert!(matches!(entries[2].outcome, AuditOutcome::Failure { .. }));
        assert_eq!(entries[2].user_id.as_deref(), Some("qa.lead"));
        assert!(verify_chain(&entries).valid);
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let (temp, provider, _) = setup();
        let report = provider.test_connection().await;
        assert!(report.connected);
        assert_eq!(report.provider, "local");
        assert!(report.error.is_none());
        assert!(!report.compliance.audit_trail);

        // Probe leaves nothing behind.
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_root_must_be_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let result = LocalFileStorageProvider::new(&file, AuditTrail::in_memory());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
