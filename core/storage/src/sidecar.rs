//! Sidecar metadata records.
//!
//! Every content object `name` has a sibling `name.meta.json` holding its
//! [`StoredMetadata`]. The suffix is reserved in every path component, and
//! sidecar files never show up in listings.

use chrono::{DateTime, Utc};

use eqms_common::{Error, Result, StoragePath};

use crate::checksum::{self, CHECKSUM_ALGORITHM};
use crate::provider::{FileMetadata, MetadataUpdate, StoredMetadata};

pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Check whether a file name is a sidecar.
pub fn is_sidecar_name(name: &str) -> bool {
    name.ends_with(SIDECAR_SUFFIX)
}

/// Sidecar location for a content path.
pub fn sidecar_path(path: &StoragePath) -> Result<StoragePath> {
    let name = path
        .name()
        .ok_or_else(|| Error::InvalidInput("Root has no sidecar".to_string()))?;
    path.with_name(&format!("{}{}", name, SIDECAR_SUFFIX))
}

/// Reject paths with a reserved component anywhere along them.
///
/// The root is allowed.
pub fn ensure_not_reserved(path: &StoragePath) -> Result<()> {
    match path.components().iter().find(|c| is_sidecar_name(c)) {
        Some(_) => Err(Error::InvalidInput(format!(
            "Names ending in '{}' are reserved: {}",
            SIDECAR_SUFFIX, path
        ))),
        None => Ok(()),
    }
}

/// Reject paths that cannot hold content: the root and reserved names.
pub fn ensure_object_path(path: &StoragePath) -> Result<()> {
    if path.is_root() {
        return Err(Error::InvalidInput(
            "Operation requires a file path, not the root".to_string(),
        ));
    }
    ensure_not_reserved(path)
}

/// What an upload replaces at its destination.
#[derive(Debug, Clone, Copy)]
pub enum Replaced<'a> {
    /// Nothing stored there yet.
    Nothing,
    /// Content written without a sidecar; it counts as version 1.
    Untracked { modified: Option<DateTime<Utc>> },
    /// Content with its sidecar record.
    Record(&'a StoredMetadata),
}

impl<'a> Replaced<'a> {
    /// Classify a destination from its existence and sidecar.
    pub fn new(
        exists: bool,
        sidecar: Option<&'a StoredMetadata>,
        modified: Option<DateTime<Utc>>,
    ) -> Self {
        match sidecar {
            Some(record) => Replaced::Record(record),
            None if exists => Replaced::Untracked { modified },
            None => Replaced::Nothing,
        }
    }
}

impl StoredMetadata {
    /// Record for freshly uploaded content.
    ///
    /// Keeps `created_at` of the replaced content and bumps its version.
    pub fn for_upload(
        path: &StoragePath,
        size: u64,
        checksum: String,
        metadata: FileMetadata,
        replaced: Replaced<'_>,
        uploaded_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let (version, created_at) = match replaced {
            Replaced::Nothing => (1, now),
            Replaced::Untracked { modified } => (2, modified.unwrap_or(now)),
            Replaced::Record(previous) => (previous.version.saturating_add(1), previous.created_at),
        };
        Self {
            path: path.to_string_path(),
            size,
            checksum,
            checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
            version,
            created_at,
            updated_at: now,
            uploaded_by,
            metadata,
        }
    }

    /// Record for content that has no sidecar yet.
    pub fn synthesized(path: &StoragePath, data: &[u8], modified: Option<DateTime<Utc>>) -> Self {
        let modified = modified.unwrap_or_else(Utc::now);
        Self {
            path: path.to_string_path(),
            size: data.len() as u64,
            checksum: checksum::sha256_hex(data),
            checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
            version: 1,
            created_at: modified,
            updated_at: modified,
            uploaded_by: None,
            metadata: FileMetadata::default(),
        }
    }

    /// Same record at a new location.
    pub fn moved_to(&self, to: &StoragePath) -> Self {
        Self {
            path: to.to_string_path(),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Record for a copy: same content and metadata, new object history.
    pub fn copied_to(&self, to: &StoragePath, copied_by: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            path: to.to_string_path(),
            version: 1,
            created_at: now,
            updated_at: now,
            uploaded_by: copied_by,
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl MetadataUpdate {
    /// Check whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == MetadataUpdate::default()
    }

    /// Apply the patch to a record and advance `updated_at`.
    pub fn apply(&self, record: &mut StoredMetadata) {
        let meta = &mut record.metadata;
        if let Some(v) = &self.original_name {
            meta.original_name = Some(v.clone());
        }
        if let Some(v) = &self.content_type {
            meta.content_type = Some(v.clone());
        }
        if let Some(v) = &self.document_id {
            meta.document_id = Some(v.clone());
        }
        if let Some(v) = &self.document_type {
            meta.document_type = Some(v.clone());
        }
        if let Some(v) = &self.revision {
            meta.revision = Some(v.clone());
        }
        if let Some(v) = &self.classification {
            meta.classification = Some(v.clone());
        }
        if let Some(v) = self.retention_years {
            meta.retention_years = Some(v);
        }
        meta.tags
            .extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        for key in &self.remove_tags {
            meta.tags.remove(key);
        }
        record.updated_at = Utc::now();
    }
}
