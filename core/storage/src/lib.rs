//! Storage provider abstraction for quality records.
//!
//! This crate provides a trait-based interface for document storage backends
//! (local filesystem, S3, Azure Blob, Google Cloud Storage, SharePoint) and a
//! factory for resolving providers from a tag and a JSON configuration.
//!
//! # Design Principles
//! - Uniform contract: every backend reports the same result records
//! - Sidecar metadata: each object carries a `.meta.json` record with its
//!   SHA-256 checksum, version and document metadata
//! - Audited: every operation appends to a hash-chained audit trail
//! - Unified error semantics: Consistent error types across providers

pub mod checksum;
pub mod local;
pub mod object;
pub mod provider;
pub mod registry;
pub mod sharepoint;
pub mod sidecar;

pub use local::{LocalConfig, LocalFileStorageProvider};
pub use object::{AzureConfig, GcsConfig, MemoryConfig, ObjectStoreProvider, S3Config};
pub use provider::{
    ComplianceProfile, ConnectionReport, DownloadOptions, FileMetadata, ListOptions,
    MetadataUpdate, ObjectInfo, OperationContext, ProviderCapabilities, StorageProvider,
    StoredMetadata, UploadOptions, UploadResult, COMPLIANCE_STANDARDS,
};
pub use registry::{parse_config, ProviderFactory, StorageProviderFactory};
pub use sharepoint::{SharePointConfig, SharePointProvider};
