//! Audit sinks: where sealed entries are kept.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use eqms_common::{Error, Result};

use crate::entry::AuditEntry;

/// Destination for sealed audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one entry. Entries arrive in sequence order.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// All entries recorded so far, oldest first.
    async fn entries(&self) -> Result<Vec<AuditEntry>>;

    /// Whether entries survive a process restart.
    fn is_durable(&self) -> bool;
}

/// In-memory sink. Entries are lost on drop.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.read().await.clone())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Append-only JSON-lines file sink.
///
/// One entry per line. The file is opened in append mode for every write so
/// that several processes sharing a log never truncate each other.
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    /// Create a sink writing to `path`.
    ///
    /// # Postconditions
    /// - Parent directory exists
    ///
    /// # Errors
    /// - Parent directory cannot be created
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str::<AuditEntry>(line).map_err(|e| {
                    Error::Serialization(format!(
                        "{}:{}: {}",
                        self.path.display(),
                        idx + 1,
                        e
                    ))
                })
            })
            .collect()
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditAction, AuditDraft};
    use tempfile::TempDir;

    fn entry(seq: u64) -> AuditEntry {
        AuditEntry::seal(
            AuditDraft::new(AuditAction::Download, "memory", format!("/doc-{}.pdf", seq)),
            seq,
            None,
        )
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryAuditSink::new();
        sink.append(&entry(1)).await.unwrap();
        sink.append(&entry(2)).await.unwrap();

        let entries = sink.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
        assert!(!sink.is_durable());
    }

    #[tokio::test]
    async fn test_jsonl_sink_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs").join("audit.jsonl");

        let sink = JsonlAuditSink::open(&path).await.unwrap();
        assert!(sink.entries().await.unwrap().is_empty());
        sink.append(&entry(1)).await.unwrap();
        sink.append(&entry(2)).await.unwrap();

        let reopened = JsonlAuditSink::open(&path).await.unwrap();
        let entries = reopened.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/doc-1.pdf");
        assert!(reopened.is_durable());
    }

    #[tokio::test]
    async fn test_jsonl_sink_reports_bad_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.jsonl");
        tokio::fs::write(&path, b"{\"broken\": true}\n").await.unwrap();

        let sink = JsonlAuditSink::open(&path).await.unwrap();
        let err = sink.entries().await.unwrap_err();
        assert!(matches!(err, Error::Serialization(msg) if msg.contains(":1:")));
    }
}
