//! Hash-chained audit trail handle.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use eqms_common::Result;

use crate::entry::{AuditDraft, AuditEntry};
use crate::sink::{AuditSink, MemoryAuditSink};

#[derive(Debug, Default)]
struct ChainHead {
    sequence: u64,
    last_hash: Option<String>,
}

/// Shared handle that seals drafts into the chain and hands them to a sink.
///
/// Cloning is cheap; clones append to the same chain.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    head: Arc<Mutex<ChainHead>>,
}

impl AuditTrail {
    /// Start a fresh chain on `sink`.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            head: Arc::new(Mutex::new(ChainHead::default())),
        }
    }

    /// Trail backed by a fresh in-memory sink.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditSink::new()))
    }

    /// Continue the chain already stored in `sink`.
    ///
    /// # Errors
    /// - Existing entries cannot be read
    pub async fn resume(sink: Arc<dyn AuditSink>) -> Result<Self> {
        let entries = sink.entries().await?;
        let head = match entries.last() {
            Some(last) => ChainHead {
                sequence: last.sequence,
                last_hash: Some(last.hash.clone()),
            },
            None => ChainHead::default(),
        };
        debug!(sequence = head.sequence, "Resumed audit trail");

        Ok(Self {
            sink,
            head: Arc::new(Mutex::new(head)),
        })
    }

    /// Seal and append a draft.
    ///
    /// The chain head only advances when the sink accepted the entry, so a
    /// failed append leaves no gap in the sequence.
    pub async fn record(&self, draft: AuditDraft) -> Result<AuditEntry> {
        let mut head = self.head.lock().await;
        let entry = AuditEntry::seal(draft, head.sequence + 1, head.last_hash.clone());
        self.sink.append(&entry).await?;

        head.sequence = entry.sequence;
        head.last_hash = Some(entry.hash.clone());
        Ok(entry)
    }

    /// Record a draft, logging instead of failing when the sink rejects it.
    pub async fn record_or_warn(&self, draft: AuditDraft) -> Option<AuditEntry> {
        let action = draft.action;
        let path = draft.path.clone();
        match self.record(draft).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(%action, %path, error = %e, "Failed to append audit entry");
                None
            }
        }
    }

    /// All entries currently held by the sink.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.sink.entries().await
    }

    /// Whether the underlying sink is durable.
    pub fn is_durable(&self) -> bool {
        self.sink.is_durable()
    }
}

/// Result of walking a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_verified: usize,
    /// Entries whose own hash is wrong, or whose link to the previous entry is broken.
    pub broken_links: Vec<Uuid>,
}

/// Verify hashes, linkage and sequence continuity of `entries`.
///
/// The first entry may start anywhere (a trail can be exported from the
/// middle), but each following entry must continue its predecessor.
pub fn verify_chain(entries: &[AuditEntry]) -> ChainVerification {
    let mut broken_links = Vec::new();
    let mut previous: Option<&AuditEntry> = None;

    for entry in entries {
        let mut ok = entry.verify_integrity();
        if let Some(prev) = previous {
            ok &= entry.previous_hash.as_deref() == Some(prev.hash.as_str());
            ok &= entry.sequence == prev.sequence + 1;
        }
        if !ok {
            broken_links.push(entry.id);
        }
        previous = Some(entry);
    }

    ChainVerification {
        valid: broken_links.is_empty(),
        entries_verified: entries.len(),
        broken_links,
    }
}
