//! Audit entry types and hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Kind of storage operation being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Upload,
    Download,
    Delete,
    Move,
    Copy,
    List,
    MetadataRead,
    MetadataUpdate,
    ConnectionTest,
}

impl AuditAction {
    /// Stable lowercase name, also used as hash input.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Upload => "upload",
            AuditAction::Download => "download",
            AuditAction::Delete => "delete",
            AuditAction::Move => "move",
            AuditAction::Copy => "copy",
            AuditAction::List => "list",
            AuditAction::MetadataRead => "metadata_read",
            AuditAction::MetadataUpdate => "metadata_update",
            AuditAction::ConnectionTest => "connection_test",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the recorded operation succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { message: String },
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }

    fn hash_input(&self) -> String {
        match self {
            AuditOutcome::Success => "success".to_string(),
            AuditOutcome::Failure { message } => format!("failure:{}", message),
        }
    }
}

/// Operation details supplied by a provider before chaining.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub action: AuditAction,
    pub provider: String,
    pub path: String,
    pub target_path: Option<String>,
    pub user_id: Option<String>,
    pub reason: Option<String>,
    pub outcome: AuditOutcome,
    pub checksum: Option<String>,
    pub details: serde_json::Value,
}

impl AuditDraft {
    /// Start a successful draft for `action` on `path`.
    pub fn new(action: AuditAction, provider: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            action,
            provider: provider.into(),
            path: path.into(),
            target_path: None,
            user_id: None,
            reason: None,
            outcome: AuditOutcome::Success,
            checksum: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target_path = Some(target.into());
        self
    }

    pub fn user(mut self, user_id: Option<String>, reason: Option<String>) -> Self {
        self.user_id = user_id;
        self.reason = reason;
        self
    }

    pub fn checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Failure {
            message: message.into(),
        };
        self
    }
}

/// A chained, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub provider: String,
    pub path: String,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl AuditEntry {
    /// Seal a draft into an entry linked to `previous_hash`.
    pub fn seal(draft: AuditDraft, sequence: u64, previous_hash: Option<String>) -> Self {
        let mut entry = Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            action: draft.action,
            provider: draft.provider,
            path: draft.path,
            target_path: draft.target_path,
            user_id: draft.user_id,
            reason: draft.reason,
            outcome: draft.outcome,
            checksum: draft.checksum,
            details: draft.details,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry.calculate_hash();
        entry
    }

    /// Recompute the hash over every field except `hash` itself.
    ///
    /// Variable-length fields are length-prefixed so that bytes cannot be
    /// shifted from one field into the next without changing the hash.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.id.as_bytes());
        hash_field(&mut hasher, self.timestamp.to_rfc3339().as_bytes());
        hash_field(&mut hasher, self.action.as_str().as_bytes());
        hash_field(&mut hasher, self.provider.as_bytes());
        hash_field(&mut hasher, self.path.as_bytes());
        for field in [
            &self.target_path,
            &self.user_id,
            &self.reason,
            &self.checksum,
            &self.previous_hash,
        ] {
            // Presence byte keeps None and Some("") distinct.
            match field {
                Some(value) => {
                    hasher.update([1u8]);
                    hash_field(&mut hasher, value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        hash_field(&mut hasher, self.outcome.hash_input().as_bytes());
        hash_field(&mut hasher, self.details.to_string().as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Check the stored hash against the entry contents.
    pub fn verify_integrity(&self) -> bool {
        self.calculate_hash() == self.hash
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
