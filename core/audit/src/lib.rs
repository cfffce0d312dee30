//! Audit trail for storage operations.
//!
//! Every storage operation produces one [`AuditEntry`]. Entries are linked
//! into a SHA-256 hash chain so that a reviewer can detect removed,
//! reordered or edited records (21 CFR Part 11 audit trail requirement).
//!
//! Entries are handed to an [`AuditSink`]; the in-memory sink is used for
//! tests and ad-hoc sessions, the JSON-lines sink for durable trails.

pub mod entry;
pub mod sink;
pub mod trail;

pub use entry::{AuditAction, AuditDraft, AuditEntry, AuditOutcome};
pub use sink::{AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use trail::{verify_chain, AuditTrail, ChainVerification};
