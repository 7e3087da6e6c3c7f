//! VTS Audit - tamper-evident run history
//!
//! Every run owns one append-only chain of [`AuditRecord`]s. Each record's
//! checksum covers its own fields plus the previous record's signature, and
//! each checksum is signed with the run's ed25519 key, so editing, dropping
//! or reordering any record breaks verification from that point on.
//!
//! # Example
//!
//! ```rust,ignore
//! use vts_audit::{AuditAction, AuditRecorder, AuditSigner, MemoryAuditSink, RunId};
//!
//! let recorder = AuditRecorder::new(RunId::new(), Arc::new(AuditSigner::generate()), Arc::new(MemoryAuditSink::new()));
//! recorder.record("run:1", "orchestrator", AuditAction::RunStarted, json!({})).await?;
//! recorder.verify_chain().await?;
//! ```

#![allow(missing_docs)]

pub mod chain;
pub mod checksum;
pub mod error;
pub mod record;
pub mod recorder;
pub mod seal;
pub mod signer;
pub mod sink;

pub use chain::ChainVerifier;
pub use checksum::{Checksum, RecordSignature};
pub use error::{AuditError, IntegrityViolation};
pub use record::{AuditAction, AuditRecord, RecordId, RunId, Severity, SubjectId};
pub use recorder::AuditRecorder;
pub use seal::Seal;
pub use signer::{fingerprint, parse_verifying_key, verifying_key_hex, AuditSigner};
pub use sink::{AuditSink, MemoryAuditSink};

/// Re-exported so callers can hold keys without depending on ed25519-dalek
pub use ed25519_dalek::VerifyingKey;
