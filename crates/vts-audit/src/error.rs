//! Error types for the audit chain

use std::fmt;

/// Audit errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Chain verification found a record that does not match its predecessor
    #[error("audit chain integrity violated at sequence {sequence}: {violation}")]
    ChainIntegrity {
        /// Sequence number of the first offending record
        sequence: u64,
        /// What failed
        violation: IntegrityViolation,
    },

    /// The sink rejected or lost a record
    #[error("audit sink error: {0}")]
    Sink(String),

    /// Payload could not be serialized for hashing
    #[error("audit payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hex or key material could not be decoded
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl AuditError {
    /// Integrity failures are never recoverable within a run
    #[inline]
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::ChainIntegrity { .. })
    }
}

/// Kind of chain integrity violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// Recomputed checksum differs from the stored one
    ChecksumMismatch,
    /// Signature does not verify against the recorder's key
    SignatureInvalid,
    /// Sequence numbers are not contiguous from zero
    SequenceGap {
        /// Expected sequence number
        expected: u64,
        /// Sequence number found
        found: u64,
    },
    /// `prior_record` does not reference the preceding record
    BrokenLink,
    /// Record belongs to a different run
    ForeignRun,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::SignatureInvalid => write!(f, "signature invalid"),
            Self::SequenceGap { expected, found } => {
                write!(f, "sequence gap (expected {expected}, found {found})")
            }
            Self::BrokenLink => write!(f, "prior record link broken"),
            Self::ForeignRun => write!(f, "record from a different run"),
        }
    }
}
