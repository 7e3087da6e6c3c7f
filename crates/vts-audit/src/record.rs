//! Audit record types

use crate::checksum::{Checksum, RecordSignature};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Unique run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique audit record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Ulid);

impl RecordId {
    /// Generate new record ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a record is about, as `scope:id` (e.g. `batch:3`, `task:research`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Subject from a raw string
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Subject in a named scope
    #[inline]
    #[must_use]
    pub fn scoped(scope: &str, id: impl std::fmt::Display) -> Self {
        Self(format!("{scope}:{id}"))
    }

    /// String form
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SubjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Recorded action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RunStarted,
    RunCompleted,
    RunFailed,
    StageStarted,
    StageCompleted,
    StageFailed,
    StageSkipped,
    TaskTransition,
    TaskAttemptFailed,
    ConfidenceClamped,
    GateEvaluated,
    ConsultationRequired,
    ConsultationSubmitted,
    ConsultationBypassed,
    ConsultationResolved,
    ConsultationTimedOut,
    ComplianceNote,
    BatchAttemptFailed,
    BatchCompleted,
    BatchFailed,
    SuiteMerged,
    ArtifactSealed,
}

impl AuditAction {
    /// Stable wire name, also fed into the checksum
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::TaskTransition => "task_transition",
            Self::TaskAttemptFailed => "task_attempt_failed",
            Self::ConfidenceClamped => "confidence_clamped",
            Self::GateEvaluated => "gate_evaluated",
            Self::ConsultationRequired => "consultation_required",
            Self::ConsultationSubmitted => "consultation_submitted",
            Self::ConsultationBypassed => "consultation_bypassed",
            Self::ConsultationResolved => "consultation_resolved",
            Self::ConsultationTimedOut => "consultation_timed_out",
            Self::ComplianceNote => "compliance_note",
            Self::BatchAttemptFailed => "batch_attempt_failed",
            Self::BatchCompleted => "batch_completed",
            Self::BatchFailed => "batch_failed",
            Self::SuiteMerged => "suite_merged",
            Self::ArtifactSealed => "artifact_sealed",
        }
    }
}

/// Record severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One link in a run's audit chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: RecordId,
    pub run_id: RunId,
    /// Zero-based position in the run's chain
    pub sequence: u64,
    pub subject_id: SubjectId,
    pub actor: String,
    pub action: AuditAction,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// Preceding record, `None` only for the first record of a run
    pub prior_record: Option<RecordId>,
    pub checksum: Checksum,
    pub signature: RecordSignature,
}

impl AuditRecord {
    /// Recompute this record's checksum given its predecessor's signature
    ///
    /// Covers every field except `checksum` and `signature` themselves.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized
    pub fn compute_checksum(
        &self,
        previous_signature: &RecordSignature,
    ) -> Result<Checksum, serde_json::Error> {
        let payload = serde_json::to_vec(&self.payload)?;

        let mut hasher = Sha256::new();
        hasher.update(self.id.0.to_bytes());
        hasher.update(self.run_id.0.to_bytes());
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.subject_id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.actor.as_bytes());
        hasher.update([0]);
        hasher.update(self.action.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.severity.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.timestamp.timestamp().to_le_bytes());
        hasher.update(self.timestamp.timestamp_subsec_nanos().to_le_bytes());
        match self.prior_record {
            Some(prior) => hasher.update(prior.0.to_bytes()),
            None => hasher.update([0u8; 16]),
        }
        hasher.update(&payload);
        hasher.update([0]);
        hasher.update(previous_signature.as_bytes());
        Ok(Checksum::new(hasher.finalize().into()))
    }
}
