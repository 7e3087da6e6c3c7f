//! Stage boundaries in the audit chain
//!
//! Every stage the orchestrator enters is bracketed by a `stage_started`
//! record and exactly one of `stage_completed` (carrying the SHA-256 of the
//! stage output), `stage_failed` or `stage_skipped`.

use crate::error::StageFailure;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Instant;
use vts_audit::{AuditAction, AuditError, AuditRecorder, Checksum, Severity, SubjectId};

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingestion,
    Categorization,
    Analysis,
    Consultation,
    Generation,
    Sealing,
}

impl Stage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Categorization => "categorization",
            Self::Analysis => "analysis",
            Self::Consultation => "consultation",
            Self::Generation => "generation",
            Self::Sealing => "sealing",
        }
    }

    /// Actor name used on the stage's audit records
    #[must_use]
    pub fn actor(&self) -> &'static str {
        match self {
            Self::Ingestion => "document-loader",
            Self::Categorization => "categorizer",
            Self::Analysis => "analysis-coordinator",
            Self::Consultation => "consultation-gate",
            Self::Generation => "generator",
            Self::Sealing => "audit-recorder",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open stage; consumed by exactly one closing record
#[must_use = "a started stage must be completed or failed"]
pub struct StageBoundary<'a> {
    recorder: &'a AuditRecorder,
    stage: Stage,
    subject: SubjectId,
    started: Instant,
}

impl<'a> StageBoundary<'a> {
    /// Record `stage_started`
    ///
    /// # Errors
    /// Returns error if the record cannot be appended
    pub async fn start(
        recorder: &'a AuditRecorder,
        stage: Stage,
        subject: SubjectId,
    ) -> Result<Self, AuditError> {
        tracing::info!(run = %recorder.run_id(), stage = stage.as_str(), "stage started");
        recorder
            .record(
                subject.clone(),
                stage.actor(),
                AuditAction::StageStarted,
                json!({ "stage": stage }),
            )
            .await?;
        Ok(Self {
            recorder,
            stage,
            subject,
            started: Instant::now(),
        })
    }

    /// Record `stage_completed` with the checksum of `output`
    ///
    /// # Errors
    /// Returns error if the output cannot be hashed or the record cannot be appended
    pub async fn complete<T: Serialize + ?Sized>(self, output: &T) -> Result<Checksum, AuditError> {
        let checksum = Checksum::of_json(output)?;
        let elapsed_ms = self.elapsed_ms();
        tracing::info!(
            run = %self.recorder.run_id(),
            stage = self.stage.as_str(),
            elapsed_ms,
            checksum = %checksum.short(),
            "stage completed"
        );
        self.recorder
            .record(
                self.subject,
                self.stage.actor(),
                AuditAction::StageCompleted,
                json!({
                    "stage": self.stage,
                    "output_checksum": checksum,
                    "elapsed_ms": elapsed_ms,
                }),
            )
            .await?;
        Ok(checksum)
    }

    /// Record `stage_failed` at error severity
    ///
    /// # Errors
    /// Returns error if the record cannot be appended
    pub async fn fail(self, failure: &StageFailure) -> Result<(), AuditError> {
        let elapsed_ms = self.elapsed_ms();
        tracing::error!(
            run = %self.recorder.run_id(),
            stage = self.stage.as_str(),
            kind = failure.kind.as_str(),
            detail = %failure.detail,
            "stage failed"
        );
        self.recorder
            .record_with_severity(
                self.subject,
                self.stage.actor(),
                AuditAction::StageFailed,
                Severity::Error,
                json!({
                    "stage": self.stage,
                    "failure": failure,
                    "elapsed_ms": elapsed_ms,
                }),
            )
            .await?;
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Record that a stage did not run
///
/// # Errors
/// Returns error if the record cannot be appended
pub async fn skip_stage(
    recorder: &AuditRecorder,
    stage: Stage,
    subject: SubjectId,
    reason: &str,
) -> Result<(), AuditError> {
    tracing::info!(run = %recorder.run_id(), stage = stage.as_str(), reason, "stage skipped");
    recorder
        .record(
            subject,
            stage.actor(),
            AuditAction::StageSkipped,
            json!({ "stage": stage, "reason": reason }),
        )
        .await?;
    Ok(())
}
