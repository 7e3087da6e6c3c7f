//! Per-run audit recorder
//!
//! Owns the head of one run's chain. Appends are serialized behind an async
//! mutex held across checksum computation, signing and the sink write, so
//! records from concurrent tasks land in a single well-ordered sequence.

use crate::chain::ChainVerifier;
use crate::checksum::{Checksum, RecordSignature};
use crate::error::AuditError;
use crate::record::{AuditAction, AuditRecord, RecordId, RunId, Severity, SubjectId};
use crate::seal::Seal;
use crate::signer::AuditSigner;
use crate::sink::AuditSink;
use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug)]
struct ChainHead {
    next_sequence: u64,
    last_id: Option<RecordId>,
    last_signature: RecordSignature,
}

/// Appends signed, hash-linked records for one run
pub struct AuditRecorder {
    run_id: RunId,
    signer: Arc<AuditSigner>,
    sink: Arc<dyn AuditSink>,
    head: Mutex<ChainHead>,
}

impl AuditRecorder {
    /// Recorder for a new run
    #[must_use]
    pub fn new(run_id: RunId, signer: Arc<AuditSigner>, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            run_id,
            signer,
            sink,
            head: Mutex::new(ChainHead {
                next_sequence: 0,
                last_id: None,
                last_signature: RecordSignature::GENESIS,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    /// Append an info-level record
    ///
    /// # Errors
    /// Returns error if the payload cannot be hashed or the sink rejects the record
    pub async fn record(
        &self,
        subject: impl Into<SubjectId>,
        actor: &str,
        action: AuditAction,
        payload: Value,
    ) -> Result<AuditRecord, AuditError> {
        self.record_with_severity(subject, actor, action, Severity::Info, payload)
            .await
    }

    /// Append a record with explicit severity
    ///
    /// # Errors
    /// Returns error if the payload cannot be hashed or the sink rejects the record
    pub async fn record_with_severity(
        &self,
        subject: impl Into<SubjectId>,
        actor: &str,
        action: AuditAction,
        severity: Severity,
        payload: Value,
    ) -> Result<AuditRecord, AuditError> {
        let mut head = self.head.lock().await;

        let mut record = AuditRecord {
            id: RecordId::new(),
            run_id: self.run_id,
            sequence: head.next_sequence,
            subject_id: subject.into(),
            actor: actor.to_string(),
            action,
            severity,
            timestamp: Utc::now(),
            payload,
            prior_record: head.last_id,
            checksum: Checksum::default(),
            signature: RecordSignature::GENESIS,
        };
        record.checksum = record.compute_checksum(&head.last_signature)?;
        record.signature = self.signer.sign_checksum(&record.checksum);

        self.sink.append(&record).await?;

        head.next_sequence += 1;
        head.last_id = Some(record.id);
        head.last_signature = record.signature;

        tracing::debug!(
            run = %self.run_id,
            sequence = record.sequence,
            action = record.action.as_str(),
            subject = %record.subject_id,
            checksum = %record.checksum.short(),
            "audit record appended"
        );
        Ok(record)
    }

    /// The run's chain as stored by the sink
    ///
    /// # Errors
    /// Returns error if the sink cannot be read
    pub async fn chain(&self) -> Result<Vec<AuditRecord>, AuditError> {
        self.sink.read_chain(self.run_id).await
    }

    /// Re-read the chain from the sink and verify every link
    ///
    /// Also checks that the sink returned exactly the records this recorder
    /// appended.
    ///
    /// # Errors
    /// Returns `ChainIntegrity` on the first mismatch
    pub async fn verify_chain(&self) -> Result<(), AuditError> {
        let head = self.head.lock().await;
        let records = self.sink.read_chain(self.run_id).await?;
        ChainVerifier::verify(&records, &self.signer.verifying_key())?;

        let stored = records.len() as u64;
        if stored != head.next_sequence || records.last().map(|r| r.id) != head.last_id {
            return Err(AuditError::ChainIntegrity {
                sequence: stored,
                violation: crate::error::IntegrityViolation::SequenceGap {
                    expected: head.next_sequence,
                    found: stored,
                },
            });
        }
        Ok(())
    }

    /// Sign an artifact and record the seal in the chain
    ///
    /// # Errors
    /// Returns error if the artifact cannot be serialized or the record cannot be appended
    pub async fn seal<T: Serialize + ?Sized>(
        &self,
        subject: impl Into<SubjectId>,
        artifact: &T,
        reviewer: Option<String>,
    ) -> Result<Seal, AuditError> {
        let subject = subject.into();
        let seal = Seal::create(&self.signer, subject.clone(), artifact, reviewer)?;
        self.record(
            subject,
            "audit-recorder",
            AuditAction::ArtifactSealed,
            serde_json::json!({
                "checksum": seal.checksum,
                "signer": seal.signer,
                "reviewer": seal.reviewer,
            }),
        )
        .await?;
        Ok(seal)
    }
}

impl std::fmt::Debug for AuditRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditRecorder")
            .field("run_id", &self.run_id)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}
