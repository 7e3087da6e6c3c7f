use crate::checksum::{Checksum, RecordSignature};
use crate::error::{AuditError, IntegrityViolation};
use crate::record::SubjectId;
use crate::signer::{verify_signature, AuditSigner};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

/// Integrity metadata attached to a finished artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seal {
    pub subject_id: SubjectId,
    /// SHA-256 of the artifact's JSON encoding
    pub checksum: Checksum,
    pub signature: RecordSignature,
    /// Fingerprint of the signing key
    pub signer: String,
    /// Human reviewer the artifact is attributed to, if any
    pub reviewer: Option<String>,
    pub sealed_at: DateTime<Utc>,
}

impl Seal {
    pub(crate) fn create<T: Serialize + ?Sized>(
        signer: &AuditSigner,
        subject_id: SubjectId,
        artifact: &T,
        reviewer: Option<String>,
    ) -> Result<Self, AuditError> {
        let checksum = Checksum::of_json(artifact)?;
        let sealed_at = Utc::now();
        let message = seal_message(&subject_id, &checksum, reviewer.as_deref(), sealed_at);
        Ok(Self {
            signature: signer.sign(&message),
            signer: signer.fingerprint(),
            subject_id,
            checksum,
            reviewer,
            sealed_at,
        })
    }

    /// Check the seal against an artifact and public key
    ///
    /// # Errors
    /// Returns `ChainIntegrity` if the artifact changed or the signature is invalid
    pub fn verify<T: Serialize + ?Sized>(
        &self,
        artifact: &T,
        key: &VerifyingKey,
    ) -> Result<(), AuditError> {
        let fail = |violation| AuditError::ChainIntegrity {
            sequence: 0,
            violation,
        };
        if Checksum::of_json(artifact)? != self.checksum {
            return Err(fail(IntegrityViolation::ChecksumMismatch));
        }
        let message = seal_message(
            &self.subject_id,
            &self.checksum,
            self.reviewer.as_deref(),
            self.sealed_at,
        );
        if !verify_signature(key, &message, &self.signature) {
            return Err(fail(IntegrityViolation::SignatureInvalid));
        }
        Ok(())
    }
}

fn seal_message(
    subject_id: &SubjectId,
    checksum: &Checksum,
    reviewer: Option<&str>,
    sealed_at: DateTime<Utc>,
) -> Vec<u8> {
    let reviewer = reviewer.unwrap_or_default();
    let mut msg = Vec::with_capacity(subject_id.as_str().len() + 32 + reviewer.len() + 14);
    msg.extend_from_slice(subject_id.as_str().as_bytes());
    msg.push(0);
    msg.extend_from_slice(checksum.as_bytes());
    msg.extend_from_slice(reviewer.as_bytes());
    msg.push(0);
    msg.extend_from_slice(&sealed_at.timestamp().to_le_bytes());
    msg.extend_from_slice(&sealed_at.timestamp_subsec_nanos().to_le_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seal_verifies_unchanged_artifact() {
        let signer = AuditSigner::generate();
        let artifact = json!({"cases": ["TC-1", "TC-2"]});
        let seal = Seal::create(&signer, "suite:x".into(), &artifact, Some("qa-lead".into())).unwrap();

        assert!(seal.verify(&artifact, &signer.verifying_key()).is_ok());
        assert_eq!(seal.signer, signer.fingerprint());
    }

    #[test]
    fn seal_rejects_modified_artifact() {
        let signer = AuditSigner::generate();
        let artifact = json!({"cases": ["TC-1"]});
        let seal = Seal::create(&signer, "suite:x".into(), &artifact, None).unwrap();

        let tampered = json!({"cases": ["TC-1", "TC-9"]});
        assert!(seal.verify(&tampered, &signer.verifying_key()).is_err());
    }

    #[test]
    fn seal_rejects_reattributed_reviewer() {
        let signer = AuditSigner::generate();
        let artifact = json!({"cases": []});
        let mut seal = Seal::create(&signer, "suite:x".into(), &artifact, Some("alice".into())).unwrap();
        seal.reviewer = Some("mallory".into());

        let err = seal.verify(&artifact, &signer.verifying_key()).unwrap_err();
        assert!(err.to_string().contains("signature invalid"));
    }
}
