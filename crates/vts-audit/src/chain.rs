//! Chain verification
//!
//! A chain is valid when, for every record in order:
//! - its sequence equals its position
//! - it belongs to the same run as the first record
//! - `prior_record` names the preceding record (none for the first)
//! - its checksum recomputes from its own fields plus the preceding signature
//! - its signature verifies over the checksum
//!
//! Verification reports the first violation and never repairs anything.

use crate::checksum::RecordSignature;
use crate::error::{AuditError, IntegrityViolation};
use crate::record::AuditRecord;
use crate::signer::verify_signature;
use ed25519_dalek::VerifyingKey;

/// Verifies audit chains against a recorder's public key
pub struct ChainVerifier;

impl ChainVerifier {
    /// Verify an ordered chain
    ///
    /// # Errors
    /// Returns `AuditError::ChainIntegrity` at the first offending record
    pub fn verify(records: &[AuditRecord], key: &VerifyingKey) -> Result<(), AuditError> {
        let mut previous_signature = RecordSignature::GENESIS;
        let mut previous_id = None;
        let run_id = records.first().map(|r| r.run_id);

        for (position, record) in records.iter().enumerate() {
            let expected = position as u64;
            let fail = |violation| AuditError::ChainIntegrity {
                sequence: record.sequence,
                violation,
            };

            if record.sequence != expected {
                return Err(fail(IntegrityViolation::SequenceGap {
                    expected,
                    found: record.sequence,
                }));
            }
            if Some(record.run_id) != run_id {
                return Err(fail(IntegrityViolation::ForeignRun));
            }
            if record.prior_record != previous_id {
                return Err(fail(IntegrityViolation::BrokenLink));
            }

            let checksum = record.compute_checksum(&previous_signature)?;
            if checksum != record.checksum {
                return Err(fail(IntegrityViolation::ChecksumMismatch));
            }
            if !verify_signature(key, checksum.as_bytes(), &record.signature) {
                return Err(fail(IntegrityViolation::SignatureInvalid));
            }

            previous_signature = record.signature;
            previous_id = Some(record.id);
        }

        Ok(())
    }

    /// Boolean form of [`ChainVerifier::verify`]; violations are logged at error level
    #[must_use]
    pub fn is_valid(records: &[AuditRecord], key: &VerifyingKey) -> bool {
        match Self::verify(records, key) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "audit chain verification failed");
                false
            }
        }
    }
}
