use crate::checksum::{Checksum, RecordSignature};
use crate::error::AuditError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Signing identity of a recorder
///
/// Every record checksum and every artifact seal is signed with this key.
pub struct AuditSigner {
    key: SigningKey,
}

impl AuditSigner {
    /// Fresh random key
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            key: SigningKey::generate(&mut csprng),
        }
    }

    /// Deterministic key from a 32-byte seed
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Key from a 64-character hex seed
    ///
    /// # Errors
    /// Returns error if the string is not 32 bytes of hex
    pub fn from_hex(seed_hex: &str) -> Result<Self, AuditError> {
        let bytes = hex::decode(seed_hex.trim()).map_err(|e| AuditError::Encoding(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuditError::Encoding("signing seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Short identifier of the public key
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.verifying_key())
    }

    pub(crate) fn sign(&self, message: &[u8]) -> RecordSignature {
        let sig: Signature = self.key.sign(message);
        RecordSignature::new(sig.to_bytes())
    }

    pub(crate) fn sign_checksum(&self, checksum: &Checksum) -> RecordSignature {
        self.sign(checksum.as_bytes())
    }
}

impl std::fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSigner")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Short identifier of a public key (first 8 bytes of its SHA-256, hex)
#[must_use]
pub fn fingerprint(key: &VerifyingKey) -> String {
    Checksum::compute(key.as_bytes()).short()
}

/// Hex encoding of a public key, as embedded in run results
#[must_use]
pub fn verifying_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Parse a hex-encoded public key
///
/// # Errors
/// Returns error if the string is not a valid ed25519 public key
pub fn parse_verifying_key(key_hex: &str) -> Result<VerifyingKey, AuditError> {
    let bytes = hex::decode(key_hex.trim()).map_err(|e| AuditError::Encoding(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AuditError::Encoding("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| AuditError::Encoding(e.to_string()))
}

pub(crate) fn verify_signature(
    key: &VerifyingKey,
    message: &[u8],
    signature: &RecordSignature,
) -> bool {
    let sig = Signature::from_bytes(signature.as_bytes());
    key.verify(message, &sig).is_ok()
}
