//! SHA-256 checksums and ed25519 signature bytes
//!
//! Both render as lowercase hex in human-readable encodings so a serialized
//! audit chain can be diffed and re-verified by hand.

use crate::error::AuditError;
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte SHA-256 checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Wrap raw digest bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Checksum of arbitrary bytes
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Checksum of the JSON encoding of a value
    ///
    /// # Errors
    /// Returns error if the value cannot be serialized
    pub fn of_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Self, AuditError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::compute(&bytes))
    }

    /// First 16 hex characters, for log lines
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Checksum {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_fixed::<32>(s)?))
    }
}

/// Raw ed25519 signature bytes attached to records and seals
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordSignature([u8; 64]);

impl RecordSignature {
    /// All-zero signature used as the predecessor of the first record
    pub const GENESIS: Self = Self([0u8; 64]);

    /// Wrap raw signature bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for RecordSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RecordSignature({}..)", hex::encode(&self.0[..8]))
    }
}

impl Display for RecordSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for RecordSignature {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_fixed::<64>(s)?))
    }
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], AuditError> {
    let bytes = hex::decode(s).map_err(|e| AuditError::Encoding(e.to_string()))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        AuditError::Encoding(format!("expected {N} bytes, got {}", v.len()))
    })
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_serde!(Checksum);
hex_serde!(RecordSignature);
