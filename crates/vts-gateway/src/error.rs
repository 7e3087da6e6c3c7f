//! Gateway failure taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a single model call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No response within the request's timeout
    Timeout,
    /// The provider answered with an error or could not be reached
    ProviderError,
    /// The response was not the structured payload that was asked for
    MalformedResponse,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ProviderError => write!(f, "provider error"),
            Self::MalformedResponse => write!(f, "malformed response"),
        }
    }
}

/// Typed failure of one gateway invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct GatewayFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl GatewayFailure {
    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn provider(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ProviderError,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::MalformedResponse,
            detail: detail.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display() {
        let failure = GatewayFailure::malformed("expected object");
        assert_eq!(failure.to_string(), "malformed response: expected object");
        assert!(!failure.is_timeout());
        assert!(GatewayFailure::timeout("30s").is_timeout());
    }

    #[test]
    fn failure_serializes_kind_in_snake_case() {
        let json = serde_json::to_value(GatewayFailure::provider("503")).unwrap();
        assert_eq!(json["kind"], "provider_error");
    }
}
