//! Error types for VTS Core
//!
//! Two layers:
//! - [`StageFailure`] is data. Stages hand it back inside their outcome and
//!   the run carries on to record it, escalate it or fail explicitly.
//! - [`OrchestrationError`] is returned as `Err` only when the run can no
//!   longer produce a trustworthy record of itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use vts_audit::AuditError;
use vts_gateway::{FailureKind, GatewayFailure};

/// Failure taxonomy shared by every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ProviderError,
    MalformedResponse,
    /// An analysis task or generation batch exhausted its attempts
    TaskFailure,
    ChainIntegrityError,
    ConfigurationError,
    IngestionError,
    /// The run deadline fired
    Cancelled,
    /// Generation had no usable category to work from
    CategoryUnavailable,
}

impl ErrorKind {
    /// Kinds a call site may retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ProviderError | Self::MalformedResponse
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProviderError => "provider_error",
            Self::MalformedResponse => "malformed_response",
            Self::TaskFailure => "task_failure",
            Self::ChainIntegrityError => "chain_integrity_error",
            Self::ConfigurationError => "configuration_error",
            Self::IngestionError => "ingestion_error",
            Self::Cancelled => "cancelled",
            Self::CategoryUnavailable => "category_unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => Self::Timeout,
            FailureKind::ProviderError => Self::ProviderError,
            FailureKind::MalformedResponse => Self::MalformedResponse,
        }
    }
}

/// A stage's explicit failure, recorded rather than thrown
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind} after {attempts} attempt(s): {detail}")]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub detail: String,
    pub attempts: u32,
}

impl StageFailure {
    #[must_use]
    pub fn new(kind: ErrorKind, detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            detail: detail.into(),
            attempts,
        }
    }

    /// Wrap the last gateway failure of a call site
    #[must_use]
    pub fn from_gateway(failure: &GatewayFailure, attempts: u32) -> Self {
        Self::new(failure.kind.into(), failure.detail.clone(), attempts)
    }

    #[must_use]
    pub fn cancelled(detail: impl Into<String>, attempts: u32) -> Self {
        Self::new(ErrorKind::Cancelled, detail, attempts)
    }
}

/// Invalid run configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("threshold for {category} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { category: String, value: f64 },

    #[error("confidence clamp tolerance must be within [0, 1), got {0}")]
    InvalidTolerance(f64),

    #[error("batch size must be greater than zero")]
    ZeroBatchSize,

    #[error("target case count for {0} must be greater than zero")]
    ZeroTargetCount(String),

    #[error("max concurrent batches must be greater than zero")]
    ZeroConcurrency,

    #[error("invalid retry policy for {scope}: {reason}")]
    InvalidRetry { scope: &'static str, reason: String },

    #[error("timeout `{0}` must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("at least one analysis task must be configured")]
    NoAnalysisTasks,

    #[error("analysis task {0} is configured more than once")]
    DuplicateAnalysisTask(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Document could not be ingested
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document {id} could not be read: {reason}")]
    Unreadable { id: String, reason: String },

    #[error("document {0} is empty")]
    Empty(String),
}

/// Rejected state machine transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal {machine} transition from {from} to {to}")]
    IllegalTransition {
        machine: &'static str,
        from: String,
        to: String,
    },
}

impl StateMachineError {
    pub(crate) fn illegal(
        machine: &'static str,
        from: impl fmt::Debug,
        to: impl fmt::Debug,
    ) -> Self {
        Self::IllegalTransition {
            machine,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}

/// Consultation gate errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Transition(#[from] StateMachineError),

    #[error("bypass requires validation mode")]
    BypassNotEnabled,

    #[error("consultation cannot be bypassed: {0}")]
    NotBypassable(String),

    #[error("resolution does not answer the open consultation")]
    RequirementMismatch,

    #[error("no consultation has been raised")]
    NoRequirement,
}

/// Consultation resolver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    #[error("no pending consultation {0}")]
    UnknownRequirement(String),

    #[error("resolver closed before a decision was made")]
    Closed,
}

/// Errors that abort a run outright
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// The audit trail could not be written or no longer verifies
    #[error("audit failure: {0}")]
    Audit(#[from] AuditError),

    /// The orchestrator attempted a transition its own state machines forbid
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, OrchestrationError>;
