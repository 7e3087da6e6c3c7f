//! Request and response shapes
//!
//! A [`ModelRequest`] goes to the transport, which hands back a
//! [`RawCompletion`]. The gateway parses that into a [`ModelResponse`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Default cap on response body size (256 KiB)
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 256 * 1024;

/// One request to a model endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Model identifier understood by the transport
    pub model: String,
    /// Stage instructions
    pub prompt: String,
    /// Structured input sent alongside the prompt
    pub input: Value,
    /// Bodies longer than this are rejected as malformed
    pub max_response_bytes: usize,
    /// Hard bound on the call; the gateway enforces it
    pub timeout: Duration,
}

impl ModelRequest {
    /// Request with an empty input, default size cap and a 30s timeout
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            input: Value::Null,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }
}

/// Unparsed transport output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCompletion {
    /// Model that actually answered, when the transport reports it
    pub model: Option<String>,
    /// Response body, not yet parsed
    pub body: String,
}

impl RawCompletion {
    #[must_use]
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            model: None,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn from_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Validated structured response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Served model, or the requested one when the transport did not say
    pub model: String,
    /// Always a JSON object
    pub payload: Value,
    /// Wall time of the call, transport included
    pub latency_ms: u64,
}
