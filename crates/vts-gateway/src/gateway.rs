//! Model gateway
//!
//! The gateway makes exactly one transport call per invocation. It owns the
//! timeout bound and response validation; retry and backoff belong to the
//! caller.

use crate::error::GatewayFailure;
use crate::request::{ModelRequest, ModelResponse, RawCompletion};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Wire-level access to a model endpoint
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &str;

    /// Perform one call; must not retry
    async fn send(&self, request: &ModelRequest) -> Result<RawCompletion, GatewayFailure>;
}

/// Timeout-bounded, validating front for a transport
#[derive(Clone)]
pub struct ModelGateway {
    transport: Arc<dyn ModelTransport>,
}

impl ModelGateway {
    #[must_use]
    pub fn new(transport: Arc<dyn ModelTransport>) -> Self {
        Self { transport }
    }

    #[must_use]
    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Invoke the model once
    ///
    /// # Errors
    /// - `Timeout` if the transport does not answer within `request.timeout`
    /// - `ProviderError` as reported by the transport
    /// - `MalformedResponse` if the body is oversized, not JSON, or not a JSON object
    pub async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, GatewayFailure> {
        let started = Instant::now();
        let raw = match tokio::time::timeout(request.timeout, self.transport.send(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!(
                    transport = self.transport.name(),
                    model = %request.model,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "model call timed out"
                );
                return Err(GatewayFailure::timeout(format!(
                    "no response from {} within {}ms",
                    request.model,
                    request.timeout.as_millis()
                )));
            }
        };

        let payload = parse_payload(&raw, request.max_response_bytes)?;
        Ok(ModelResponse {
            model: raw.model.unwrap_or(request.model),
            payload,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl std::fmt::Debug for ModelGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelGateway")
            .field("transport", &self.transport.name())
            .finish()
    }
}

fn parse_payload(raw: &RawCompletion, max_bytes: usize) -> Result<Value, GatewayFailure> {
    if raw.body.len() > max_bytes {
        return Err(GatewayFailure::malformed(format!(
            "response of {} bytes exceeds limit of {max_bytes}",
            raw.body.len()
        )));
    }
    let payload: Value = serde_json::from_str(raw.body.trim())
        .map_err(|e| GatewayFailure::malformed(format!("invalid JSON: {e}")))?;
    if !payload.is_object() {
        return Err(GatewayFailure::malformed("expected a JSON object"));
    }
    Ok(payload)
}
