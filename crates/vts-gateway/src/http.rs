//! HTTP transport
//!
//! POSTs `{model, prompt, input, max_response_bytes}` as JSON and hands the
//! response body back unparsed. The endpoint is expected to answer with the
//! structured payload itself.

use crate::error::GatewayFailure;
use crate::gateway::ModelTransport;
use crate::request::{ModelRequest, RawCompletion};
use async_trait::async_trait;
use serde::Serialize;

/// Header an endpoint may set to report the model that served the call
pub const MODEL_HEADER: &str = "x-model";

const ERROR_BODY_PREVIEW: usize = 512;

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    input: &'a serde_json::Value,
    max_response_bytes: usize,
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    /// Transport for an endpoint URL
    ///
    /// # Errors
    /// Returns `ProviderError` if the HTTP client cannot be built
    pub fn new(endpoint: impl Into<String>) -> Result<Self, GatewayFailure> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vts-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayFailure::provider(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: None,
        })
    }

    /// Send a bearer token with every call
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &ModelRequest) -> Result<RawCompletion, GatewayFailure> {
        let body = WireRequest {
            model: &request.model,
            prompt: &request.prompt,
            input: &request.input,
            max_response_bytes: request.max_response_bytes,
        };

        let mut call = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let served_by = response
            .headers()
            .get(MODEL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(length) = response.content_length() {
            if length > request.max_response_bytes as u64 {
                return Err(GatewayFailure::malformed(format!(
                    "declared response of {length} bytes exceeds limit of {}",
                    request.max_response_bytes
                )));
            }
        }

        let text = read_capped(response, request.max_response_bytes).await;
        if !status.is_success() {
            let preview: String = text
                .as_ref()
                .map(|t| t.chars().take(ERROR_BODY_PREVIEW).collect())
                .unwrap_or_default();
            return Err(GatewayFailure::provider(format!("HTTP {}: {preview}", status.as_u16())));
        }
        let text = text?;

        let mut completion = RawCompletion::new(text);
        if let Some(model) = served_by {
            completion = completion.from_model(model);
        }
        Ok(completion)
    }
}

/// Read the body chunk by chunk, giving up as soon as it passes `limit`
async fn read_capped(mut response: reqwest::Response, limit: usize) -> Result<String, GatewayFailure> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
        if body.len() + chunk.len() > limit {
            return Err(GatewayFailure::malformed(format!(
                "response exceeds limit of {limit} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    String::from_utf8(body)
        .map_err(|e| GatewayFailure::malformed(format!("response is not UTF-8: {e}")))
}

fn map_reqwest_error(error: reqwest::Error) -> GatewayFailure {
    if error.is_timeout() {
        GatewayFailure::timeout(error.to_string())
    } else if error.is_decode() {
        GatewayFailure::malformed(error.to_string())
    } else {
        GatewayFailure::provider(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::gateway::ModelGateway;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the endpoint URL
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\nx-model: served-1\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/v1/invoke")
    }

    #[tokio::test]
    async fn success_body_is_passed_through() {
        let endpoint = serve_once("200 OK", r#"{"category": 3, "confidence": 0.9}"#).await;
        let gateway = ModelGateway::new(Arc::new(HttpTransport::new(endpoint).unwrap()));

        let response = gateway
            .invoke(ModelRequest::new("m", "p").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(response.payload["category"], 3);
        assert_eq!(response.model, "served-1");
    }

    #[tokio::test]
    async fn error_status_is_provider_error() {
        let endpoint = serve_once("503 Service Unavailable", r#"{"error": "overloaded"}"#).await;
        let transport = HttpTransport::new(endpoint).unwrap();

        let err = transport
            .send(&ModelRequest::new("m", "p").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ProviderError);
        assert!(err.detail.starts_with("HTTP 503"));
    }

    #[tokio::test]
    async fn oversized_chunked_body_fails_before_it_ends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ntransfer-encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            let chunk = format!("200\r\n{}\r\n", "x".repeat(0x200));
            for _ in 0..8 {
                socket.write_all(chunk.as_bytes()).await.unwrap();
            }
            // Never send the terminating chunk; only an early cut-off returns.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let transport = HttpTransport::new(format!("http://{addr}/v1/invoke")).unwrap();
        let err = transport
            .send(
                &ModelRequest::new("m", "p")
                    .with_timeout(Duration::from_secs(5))
                    .with_max_response_bytes(1024),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::MalformedResponse);
        assert!(err.detail.contains("exceeds limit of 1024 bytes"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_provider_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(format!("http://{addr}/")).unwrap();
        let err = transport
            .send(&ModelRequest::new("m", "p").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ProviderError);
    }
}
