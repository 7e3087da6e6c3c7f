//! VTS Gateway - one bounded call to a model endpoint
//!
//! [`ModelGateway::invoke`] returns either a structured JSON object or a
//! [`GatewayFailure`] of kind `Timeout`, `ProviderError` or
//! `MalformedResponse`. It never retries and never coerces a bad payload.

#![allow(missing_docs)]

pub mod error;
pub mod gateway;
pub mod http;
pub mod request;

pub use error::{FailureKind, GatewayFailure};
pub use gateway::{ModelGateway, ModelTransport};
pub use http::HttpTransport;
pub use request::{ModelRequest, ModelResponse, RawCompletion, DEFAULT_MAX_RESPONSE_BYTES};
