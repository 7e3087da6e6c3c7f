//! Testing utilities for the VTS workspace
//!
//! [`ScriptedTransport`] answers model calls from per-route scripts so runs
//! can be driven end to end without a model endpoint.

#![allow(missing_docs)]

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use vts_audit::{AuditSigner, MemoryAuditSink};
use vts_core::{
    CategoryTable, Document, Orchestrator, RetryPolicy, RunConfig, TimeoutConfig,
};
use vts_gateway::{GatewayFailure, ModelGateway, ModelRequest, ModelTransport, RawCompletion};

/// One scripted answer
#[derive(Debug, Clone)]
pub enum Reply {
    /// A well-formed default answer for the route
    Auto,
    Json(Value),
    /// Body returned verbatim, for malformed-response cases
    Raw(String),
    Fail(GatewayFailure),
    /// Never answers; the gateway timeout fires
    Stall,
}

/// Route key of a request: `categorization`, `analysis:<kind>` or `generation:<batch>`
#[must_use]
pub fn route_of(request: &ModelRequest) -> String {
    let input = &request.input;
    match input["stage"].as_str() {
        Some("analysis") => format!("analysis:{}", input["kind"].as_str().unwrap_or("?")),
        Some("generation") => format!("generation:{}", input["batch_index"]),
        Some(stage) => stage.to_string(),
        None => "unknown".to_string(),
    }
}

/// Model transport that answers from per-route scripts
///
/// The n-th call on a route gets the n-th scripted reply; the last reply
/// repeats. Unscripted routes get [`Reply::Auto`].
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: DashMap<String, Vec<Reply>>,
    calls: DashMap<String, u32>,
    delay: Option<Duration>,
    route_delays: DashMap<String, Duration>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn script(self, route: impl Into<String>, replies: Vec<Reply>) -> Self {
        self.scripts.insert(route.into(), replies);
        self
    }

    #[must_use]
    pub fn categorize(self, category: Value, confidence: f64) -> Self {
        self.script(
            "categorization",
            vec![Reply::Json(categorization_payload(category, confidence))],
        )
    }

    /// Fail every attempt of one analysis task
    #[must_use]
    pub fn fail_task(self, kind: &str, failure: GatewayFailure) -> Self {
        self.script(format!("analysis:{kind}"), vec![Reply::Fail(failure)])
    }

    /// Fail every attempt of one batch
    #[must_use]
    pub fn fail_batch(self, batch_index: usize, failure: GatewayFailure) -> Self {
        self.script(format!("generation:{batch_index}"), vec![Reply::Fail(failure)])
    }

    /// Sleep before every answer
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep before every answer on one route, on top of any shared delay
    #[must_use]
    pub fn delay_route(self, route: impl Into<String>, delay: Duration) -> Self {
        self.route_delays.insert(route.into(), delay);
        self
    }

    /// Calls seen on a route
    #[must_use]
    pub fn calls(&self, route: &str) -> u32 {
        self.calls.get(route).map_or(0, |n| *n)
    }

    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    fn next_reply(&self, route: &str) -> Reply {
        let call = {
            let mut count = self.calls.entry(route.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.scripts
            .get(route)
            .and_then(|replies| {
                let index = (call as usize).saturating_sub(1).min(replies.len().saturating_sub(1));
                replies.get(index).cloned()
            })
            .unwrap_or(Reply::Auto)
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &ModelRequest) -> Result<RawCompletion, GatewayFailure> {
        let route = route_of(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let route_delay = self.route_delays.get(&route).map(|d| *d);
        if let Some(delay) = route_delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.next_reply(&route);
        let body = match reply {
            Reply::Auto => auto_payload(request).to_string(),
            Reply::Json(value) => value.to_string(),
            Reply::Raw(body) => body,
            Reply::Fail(failure) => return Err(failure),
            Reply::Stall => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                return Err(GatewayFailure::provider("stalled reply woke up"));
            }
        };
        Ok(RawCompletion::new(body).from_model(request.model.clone()))
    }
}

/// Gateway over a shared scripted transport
#[must_use]
pub fn gateway_for(transport: &Arc<ScriptedTransport>) -> ModelGateway {
    ModelGateway::new(Arc::clone(transport) as Arc<dyn ModelTransport>)
}

fn auto_payload(request: &ModelRequest) -> Value {
    let input = &request.input;
    match input["stage"].as_str() {
        Some("analysis") => analysis_payload(input["kind"].as_str().unwrap_or("analysis")),
        Some("generation") => {
            let batch = input["batch_index"].as_u64().unwrap_or(0) as usize;
            let count = input["count"].as_u64().unwrap_or(0) as usize;
            let existing = input["existing_ids"].as_array().map_or(0, Vec::len);
            cases_payload(batch, existing + 1, count)
        }
        _ => categorization_payload(json!(4), 0.95),
    }
}

#[must_use]
pub fn categorization_payload(category: Value, confidence: f64) -> Value {
    json!({
        "category": category,
        "confidence": confidence,
        "rationale": "configured product with custom reports",
    })
}

#[must_use]
pub fn analysis_payload(kind: &str) -> Value {
    json!({ "summary": format!("{kind} findings"), "notes": [] })
}

/// `count` cases for a batch, numbered from `first`
#[must_use]
pub fn cases_payload(batch_index: usize, first: usize, count: usize) -> Value {
    let cases: Vec<Value> = (first..first + count)
        .map(|n| test_case_json(&case_id(batch_index, n)))
        .collect();
    json!({ "cases": cases })
}

#[must_use]
pub fn case_id(batch_index: usize, n: usize) -> String {
    format!("TC-{batch_index:02}-{n:02}")
}

#[must_use]
pub fn test_case_json(id: &str) -> Value {
    json!({
        "id": id,
        "title": format!("Verify {id}"),
        "category_tags": ["oq"],
        "risk_level": "medium",
        "steps": ["Log in as operator", "Execute the function"],
        "expected_result": "Function behaves as specified",
        "traceability_refs": ["URS-1"],
    })
}

/// Requirements document with three sections and four requirement ids
#[must_use]
pub fn sample_document() -> Document {
    Document::new(
        "urs-lims.md",
        "# Purpose\n\
         Laboratory information system for batch release.\n\n\
         # Requirements\n\
         URS-1 The system shall record sample results with an audit trail.\n\
         URS-2 The system shall enforce electronic signatures on release.\n\
         URS-3 Custom reports shall be configurable per site.\n\n\
         # Interfaces\n\
         URS-4 Results shall be exported to the ERP nightly.\n",
    )
}

/// Fast config: millisecond backoff and generous per-call timeouts
#[must_use]
pub fn test_config() -> RunConfig {
    let retry = RetryPolicy::default().with_delays(1, 5);
    RunConfig::default()
        .with_analysis_retry(retry)
        .with_generation_retry(retry)
        .with_timeouts(TimeoutConfig {
            categorization_ms: 2_000,
            analysis_ms: 2_000,
            batch_ms: 2_000,
            consultation_ms: 2_000,
            run_deadline_ms: None,
        })
}

/// Same target count for every category
#[must_use]
pub fn uniform_targets(cases: usize) -> CategoryTable<usize> {
    CategoryTable {
        category_1: cases,
        category_3: cases,
        category_4: cases,
        category_5: cases,
    }
}

/// Deterministic signer
#[must_use]
pub fn test_signer() -> Arc<AuditSigner> {
    Arc::new(AuditSigner::from_seed([7; 32]))
}

/// Orchestrator over a scripted transport and an in-memory sink
#[must_use]
pub fn orchestrator(
    config: RunConfig,
    transport: &Arc<ScriptedTransport>,
) -> (Orchestrator, Arc<MemoryAuditSink>) {
    let sink = Arc::new(MemoryAuditSink::new());
    let orchestrator = Orchestrator::new(
        config,
        gateway_for(transport),
        test_signer(),
        Arc::clone(&sink) as Arc<dyn vts_audit::AuditSink>,
    );
    (orchestrator, sink)
}
