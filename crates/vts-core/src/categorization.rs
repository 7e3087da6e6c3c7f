//! Categorization stage
//!
//! One gateway call per document, no retry. The payload must carry
//! `{category, confidence, rationale}`; an unrecognized category or an
//! unusable confidence fails the stage instead of being defaulted.

use crate::config::RunConfig;
use crate::document::Document;
use crate::error::StageFailure;
use crate::types::{CategorizationId, CategorizationResult, Category};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use vts_audit::{AuditAction, AuditError, AuditRecorder, Severity, SubjectId};
use vts_gateway::{GatewayFailure, ModelGateway, ModelRequest};

const PROMPT: &str = "Classify the requirements document into regulatory risk category 1, 3, 4 or 5, \
or answer \"ambiguous\". Reply with a JSON object {\"category\", \"confidence\", \"rationale\"} where \
confidence is between 0 and 1.";

/// Parsed categorization payload
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCategorization {
    pub category: Category,
    pub confidence: f64,
    /// Set when `confidence` was clamped from this value
    pub raw_confidence: Option<f64>,
    pub rationale: String,
}

/// Validate a categorization payload
///
/// Confidence outside [0, 1] by at most `tolerance` is clamped to the
/// nearest bound; anything further out is rejected.
///
/// # Errors
/// Returns `MalformedResponse` naming the offending field
pub fn parse_categorization(
    payload: &Value,
    tolerance: f64,
) -> Result<ParsedCategorization, GatewayFailure> {
    let category = payload
        .get("category")
        .ok_or_else(|| GatewayFailure::malformed("missing field `category`"))
        .and_then(|value| {
            Category::parse_model_value(value)
                .ok_or_else(|| GatewayFailure::malformed(format!("unrecognized category {value}")))
        })?;

    let raw = payload
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .ok_or_else(|| GatewayFailure::malformed("`confidence` missing or not a finite number"))?;

    let (confidence, raw_confidence) = if (0.0..=1.0).contains(&raw) {
        (raw, None)
    } else if (-tolerance..0.0).contains(&raw) {
        (0.0, Some(raw))
    } else if raw > 1.0 && raw <= 1.0 + tolerance {
        (1.0, Some(raw))
    } else {
        return Err(GatewayFailure::malformed(format!(
            "confidence {raw} outside [0, 1] beyond tolerance {tolerance}"
        )));
    };

    let rationale = payload
        .get("rationale")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayFailure::malformed("`rationale` missing or not a string"))?
        .to_string();

    Ok(ParsedCategorization {
        category,
        confidence,
        raw_confidence,
        rationale,
    })
}

/// Assigns a category and confidence to a document
pub struct CategorizationStage<'a> {
    gateway: &'a ModelGateway,
    recorder: &'a AuditRecorder,
    config: &'a RunConfig,
}

impl<'a> CategorizationStage<'a> {
    #[must_use]
    pub fn new(gateway: &'a ModelGateway, recorder: &'a AuditRecorder, config: &'a RunConfig) -> Self {
        Self {
            gateway,
            recorder,
            config,
        }
    }

    /// Categorize `document`
    ///
    /// The inner `Err` is the stage's recorded failure; the outer `Err` means
    /// the audit trail could not be written.
    ///
    /// # Errors
    /// Returns `AuditError` if a record cannot be appended
    pub async fn run(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<Result<CategorizationResult, StageFailure>, AuditError> {
        let request = ModelRequest::new(&self.config.models.categorization, PROMPT)
            .with_input(json!({
                "stage": "categorization",
                "document_id": document.id,
                "content": document.content(),
                "section_count": document.metadata().section_count,
                "requirement_ids": document.metadata().requirement_ids,
            }))
            .with_timeout(self.config.timeouts.categorization())
            .with_max_response_bytes(self.config.models.max_response_bytes);

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(Err(StageFailure::cancelled("run deadline reached during categorization", 1)));
            }
            response = self.gateway.invoke(request) => response,
        };

        let parsed = match response {
            Ok(response) => parse_categorization(&response.payload, self.config.confidence_clamp_tolerance)
                .map(|parsed| (parsed, response.model)),
            Err(failure) => Err(failure),
        };
        let (parsed, model_used) = match parsed {
            Ok(ok) => ok,
            Err(failure) => {
                tracing::warn!(document = %document.id, %failure, "categorization failed");
                return Ok(Err(StageFailure::from_gateway(&failure, 1)));
            }
        };

        let result = CategorizationResult {
            id: CategorizationId::new(),
            category: parsed.category,
            confidence: parsed.confidence,
            raw_confidence: parsed.raw_confidence,
            rationale: parsed.rationale,
            model_used,
            timestamp: Utc::now(),
        };

        if let Some(raw) = result.raw_confidence {
            tracing::warn!(
                document = %document.id,
                raw,
                clamped = result.confidence,
                "model confidence clamped into [0, 1]"
            );
            self.recorder
                .record_with_severity(
                    SubjectId::scoped("categorization", result.id),
                    "categorizer",
                    AuditAction::ConfidenceClamped,
                    Severity::Warning,
                    json!({
                        "raw_confidence": raw,
                        "confidence": result.confidence,
                        "tolerance": self.config.confidence_clamp_tolerance,
                    }),
                )
                .await?;
        }

        tracing::info!(
            document = %document.id,
            category = %result.category,
            confidence = result.confidence,
            "document categorized"
        );
        Ok(Ok(result))
    }
}
