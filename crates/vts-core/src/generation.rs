//! Batched suite generation
//!
//! The target case count for the category is split into 1-based batches of
//! `batch_size`. Each batch is retried independently with backoff; a batch
//! that exhausts its attempts is recorded and skipped, never aborting the
//! batches after it. Up to `max_concurrent_batches` run at once and the merged
//! suite is always rebuilt in batch order.

use crate::config::RunConfig;
use crate::document::Document;
use crate::error::{ErrorKind, StageFailure};
use crate::retry::{sleep_or_cancel, RetryPolicy};
use crate::types::{BatchStatus, Category, RiskLevel, SuiteId, TestBatch, TestCase, TestSuite};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vts_audit::{AuditAction, AuditError, AuditRecorder, Severity, SubjectId};
use vts_gateway::{GatewayFailure, ModelGateway, ModelRequest};

const PROMPT: &str = "Generate validation test cases for the requirements document. Reply with a JSON \
object {\"cases\": [...]} where each case has id, title, category_tags, risk_level \
(low|medium|high|critical), steps, expected_result and traceability_refs.";

/// Split `target` cases into batches of at most `batch_size`
#[must_use]
pub fn plan_batches(target: usize, batch_size: usize) -> Vec<TestBatch> {
    if batch_size == 0 {
        return Vec::new();
    }
    (0..target.div_ceil(batch_size))
        .map(|i| {
            let requested = batch_size.min(target - i * batch_size);
            TestBatch::pending(i + 1, requested)
        })
        .collect()
}

#[derive(Deserialize)]
struct WireCase {
    id: String,
    title: String,
    #[serde(default)]
    category_tags: Vec<String>,
    risk_level: String,
    steps: Vec<String>,
    expected_result: String,
    #[serde(default)]
    traceability_refs: BTreeSet<String>,
}

/// Parse the `cases` array of a generation payload
///
/// # Errors
/// Returns `MalformedResponse` if any case is missing a required field, has
/// an empty id, or names an unknown risk level
pub fn parse_cases(
    payload: &Value,
    batch_index: usize,
    attempt: u32,
) -> Result<Vec<TestCase>, GatewayFailure> {
    let raw = payload
        .get("cases")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayFailure::malformed("missing array field `cases`"))?;

    let generated_at = Utc::now();
    raw.iter()
        .enumerate()
        .map(|(position, value)| {
            let wire: WireCase = serde_json::from_value(value.clone()).map_err(|e| {
                GatewayFailure::malformed(format!("case {position}: {e}"))
            })?;
            if wire.id.trim().is_empty() {
                return Err(GatewayFailure::malformed(format!("case {position}: empty id")));
            }
            let risk_level: RiskLevel = wire
                .risk_level
                .parse()
                .map_err(|e| GatewayFailure::malformed(format!("case {position}: {e}")))?;
            Ok(TestCase {
                id: wire.id,
                title: wire.title,
                category_tags: wire.category_tags,
                risk_level,
                steps: wire.steps,
                expected_result: wire.expected_result,
                traceability_refs: wire.traceability_refs,
                generated_at,
                batch_index,
                attempt,
            })
        })
        .collect()
}

/// Fold `incoming` into `existing`, replacing same-id cases with the later one
///
/// Returns the number of duplicates dropped.
pub fn merge_cases(existing: &mut Vec<TestCase>, incoming: Vec<TestCase>) -> usize {
    let mut duplicates = 0;
    for case in incoming {
        match existing.iter_mut().find(|c| c.id == case.id) {
            Some(current) => {
                duplicates += 1;
                if case.generated_at >= current.generated_at {
                    *current = case;
                }
            }
            None => existing.push(case),
        }
    }
    duplicates
}

/// Concatenate succeeded batches' cases in batch order, one case per id
///
/// Across batches the later-timestamped case wins; on a tie the later batch
/// wins. The winner stays at its own batch's position.
#[must_use]
pub fn merge_suite(batches: &[TestBatch]) -> (Vec<TestCase>, usize) {
    let mut ordered: Vec<&TestBatch> = batches.iter().filter(|b| b.succeeded()).collect();
    ordered.sort_by_key(|b| b.batch_index);
    let flat: Vec<&TestCase> = ordered
        .iter()
        .flat_map(|b| b.generated_cases.iter())
        .collect();

    let mut winners: HashMap<&str, usize> = HashMap::new();
    for (position, case) in flat.iter().enumerate() {
        winners
            .entry(case.id.as_str())
            .and_modify(|best| {
                if case.generated_at >= flat[*best].generated_at {
                    *best = position;
                }
            })
            .or_insert(position);
    }

    let cases: Vec<TestCase> = flat
        .iter()
        .enumerate()
        .filter(|(position, case)| winners.get(case.id.as_str()) == Some(position))
        .map(|(_, case)| (*case).clone())
        .collect();
    let duplicates = flat.len() - cases.len();
    (cases, duplicates)
}

/// Everything generation produced, including failed batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// All batches in index order
    pub batches: Vec<TestBatch>,
    pub suite: Option<TestSuite>,
    /// Set when no batch succeeded
    pub failure: Option<StageFailure>,
}

/// Produces a suite from batched model calls
pub struct SuiteGenerator {
    gateway: ModelGateway,
    recorder: Arc<AuditRecorder>,
    model: String,
    timeout: Duration,
    max_response_bytes: usize,
    retry: RetryPolicy,
    batch_size: usize,
    max_concurrent: usize,
}

impl SuiteGenerator {
    #[must_use]
    pub fn new(gateway: ModelGateway, recorder: Arc<AuditRecorder>, config: &RunConfig) -> Self {
        Self {
            gateway,
            recorder,
            model: config.models.generation.clone(),
            timeout: config.timeouts.batch(),
            max_response_bytes: config.models.max_response_bytes,
            retry: config.generation.retry,
            batch_size: config.generation.batch_size,
            max_concurrent: config.generation.max_concurrent_batches.max(1),
        }
    }

    /// Generate `target` cases for `document` in `category`
    ///
    /// `analysis` is passed through to every batch request as context.
    ///
    /// # Errors
    /// Returns `AuditError` if a record cannot be appended
    pub async fn generate(
        &self,
        document: &Document,
        category: Category,
        target: usize,
        analysis: &Value,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, AuditError> {
        let plan = plan_batches(target, self.batch_size);
        let base_input = json!({
            "stage": "generation",
            "document_id": document.id,
            "content": document.content(),
            "requirement_ids": document.metadata().requirement_ids,
            "category": category,
            "analysis": analysis,
        });
        tracing::info!(
            document = %document.id,
            %category,
            target,
            batches = plan.len(),
            concurrency = self.max_concurrent,
            "generating suite"
        );

        let mut batches: Vec<TestBatch> = stream::iter(plan)
            .map(|batch| self.run_batch(batch, &base_input, cancel))
            .buffer_unordered(self.max_concurrent)
            .try_collect()
            .await?;
        batches.sort_by_key(|b| b.batch_index);

        let attempts: u32 = batches.iter().map(|b| b.attempt_count).sum();
        let failed_batches: Vec<usize> = batches
            .iter()
            .filter(|b| !b.succeeded())
            .map(|b| b.batch_index)
            .collect();

        if failed_batches.len() == batches.len() {
            let failure = StageFailure::new(
                ErrorKind::TaskFailure,
                format!("none of {} batches succeeded", batches.len()),
                attempts,
            );
            return Ok(GenerationOutcome {
                batches,
                suite: None,
                failure: Some(failure),
            });
        }

        let (cases, duplicates_removed) = merge_suite(&batches);
        let suite = TestSuite {
            id: SuiteId::new(),
            run_id: self.recorder.run_id(),
            document_id: document.id.clone(),
            category,
            cases,
            batch_count: batches.len(),
            failed_batches,
            duplicates_removed,
            created_at: Utc::now(),
        };
        self.recorder
            .record_with_severity(
                SubjectId::scoped("suite", suite.id),
                "generator",
                AuditAction::SuiteMerged,
                if suite.is_partial() {
                    Severity::Warning
                } else {
                    Severity::Info
                },
                json!({
                    "cases": suite.cases.len(),
                    "batch_count": suite.batch_count,
                    "failed_batches": suite.failed_batches,
                    "duplicates_removed": suite.duplicates_removed,
                }),
            )
            .await?;

        Ok(GenerationOutcome {
            batches,
            suite: Some(suite),
            failure: None,
        })
    }

    async fn run_batch(
        &self,
        mut batch: TestBatch,
        base_input: &Value,
        cancel: &CancellationToken,
    ) -> Result<TestBatch, AuditError> {
        let subject = SubjectId::scoped("batch", batch.batch_index);

        let terminal = loop {
            if cancel.is_cancelled() {
                batch.error = Some(StageFailure::cancelled(
                    "run deadline reached before batch attempt",
                    batch.attempt_count,
                ));
                break BatchStatus::TimedOut;
            }
            batch.attempt_count += 1;
            let attempt = batch.attempt_count;
            let remaining = batch.requested_count.saturating_sub(batch.generated_cases.len());

            let mut input = base_input.clone();
            input["batch_index"] = json!(batch.batch_index);
            input["count"] = json!(remaining);
            input["attempt"] = json!(attempt);
            input["existing_ids"] = json!(batch
                .generated_cases
                .iter()
                .map(|c| c.id.as_str())
                .collect::<Vec<_>>());
            let request = ModelRequest::new(&self.model, PROMPT)
                .with_input(input)
                .with_timeout(self.timeout)
                .with_max_response_bytes(self.max_response_bytes);

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                response = self.gateway.invoke(request) => Some(response),
            };
            let failure = match outcome {
                None => {
                    batch.error = Some(StageFailure::cancelled("run deadline reached", attempt));
                    break BatchStatus::TimedOut;
                }
                Some(Ok(response)) => {
                    match parse_cases(&response.payload, batch.batch_index, attempt) {
                        Ok(cases) => {
                            merge_cases(&mut batch.generated_cases, cases);
                            if batch.generated_cases.len() >= batch.requested_count {
                                batch.error = None;
                                break BatchStatus::Succeeded;
                            }
                            GatewayFailure::malformed(format!(
                                "short batch: {} of {} cases",
                                batch.generated_cases.len(),
                                batch.requested_count
                            ))
                        }
                        Err(failure) => failure,
                    }
                }
                Some(Err(failure)) => failure,
            };

            tracing::warn!(batch = batch.batch_index, attempt, %failure, "batch attempt failed");
            self.recorder
                .record_with_severity(
                    subject.clone(),
                    "generator",
                    AuditAction::BatchAttemptFailed,
                    Severity::Warning,
                    json!({
                        "batch_index": batch.batch_index,
                        "attempt": attempt,
                        "cases_so_far": batch.generated_cases.len(),
                        "failure": failure,
                    }),
                )
                .await?;

            let error = StageFailure::from_gateway(&failure, attempt);
            let retryable = error.kind.is_retryable();
            batch.error = Some(error);
            if !retryable || !self.retry.has_attempts_after(attempt) {
                break if failure.is_timeout() {
                    BatchStatus::TimedOut
                } else {
                    BatchStatus::Failed
                };
            }
            if !sleep_or_cancel(self.retry.delay_for(attempt), cancel).await {
                batch.error = Some(StageFailure::cancelled("run deadline reached during backoff", attempt));
                break BatchStatus::TimedOut;
            }
        };
        batch.status = terminal;

        if batch.succeeded() {
            tracing::debug!(batch = batch.batch_index, cases = batch.generated_cases.len(), "batch completed");
            self.recorder
                .record(
                    subject,
                    "generator",
                    AuditAction::BatchCompleted,
                    json!({
                        "batch_index": batch.batch_index,
                        "cases": batch.generated_cases.len(),
                        "attempts": batch.attempt_count,
                    }),
                )
                .await?;
        } else {
            tracing::error!(batch = batch.batch_index, status = ?batch.status, "batch exhausted");
            self.recorder
                .record_with_severity(
                    subject,
                    "generator",
                    AuditAction::BatchFailed,
                    Severity::Error,
                    json!({
                        "batch_index": batch.batch_index,
                        "status": batch.status,
                        "attempts": batch.attempt_count,
                        "error": batch.error,
                    }),
                )
                .await?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration};
    use proptest::prelude::*;

    fn case(id: &str, batch_index: usize, at: DateTime<Utc>) -> TestCase {
        TestCase {
            id: id.to_string(),
            title: format!("verify {id}"),
            category_tags: vec![],
            risk_level: RiskLevel::Medium,
            steps: vec!["do".to_string()],
            expected_result: "ok".to_string(),
            traceability_refs: BTreeSet::new(),
            generated_at: at,
            batch_index,
            attempt: 1,
        }
    }

    fn batch(index: usize, status: BatchStatus, cases: Vec<TestCase>) -> TestBatch {
        TestBatch {
            status,
            attempt_count: 1,
            generated_cases: cases,
            ..TestBatch::pending(index, 2)
        }
    }

    #[test]
    fn plan_splits_with_remainder() {
        let plan = plan_batches(12, 5);
        let sizes: Vec<_> = plan.iter().map(|b| (b.batch_index, b.requested_count)).collect();
        assert_eq!(sizes, vec![(1, 5), (2, 5), (3, 2)]);
        assert!(plan.iter().all(|b| b.status == BatchStatus::Pending));
        assert!(plan_batches(0, 5).is_empty());
        assert_eq!(plan_batches(10, 5).len(), 2);
    }

    #[test]
    fn parse_valid_cases() {
        let payload = json!({ "cases": [{
            "id": "TC-1",
            "title": "Login audit trail",
            "risk_level": "High",
            "steps": ["log in", "inspect trail"],
            "expected_result": "entry recorded",
            "traceability_refs": ["URS-001"]
        }]});
        let cases = parse_cases(&payload, 2, 3).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].risk_level, RiskLevel::High);
        assert_eq!(cases[0].batch_index, 2);
        assert_eq!(cases[0].attempt, 3);
        assert!(cases[0].traceability_refs.contains("URS-001"));
        assert!(cases[0].category_tags.is_empty());
    }

    #[test]
    fn parse_rejects_bad_cases() {
        let missing_steps = json!({ "cases": [{
            "id": "TC-1", "title": "t", "risk_level": "low", "expected_result": "r"
        }]});
        assert!(parse_cases(&missing_steps, 1, 1).is_err());

        let bad_risk = json!({ "cases": [{
            "id": "TC-1", "title": "t", "risk_level": "severe", "steps": [], "expected_result": "r"
        }]});
        assert!(parse_cases(&bad_risk, 1, 1).unwrap_err().detail.contains("risk level"));

        assert!(parse_cases(&json!({ "tests": [] }), 1, 1).is_err());
    }

    #[test]
    fn batch_merge_keeps_later_duplicate_in_place() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(1);
        let mut existing = vec![case("A", 1, t0), case("B", 1, t0)];
        let mut newer_a = case("A", 1, t1);
        newer_a.attempt = 2;
        let dropped = merge_cases(&mut existing, vec![newer_a, case("C", 1, t1)]);

        assert_eq!(dropped, 1);
        let ids: Vec<_> = existing.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(existing[0].attempt, 2);
    }

    #[test]
    fn suite_skips_failed_batches_and_keeps_order() {
        let t = Utc::now();
        let batches = vec![
            batch(2, BatchStatus::Succeeded, vec![case("b2-1", 2, t), case("b2-2", 2, t)]),
            batch(1, BatchStatus::Succeeded, vec![case("b1-1", 1, t), case("b1-2", 1, t)]),
            batch(3, BatchStatus::Failed, vec![case("b3-1", 3, t)]),
        ];
        let (cases, duplicates) = merge_suite(&batches);
        let ids: Vec<_> = cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b1-1", "b1-2", "b2-1", "b2-2"]);
        assert_eq!(duplicates, 0);
    }

    #[test]
    fn suite_dedup_prefers_later_timestamp() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::milliseconds(5);
        let batches = vec![
            batch(1, BatchStatus::Succeeded, vec![case("X", 1, t1), case("Y", 1, t0)]),
            batch(2, BatchStatus::Succeeded, vec![case("X", 2, t0), case("Z", 2, t0)]),
        ];
        let (cases, duplicates) = merge_suite(&batches);
        assert_eq!(duplicates, 1);
        let kept: Vec<_> = cases.iter().map(|c| (c.id.as_str(), c.batch_index)).collect();
        assert_eq!(kept, vec![("X", 1), ("Y", 1), ("Z", 2)]);
    }

    proptest! {
        #[test]
        fn earlier_batches_precede_later_ones(
            sizes in prop::collection::vec(0usize..4, 1..8),
            failed in prop::collection::vec(any::<bool>(), 8),
            rotation in 0usize..8,
        ) {
            let t = Utc::now();
            let mut batches: Vec<TestBatch> = sizes
                .iter()
                .enumerate()
                .map(|(i, &n)| {
                    let index = i + 1;
                    let status = if failed[i] { BatchStatus::Failed } else { BatchStatus::Succeeded };
                    let cases = (0..n).map(|k| case(&format!("{index}-{k}"), index, t)).collect();
                    batch(index, status, cases)
                })
                .collect();
            let len = batches.len();
            batches.rotate_left(rotation % len);

            let (cases, _) = merge_suite(&batches);
            for pair in cases.windows(2) {
                prop_assert!(pair[0].batch_index <= pair[1].batch_index);
            }
            prop_assert!(cases.iter().all(|c| !failed[c.batch_index - 1]));
        }
    }
}
