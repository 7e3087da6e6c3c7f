//! Parallel analysis coordinator
//!
//! Fans out one tokio task per configured [`AnalysisKind`], each with its own
//! per-attempt timeout and retry loop, and fans back in once every task is
//! terminal. A failing task never cancels its siblings; only the run deadline
//! does, through child cancellation tokens.

use crate::config::RunConfig;
use crate::document::Document;
use crate::error::{ErrorKind, OrchestrationError, StageFailure, StateMachineError};
use crate::retry::{sleep_or_cancel, RetryPolicy};
use crate::types::CategorizationResult;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vts_audit::{AuditAction, AuditRecorder, Severity, SubjectId};
use vts_gateway::{GatewayFailure, ModelGateway, ModelRequest};

/// Independent analysis performed on a categorized document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Context retrieval
    Context,
    /// Domain research
    Research,
    /// Subject-matter expert review
    Sme,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 3] = [Self::Context, Self::Research, Self::Sme];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Research => "research",
            Self::Sme => "sme",
        }
    }

    fn prompt(self) -> &'static str {
        match self {
            Self::Context => {
                "Retrieve regulatory and organizational context relevant to the document. \
                 Reply with a JSON object containing a non-empty `summary`."
            }
            Self::Research => {
                "Research domain risks and known failure modes for the categorized system. \
                 Reply with a JSON object containing a non-empty `summary`."
            }
            Self::Sme => {
                "Review the requirements as a subject-matter expert and flag gaps. \
                 Reply with a JSON object containing a non-empty `summary`."
            }
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one analysis task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet dispatched
    Pending,
    /// At least one attempt in flight or backing off
    Running,
    /// Produced a parsed output
    Succeeded,
    /// Exhausted its attempts on provider or malformed-response failures
    Failed,
    /// Last attempt timed out, or the run deadline fired
    TimedOut,
}

impl TaskStatus {
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::{Failed, Pending, Running, Succeeded, TimedOut};
    match from {
        Pending => &[Running],
        Running => &[Succeeded, Failed, TimedOut],
        Succeeded | Failed | TimedOut => &[],
    }
}

/// # Errors
/// Returns `IllegalTransition` if `to` is not reachable from `from`
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::illegal("analysis task", from, to))
    }
}

/// One analysis task and its final outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub kind: AnalysisKind,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Structured output, present only on success
    pub output: Option<Value>,
    /// Last failure, present only when the task did not succeed
    pub error: Option<StageFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisTask {
    #[must_use]
    pub fn new(kind: AnalysisKind) -> Self {
        Self {
            kind,
            status: TaskStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `to`, rejecting non-monotonic transitions
    ///
    /// # Errors
    /// Returns `IllegalTransition` if the move is not allowed
    pub fn transition(&mut self, to: TaskStatus) -> Result<TaskStatus, StateMachineError> {
        validate_transition(self.status, to)?;
        let from = self.status;
        self.status = to;
        match to {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut => {
                self.finished_at = Some(Utc::now());
            }
            TaskStatus::Pending => {}
        }
        Ok(from)
    }
}

/// Fan-in result of all analysis tasks, in configured order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub tasks: Vec<AnalysisTask>,
}

impl AnalysisReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &AnalysisTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
    }

    #[must_use]
    pub fn succeeded_count(&self) -> usize {
        self.succeeded().count()
    }

    #[must_use]
    pub fn failed_kinds(&self) -> Vec<AnalysisKind> {
        self.tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Succeeded)
            .map(|t| t.kind)
            .collect()
    }

    /// At least one task succeeded
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.succeeded_count() > 0
    }

    /// Successful outputs keyed by kind, for downstream prompts
    #[must_use]
    pub fn context(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .succeeded()
            .filter_map(|t| t.output.clone().map(|o| (t.kind.to_string(), o)))
            .collect();
        Value::Object(map)
    }
}

/// Check an analysis payload
///
/// # Errors
/// Returns `MalformedResponse` unless the payload has a non-empty `summary` string
pub fn parse_analysis_output(payload: &Value) -> Result<Value, GatewayFailure> {
    match payload.get("summary").and_then(Value::as_str) {
        Some(summary) if !summary.trim().is_empty() => Ok(payload.clone()),
        Some(_) => Err(GatewayFailure::malformed("`summary` is empty")),
        None => Err(GatewayFailure::malformed("missing string field `summary`")),
    }
}

/// Runs analysis tasks in parallel
pub struct AnalysisCoordinator {
    gateway: ModelGateway,
    recorder: Arc<AuditRecorder>,
    model: String,
    timeout: std::time::Duration,
    max_response_bytes: usize,
    retry: RetryPolicy,
}

impl AnalysisCoordinator {
    #[must_use]
    pub fn new(gateway: ModelGateway, recorder: Arc<AuditRecorder>, config: &RunConfig) -> Self {
        Self {
            gateway,
            recorder,
            model: config.models.analysis.clone(),
            timeout: config.timeouts.analysis(),
            max_response_bytes: config.models.max_response_bytes,
            retry: config.analysis.retry,
        }
    }

    /// Run every kind concurrently and wait for all of them
    ///
    /// # Errors
    /// Returns an error if any task could not record its transitions
    pub async fn run(
        &self,
        kinds: &[AnalysisKind],
        document: &Document,
        categorization: &CategorizationResult,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReport, OrchestrationError> {
        let shared_input = json!({
            "stage": "analysis",
            "document_id": document.id,
            "content": document.content(),
            "requirement_ids": document.metadata().requirement_ids,
            "category": categorization.category,
            "confidence": categorization.confidence,
            "rationale": categorization.rationale,
        });

        let handles: Vec<_> = kinds
            .iter()
            .map(|&kind| {
                let mut input = shared_input.clone();
                input["kind"] = json!(kind);
                let worker = TaskWorker {
                    kind,
                    gateway: self.gateway.clone(),
                    recorder: Arc::clone(&self.recorder),
                    request: ModelRequest::new(&self.model, kind.prompt())
                        .with_input(input)
                        .with_timeout(self.timeout)
                        .with_max_response_bytes(self.max_response_bytes),
                    retry: self.retry,
                    cancel: cancel.child_token(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let mut tasks = Vec::with_capacity(kinds.len());
        for (kind, joined) in kinds.iter().zip(join_all(handles).await) {
            match joined {
                Ok(task) => tasks.push(task?),
                Err(join_error) => {
                    tracing::error!(%kind, %join_error, "analysis task aborted");
                    let task = aborted_task(*kind, &join_error.to_string());
                    self.recorder
                        .record_with_severity(
                            SubjectId::scoped("analysis", kind),
                            "analysis-coordinator",
                            AuditAction::TaskTransition,
                            Severity::Error,
                            json!({ "kind": kind, "to": task.status, "error": task.error }),
                        )
                        .await?;
                    tasks.push(task);
                }
            }
        }

        let report = AnalysisReport { tasks };
        tracing::info!(
            succeeded = report.succeeded_count(),
            total = report.tasks.len(),
            "analysis fan-in complete"
        );
        Ok(report)
    }
}

fn aborted_task(kind: AnalysisKind, detail: &str) -> AnalysisTask {
    let mut task = AnalysisTask::new(kind);
    task.status = TaskStatus::Failed;
    task.error = Some(StageFailure::new(ErrorKind::TaskFailure, detail, 0));
    task.finished_at = Some(Utc::now());
    task
}

/// State owned by one spawned analysis task
struct TaskWorker {
    kind: AnalysisKind,
    gateway: ModelGateway,
    recorder: Arc<AuditRecorder>,
    request: ModelRequest,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl TaskWorker {
    async fn run(self) -> Result<AnalysisTask, OrchestrationError> {
        let mut task = AnalysisTask::new(self.kind);
        self.advance(&mut task, TaskStatus::Running).await?;

        let terminal = loop {
            task.attempts += 1;
            let attempt = task.attempts;

            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                response = self.gateway.invoke(self.request.clone()) => Some(response),
            };
            let failure = match outcome {
                None => {
                    task.error = Some(StageFailure::cancelled("run deadline reached", attempt));
                    break TaskStatus::TimedOut;
                }
                Some(Ok(response)) => match parse_analysis_output(&response.payload) {
                    Ok(output) => {
                        task.output = Some(output);
                        break TaskStatus::Succeeded;
                    }
                    Err(failure) => failure,
                },
                Some(Err(failure)) => failure,
            };

            tracing::warn!(kind = %self.kind, attempt, %failure, "analysis attempt failed");
            self.recorder
                .record_with_severity(
                    self.subject(),
                    &self.actor(),
                    AuditAction::TaskAttemptFailed,
                    Severity::Warning,
                    json!({ "kind": self.kind, "attempt": attempt, "failure": failure }),
                )
                .await?;

            let error = StageFailure::from_gateway(&failure, attempt);
            let retryable = error.kind.is_retryable();
            task.error = Some(error);
            if !retryable || !self.retry.has_attempts_after(attempt) {
                break if failure.is_timeout() {
                    TaskStatus::TimedOut
                } else {
                    TaskStatus::Failed
                };
            }
            if !sleep_or_cancel(self.retry.delay_for(attempt), &self.cancel).await {
                task.error = Some(StageFailure::cancelled("run deadline reached during backoff", attempt));
                break TaskStatus::TimedOut;
            }
        };

        self.advance(&mut task, terminal).await?;
        Ok(task)
    }

    async fn advance(&self, task: &mut AnalysisTask, to: TaskStatus) -> Result<(), OrchestrationError> {
        let from = task.transition(to)?;
        let severity = match to {
            TaskStatus::Failed | TaskStatus::TimedOut => Severity::Error,
            _ => Severity::Info,
        };
        self.recorder
            .record_with_severity(
                self.subject(),
                &self.actor(),
                AuditAction::TaskTransition,
                severity,
                json!({
                    "kind": self.kind,
                    "from": from,
                    "to": to,
                    "attempts": task.attempts,
                    "error": task.error,
                }),
            )
            .await?;
        Ok(())
    }

    fn subject(&self) -> SubjectId {
        SubjectId::scoped("analysis", self.kind)
    }

    fn actor(&self) -> String {
        format!("analysis:{}", self.kind)
    }
}
