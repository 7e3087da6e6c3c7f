//! Run orchestrator
//!
//! Drives one document through the pipeline:
//!
//! ```text
//! Document -> Categorization -> Parallel Analysis -> Consultation Gate
//!          -> Suite Generation (batched) -> Seal -> RunResult
//! ```
//!
//! Stage failures are carried as data and end in an explicit
//! [`RunResult::failure`] or a raised consultation. `Err` is returned only
//! when the audit chain cannot be written or no longer verifies, because a
//! run without a trustworthy chain has no result worth returning.

use crate::analysis::{AnalysisCoordinator, AnalysisReport, AnalysisTask};
use crate::categorization::CategorizationStage;
use crate::config::RunConfig;
use crate::consultation::{ConsultationGate, ConsultationRequirement, GateSignals, GateState};
use crate::document::{Document, DocumentId};
use crate::error::{ErrorKind, OrchestrationError, Result, StageFailure};
use crate::generation::SuiteGenerator;
use crate::ingestion::DocumentLoader;
use crate::resolver::ConsultationResolver;
use crate::stage::{skip_stage, Stage, StageBoundary};
use crate::types::{CategorizationResult, RunStatus, TestBatch, TestSuite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vts_audit::{
    parse_verifying_key, verifying_key_hex, AuditAction, AuditError, AuditRecord, AuditRecorder,
    AuditSigner, AuditSink, ChainVerifier, RunId, Seal, Severity, SubjectId,
};
use vts_gateway::ModelGateway;

const ACTOR: &str = "orchestrator";
const GATE_ACTOR: &str = "consultation-gate";

/// Everything a run produced, with its audit chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique per run; every audit record carries it
    pub run_id: RunId,
    /// Document the run was started for
    pub document_id: DocumentId,
    /// Present when the model returned a usable category
    pub categorization: Option<CategorizationResult>,
    /// Why categorization produced nothing; escalated through the gate
    pub categorization_failure: Option<StageFailure>,
    /// Final state of every analysis task, in configured order
    pub analysis_tasks: Vec<AnalysisTask>,
    /// Where the consultation gate ended up
    pub gate_state: GateState,
    /// The consultation raised, with any bypass or resolution attached
    pub consultation: Option<ConsultationRequirement>,
    /// Every planned batch, ordered by `batch_index`
    pub batches: Vec<TestBatch>,
    /// Possibly partial; see `TestSuite::failed_batches`
    pub suite: Option<TestSuite>,
    /// Signature over `suite`, naming the reviewer when one resolved
    pub suite_seal: Option<Seal>,
    /// Why the run failed, if it did
    pub failure: Option<StageFailure>,
    /// Full chain, ending with `RunCompleted` or `RunFailed`
    pub audit_chain: Vec<AuditRecord>,
    /// Hex ed25519 key that verifies `audit_chain` and `suite_seal`
    pub audit_public_key: String,
    pub overall_status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    /// Re-verify the embedded chain and the suite seal offline
    ///
    /// # Errors
    /// Returns `Encoding` for a bad key, otherwise `ChainIntegrity` on the first mismatch
    pub fn verify(&self) -> std::result::Result<(), AuditError> {
        let key = parse_verifying_key(&self.audit_public_key)?;
        ChainVerifier::verify(&self.audit_chain, &key)?;
        if let (Some(suite), Some(seal)) = (&self.suite, &self.suite_seal) {
            seal.verify(suite, &key)?;
        }
        Ok(())
    }
}

/// Aborts the deadline timer when the run ends first
struct DeadlineGuard(JoinHandle<()>);

impl DeadlineGuard {
    fn arm(run_id: RunId, deadline: Duration, cancel: CancellationToken) -> Self {
        Self(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tracing::warn!(run = %run_id, deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX), "run deadline reached");
            cancel.cancel();
        }))
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct RunContext {
    recorder: Arc<AuditRecorder>,
    cancel: CancellationToken,
    result: RunResult,
}

impl RunContext {
    fn subject(&self) -> SubjectId {
        SubjectId::scoped("run", self.result.run_id)
    }

    fn fail(&mut self, failure: StageFailure) {
        if self.result.failure.is_none() {
            self.result.failure = Some(failure);
        }
    }

    /// Mark the run cancelled if the deadline has fired
    fn deadline_passed(&mut self, after: Stage) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        tracing::error!(run = %self.result.run_id, stage = after.as_str(), "run cancelled by deadline");
        self.fail(StageFailure::cancelled(
            format!("run deadline reached during {after}"),
            0,
        ));
        true
    }
}

/// Runs documents through the pipeline
pub struct Orchestrator {
    config: Arc<RunConfig>,
    gateway: ModelGateway,
    signer: Arc<AuditSigner>,
    sink: Arc<dyn AuditSink>,
    resolver: Option<Arc<dyn ConsultationResolver>>,
}

impl Orchestrator {
    /// Orchestrator without a consultation resolver; consultations stay open
    #[must_use]
    pub fn new(
        config: RunConfig,
        gateway: ModelGateway,
        signer: Arc<AuditSigner>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            signer,
            sink,
            resolver: None,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConsultationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run an already ingested document
    ///
    /// # Errors
    /// Returns `OrchestrationError` only if the audit chain cannot be written or verified
    pub async fn run(&self, document: &Document) -> Result<RunResult> {
        let mut run = self.begin(&document.id).await?;
        if !self.accept_config(&mut run) {
            return self.finish(run).await;
        }
        let _deadline = self.arm_deadline(&run);
        self.pipeline(&mut run, document).await?;
        self.finish(run).await
    }

    /// Load a document through `loader`, then run it
    ///
    /// Ingestion failures end the run as `Failed` before categorization.
    ///
    /// # Errors
    /// Returns `OrchestrationError` only if the audit chain cannot be written or verified
    pub async fn run_from_loader(
        &self,
        loader: &dyn DocumentLoader,
        id: &DocumentId,
    ) -> Result<RunResult> {
        let mut run = self.begin(id).await?;
        if !self.accept_config(&mut run) {
            return self.finish(run).await;
        }
        let _deadline = self.arm_deadline(&run);

        let boundary = StageBoundary::start(
            &run.recorder,
            Stage::Ingestion,
            SubjectId::scoped("document", id),
        )
        .await?;
        let loaded = tokio::select! {
            biased;
            () = run.cancel.cancelled() => None,
            loaded = loader.load(id) => Some(loaded),
        };
        let document = match loaded {
            Some(Ok(document)) => {
                boundary.complete(document.metadata()).await?;
                document
            }
            Some(Err(error)) => {
                let failure = StageFailure::new(ErrorKind::IngestionError, error.to_string(), 1);
                boundary.fail(&failure).await?;
                run.fail(failure);
                return self.finish(run).await;
            }
            None => {
                let failure = StageFailure::cancelled("run deadline reached during ingestion", 1);
                boundary.fail(&failure).await?;
                run.fail(failure);
                return self.finish(run).await;
            }
        };

        self.pipeline(&mut run, &document).await?;
        self.finish(run).await
    }

    async fn begin(&self, document_id: &DocumentId) -> Result<RunContext> {
        let run_id = RunId::new();
        let recorder = Arc::new(AuditRecorder::new(
            run_id,
            Arc::clone(&self.signer),
            Arc::clone(&self.sink),
        ));
        let started_at = Utc::now();
        tracing::info!(run = %run_id, document = %document_id, "run started");

        recorder
            .record(
                SubjectId::scoped("run", run_id),
                ACTOR,
                AuditAction::RunStarted,
                json!({
                    "document_id": document_id,
                    "validation_mode": self.config.validation_mode,
                    "signer": self.signer.fingerprint(),
                    "transport": self.gateway.transport_name(),
                }),
            )
            .await?;

        Ok(RunContext {
            result: RunResult {
                run_id,
                document_id: document_id.clone(),
                categorization: None,
                categorization_failure: None,
                analysis_tasks: Vec::new(),
                gate_state: GateState::NotEvaluated,
                consultation: None,
                batches: Vec::new(),
                suite: None,
                suite_seal: None,
                failure: None,
                audit_chain: Vec::new(),
                audit_public_key: verifying_key_hex(&recorder.verifying_key()),
                overall_status: RunStatus::Failed,
                started_at,
                finished_at: started_at,
            },
            recorder,
            cancel: CancellationToken::new(),
        })
    }

    fn accept_config(&self, run: &mut RunContext) -> bool {
        match self.config.validate() {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(run = %run.result.run_id, %error, "invalid run configuration");
                run.fail(StageFailure::new(
                    ErrorKind::ConfigurationError,
                    error.to_string(),
                    0,
                ));
                false
            }
        }
    }

    fn arm_deadline(&self, run: &RunContext) -> Option<DeadlineGuard> {
        self.config
            .timeouts
            .run_deadline()
            .map(|deadline| DeadlineGuard::arm(run.result.run_id, deadline, run.cancel.clone()))
    }

    async fn pipeline(&self, run: &mut RunContext, document: &Document) -> Result<()> {
        let recorder = Arc::clone(&run.recorder);
        let cancel = run.cancel.clone();
        let subject = SubjectId::scoped("document", &document.id);

        // Categorization
        let boundary = StageBoundary::start(&recorder, Stage::Categorization, subject.clone()).await?;
        let categorization = CategorizationStage::new(&self.gateway, &recorder, &self.config)
            .run(document, &cancel)
            .await?;
        match &categorization {
            Ok(result) => {
                boundary.complete(result).await?;
                run.result.categorization = Some(result.clone());
            }
            Err(failure) => {
                boundary.fail(failure).await?;
                run.result.categorization_failure = Some(failure.clone());
            }
        }
        if run.deadline_passed(Stage::Categorization) {
            return Ok(());
        }

        // Analysis
        let analysis = match &categorization {
            Ok(result) => {
                let boundary = StageBoundary::start(&recorder, Stage::Analysis, subject.clone()).await?;
                let report = AnalysisCoordinator::new(self.gateway.clone(), Arc::clone(&recorder), &self.config)
                    .run(&self.config.analysis.tasks, document, result, &cancel)
                    .await?;
                if report.is_complete() {
                    boundary.complete(&report).await?;
                } else {
                    let attempts = report.tasks.iter().map(|t| t.attempts).sum();
                    boundary
                        .fail(&StageFailure::new(
                            ErrorKind::TaskFailure,
                            format!("all {} analysis tasks failed", report.tasks.len()),
                            attempts,
                        ))
                        .await?;
                }
                run.result.analysis_tasks.clone_from(&report.tasks);
                Some(report)
            }
            Err(_) => {
                skip_stage(&recorder, Stage::Analysis, subject.clone(), "categorization failed").await?;
                None
            }
        };
        if run.deadline_passed(Stage::Analysis) {
            return Ok(());
        }

        // Consultation gate
        let boundary = StageBoundary::start(&recorder, Stage::Consultation, subject.clone()).await?;
        let mut gate = ConsultationGate::new(self.config.thresholds);
        let signals = GateSignals::collect(categorization.as_ref(), analysis.as_ref());
        let state = gate.evaluate(&signals)?;
        recorder
            .record(
                subject.clone(),
                GATE_ACTOR,
                AuditAction::GateEvaluated,
                json!({ "state": state, "signals": signals }),
            )
            .await?;
        if state == GateState::ConsultationRequired {
            self.consult(&recorder, &mut gate, &cancel).await?;
        }
        run.result.gate_state = gate.state();
        run.result.consultation = gate.requirement().cloned();
        boundary
            .complete(&json!({ "state": gate.state(), "consultation": gate.requirement() }))
            .await?;
        if run.deadline_passed(Stage::Consultation) {
            return Ok(());
        }

        // Generation
        if !gate.may_generate() {
            let reason = match gate.requirement().and_then(|r| r.resolution.as_ref()) {
                Some(resolution) => format!("consultation resolved as {:?}", resolution.decision),
                None => "awaiting consultation resolution".to_string(),
            };
            skip_stage(&recorder, Stage::Generation, subject.clone(), &reason).await?;
            return Ok(());
        }

        let boundary = StageBoundary::start(&recorder, Stage::Generation, subject.clone()).await?;
        let categorized = categorization.as_ref().ok().map(|c| c.category);
        let Some((category, target)) = gate.effective_category(categorized).and_then(|category| {
            self.config
                .generation
                .target_cases
                .get(category)
                .map(|target| (category, target))
        }) else {
            let failure = StageFailure::new(
                ErrorKind::CategoryUnavailable,
                "no concrete category to generate a suite for",
                0,
            );
            boundary.fail(&failure).await?;
            run.fail(failure);
            return Ok(());
        };

        let context = analysis
            .as_ref()
            .map_or_else(|| Value::Object(serde_json::Map::new()), AnalysisReport::context);
        let outcome = SuiteGenerator::new(self.gateway.clone(), Arc::clone(&recorder), &self.config)
            .generate(document, category, target, &context, &cancel)
            .await?;
        run.result.batches = outcome.batches;

        let suite = match (outcome.suite, outcome.failure) {
            (Some(suite), None) => suite,
            (_, failure) => {
                let failure = failure.unwrap_or_else(|| {
                    StageFailure::new(ErrorKind::TaskFailure, "generation produced no suite", 0)
                });
                boundary.fail(&failure).await?;
                run.fail(failure);
                return Ok(());
            }
        };
        boundary.complete(&suite).await?;
        if run.deadline_passed(Stage::Generation) {
            run.result.suite = Some(suite);
            return Ok(());
        }

        // Seal
        let suite_subject = SubjectId::scoped("suite", suite.id);
        let reviewer = gate
            .requirement()
            .and_then(|r| r.resolution.as_ref())
            .map(|r| r.reviewer.clone());
        let boundary = StageBoundary::start(&recorder, Stage::Sealing, suite_subject.clone()).await?;
        let seal = recorder.seal(suite_subject, &suite, reviewer).await?;
        boundary.complete(&seal).await?;

        run.result.suite = Some(suite);
        run.result.suite_seal = Some(seal);
        Ok(())
    }

    async fn consult(
        &self,
        recorder: &AuditRecorder,
        gate: &mut ConsultationGate,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(requirement) = gate.requirement().cloned() else {
            return Ok(());
        };
        let subject = SubjectId::scoped("consultation", requirement.id);
        tracing::warn!(
            consultation = %requirement.id,
            reason = ?requirement.reason,
            triggers = ?requirement.triggers,
            "consultation required"
        );
        recorder
            .record_with_severity(
                subject.clone(),
                GATE_ACTOR,
                AuditAction::ConsultationRequired,
                Severity::Warning,
                json!(requirement),
            )
            .await?;

        if self.config.validation_mode {
            if requirement.bypassable {
                let reason = format!(
                    "validation mode enabled and triggers {:?} permit bypass",
                    requirement.triggers
                );
                gate.bypass(true, reason.clone())?;
                recorder
                    .record_with_severity(
                        subject.clone(),
                        GATE_ACTOR,
                        AuditAction::ConsultationBypassed,
                        Severity::Warning,
                        json!({ "reason": reason, "triggers": requirement.triggers }),
                    )
                    .await?;
                recorder
                    .record(
                        subject,
                        GATE_ACTOR,
                        AuditAction::ComplianceNote,
                        json!({
                            "consultation_id": requirement.id,
                            "note": "consultation bypassed under validation mode; no later resolution will be recorded",
                        }),
                    )
                    .await?;
                return Ok(());
            }
            recorder
                .record(
                    subject.clone(),
                    GATE_ACTOR,
                    AuditAction::ComplianceNote,
                    json!({
                        "consultation_id": requirement.id,
                        "note": "validation mode enabled but triggers require a human decision",
                        "triggers": requirement.triggers,
                    }),
                )
                .await?;
        }

        let Some(resolver) = &self.resolver else {
            recorder
                .record(
                    subject,
                    GATE_ACTOR,
                    AuditAction::ComplianceNote,
                    json!({
                        "consultation_id": requirement.id,
                        "note": "no consultation resolver configured; consultation left open",
                    }),
                )
                .await?;
            return Ok(());
        };

        if let Err(error) = resolver.submit(&requirement).await {
            tracing::error!(consultation = %requirement.id, %error, "consultation submission failed");
            recorder
                .record_with_severity(
                    subject,
                    GATE_ACTOR,
                    AuditAction::ComplianceNote,
                    Severity::Error,
                    json!({ "note": "consultation could not be submitted", "error": error.to_string() }),
                )
                .await?;
            return Ok(());
        }
        recorder
            .record(
                subject.clone(),
                GATE_ACTOR,
                AuditAction::ConsultationSubmitted,
                json!({ "consultation_id": requirement.id }),
            )
            .await?;

        let wait = self.config.timeouts.consultation();
        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            answer = tokio::time::timeout(wait, resolver.await_resolution(requirement.id)) => Some(answer),
        };
        match waited {
            None => {}
            Some(Err(_elapsed)) => {
                tracing::warn!(consultation = %requirement.id, "consultation timed out");
                recorder
                    .record_with_severity(
                        subject,
                        GATE_ACTOR,
                        AuditAction::ConsultationTimedOut,
                        Severity::Warning,
                        json!({ "consultation_id": requirement.id, "timeout_ms": u64::try_from(wait.as_millis()).unwrap_or(u64::MAX) }),
                    )
                    .await?;
            }
            Some(Ok(Err(error))) => {
                recorder
                    .record_with_severity(
                        subject,
                        GATE_ACTOR,
                        AuditAction::ComplianceNote,
                        Severity::Error,
                        json!({ "note": "resolver failed", "error": error.to_string() }),
                    )
                    .await?;
            }
            Some(Ok(Ok(resolution))) => match gate.resolve(resolution.clone()) {
                Ok(_) => {
                    tracing::info!(
                        consultation = %requirement.id,
                        decision = ?resolution.decision,
                        reviewer = %resolution.reviewer,
                        "consultation resolved"
                    );
                    recorder
                        .record(
                            subject,
                            GATE_ACTOR,
                            AuditAction::ConsultationResolved,
                            json!(resolution),
                        )
                        .await?;
                }
                Err(error) => {
                    recorder
                        .record_with_severity(
                            subject,
                            GATE_ACTOR,
                            AuditAction::ComplianceNote,
                            Severity::Error,
                            json!({ "note": "resolution rejected", "error": error.to_string() }),
                        )
                        .await?;
                }
            },
        }
        Ok(())
    }

    async fn finish(&self, run: RunContext) -> Result<RunResult> {
        let subject = run.subject();
        let RunContext {
            recorder, mut result, ..
        } = run;

        result.overall_status = if result.failure.is_some() {
            RunStatus::Failed
        } else if result.consultation.is_some() {
            RunStatus::CompletedWithConsultation
        } else {
            RunStatus::Completed
        };
        let (action, severity) = match result.overall_status {
            RunStatus::Failed => (AuditAction::RunFailed, Severity::Error),
            _ => (AuditAction::RunCompleted, Severity::Info),
        };
        recorder
            .record_with_severity(
                subject,
                ACTOR,
                action,
                severity,
                json!({
                    "status": result.overall_status,
                    "failure": result.failure,
                    "gate_state": result.gate_state,
                    "suite_cases": result.suite.as_ref().map(|s| s.cases.len()),
                }),
            )
            .await?;

        if let Err(error) = recorder.verify_chain().await {
            tracing::error!(run = %result.run_id, %error, "audit chain failed verification");
            return Err(OrchestrationError::Audit(error));
        }
        result.audit_chain = recorder.chain().await?;
        result.finished_at = Utc::now();

        tracing::info!(
            run = %result.run_id,
            status = ?result.overall_status,
            records = result.audit_chain.len(),
            "run finished"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("gateway", &self.gateway)
            .field("signer", &self.signer)
            .field("has_resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}
