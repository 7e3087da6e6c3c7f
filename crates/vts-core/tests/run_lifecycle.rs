//! Run-level outcomes outside the happy path.
//!
//! Core guarantees exercised here:
//! - Invalid configuration and unreadable documents fail the run before any
//!   model call, with a verifiable chain.
//! - The run deadline cancels in-flight work and ends the run `Failed`.
//! - A clean document loaded from disk completes with a sealed suite.

use std::sync::Arc;
use std::time::Duration;
use vts_audit::AuditAction;
use vts_core::{
    DocumentId, ErrorKind, FsDocumentLoader, GateState, RunStatus, TaskStatus, TimeoutConfig,
};
use vts_test_utils::{orchestrator, sample_document, test_config, ScriptedTransport};

#[tokio::test]
async fn invalid_configuration_fails_before_any_model_call() {
    let transport = Arc::new(ScriptedTransport::new());
    let (orchestrator, _sink) = orchestrator(test_config().with_batch_size(0), &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    assert_eq!(result.overall_status, RunStatus::Failed);
    assert_eq!(
        result.failure.as_ref().unwrap().kind,
        ErrorKind::ConfigurationError
    );
    assert_eq!(transport.total_calls(), 0);
    let actions: Vec<_> = result.audit_chain.iter().map(|r| r.action).collect();
    assert_eq!(actions, vec![AuditAction::RunStarted, AuditAction::RunFailed]);
    assert!(result.verify().is_ok());
}

#[tokio::test]
async fn missing_document_fails_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let (orchestrator, _sink) = orchestrator(test_config(), &transport);

    let result = orchestrator
        .run_from_loader(&FsDocumentLoader::new(dir.path()), &DocumentId::new("absent.md"))
        .await
        .unwrap();

    assert_eq!(result.overall_status, RunStatus::Failed);
    assert_eq!(result.failure.as_ref().unwrap().kind, ErrorKind::IngestionError);
    assert!(result.categorization.is_none());
    assert_eq!(result.gate_state, GateState::NotEvaluated);
    assert_eq!(transport.total_calls(), 0);

    let failed = result
        .audit_chain
        .iter()
        .find(|r| r.action == AuditAction::StageFailed)
        .unwrap();
    assert_eq!(failed.payload["stage"], "ingestion");
    assert!(result.verify().is_ok());
}

#[tokio::test]
async fn document_on_disk_runs_to_a_sealed_suite() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("urs.md"), sample_document().content()).unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let (orchestrator, _sink) = orchestrator(test_config(), &transport);

    let result = orchestrator
        .run_from_loader(&FsDocumentLoader::new(dir.path()), &DocumentId::new("urs.md"))
        .await
        .unwrap();

    assert_eq!(result.overall_status, RunStatus::Completed);
    assert_eq!(result.gate_state, GateState::Proceeding);
    assert!(result.consultation.is_none());
    assert!(result
        .analysis_tasks
        .iter()
        .all(|t| t.status == TaskStatus::Succeeded));
    let suite = result.suite.as_ref().unwrap();
    assert_eq!(suite.cases.len(), 20);
    assert_eq!(suite.run_id, result.run_id);
    assert!(!suite.is_partial());
    assert!(result.suite_seal.is_some());
    assert!(result.finished_at >= result.started_at);
    assert!(result.verify().is_ok());
}

#[tokio::test(start_paused = true)]
async fn run_deadline_cancels_in_flight_work() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(10)));
    let config = test_config().with_timeouts(TimeoutConfig {
        categorization_ms: 60_000,
        analysis_ms: 60_000,
        batch_ms: 60_000,
        consultation_ms: 60_000,
        run_deadline_ms: Some(500),
    });
    let (orchestrator, _sink) = orchestrator(config, &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    assert_eq!(result.overall_status, RunStatus::Failed);
    assert_eq!(result.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(
        result.categorization_failure.as_ref().unwrap().kind,
        ErrorKind::Cancelled
    );
    assert!(result.suite.is_none());
    assert_eq!(
        result.audit_chain.last().unwrap().action,
        AuditAction::RunFailed
    );
    assert!(result.verify().is_ok());
}

#[tokio::test(start_paused = true)]
async fn deadline_during_analysis_times_out_tasks() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(1)));
    let config = test_config().with_timeouts(TimeoutConfig {
        categorization_ms: 60_000,
        analysis_ms: 60_000,
        batch_ms: 60_000,
        consultation_ms: 60_000,
        run_deadline_ms: Some(1_500),
    });
    let (orchestrator, _sink) = orchestrator(config, &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    assert!(result.categorization.is_some());
    assert_eq!(result.analysis_tasks.len(), 3);
    assert!(result
        .analysis_tasks
        .iter()
        .all(|t| t.status == TaskStatus::TimedOut));
    assert_eq!(result.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(result.overall_status, RunStatus::Failed);
    assert_eq!(result.gate_state, GateState::NotEvaluated);
}
