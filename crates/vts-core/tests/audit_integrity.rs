//! Audit chain guarantees across whole runs.
//!
//! Core guarantees exercised here:
//! - Concurrent analysis tasks and batches append to one linear chain with
//!   contiguous sequences and unique checksums.
//! - Every started stage is closed by a completed, failed or skipped record.
//! - A serialized run result can be verified offline, and any edit to the
//!   chain or the sealed suite is detected.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use vts_audit::{AuditAction, AuditError, AuditSink, ChainVerifier};
use vts_core::{RunResult, RunStatus};
use vts_test_utils::{
    orchestrator, sample_document, test_config, test_signer, uniform_targets, ScriptedTransport,
};

async fn completed_run() -> RunResult {
    let transport = Arc::new(ScriptedTransport::new());
    let (orchestrator, _sink) = orchestrator(test_config(), &transport);
    orchestrator.run(&sample_document()).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_produce_one_linear_chain() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_millis(2)));
    let config = test_config()
        .with_target_cases(uniform_targets(30))
        .with_max_concurrent_batches(3);
    let (orchestrator, sink) = orchestrator(config, &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();
    assert_eq!(result.overall_status, RunStatus::Completed);

    let chain = &result.audit_chain;
    for (position, record) in chain.iter().enumerate() {
        assert_eq!(record.sequence, position as u64);
        assert_eq!(record.run_id, result.run_id);
    }
    for pair in chain.windows(2) {
        assert_eq!(pair[1].prior_record, Some(pair[0].id));
    }
    let checksums: HashSet<_> = chain.iter().map(|r| r.checksum).collect();
    assert_eq!(checksums.len(), chain.len());

    let stored = sink.read_chain(result.run_id).await.unwrap();
    assert_eq!(&stored, chain);
    assert!(ChainVerifier::is_valid(chain, &test_signer().verifying_key()));
}

#[tokio::test]
async fn every_started_stage_is_closed() {
    let result = completed_run().await;

    let mut open = Vec::new();
    for record in &result.audit_chain {
        let stage = record.payload["stage"].clone();
        match record.action {
            AuditAction::StageStarted => open.push(stage),
            AuditAction::StageCompleted | AuditAction::StageFailed => {
                assert_eq!(open.pop(), Some(stage));
            }
            _ => {}
        }
    }
    assert!(open.is_empty());

    let first = result.audit_chain.first().unwrap();
    let last = result.audit_chain.last().unwrap();
    assert_eq!(first.action, AuditAction::RunStarted);
    assert_eq!(last.action, AuditAction::RunCompleted);

    let sealed = result
        .audit_chain
        .iter()
        .filter(|r| r.action == AuditAction::ArtifactSealed)
        .count();
    assert_eq!(sealed, 1);
}

#[tokio::test]
async fn serialized_result_verifies_offline() {
    let result = completed_run().await;
    let json = serde_json::to_string(&result).unwrap();
    let restored: RunResult = serde_json::from_str(&json).unwrap();

    assert_eq!(restored, result);
    assert!(restored.verify().is_ok());
}

#[tokio::test]
async fn edited_record_breaks_verification() {
    let mut result = completed_run().await;
    result.audit_chain[3].payload = serde_json::json!({ "stage": "generation" });

    let err = result.verify().unwrap_err();
    assert!(matches!(err, AuditError::ChainIntegrity { sequence: 3, .. }));
}

#[tokio::test]
async fn dropped_record_breaks_verification() {
    let mut result = completed_run().await;
    result.audit_chain.remove(5);

    assert!(result.verify().unwrap_err().is_integrity_failure());
}

#[tokio::test]
async fn edited_suite_breaks_the_seal() {
    let mut result = completed_run().await;
    let suite = result.suite.as_mut().unwrap();
    suite.cases[0].expected_result = "Anything goes".to_string();

    assert!(result.verify().unwrap_err().is_integrity_failure());
}

#[tokio::test]
async fn foreign_key_does_not_verify() {
    let mut result = completed_run().await;
    let other = vts_audit::AuditSigner::from_seed([9; 32]);
    result.audit_public_key = vts_audit::verifying_key_hex(&other.verifying_key());

    assert!(result.verify().is_err());
}
