//! Batched suite generation inside a full run.
//!
//! Core guarantees exercised here:
//! - A failed batch is recorded and skipped; later batches still run and the
//!   merged suite keeps batch order.
//! - Retries use backoff and a short batch asks only for what is missing.
//! - A run where every batch fails ends `Failed` with no suite.
//! - Batches that finish out of order are still reported in index order.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vts_audit::AuditAction;
use vts_core::{BatchStatus, ErrorKind, RetryPolicy, RunStatus};
use vts_gateway::GatewayFailure;
use vts_test_utils::{
    case_id, cases_payload, orchestrator, sample_document, test_config, uniform_targets, Reply,
    ScriptedTransport,
};

#[tokio::test]
async fn failed_middle_batch_leaves_ordered_partial_suite() {
    let transport = Arc::new(
        ScriptedTransport::new().fail_batch(3, GatewayFailure::provider("upstream 502")),
    );
    let config = test_config()
        .with_target_cases(uniform_targets(25))
        .with_batch_size(5);
    let (orchestrator, _sink) = orchestrator(config, &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    assert_eq!(result.overall_status, RunStatus::Completed);
    assert_eq!(result.batches.len(), 5);
    let statuses: Vec<_> = result.batches.iter().map(|b| b.status).collect();
    assert_eq!(
        statuses,
        vec![
            BatchStatus::Succeeded,
            BatchStatus::Succeeded,
            BatchStatus::Failed,
            BatchStatus::Succeeded,
            BatchStatus::Succeeded,
        ]
    );
    let failed = &result.batches[2];
    assert_eq!(failed.attempt_count, 3);
    assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::ProviderError);
    assert_eq!(transport.calls("generation:3"), 3);

    let suite = result.suite.as_ref().unwrap();
    assert!(suite.is_partial());
    assert_eq!(suite.failed_batches, vec![3]);
    assert_eq!(suite.batch_count, 5);

    let ids: Vec<&str> = suite.cases.iter().map(|c| c.id.as_str()).collect();
    let expected: Vec<String> = [1, 2, 4, 5]
        .into_iter()
        .flat_map(|batch| (1..=5).map(move |n| case_id(batch, n)))
        .collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(suite.cases.iter().all(|c| c.batch_index != 3));

    let merged = result
        .audit_chain
        .iter()
        .find(|r| r.action == AuditAction::SuiteMerged)
        .unwrap();
    assert_eq!(merged.severity, vts_audit::Severity::Warning);
    assert!(result.verify().is_ok());
}

#[tokio::test]
async fn every_batch_failing_fails_the_run() {
    let failure = GatewayFailure::malformed("not a case list");
    let transport = Arc::new(
        ScriptedTransport::new()
            .fail_batch(1, failure.clone())
            .fail_batch(2, failure.clone())
            .fail_batch(3, failure.clone())
            .fail_batch(4, failure),
    );
    let (orchestrator, _sink) = orchestrator(test_config(), &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    assert_eq!(result.overall_status, RunStatus::Failed);
    assert_eq!(result.failure.as_ref().unwrap().kind, ErrorKind::TaskFailure);
    assert!(result.suite.is_none());
    assert!(result.suite_seal.is_none());
    assert_eq!(result.batches.len(), 4);
    assert_eq!(
        result.audit_chain.last().unwrap().action,
        AuditAction::RunFailed
    );
    assert!(result.verify().is_ok());
}

#[tokio::test]
async fn short_batch_requests_only_the_remainder() {
    let transport = Arc::new(ScriptedTransport::new().script(
        "generation:1",
        vec![Reply::Json(cases_payload(1, 1, 3)), Reply::Auto],
    ));
    let (orchestrator, _sink) = orchestrator(test_config(), &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    let first = &result.batches[0];
    assert_eq!(first.status, BatchStatus::Succeeded);
    assert_eq!(first.attempt_count, 2);
    let ids: Vec<&str> = first.generated_cases.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["TC-01-01", "TC-01-02", "TC-01-03", "TC-01-04", "TC-01-05"]);
    assert_eq!(first.generated_cases[3].attempt, 2);

    let short = result
        .audit_chain
        .iter()
        .find(|r| r.action == AuditAction::BatchAttemptFailed)
        .unwrap();
    assert_eq!(short.payload["cases_so_far"], json!(3));
    assert_eq!(result.suite.as_ref().unwrap().cases.len(), 20);
}

#[tokio::test]
async fn transient_failure_succeeds_on_retry() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .script(
                "analysis:context",
                vec![Reply::Fail(GatewayFailure::provider("429")), Reply::Auto],
            )
            .script(
                "generation:2",
                vec![Reply::Raw("{\"cases\": ".to_string()), Reply::Auto],
            ),
    );
    let (orchestrator, _sink) = orchestrator(test_config(), &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    assert_eq!(result.overall_status, RunStatus::Completed);
    let context = &result.analysis_tasks[0];
    assert_eq!(context.attempts, 2);
    assert!(context.output.is_some());
    assert_eq!(result.batches[1].attempt_count, 2);
    assert_eq!(result.batches[1].status, BatchStatus::Succeeded);

    let attempt_failures: Vec<_> = result
        .audit_chain
        .iter()
        .filter(|r| {
            matches!(
                r.action,
                AuditAction::TaskAttemptFailed | AuditAction::BatchAttemptFailed
            )
        })
        .collect();
    assert_eq!(attempt_failures.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn stalled_batch_times_out_after_its_attempts() {
    let transport = Arc::new(ScriptedTransport::new().script("generation:4", vec![Reply::Stall]));
    let config = test_config().with_generation_retry(RetryPolicy::default().with_max_attempts(2));
    let (orchestrator, _sink) = orchestrator(config, &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    let last = result.batches.last().unwrap();
    assert_eq!(last.status, BatchStatus::TimedOut);
    assert_eq!(last.attempt_count, 2);
    assert_eq!(last.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(result.suite.as_ref().unwrap().failed_batches, vec![4]);
    assert_eq!(result.overall_status, RunStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_keep_batch_order() {
    let transport = Arc::new(
        ScriptedTransport::new().with_delay(Duration::from_millis(3)),
    );
    let config = test_config()
        .with_target_cases(uniform_targets(40))
        .with_max_concurrent_batches(4);
    let (orchestrator, _sink) = orchestrator(config, &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    let indices: Vec<usize> = result.batches.iter().map(|b| b.batch_index).collect();
    assert_eq!(indices, (1..=8).collect::<Vec<_>>());
    let suite = result.suite.as_ref().unwrap();
    assert_eq!(suite.cases.len(), 40);
    assert!(suite
        .cases
        .windows(2)
        .all(|pair| pair[0].batch_index <= pair[1].batch_index));
    assert!(result.verify().is_ok());
}

#[tokio::test(start_paused = true)]
async fn slow_first_batch_still_lands_first() {
    let transport = Arc::new(
        ScriptedTransport::new()
            .delay_route("generation:1", Duration::from_millis(900))
            .delay_route("generation:2", Duration::from_millis(300)),
    );
    let config = test_config()
        .with_target_cases(uniform_targets(20))
        .with_batch_size(5)
        .with_max_concurrent_batches(4);
    let (orchestrator, _sink) = orchestrator(config, &transport);

    let result = orchestrator.run(&sample_document()).await.unwrap();

    let completion_order: Vec<u64> = result
        .audit_chain
        .iter()
        .filter(|r| r.action == AuditAction::BatchCompleted)
        .filter_map(|r| r.payload["batch_index"].as_u64())
        .collect();
    assert_eq!(completion_order.last(), Some(&1));
    assert_ne!(completion_order, vec![1, 2, 3, 4]);

    let indices: Vec<usize> = result.batches.iter().map(|b| b.batch_index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    let suite = result.suite.as_ref().unwrap();
    assert_eq!(suite.cases.first().unwrap().batch_index, 1);
    assert!(suite
        .cases
        .windows(2)
        .all(|pair| pair[0].batch_index <= pair[1].batch_index));
    assert!(result.verify().is_ok());
}
