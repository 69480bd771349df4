// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Retry policy and circuit breaker behavior.

use super::*;
use floworch::config::CircuitBreakerConfig;
use floworch::context::{BranchStatus, ExecutionStatus, TriggerMetadata};
use floworch::error::ErrorCode;
use floworch::events::EventType;
use floworch_testing::{MockOutcome, MockWorker};

#[tokio::test]
async fn test_retriable_failure_recovers_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator_with(Arc::clone(&sink), test_config(dir.path()));

    let importer = Arc::new(
        MockWorker::new(ServiceRef::new(IMPORTER, "1.0.0")).script([
            MockOutcome::Fail(ErrorCode::connection_timeout()),
            MockOutcome::Succeed,
        ]),
    );
    let processor = Arc::new(MockWorker::new(ServiceRef::new(PROCESSOR, "1.0.0")));
    let exporter = Arc::new(MockWorker::new(ServiceRef::new(EXPORTER, "1.0.0")));
    for worker in [&importer, &processor, &exporter] {
        let _ = Arc::clone(worker).spawn(orchestrator.bus(), orchestrator.memory());
    }

    assert!(orchestrator.submit_flow(linear_flow("FLOW-RT")).unwrap().is_valid());
    let execution_id = orchestrator
        .trigger_execution("FLOW-RT", TriggerMetadata::default())
        .await
        .unwrap();

    let view = wait_for_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Completed);
    // First dispatch failed, retry succeeded.
    assert_eq!(importer.seen_count(), 2);
    assert_eq!(processor.seen_count(), 1);
}

#[tokio::test]
async fn test_importer_timeout_exhausts_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator_with(Arc::clone(&sink), test_config(dir.path()));

    let importer = Arc::new(
        MockWorker::new(ServiceRef::new(IMPORTER, "1.0.0"))
            .default_outcome(MockOutcome::Timeout),
    );
    let processor = Arc::new(MockWorker::new(ServiceRef::new(PROCESSOR, "1.0.0")));
    let exporter = Arc::new(MockWorker::new(ServiceRef::new(EXPORTER, "1.0.0")));
    for worker in [&importer, &processor, &exporter] {
        let _ = Arc::clone(worker).spawn(orchestrator.bus(), orchestrator.memory());
    }

    orchestrator.submit_flow(linear_flow("FLOW-TO")).unwrap();
    let execution_id = orchestrator
        .trigger_execution("FLOW-TO", TriggerMetadata::default())
        .await
        .unwrap();

    let view = wait_for_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Failed);
    // Initial dispatch plus exactly max_attempts retries.
    assert_eq!(importer.seen_count(), 4);
    assert_eq!(view.branches["main"], BranchStatus::Failed);
    // Downstream steps never ran.
    assert_eq!(processor.seen_count(), 0);
    assert_eq!(exporter.seen_count(), 0);

    let types = sink.event_types();
    assert!(types.contains(&EventType::StepFailed));
    assert!(types.contains(&EventType::BranchFailed));
    assert_eq!(*types.last().unwrap(), EventType::Failed);
}

#[tokio::test]
async fn test_non_retriable_failure_fails_branch_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator_with(Arc::clone(&sink), test_config(dir.path()));

    let importer = Arc::new(MockWorker::new(ServiceRef::new(IMPORTER, "1.0.0")));
    let processor = Arc::new(
        MockWorker::new(ServiceRef::new(PROCESSOR, "1.0.0"))
            .default_outcome(MockOutcome::Fail(ErrorCode::transformation_failed())),
    );
    let exporter = Arc::new(MockWorker::new(ServiceRef::new(EXPORTER, "1.0.0")));
    for worker in [&importer, &processor, &exporter] {
        let _ = Arc::clone(worker).spawn(orchestrator.bus(), orchestrator.memory());
    }

    orchestrator.submit_flow(linear_flow("FLOW-NR")).unwrap();
    let execution_id = orchestrator
        .trigger_execution("FLOW-NR", TriggerMetadata::default())
        .await
        .unwrap();

    let view = wait_for_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Failed);
    // No retries for DATA/TRANSFORMATION failures.
    assert_eq!(processor.seen_count(), 1);
    assert_eq!(exporter.seen_count(), 0);
}

#[tokio::test]
async fn test_circuit_opens_and_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let mut config = test_config(dir.path());
    config.retry.max_attempts = 5;
    config.circuit_breaker = CircuitBreakerConfig {
        threshold: 2,
        cooldown_ms: 60_000,
    };
    let orchestrator = orchestrator_with(Arc::clone(&sink), config);

    let importer = Arc::new(
        MockWorker::new(ServiceRef::new(IMPORTER, "1.0.0"))
            .default_outcome(MockOutcome::Fail(ErrorCode::resource_unavailable())),
    );
    let processor = Arc::new(MockWorker::new(ServiceRef::new(PROCESSOR, "1.0.0")));
    let exporter = Arc::new(MockWorker::new(ServiceRef::new(EXPORTER, "1.0.0")));
    for worker in [&importer, &processor, &exporter] {
        let _ = Arc::clone(worker).spawn(orchestrator.bus(), orchestrator.memory());
    }

    orchestrator.submit_flow(linear_flow("FLOW-CB")).unwrap();
    let execution_id = orchestrator
        .trigger_execution("FLOW-CB", TriggerMetadata::default())
        .await
        .unwrap();

    let view = wait_for_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Failed);
    // The circuit opened after 2 consecutive failures; the remaining
    // attempts failed fast without reaching the worker.
    assert_eq!(importer.seen_count(), 2);
}
