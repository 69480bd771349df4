// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cancellation, leadership gating, and active-address exclusion.

use super::*;
use floworch::context::{ExecutionStatus, TriggerMetadata};
use floworch::events::EventType;
use floworch::recovery::LeaderElector;
use floworch_testing::{MockOutcome, MockWorker};

#[tokio::test]
async fn test_cancellation_is_immediate_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator_with(Arc::clone(&sink), test_config(dir.path()));

    // Importer stalls long enough for the cancel to land mid-flight.
    let importer = Arc::new(
        MockWorker::new(ServiceRef::new(IMPORTER, "1.0.0"))
            .default_outcome(MockOutcome::DelayMs(2_000)),
    );
    let processor = Arc::new(MockWorker::new(ServiceRef::new(PROCESSOR, "1.0.0")));
    let exporter = Arc::new(MockWorker::new(ServiceRef::new(EXPORTER, "1.0.0")));
    for worker in [&importer, &processor, &exporter] {
        let _ = Arc::clone(worker).spawn(orchestrator.bus(), orchestrator.memory());
    }

    orchestrator.submit_flow(linear_flow("FLOW-CXL")).unwrap();
    let execution_id = orchestrator
        .trigger_execution("FLOW-CXL", TriggerMetadata::default())
        .await
        .unwrap();

    // Let the import command reach the worker, then cancel.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    orchestrator.cancel_execution(execution_id).unwrap();

    let view = wait_for_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Failed);
    assert!(sink.event_types().contains(&EventType::Cancelled));

    // Cancelling a finished execution is a no-op.
    orchestrator.cancel_execution(execution_id).unwrap();
    orchestrator.cancel_execution(execution_id).unwrap();

    // The stalled worker was asked to abort.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(importer.cancellations().len(), 1);
    // Nothing was dispatched after the cancel.
    assert_eq!(processor.seen_count(), 0);
}

#[tokio::test]
async fn test_active_address_exclusion_rejects_second_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator_with(Arc::clone(&sink), test_config(dir.path()));

    let importer = Arc::new(
        MockWorker::new(ServiceRef::new(IMPORTER, "1.0.0"))
            .default_outcome(MockOutcome::DelayMs(1_500)),
    );
    let processor = Arc::new(MockWorker::new(ServiceRef::new(PROCESSOR, "1.0.0")));
    let exporter = Arc::new(MockWorker::new(ServiceRef::new(EXPORTER, "1.0.0")));
    for worker in [&importer, &processor, &exporter] {
        let _ = Arc::clone(worker).spawn(orchestrator.bus(), orchestrator.memory());
    }

    orchestrator.submit_flow(linear_flow("FLOW-EX")).unwrap();
    let first = orchestrator
        .trigger_execution("FLOW-EX", TriggerMetadata::default())
        .await
        .unwrap();

    // Same flow, same (protocol, address, version): rejected synchronously.
    let err = orchestrator
        .trigger_execution("FLOW-EX", TriggerMetadata::default())
        .await
        .unwrap_err();
    assert_conflict(&err);

    // Only the first execution ever dispatched.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(importer.seen_count(), 1);

    orchestrator.cancel_execution(first).unwrap();
    wait_for_terminal(&orchestrator, first).await;

    // With the first execution finished, the reservation is free again.
    let second = orchestrator
        .trigger_execution("FLOW-EX", TriggerMetadata::default())
        .await
        .unwrap();
    assert_ne!(first, second);
    orchestrator.cancel_execution(second).unwrap();
    wait_for_terminal(&orchestrator, second).await;
}

struct NeverLeader;

impl LeaderElector for NeverLeader {
    fn is_leader(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_non_leader_refuses_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = FlowOrchestrator::builder()
        .with_config(test_config(dir.path()))
        .with_catalog(catalog())
        .with_elector(Arc::new(NeverLeader))
        .build()
        .unwrap();

    orchestrator.submit_flow(linear_flow("FLOW-NL")).unwrap();
    let err = orchestrator
        .trigger_execution("FLOW-NL", TriggerMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotLeader));
}

#[tokio::test]
async fn test_shutdown_refuses_new_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator_with(Arc::clone(&sink), test_config(dir.path()));

    orchestrator.submit_flow(linear_flow("FLOW-SD")).unwrap();
    orchestrator.shutdown(std::time::Duration::from_millis(100)).await;

    let err = orchestrator
        .trigger_execution("FLOW-SD", TriggerMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}
