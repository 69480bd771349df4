// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Shared fixtures for the end-to-end tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use floworch::config::OrchestratorConfig;
use floworch::context::ExecutionStatusView;
use floworch::definition::RetryPolicy;
use floworch::events::{EventType, FlowExecutionEvent, MemoryEventSink};
use floworch::orchestrator::FlowOrchestrator;
use floworch::prelude::*;
use floworch_testing::MockWorker;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Install the test tracing subscriber once; RUST_LOG controls verbosity.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn fast_config(state_dir: &Path) -> OrchestratorConfig {
    init_tracing();
    let mut config = OrchestratorConfig {
        state_dir: state_dir.to_path_buf(),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 10,
            factor: 1.5,
            jitter: 0.0,
        },
        command_deadline_ms: 500,
        deadline_sweep_ms: 10,
        snapshot_interval: 4,
        ..OrchestratorConfig::default()
    };
    config.recovery.result_wait_ms = 50;
    config
}

pub fn orchestrator(
    state_dir: &Path,
    catalog: Arc<StaticVersionCatalog>,
    sink: Arc<MemoryEventSink>,
) -> FlowOrchestrator {
    FlowOrchestrator::builder()
        .with_config(fast_config(state_dir))
        .with_catalog(catalog)
        .with_event_sink(sink)
        .build()
        .expect("orchestrator builds")
}

pub fn spawn_workers(orchestrator: &FlowOrchestrator, workers: &[Arc<MockWorker>]) {
    for worker in workers {
        let _ = Arc::clone(worker).spawn(orchestrator.bus(), orchestrator.memory());
    }
}

pub async fn wait_terminal(
    orchestrator: &FlowOrchestrator,
    execution_id: ExecutionId,
) -> ExecutionStatusView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(view) = orchestrator.execution_status(execution_id) {
            if view.status.is_terminal() {
                return view;
            }
        }
        assert!(
            tokio::time::Instant::now() <= deadline,
            "execution {execution_id} never reached a terminal status"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Block until the sink has emitted a STEP_COMPLETED for the given step id.
pub async fn wait_step_completed(sink: &MemoryEventSink, step_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if sink
            .events()
            .iter()
            .any(|e| e.event_type == EventType::StepCompleted && e.data["step_id"] == step_id)
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() <= deadline,
            "step {step_id} never completed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The step ids of STEP_COMPLETED events, in emission order.
pub fn completed_step_ids(events: &[FlowExecutionEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::StepCompleted)
        .filter_map(|e| e.data["step_id"].as_str().map(str::to_string))
        .collect()
}

/// The first event of the given type, if any.
pub fn first_event<'a>(
    events: &'a [FlowExecutionEvent],
    event_type: EventType,
) -> Option<&'a FlowExecutionEvent> {
    events.iter().find(|e| e.event_type == event_type)
}
