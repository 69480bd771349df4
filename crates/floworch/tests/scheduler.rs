// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Scheduler behavior tests: retry policy, circuit breaking, timeouts,
//! cancellation. Driven end-to-end through the orchestrator facade with
//! scripted mock workers, which is how every deployment exercises the
//! scheduler anyway.
//!
//! These live as an integration test (rather than an in-crate `#[cfg(test)]`
//! module) because they depend on `floworch-testing`, which itself depends
//! on `floworch` - an in-crate unit test module pulling in that dev-dependency
//! would link two different compilations of this crate.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

#[path = "scheduler/control_tests.rs"]
mod control_tests;
#[path = "scheduler/retry_tests.rs"]
mod retry_tests;

use floworch::config::OrchestratorConfig;
use floworch::context::ExecutionStatusView;
use floworch::definition::{
    EntityRef, ExporterSpec, FlowDefinition, ImporterSpec, ProcessorSpec, RetryPolicy, ServiceRef,
};
use floworch::error::Error;
use floworch::events::MemoryEventSink;
use floworch::orchestrator::FlowOrchestrator;
use floworch::schema::DataSchema;
use floworch::versioning::{MergeCapabilities, ServiceRegistration, StaticVersionCatalog};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const IMPORTER: &str = "rest-importer";
pub(crate) const PROCESSOR: &str = "json-proc";
pub(crate) const EXPORTER: &str = "file-exporter";

pub(crate) fn test_config(state_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        state_dir: state_dir.to_path_buf(),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            factor: 1.5,
            jitter: 0.0,
        },
        command_deadline_ms: 400,
        deadline_sweep_ms: 10,
        snapshot_interval: 4,
        ..OrchestratorConfig::default()
    }
}

pub(crate) fn catalog() -> Arc<StaticVersionCatalog> {
    let catalog = StaticVersionCatalog::new();
    catalog.register(
        ServiceRegistration::new(ServiceRef::new(IMPORTER, "1.0.0"))
            .output_schema(DataSchema::new("RawData", 1, vec![])),
    );
    catalog.register(
        ServiceRegistration::new(ServiceRef::new(PROCESSOR, "1.0.0"))
            .output_schema(DataSchema::new("TransformedData", 1, vec![])),
    );
    catalog.register(
        ServiceRegistration::new(ServiceRef::new(EXPORTER, "1.0.0"))
            .merge_capabilities(MergeCapabilities::everything()),
    );
    Arc::new(catalog)
}

pub(crate) fn linear_flow(flow_id: &str) -> FlowDefinition {
    FlowDefinition::new(
        flow_id,
        "1.0.0",
        ImporterSpec::new(
            "imp",
            ServiceRef::new(IMPORTER, "1.0.0"),
            EntityRef::new("src", "1.0.0", "rest", format!("https://api.example.com/{flow_id}")),
        ),
    )
    .with_processor(ProcessorSpec::new("p1", ServiceRef::new(PROCESSOR, "1.0.0")))
    .with_exporter(ExporterSpec::new(
        "exp",
        ServiceRef::new(EXPORTER, "1.0.0"),
        EntityRef::new("dst", "1.0.0", "file", format!("/data/out/{flow_id}.jsonl")),
    ))
    .connect("imp", "p1")
    .connect("p1", "exp")
}

pub(crate) fn orchestrator_with(
    sink: Arc<MemoryEventSink>,
    config: OrchestratorConfig,
) -> FlowOrchestrator {
    FlowOrchestrator::builder()
        .with_config(config)
        .with_catalog(catalog())
        .with_event_sink(sink)
        .build()
        .expect("orchestrator builds")
}

pub(crate) async fn wait_for_terminal(
    orchestrator: &FlowOrchestrator,
    execution_id: floworch::address::ExecutionId,
) -> ExecutionStatusView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(view) = orchestrator.execution_status(execution_id) {
            if view.status.is_terminal() {
                return view;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("execution {execution_id} did not reach a terminal status in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) fn assert_conflict(err: &Error) {
    assert!(matches!(err, Error::AddressConflict { .. }), "got {err:?}");
    assert_eq!(err.code().to_string(), "RESOURCE_ERROR.CONFLICT");
}
