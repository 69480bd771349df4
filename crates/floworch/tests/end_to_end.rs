// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! End-to-end flows through the full orchestrator: linear execution,
//! priority and field-level merges, and admission rejections.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use floworch::definition::{ConflictRule, FieldMapping};
use floworch::events::EventType;
use floworch::prelude::*;
use floworch_testing::{MockOutcome, MockWorker};
use serde_json::json;
use std::sync::Arc;

fn linear_catalog() -> Arc<StaticVersionCatalog> {
    let catalog = StaticVersionCatalog::new();
    catalog.register(
        ServiceRegistration::new(ServiceRef::new("rest-importer", "1.0.0"))
            .output_schema(DataSchema::new("RawData", 1, vec![])),
    );
    catalog.register(
        ServiceRegistration::new(ServiceRef::new("json-proc", "1.0.0"))
            .output_schema(DataSchema::new("TransformedData", 1, vec![])),
    );
    catalog.register(
        ServiceRegistration::new(ServiceRef::new("file-exporter", "1.0.0"))
            .merge_capabilities(MergeCapabilities::everything()),
    );
    Arc::new(catalog)
}

fn linear_flow() -> FlowDefinition {
    FlowDefinition::new(
        "FLOW-L",
        "1.0.0",
        ImporterSpec::new(
            "imp",
            ServiceRef::new("rest-importer", "1.0.0"),
            EntityRef::new("orders", "1.0.0", "rest", "https://api.example.com/orders"),
        ),
    )
    .with_processor(ProcessorSpec::new("p1", ServiceRef::new("json-proc", "1.0.0")))
    .with_exporter(ExporterSpec::new(
        "exp",
        ServiceRef::new("file-exporter", "1.0.0"),
        EntityRef::new("archive", "1.0.0", "file", "/data/out/orders.jsonl"),
    ))
    .connect("imp", "p1")
    .connect("p1", "exp")
}

#[tokio::test]
async fn test_linear_flow_runs_to_completion_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator(dir.path(), linear_catalog(), Arc::clone(&sink));

    let workers = [
        Arc::new(
            MockWorker::new(ServiceRef::new("rest-importer", "1.0.0"))
                .with_json_payload(json!({"rows": [1, 2, 3]})),
        ),
        Arc::new(MockWorker::new(ServiceRef::new("json-proc", "1.0.0"))),
        Arc::new(MockWorker::new(ServiceRef::new("file-exporter", "1.0.0"))),
    ];
    spawn_workers(&orchestrator, &workers);

    let report = orchestrator.submit_flow(linear_flow()).unwrap();
    assert!(report.is_valid(), "issues: {:?}", report.issues);

    let execution_id = orchestrator
        .trigger_execution("FLOW-L", TriggerMetadata::default())
        .await
        .unwrap();
    let view = wait_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Completed);
    assert_eq!(view.branches["main"], BranchStatus::Completed);

    let events = sink.events();
    assert_eq!(events.first().unwrap().event_type, EventType::Started);
    assert_eq!(events.last().unwrap().event_type, EventType::Completed);
    assert_eq!(
        completed_step_ids(&events),
        vec!["FLOW-L:main:1", "FLOW-L:main:2", "FLOW-L:main:3"]
    );

    // Memory addresses embed the execution id, step placement, and the
    // schema-derived data type.
    let imp_event = events
        .iter()
        .find(|e| e.data["step_id"] == "FLOW-L:main:1")
        .unwrap();
    assert_eq!(
        imp_event.data["address"],
        format!("{execution_id}:FLOW-L:IMPORT:main:1:RawData")
    );
    let p1_event = events
        .iter()
        .find(|e| e.data["step_id"] == "FLOW-L:main:2")
        .unwrap();
    assert_eq!(
        p1_event.data["address"],
        format!("{execution_id}:FLOW-L:PROCESS:main:2:TransformedData")
    );
}

fn merge_catalog() -> Arc<StaticVersionCatalog> {
    let catalog = StaticVersionCatalog::new();
    catalog.register(
        ServiceRegistration::new(ServiceRef::new("rest-importer", "1.0.0"))
            .output_schema(DataSchema::new("RawData", 1, vec![])),
    );
    for id in ["proc-a", "proc-b", "proc-c"] {
        catalog.register(
            ServiceRegistration::new(ServiceRef::new(id, "1.0.0"))
                .output_schema(DataSchema::new("TransformedData", 1, vec![])),
        );
    }
    catalog.register(
        ServiceRegistration::new(ServiceRef::new("merge-exporter", "1.0.0"))
            .merge_capabilities(MergeCapabilities::everything())
            .input_schema(DataSchema::new(
                "MergedRecord",
                1,
                vec![
                    FieldSpec::required("customer", FieldType::Object),
                    FieldSpec::required("order", FieldType::Object),
                    FieldSpec::required("shipping", FieldType::String),
                ],
            )),
    );
    Arc::new(catalog)
}

fn priority_flow() -> FlowDefinition {
    FlowDefinition::new(
        "FLOW-P",
        "1.0.0",
        ImporterSpec::new(
            "imp",
            ServiceRef::new("rest-importer", "1.0.0"),
            EntityRef::new("feed", "1.0.0", "rest", "https://api.example.com/feed"),
        ),
    )
    .with_processor(ProcessorSpec::new("a1", ServiceRef::new("proc-a", "1.0.0")).in_branch("branchA"))
    .with_processor(ProcessorSpec::new("b1", ServiceRef::new("proc-b", "1.0.0")).in_branch("branchB"))
    .with_exporter(
        ExporterSpec::new(
            "exp",
            ServiceRef::new("merge-exporter", "1.0.0"),
            EntityRef::new("sink", "1.0.0", "file", "/data/out/p.jsonl"),
        )
        .with_merge(MergeSpec {
            trigger: MergeTrigger::All,
            strategy: MergeStrategy::PriorityBased {
                order: vec!["branchA".into(), "branchB".into()],
            },
        }),
    )
    .connect("imp", "a1")
    .connect("imp", "b1")
    .connect("a1", "exp")
    .connect("b1", "exp")
}

#[tokio::test]
async fn test_priority_merge_prefers_the_configured_branch() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator(dir.path(), merge_catalog(), Arc::clone(&sink));

    let exporter = Arc::new(MockWorker::new(ServiceRef::new("merge-exporter", "1.0.0")));
    let workers = [
        Arc::new(MockWorker::new(ServiceRef::new("rest-importer", "1.0.0"))),
        Arc::new(
            MockWorker::new(ServiceRef::new("proc-a", "1.0.0"))
                .with_json_payload(json!({"from": "a1"})),
        ),
        Arc::new(
            MockWorker::new(ServiceRef::new("proc-b", "1.0.0"))
                .with_json_payload(json!({"from": "b1"})),
        ),
        Arc::clone(&exporter),
    ];
    spawn_workers(&orchestrator, &workers);

    assert!(orchestrator.submit_flow(priority_flow()).unwrap().is_valid());
    let execution_id = orchestrator
        .trigger_execution("FLOW-P", TriggerMetadata::default())
        .await
        .unwrap();
    let view = wait_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Completed);

    let events = sink.events();
    let merge = first_event(&events, EventType::MergeFired).unwrap();
    assert_eq!(merge.data["selected_branch"], "branchA");
    assert_eq!(merge.data["reason"], "priority");

    // The exporter consumed branchA's payload.
    let inputs = exporter.export_inputs();
    assert_eq!(inputs.len(), 1);
    let input: serde_json::Value = serde_json::from_slice(&inputs[0]).unwrap();
    assert_eq!(input, json!({"from": "a1"}));
}

#[tokio::test]
async fn test_priority_merge_falls_back_when_the_winner_fails() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator(dir.path(), merge_catalog(), Arc::clone(&sink));

    let exporter = Arc::new(MockWorker::new(ServiceRef::new("merge-exporter", "1.0.0")));
    let workers = [
        Arc::new(MockWorker::new(ServiceRef::new("rest-importer", "1.0.0"))),
        // branchA fails permanently.
        Arc::new(
            MockWorker::new(ServiceRef::new("proc-a", "1.0.0"))
                .default_outcome(MockOutcome::Fail(ErrorCode::transformation_failed())),
        ),
        Arc::new(
            MockWorker::new(ServiceRef::new("proc-b", "1.0.0"))
                .with_json_payload(json!({"from": "b1"})),
        ),
        Arc::clone(&exporter),
    ];
    spawn_workers(&orchestrator, &workers);

    orchestrator.submit_flow(priority_flow()).unwrap();
    let execution_id = orchestrator
        .trigger_execution("FLOW-P", TriggerMetadata::default())
        .await
        .unwrap();
    let view = wait_terminal(&orchestrator, execution_id).await;

    // Partial success: the execution completes, the failed branch shows.
    assert_eq!(view.status, ExecutionStatus::Completed);
    assert_eq!(view.branches["main.branchA"], BranchStatus::Failed);
    assert_eq!(view.branches["main.branchB"], BranchStatus::Completed);

    let events = sink.events();
    let merge = first_event(&events, EventType::MergeFired).unwrap();
    assert_eq!(merge.data["selected_branch"], "branchB");

    let inputs = exporter.export_inputs();
    let input: serde_json::Value = serde_json::from_slice(&inputs[0]).unwrap();
    assert_eq!(input, json!({"from": "b1"}));
}

#[tokio::test]
async fn test_field_level_merge_assembles_the_exporter_input() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());
    let orchestrator = orchestrator(dir.path(), merge_catalog(), Arc::clone(&sink));

    let exporter = Arc::new(MockWorker::new(ServiceRef::new("merge-exporter", "1.0.0")));
    let workers = [
        Arc::new(MockWorker::new(ServiceRef::new("rest-importer", "1.0.0"))),
        Arc::new(
            MockWorker::new(ServiceRef::new("proc-a", "1.0.0"))
                .with_json_payload(json!({"customerInfo": {"id": "C-7", "name": "Ada"}})),
        ),
        Arc::new(
            MockWorker::new(ServiceRef::new("proc-b", "1.0.0"))
                .with_json_payload(json!({"orderData": {"total": 99}})),
        ),
        Arc::new(
            MockWorker::new(ServiceRef::new("proc-c", "1.0.0"))
                .with_json_payload(json!({"shippingDetails": "express"})),
        ),
        Arc::clone(&exporter),
    ];
    spawn_workers(&orchestrator, &workers);

    let flow = FlowDefinition::new(
        "FLOW-F",
        "1.0.0",
        ImporterSpec::new(
            "imp",
            ServiceRef::new("rest-importer", "1.0.0"),
            EntityRef::new("feed", "1.0.0", "rest", "https://api.example.com/f"),
        ),
    )
    .with_processor(ProcessorSpec::new("a1", ServiceRef::new("proc-a", "1.0.0")).in_branch("branchA"))
    .with_processor(ProcessorSpec::new("b1", ServiceRef::new("proc-b", "1.0.0")).in_branch("branchB"))
    .with_processor(ProcessorSpec::new("c1", ServiceRef::new("proc-c", "1.0.0")).in_branch("branchC"))
    .with_exporter(
        ExporterSpec::new(
            "exp",
            ServiceRef::new("merge-exporter", "1.0.0"),
            EntityRef::new("sink", "1.0.0", "file", "/data/out/f.jsonl"),
        )
        .with_merge(MergeSpec {
            trigger: MergeTrigger::All,
            strategy: MergeStrategy::FieldLevel {
                mappings: vec![
                    FieldMapping {
                        target_field: "customer".into(),
                        source_branch: "branchA".into(),
                        source_field: Some("customerInfo".into()),
                    },
                    FieldMapping {
                        target_field: "order".into(),
                        source_branch: "branchB".into(),
                        source_field: Some("orderData".into()),
                    },
                    FieldMapping {
                        target_field: "shipping".into(),
                        source_branch: "branchC".into(),
                        source_field: Some("shippingDetails".into()),
                    },
                ],
                conflict: Some(ConflictRule::PriorityBased {
                    order: vec!["branchA".into(), "branchB".into(), "branchC".into()],
                }),
            },
        }),
    )
    .connect("imp", "a1")
    .connect("imp", "b1")
    .connect("imp", "c1")
    .connect("a1", "exp")
    .connect("b1", "exp")
    .connect("c1", "exp");

    let report = orchestrator.submit_flow(flow).unwrap();
    assert!(report.is_valid(), "issues: {:?}", report.issues);

    let execution_id = orchestrator
        .trigger_execution("FLOW-F", TriggerMetadata::default())
        .await
        .unwrap();
    let view = wait_terminal(&orchestrator, execution_id).await;
    assert_eq!(view.status, ExecutionStatus::Completed);

    let inputs = exporter.export_inputs();
    assert_eq!(inputs.len(), 1);
    let merged: serde_json::Value = serde_json::from_slice(&inputs[0]).unwrap();
    assert_eq!(merged["customer"], json!({"id": "C-7", "name": "Ada"}));
    assert_eq!(merged["order"], json!({"total": 99}));
    assert_eq!(merged["shipping"], "express");

    let events = sink.events();
    let merge = first_event(&events, EventType::MergeFired).unwrap();
    assert_eq!(merge.data["sources"]["customer"], "branchA");
    assert_eq!(merge.data["sources"]["shipping"], "branchC");
}

#[tokio::test]
async fn test_version_incompatibility_is_rejected_at_admission() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemoryEventSink::new());

    let catalog = StaticVersionCatalog::new();
    catalog.register(ServiceRegistration::new(ServiceRef::new("rest-importer", "3.0.0")));
    catalog.register(ServiceRegistration::new(ServiceRef::new("json-proc", "1.0.0")));
    catalog.register(ServiceRegistration::new(ServiceRef::new("file-exporter", "1.0.0")));
    // The matrix disallows the importer v3 feeding processor v1.
    catalog.forbid(
        ServiceRef::new("rest-importer", "3.0.0"),
        ServiceRef::new("json-proc", "1.0.0"),
    );
    let orchestrator = orchestrator(dir.path(), Arc::new(catalog), sink);

    let flow = FlowDefinition::new(
        "FLOW-V",
        "1.0.0",
        ImporterSpec::new(
            "imp",
            ServiceRef::new("rest-importer", "3.0.0"),
            EntityRef::new("src", "1.0.0", "rest", "https://api.example.com/v"),
        ),
    )
    .with_processor(ProcessorSpec::new("p1", ServiceRef::new("json-proc", "1.0.0")))
    .with_exporter(ExporterSpec::new(
        "exp",
        ServiceRef::new("file-exporter", "1.0.0"),
        EntityRef::new("dst", "1.0.0", "file", "/data/out/v.jsonl"),
    ))
    .connect("imp", "p1")
    .connect("p1", "exp");

    let report = orchestrator.submit_flow(flow).unwrap();
    assert!(!report.is_valid());
    // The offending edge is named under the version_compatibility rule.
    let issue = report
        .errors()
        .find(|i| i.rule.id() == "version_compatibility")
        .unwrap();
    assert_eq!(issue.subject, "imp->p1");

    // Nothing was persisted: triggering the flow finds no definition.
    let err = orchestrator
        .trigger_execution("FLOW-V", TriggerMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FlowNotFound { .. }));
}
