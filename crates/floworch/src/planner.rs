// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The Execution Planner.
//!
//! Takes a validated definition plus a trigger and produces a fully
//! materialized [`ExecutionContext`]: every branch context up front, every
//! output address allocated, the active-address reservations taken, and
//! the whole thing persisted through the Recovery Manager before anything
//! is dispatched.
//!
//! Determinism: branch traversal and address allocation follow the
//! topology's lexicographic ordering, so planning the same definition
//! twice (e.g. during recovery) produces byte-identical addresses.

use crate::active_address::{ActiveAddressRegistry, AddressKey};
use crate::address::{ExecutionId, MemoryAddress};
use crate::context::{
    BranchContext, BranchStatus, ExecutionContext, ExecutionStatus, StepRuntime, StepStatus,
    TriggerMetadata,
};
use crate::definition::{FlowDefinition, MergeStrategy, NodeKind};
use crate::error::Result;
use crate::recovery::{ExecutionJournal, RecoveryManager};
use crate::topology::FlowTopology;
use crate::versioning::VersionCatalog;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use ulid::Ulid;
use uuid::Uuid;

/// A planned execution, ready to hand to a scheduler.
#[derive(Debug)]
pub struct PlannedExecution {
    /// The fully materialized context.
    pub context: ExecutionContext,
    /// Derived topology, shared with the scheduler.
    pub topology: FlowTopology,
    /// Journal with the `Planned` record already durable.
    pub journal: ExecutionJournal,
}

/// Builds execution contexts from validated definitions.
pub struct ExecutionPlanner {
    catalog: Arc<dyn VersionCatalog>,
    registry: Arc<ActiveAddressRegistry>,
    recovery: Arc<RecoveryManager>,
}

impl ExecutionPlanner {
    /// A planner over the catalog, registry, and recovery manager.
    pub fn new(
        catalog: Arc<dyn VersionCatalog>,
        registry: Arc<ActiveAddressRegistry>,
        recovery: Arc<RecoveryManager>,
    ) -> Self {
        Self {
            catalog,
            registry,
            recovery,
        }
    }

    /// Plan one execution. Reserves the flow's source and destination
    /// addresses atomically - a conflict fails the plan before anything
    /// else happens - and persists the context before returning.
    pub async fn plan(
        &self,
        definition: &FlowDefinition,
        topology: FlowTopology,
        trigger: TriggerMetadata,
    ) -> Result<PlannedExecution> {
        let execution_id: ExecutionId = Ulid::new();

        // Atomic reservation first: on conflict nothing has been created.
        let keys: Vec<AddressKey> = definition.external_entities().map(AddressKey::of).collect();
        self.registry
            .reserve_all(&keys, execution_id, &definition.flow_id)?;

        match self
            .build_and_persist(definition, &topology, trigger, execution_id, keys)
            .await
        {
            Ok(planned) => Ok(planned),
            Err(e) => {
                // Roll the reservations back; the plan never existed.
                self.registry.release_execution(execution_id);
                Err(e)
            }
        }
    }

    async fn build_and_persist(
        &self,
        definition: &FlowDefinition,
        topology: &FlowTopology,
        trigger: TriggerMetadata,
        execution_id: ExecutionId,
        keys: Vec<AddressKey>,
    ) -> Result<PlannedExecution> {
        let mut allocations: BTreeMap<String, MemoryAddress> = BTreeMap::new();
        let mut merge_inputs: BTreeMap<String, MemoryAddress> = BTreeMap::new();
        let mut steps: BTreeMap<String, StepRuntime> = BTreeMap::new();

        for info in topology.steps() {
            let service = definition.service_of(&info.node).ok_or_else(|| {
                crate::error::Error::FlowNotFound {
                    flow_id: definition.flow_id.clone(),
                }
            })?;
            let data_type = self
                .catalog
                .output_schema(service)?
                .map(|s| s.name)
                .unwrap_or_else(|| "Data".to_string());
            allocations.insert(
                info.node.clone(),
                MemoryAddress::output_of(execution_id, &info.step_id, info.step_type, data_type),
            );

            // Convergent exporters also get an input address the merged
            // payload lands under.
            if definition.node_kind(&info.node) == Some(NodeKind::Exporter)
                && info.dependency_count > 1
            {
                let input_type = self
                    .catalog
                    .input_schema(service)?
                    .map(|s| s.name)
                    .unwrap_or_else(|| "MergedData".to_string());
                merge_inputs.insert(
                    info.node.clone(),
                    MemoryAddress::output_of(
                        execution_id,
                        &info.step_id,
                        info.step_type,
                        input_type,
                    )
                    .component("merged"),
                );
            }

            steps.insert(
                info.node.clone(),
                StepRuntime {
                    node: info.node.clone(),
                    step_id: info.step_id.clone(),
                    step_type: info.step_type,
                    status: if info.dependency_count == 0 {
                        StepStatus::Ready
                    } else {
                        StepStatus::Waiting
                    },
                    attempts: 0,
                    remaining_deps: info.dependency_count,
                    correlation_id: None,
                    output_address: None,
                    completed_at: None,
                    last_error: None,
                },
            );
        }

        let mut branches: BTreeMap<_, BranchContext> = BTreeMap::new();
        for branch in topology.branches() {
            let mut pinned = Vec::new();
            for node in &branch.steps {
                if let Some(service) = definition.service_of(node) {
                    if !pinned.contains(service) {
                        pinned.push(service.clone());
                    }
                }
            }
            let priority = priority_of(definition, branch.path.name());
            branches.insert(
                branch.path.clone(),
                BranchContext {
                    branch_path: branch.path.clone(),
                    status: BranchStatus::New,
                    steps: branch.steps.clone(),
                    joins: branch.joins.iter().cloned().collect(),
                    completed_at: None,
                    priority,
                    error_history: Vec::new(),
                    memory_addresses: Vec::new(),
                    pinned_services: pinned,
                },
            );
        }

        let context = ExecutionContext {
            execution_id,
            flow_id: definition.flow_id.clone(),
            flow_version: definition.version.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: ExecutionStatus::Planned,
            correlation_id: Uuid::new_v4(),
            trigger,
            branches,
            steps,
            allocations,
            merge_inputs,
            reserved_addresses: keys,
            error: None,
        };

        let journal = self.recovery.init_execution(definition, &context).await?;
        tracing::info!(
            execution_id = %execution_id,
            flow_id = %definition.flow_id,
            steps = context.steps.len(),
            branches = context.branches.len(),
            "execution planned"
        );

        Ok(PlannedExecution {
            context,
            topology: topology.clone(),
            journal,
        })
    }
}

/// Rank of a branch in the first priority-based merge that names it.
fn priority_of(definition: &FlowDefinition, branch_name: &str) -> Option<u32> {
    for exporter in &definition.exporters {
        if let MergeStrategy::PriorityBased { order } = &exporter.merge.strategy {
            if let Some(rank) = order.iter().position(|n| n == branch_name) {
                return Some(rank as u32);
            }
        }
    }
    None
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EntityRef, ExporterSpec, ImporterSpec, ProcessorSpec, ServiceRef};
    use crate::error::Error;
    use crate::schema::DataSchema;
    use crate::topology;
    use crate::versioning::{ServiceRegistration, StaticVersionCatalog};

    fn catalog() -> Arc<StaticVersionCatalog> {
        let catalog = StaticVersionCatalog::new();
        catalog.register(
            ServiceRegistration::new(ServiceRef::new("rest-importer", "1.0.0"))
                .output_schema(DataSchema::new("RawData", 1, vec![])),
        );
        catalog.register(
            ServiceRegistration::new(ServiceRef::new("json-proc", "1.0.0"))
                .output_schema(DataSchema::new("TransformedData", 1, vec![])),
        );
        catalog.register(ServiceRegistration::new(ServiceRef::new("file-exporter", "1.0.0")));
        Arc::new(catalog)
    }

    fn linear_flow() -> FlowDefinition {
        FlowDefinition::new(
            "FLOW-L",
            "1.0.0",
            ImporterSpec::new(
                "imp",
                ServiceRef::new("rest-importer", "1.0.0"),
                EntityRef::new("src", "1.0.0", "rest", "https://api.example.com/data"),
            ),
        )
        .with_processor(ProcessorSpec::new("p1", ServiceRef::new("json-proc", "1.0.0")))
        .with_exporter(ExporterSpec::new(
            "exp",
            ServiceRef::new("file-exporter", "1.0.0"),
            EntityRef::new("dst", "1.0.0", "file", "/data/out/l.jsonl"),
        ))
        .connect("imp", "p1")
        .connect("p1", "exp")
    }

    fn planner(dir: &std::path::Path) -> (ExecutionPlanner, Arc<ActiveAddressRegistry>) {
        let registry = Arc::new(ActiveAddressRegistry::new());
        let recovery = Arc::new(RecoveryManager::new(dir, 8));
        (
            ExecutionPlanner::new(catalog(), Arc::clone(&registry), recovery),
            registry,
        )
    }

    #[tokio::test]
    async fn test_plan_allocates_schema_derived_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, registry) = planner(dir.path());
        let flow = linear_flow();
        let topo = topology::derive(&flow).unwrap();

        let planned = planner
            .plan(&flow, topo, TriggerMetadata::default())
            .await
            .unwrap();
        let eid = planned.context.execution_id;

        let imp_addr = planned.context.allocations["imp"].to_string();
        assert_eq!(imp_addr, format!("{eid}:FLOW-L:IMPORT:main:1:RawData"));
        let p1_addr = planned.context.allocations["p1"].to_string();
        assert_eq!(p1_addr, format!("{eid}:FLOW-L:PROCESS:main:2:TransformedData"));

        // Importer ready, everything else waiting on dependencies.
        assert_eq!(planned.context.step("imp").unwrap().status, StepStatus::Ready);
        assert_eq!(planned.context.step("p1").unwrap().status, StepStatus::Waiting);
        assert_eq!(planned.context.step("exp").unwrap().remaining_deps, 1);

        // Source and destination reserved.
        assert_eq!(registry.held_by(eid), 2);
        // Linear exporter needs no merge input.
        assert!(planned.context.merge_inputs.is_empty());
    }

    #[tokio::test]
    async fn test_plan_conflict_reserves_nothing_and_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, registry) = planner(dir.path());
        let flow = linear_flow();

        let first = planner
            .plan(&flow, topology::derive(&flow).unwrap(), TriggerMetadata::default())
            .await
            .unwrap();

        let err = planner
            .plan(&flow, topology::derive(&flow).unwrap(), TriggerMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressConflict { .. }));

        // Only the first execution holds reservations or durable state.
        assert_eq!(registry.held_by(first.context.execution_id), 2);
        let recovery = RecoveryManager::new(dir.path(), 8);
        assert_eq!(
            recovery.list_executions().unwrap(),
            vec![first.context.execution_id]
        );
    }

    #[tokio::test]
    async fn test_branch_priorities_follow_merge_order() {
        let dir = tempfile::tempdir().unwrap();
        let (planner, _registry) = planner(dir.path());
        let flow = FlowDefinition::new(
            "FLOW-P",
            "1.0.0",
            ImporterSpec::new(
                "imp",
                ServiceRef::new("rest-importer", "1.0.0"),
                EntityRef::new("src", "1.0.0", "rest", "https://api.example.com/p"),
            ),
        )
        .with_processor(
            ProcessorSpec::new("a1", ServiceRef::new("json-proc", "1.0.0")).in_branch("branchA"),
        )
        .with_processor(
            ProcessorSpec::new("b1", ServiceRef::new("json-proc", "1.0.0")).in_branch("branchB"),
        )
        .with_exporter(
            ExporterSpec::new(
                "exp",
                ServiceRef::new("file-exporter", "1.0.0"),
                EntityRef::new("dst", "1.0.0", "file", "/data/out/p.jsonl"),
            )
            .with_merge(crate::definition::MergeSpec {
                trigger: crate::definition::MergeTrigger::All,
                strategy: MergeStrategy::PriorityBased {
                    order: vec!["branchA".into(), "branchB".into()],
                },
            }),
        )
        .connect("imp", "a1")
        .connect("imp", "b1")
        .connect("a1", "exp")
        .connect("b1", "exp");

        let topo = topology::derive(&flow).unwrap();
        let planned = planner
            .plan(&flow, topo, TriggerMetadata::default())
            .await
            .unwrap();

        let branch_a = crate::address::BranchPath::parse("main.branchA").unwrap();
        let branch_b = crate::address::BranchPath::parse("main.branchB").unwrap();
        assert_eq!(planned.context.branch(&branch_a).unwrap().priority, Some(0));
        assert_eq!(planned.context.branch(&branch_b).unwrap().priority, Some(1));

        // Convergent exporter got a merged-input allocation.
        let merged = planned.context.merge_inputs["exp"].to_string();
        assert!(merged.ends_with(":merged"));

        // Branch contexts pin their services.
        assert_eq!(
            planned.context.branch(&branch_a).unwrap().pinned_services,
            vec![ServiceRef::new("json-proc", "1.0.0")]
        );
    }
}
