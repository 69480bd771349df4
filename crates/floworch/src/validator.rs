// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Flow validation at admission and execution time.
//!
//! Validation runs an ordered rule chain; later rules assume the earlier
//! ones held, so the chain stops at the first failing stage rather than
//! reporting noise derived from a broken graph:
//!
//! 1. `completeness` - referenced components exist, names are unique
//! 2. `topology` - one importer, acyclic, reachable, sinks are exporters,
//!    chains never merge
//! 3. `branch_identification` - deterministic branch/step derivation
//! 4. `version_compatibility` - every edge allowed by the version matrix
//! 5. `schema_compatibility` - producer output satisfies consumer input
//! 6. `merge_feasibility` - convergent exporters can actually merge
//!
//! Execution mode appends `version_status`: ARCHIVED versions refuse,
//! DEPRECATED versions pass with a warning surfaced in telemetry.

use crate::definition::{FlowDefinition, MergeStrategy, MergeTrigger, NodeKind, ServiceRef};
use crate::error::Severity;
use crate::schema::satisfies;
use crate::topology::{self, FlowTopology};
use crate::versioning::{VersionCatalog, VersionStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// At which boundary validation runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationMode {
    /// Before a definition is persisted.
    Admission,
    /// Just before planning an execution.
    Execution,
}

/// Identifier of the rule that produced an issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    /// Referenced components exist and required fields are present.
    Completeness,
    /// Graph-shape invariants.
    Topology,
    /// Branch/step derivation.
    BranchIdentification,
    /// Version compatibility matrix.
    VersionCompatibility,
    /// Producer/consumer schema compatibility.
    SchemaCompatibility,
    /// Merge strategy feasibility at convergent exporters.
    MergeFeasibility,
    /// Service version lifecycle status (execution mode only).
    VersionStatus,
}

impl ValidationRule {
    /// Stable rule id used in reports and telemetry.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Completeness => "completeness",
            Self::Topology => "topology",
            Self::BranchIdentification => "branch_identification",
            Self::VersionCompatibility => "version_compatibility",
            Self::SchemaCompatibility => "schema_compatibility",
            Self::MergeFeasibility => "merge_feasibility",
            Self::VersionStatus => "version_status",
        }
    }
}

/// One finding from the rule chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Rule that raised the issue.
    pub rule: ValidationRule,
    /// Blocking (`Major`) or advisory (`Warning`).
    pub severity: Severity,
    /// Node name or `from->to` edge the issue is about.
    pub subject: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    fn error(rule: ValidationRule, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity: Severity::Major,
            subject: subject.into(),
            message: message.into(),
        }
    }

    fn warning(rule: ValidationRule, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity: Severity::Warning,
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Whether this issue blocks admission/execution.
    pub fn is_blocking(&self) -> bool {
        self.severity > Severity::Warning
    }
}

/// Outcome of one validation run.
#[derive(Debug)]
pub struct ValidationReport {
    /// Flow that was validated.
    pub flow_id: String,
    /// Boundary the run was for.
    pub mode: ValidationMode,
    /// Findings, in rule order.
    pub issues: Vec<ValidationIssue>,
    topology: Option<FlowTopology>,
}

impl ValidationReport {
    /// Whether the flow passed (warnings allowed).
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(ValidationIssue::is_blocking)
    }

    /// Blocking issues only.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }

    /// Advisory issues only.
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.is_blocking())
    }

    /// Number of blocking issues.
    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    /// Number of advisory issues.
    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    /// Whether any issue came from the given rule.
    pub fn has_rule(&self, rule: ValidationRule) -> bool {
        self.issues.iter().any(|i| i.rule == rule)
    }

    /// The derived topology, present when derivation succeeded. The
    /// planner reuses it so plan-time addresses match validation exactly.
    pub fn topology(&self) -> Option<&FlowTopology> {
        self.topology.as_ref()
    }

    /// Take ownership of the derived topology.
    pub fn into_topology(self) -> Option<FlowTopology> {
        self.topology
    }
}

/// Validates flow definitions against the version catalog.
pub struct FlowValidator {
    catalog: Arc<dyn VersionCatalog>,
}

impl FlowValidator {
    /// Build a validator over a catalog.
    pub fn new(catalog: Arc<dyn VersionCatalog>) -> Self {
        Self { catalog }
    }

    /// Run the full rule chain.
    pub fn validate(&self, definition: &FlowDefinition, mode: ValidationMode) -> ValidationReport {
        let mut issues = Vec::new();

        self.check_completeness(definition, &mut issues);
        if issues.iter().any(ValidationIssue::is_blocking) {
            return self.report(definition, mode, issues, None);
        }

        self.check_topology(definition, &mut issues);
        if issues.iter().any(ValidationIssue::is_blocking) {
            return self.report(definition, mode, issues, None);
        }

        let topo = match topology::derive(definition) {
            Ok(topo) => topo,
            Err(e) => {
                issues.push(ValidationIssue::error(
                    ValidationRule::BranchIdentification,
                    definition.flow_id.clone(),
                    e.to_string(),
                ));
                return self.report(definition, mode, issues, None);
            }
        };
        self.check_step_id_uniqueness(&topo, &mut issues);
        if issues.iter().any(ValidationIssue::is_blocking) {
            return self.report(definition, mode, issues, Some(topo));
        }

        self.check_version_compatibility(definition, &mut issues);
        self.check_schema_compatibility(definition, &mut issues);
        self.check_merge_feasibility(definition, &topo, &mut issues);

        if mode == ValidationMode::Execution {
            self.check_version_status(definition, &mut issues);
        }

        self.report(definition, mode, issues, Some(topo))
    }

    fn report(
        &self,
        definition: &FlowDefinition,
        mode: ValidationMode,
        issues: Vec<ValidationIssue>,
        topology: Option<FlowTopology>,
    ) -> ValidationReport {
        let report = ValidationReport {
            flow_id: definition.flow_id.clone(),
            mode,
            issues,
            topology,
        };
        if !report.is_valid() {
            tracing::warn!(
                flow_id = %report.flow_id,
                mode = ?report.mode,
                errors = report.error_count(),
                warnings = report.warning_count(),
                "flow failed validation"
            );
        }
        report
    }

    fn check_completeness(&self, definition: &FlowDefinition, issues: &mut Vec<ValidationIssue>) {
        let rule = ValidationRule::Completeness;

        if definition.flow_id.is_empty() || definition.flow_id.contains(':') {
            issues.push(ValidationIssue::error(
                rule,
                definition.flow_id.clone(),
                "flow id must be non-empty and must not contain ':'",
            ));
        }

        let mut seen = HashSet::new();
        for name in definition.node_names() {
            if name.is_empty() || name.contains(':') || name.contains('.') {
                issues.push(ValidationIssue::error(
                    rule,
                    name,
                    "node name must be non-empty and must not contain ':' or '.'",
                ));
            }
            if !seen.insert(name) {
                issues.push(ValidationIssue::error(rule, name, "duplicate node name"));
            }
        }

        if definition.exporters.is_empty() {
            issues.push(ValidationIssue::error(
                rule,
                definition.flow_id.clone(),
                "flow declares no exporter",
            ));
        }

        for entity in definition.external_entities() {
            if entity.protocol.is_empty() || entity.address.is_empty() {
                issues.push(ValidationIssue::error(
                    rule,
                    entity.entity_id.clone(),
                    "entity requires a protocol and an address",
                ));
            }
        }

        for name in definition.node_names() {
            let Some(service) = definition.service_of(name) else {
                continue;
            };
            if let Err(e) = self.catalog.service_status(service) {
                issues.push(ValidationIssue::error(rule, name, e.to_string()));
            }
        }
    }

    fn check_topology(&self, definition: &FlowDefinition, issues: &mut Vec<ValidationIssue>) {
        let rule = ValidationRule::Topology;
        let report = topology::structure(definition);

        for node in &report.unknown_endpoints {
            issues.push(ValidationIssue::error(
                rule,
                node.clone(),
                "edge endpoint is not a node of the flow",
            ));
        }
        if report.has_cycle {
            issues.push(ValidationIssue::error(
                rule,
                definition.flow_id.clone(),
                "flow graph contains a cycle",
            ));
        }
        for node in &report.unreachable {
            issues.push(ValidationIssue::error(
                rule,
                node.clone(),
                "node is not reachable from the importer",
            ));
        }
        for node in &report.non_exporter_sinks {
            issues.push(ValidationIssue::error(
                rule,
                node.clone(),
                "every branch must terminate at an exporter",
            ));
        }
        for node in &report.multi_input_processors {
            issues.push(ValidationIssue::error(
                rule,
                node.clone(),
                "processing chains cannot merge; only exporters may have multiple inputs",
            ));
        }
        for node in &report.exporters_with_successors {
            issues.push(ValidationIssue::error(
                rule,
                node.clone(),
                "exporters are terminal and cannot feed other nodes",
            ));
        }
        for node in &report.importer_predecessors {
            issues.push(ValidationIssue::error(
                rule,
                node.clone(),
                "nothing may feed the importer",
            ));
        }
    }

    fn check_step_id_uniqueness(&self, topo: &FlowTopology, issues: &mut Vec<ValidationIssue>) {
        let mut seen = HashSet::new();
        for step in topo.steps() {
            if !seen.insert(step.step_id.to_string()) {
                issues.push(ValidationIssue::error(
                    ValidationRule::BranchIdentification,
                    step.node.clone(),
                    format!("derived step id '{}' collides", step.step_id),
                ));
            }
        }
    }

    fn check_version_compatibility(
        &self,
        definition: &FlowDefinition,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let rule = ValidationRule::VersionCompatibility;
        for edge in &definition.connections {
            let (Some(producer), Some(consumer)) = (
                definition.service_of(&edge.from),
                definition.service_of(&edge.to),
            ) else {
                continue;
            };
            match self.catalog.compatible(producer, consumer) {
                Ok(true) => {}
                Ok(false) => issues.push(ValidationIssue::error(
                    rule,
                    format!("{}->{}", edge.from, edge.to),
                    format!(
                        "version matrix forbids {} feeding {}",
                        producer, consumer
                    ),
                )),
                Err(e) => issues.push(ValidationIssue::error(
                    rule,
                    format!("{}->{}", edge.from, edge.to),
                    e.to_string(),
                )),
            }
        }
    }

    fn check_schema_compatibility(
        &self,
        definition: &FlowDefinition,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let rule = ValidationRule::SchemaCompatibility;
        for edge in &definition.connections {
            // Merge inputs are checked by merge feasibility instead; a
            // convergent exporter consumes the merged payload, not any
            // single edge's output.
            if definition.node_kind(&edge.to) == Some(NodeKind::Exporter)
                && definition
                    .connections
                    .iter()
                    .filter(|c| c.to == edge.to)
                    .count()
                    > 1
            {
                continue;
            }
            let (Some(producer), Some(consumer)) = (
                definition.service_of(&edge.from),
                definition.service_of(&edge.to),
            ) else {
                continue;
            };
            let consumer_schema = match self.catalog.input_schema(consumer) {
                Ok(Some(schema)) => schema,
                Ok(None) => continue,
                Err(e) => {
                    issues.push(ValidationIssue::error(
                        rule,
                        format!("{}->{}", edge.from, edge.to),
                        e.to_string(),
                    ));
                    continue;
                }
            };
            let producer_schema = match self.catalog.output_schema(producer) {
                Ok(Some(schema)) => schema,
                Ok(None) => {
                    issues.push(ValidationIssue::error(
                        rule,
                        format!("{}->{}", edge.from, edge.to),
                        format!(
                            "consumer expects schema '{}' but producer declares no output schema",
                            consumer_schema.name
                        ),
                    ));
                    continue;
                }
                Err(e) => {
                    issues.push(ValidationIssue::error(
                        rule,
                        format!("{}->{}", edge.from, edge.to),
                        e.to_string(),
                    ));
                    continue;
                }
            };
            for problem in satisfies(&producer_schema, &consumer_schema) {
                issues.push(ValidationIssue::error(
                    rule,
                    format!("{}->{}", edge.from, edge.to),
                    format!("field '{}': {}", problem.field, problem.reason),
                ));
            }
        }
    }

    fn check_merge_feasibility(
        &self,
        definition: &FlowDefinition,
        topo: &FlowTopology,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let rule = ValidationRule::MergeFeasibility;
        for exporter in &definition.exporters {
            let Some(step) = topo.step(&exporter.name) else {
                continue;
            };
            if step.dependency_count <= 1 {
                continue;
            }

            let caps = match self.catalog.merge_capabilities(&exporter.service) {
                Ok(caps) => caps,
                Err(e) => {
                    issues.push(ValidationIssue::error(rule, exporter.name.clone(), e.to_string()));
                    continue;
                }
            };
            let kind = exporter.merge.strategy.kind();
            if !caps.supports(kind) {
                issues.push(ValidationIssue::error(
                    rule,
                    exporter.name.clone(),
                    format!("exporter service does not support merge strategy {kind:?}"),
                ));
            }

            let producing: Vec<String> = topo
                .predecessors(&exporter.name)
                .iter()
                .filter_map(|p| topo.step(p))
                .map(|s| s.step_id.branch_path.clone())
                .flat_map(|p| [p.name().to_string(), p.as_str().to_string()])
                .collect();
            let resolves = |branch: &str| producing.iter().any(|b| b == branch);

            match &exporter.merge.strategy {
                MergeStrategy::PriorityBased { order } => {
                    for branch in order {
                        if !resolves(branch) {
                            issues.push(ValidationIssue::error(
                                rule,
                                exporter.name.clone(),
                                format!("priority order names unknown branch '{branch}'"),
                            ));
                        }
                    }
                }
                MergeStrategy::FieldLevel { mappings, .. } => {
                    for mapping in mappings {
                        if !resolves(&mapping.source_branch) {
                            issues.push(ValidationIssue::error(
                                rule,
                                exporter.name.clone(),
                                format!(
                                    "field '{}' maps from unknown branch '{}'",
                                    mapping.target_field, mapping.source_branch
                                ),
                            ));
                        }
                    }
                    if let Ok(Some(schema)) = self.catalog.input_schema(&exporter.service) {
                        for field in schema.required_fields() {
                            if !mappings.iter().any(|m| m.target_field == field.name) {
                                issues.push(ValidationIssue::error(
                                    rule,
                                    exporter.name.clone(),
                                    format!(
                                        "field-level mapping does not cover required field '{}'",
                                        field.name
                                    ),
                                ));
                            }
                        }
                    }
                }
                MergeStrategy::LastWriteWins => {}
            }

            if let MergeTrigger::Critical { branches } = &exporter.merge.trigger {
                for branch in branches {
                    if !resolves(branch) {
                        issues.push(ValidationIssue::error(
                            rule,
                            exporter.name.clone(),
                            format!("critical trigger names unknown branch '{branch}'"),
                        ));
                    }
                }
            }
        }
    }

    fn check_version_status(&self, definition: &FlowDefinition, issues: &mut Vec<ValidationIssue>) {
        let rule = ValidationRule::VersionStatus;
        let mut checked: HashSet<&ServiceRef> = HashSet::new();
        let services = definition
            .node_names()
            .filter_map(|n| definition.service_of(n))
            .collect::<Vec<_>>();
        for service in services {
            if !checked.insert(service) {
                continue;
            }
            match self.catalog.service_status(service) {
                Ok(VersionStatus::Active) => {}
                Ok(VersionStatus::Deprecated) => issues.push(ValidationIssue::warning(
                    rule,
                    service.to_string(),
                    "service version is DEPRECATED",
                )),
                Ok(VersionStatus::Archived) => issues.push(ValidationIssue::error(
                    rule,
                    service.to_string(),
                    "service version is ARCHIVED and cannot be executed",
                )),
                Err(e) => issues.push(ValidationIssue::error(rule, service.to_string(), e.to_string())),
            }
        }
    }
}
