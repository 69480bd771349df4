// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Flow definitions: the immutable, versioned description of a pipeline.
//!
//! A definition names exactly one importer, any number of processors and
//! exporters, and the directed edges among them. Everything here is plain
//! data - validation lives in [`crate::validator`], branch derivation in
//! [`crate::topology`].
//!
//! # Example
//!
//! ```rust,ignore
//! use floworch::definition::{FlowDefinition, ImporterSpec, ProcessorSpec, ExporterSpec};
//!
//! let flow = FlowDefinition::new("FLOW-L", "1.0.0", importer)
//!     .with_processor(ProcessorSpec::new("p1", json_service.clone()))
//!     .with_exporter(ExporterSpec::new("exp", file_service.clone(), destination))
//!     .connect("imp", "p1")
//!     .connect("p1", "exp");
//! ```

use crate::error::{Error, Result};
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Reference to a worker service at a pinned version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Service id in the version catalog.
    pub service_id: String,
    /// Pinned version.
    pub version: Version,
}

impl ServiceRef {
    /// Build a reference from an id and a semver string.
    ///
    /// # Panics
    ///
    /// Panics if `version` is not valid semver; intended for literals.
    // ALLOW: literal-only constructor, fallible callers use the struct directly
    #[allow(clippy::expect_used)]
    pub fn new(service_id: impl Into<String>, version: &str) -> Self {
        Self {
            service_id: service_id.into(),
            version: Version::parse(version).expect("ServiceRef::new requires valid semver"),
        }
    }
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.service_id, self.version)
    }
}

/// Reference to an external source or destination entity.
///
/// The `(protocol, address, version)` triple is the reservation key the
/// Active Address Registry enforces uniqueness over.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity id in the catalog.
    pub entity_id: String,
    /// Pinned entity version.
    pub version: Version,
    /// Protocol handler, e.g. `file`, `rest`, `jdbc`.
    pub protocol: String,
    /// Protocol-specific address (URL, path, DSN).
    pub address: String,
}

impl EntityRef {
    /// Build a reference from literals.
    ///
    /// # Panics
    ///
    /// Panics if `version` is not valid semver; intended for literals.
    // ALLOW: literal-only constructor, fallible callers use the struct directly
    #[allow(clippy::expect_used)]
    pub fn new(
        entity_id: impl Into<String>,
        version: &str,
        protocol: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            version: Version::parse(version).expect("EntityRef::new requires valid semver"),
            protocol: protocol.into(),
            address: address.into(),
        }
    }
}

/// Per-step retry policy; unset fields fall back to the orchestrator
/// defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial dispatch (0 = never retry).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied per subsequent retry.
    pub factor: f64,
    /// Fraction of the delay randomized away (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

/// Which family of merge strategy an exporter applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategyKind {
    /// Keep the most recently completed branch's payload.
    LastWriteWins,
    /// First successful branch in configured priority order.
    PriorityBased,
    /// Assemble the output field-by-field from named branches.
    FieldLevel,
}

/// When a convergent exporter fires.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeTrigger {
    /// Wait for every producing branch to complete successfully.
    All,
    /// Fire on the first successful branch.
    Any {
        /// Cancel still-running sibling branches once fired.
        #[serde(default)]
        cancel_losers: Option<bool>,
    },
    /// Wait for a named subset of branches.
    Critical {
        /// Branch names that must complete before firing.
        branches: Vec<String>,
    },
    /// Fire at the deadline with whatever has arrived.
    Timeout {
        /// Milliseconds from execution start.
        timeout_ms: u64,
    },
}

impl Default for MergeTrigger {
    fn default() -> Self {
        Self::All
    }
}

/// One target-field assignment in a field-level merge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field of the exporter's input schema being filled.
    pub target_field: String,
    /// Branch (by name) whose payload supplies the value.
    pub source_branch: String,
    /// Field to read from the source payload; defaults to `target_field`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_field: Option<String>,
}

/// How field-level merges resolve a missing or contested source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictRule {
    /// Scan branches in the given order, first success wins.
    PriorityBased {
        /// Branch names in descending priority.
        order: Vec<String>,
    },
    /// Latest completion timestamp wins.
    LastWriteWins,
}

/// How branch outputs are combined at a convergent exporter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keep the payload of the most recently completed branch.
    LastWriteWins,
    /// First successful branch in `order` wins.
    PriorityBased {
        /// Branch names in descending priority.
        order: Vec<String>,
    },
    /// Assemble the exporter input field-by-field.
    FieldLevel {
        /// Per-field source assignments.
        mappings: Vec<FieldMapping>,
        /// Fallback when a source branch failed; priority-based over the
        /// mapping's declaration order when unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict: Option<ConflictRule>,
    },
}

impl MergeStrategy {
    /// The strategy family, for capability checks.
    pub fn kind(&self) -> MergeStrategyKind {
        match self {
            Self::LastWriteWins => MergeStrategyKind::LastWriteWins,
            Self::PriorityBased { .. } => MergeStrategyKind::PriorityBased,
            Self::FieldLevel { .. } => MergeStrategyKind::FieldLevel,
        }
    }
}

/// Full merge configuration of an exporter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    /// When the merge fires.
    #[serde(default)]
    pub trigger: MergeTrigger,
    /// How gathered payloads are combined.
    pub strategy: MergeStrategy,
}

impl MergeSpec {
    /// Single-input pass-through: fire as soon as the only branch arrives.
    pub fn passthrough() -> Self {
        Self {
            trigger: MergeTrigger::All,
            strategy: MergeStrategy::LastWriteWins,
        }
    }
}

/// The flow's single importer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImporterSpec {
    /// Node name, unique among all nodes of the flow.
    pub name: String,
    /// Importer service to dispatch to.
    pub service: ServiceRef,
    /// Source entity being read.
    pub source: EntityRef,
    /// Service-specific configuration passed through in commands.
    #[serde(default)]
    pub config: Value,
}

impl ImporterSpec {
    /// Build an importer node.
    pub fn new(name: impl Into<String>, service: ServiceRef, source: EntityRef) -> Self {
        Self {
            name: name.into(),
            service,
            source,
            config: Value::Null,
        }
    }

    /// Attach service-specific configuration.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// A processor node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    /// Node name, unique among all nodes of the flow.
    pub name: String,
    /// Declared branch name; used when this node starts a new branch at a
    /// divergence. Derivation falls back to a generated name when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Processor service to dispatch to.
    pub service: ServiceRef,
    /// Service-specific configuration passed through in commands.
    #[serde(default)]
    pub config: Value,
    /// Per-step retry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl ProcessorSpec {
    /// Build a processor node.
    pub fn new(name: impl Into<String>, service: ServiceRef) -> Self {
        Self {
            name: name.into(),
            branch: None,
            service,
            config: Value::Null,
            retry: None,
        }
    }

    /// Declare the branch name this node starts when it follows a
    /// divergence point.
    pub fn in_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Attach service-specific configuration.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Override the retry policy for this step.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// An exporter node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExporterSpec {
    /// Node name, unique among all nodes of the flow.
    pub name: String,
    /// Exporter service to dispatch to.
    pub service: ServiceRef,
    /// Destination entity being written.
    pub destination: EntityRef,
    /// Merge configuration; pass-through for single-input exporters.
    #[serde(default = "MergeSpec::passthrough")]
    pub merge: MergeSpec,
    /// Service-specific configuration passed through in commands.
    #[serde(default)]
    pub config: Value,
    /// Per-step retry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl ExporterSpec {
    /// Build an exporter node with pass-through merge.
    pub fn new(name: impl Into<String>, service: ServiceRef, destination: EntityRef) -> Self {
        Self {
            name: name.into(),
            service,
            destination,
            merge: MergeSpec::passthrough(),
            config: Value::Null,
            retry: None,
        }
    }

    /// Attach a merge configuration.
    pub fn with_merge(mut self, merge: MergeSpec) -> Self {
        self.merge = merge;
        self
    }

    /// Attach service-specific configuration.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Override the retry policy for this step.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// A directed edge between two named nodes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    /// Producing node name.
    pub from: String,
    /// Consuming node name.
    pub to: String,
}

/// Role of a node within its flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// The single importer.
    Importer,
    /// A processor.
    Processor,
    /// An exporter.
    Exporter,
}

/// An immutable, versioned flow definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Flow id, stable across versions.
    pub flow_id: String,
    /// Definition version.
    pub version: Version,
    /// The single importer.
    pub importer: ImporterSpec,
    /// Processor nodes.
    #[serde(default)]
    pub processors: Vec<ProcessorSpec>,
    /// Exporter nodes.
    pub exporters: Vec<ExporterSpec>,
    /// Directed edges among node names.
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl FlowDefinition {
    /// Start a definition from its importer.
    ///
    /// # Panics
    ///
    /// Panics if `version` is not valid semver; intended for literals.
    // ALLOW: literal-only constructor, fallible callers use the struct directly
    #[allow(clippy::expect_used)]
    pub fn new(flow_id: impl Into<String>, version: &str, importer: ImporterSpec) -> Self {
        Self {
            flow_id: flow_id.into(),
            version: Version::parse(version).expect("FlowDefinition::new requires valid semver"),
            importer,
            processors: Vec::new(),
            exporters: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Add a processor node.
    pub fn with_processor(mut self, processor: ProcessorSpec) -> Self {
        self.processors.push(processor);
        self
    }

    /// Add an exporter node.
    pub fn with_exporter(mut self, exporter: ExporterSpec) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Add a directed edge between two named nodes.
    pub fn connect(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.connections.push(Connection {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// The role of a named node, if it exists.
    pub fn node_kind(&self, name: &str) -> Option<NodeKind> {
        if self.importer.name == name {
            return Some(NodeKind::Importer);
        }
        if self.processors.iter().any(|p| p.name == name) {
            return Some(NodeKind::Processor);
        }
        if self.exporters.iter().any(|e| e.name == name) {
            return Some(NodeKind::Exporter);
        }
        None
    }

    /// Look up a processor by name.
    pub fn processor(&self, name: &str) -> Option<&ProcessorSpec> {
        self.processors.iter().find(|p| p.name == name)
    }

    /// Look up an exporter by name.
    pub fn exporter(&self, name: &str) -> Option<&ExporterSpec> {
        self.exporters.iter().find(|e| e.name == name)
    }

    /// The service reference of a named node, if it exists.
    pub fn service_of(&self, name: &str) -> Option<&ServiceRef> {
        if self.importer.name == name {
            return Some(&self.importer.service);
        }
        self.processor(name)
            .map(|p| &p.service)
            .or_else(|| self.exporter(name).map(|e| &e.service))
    }

    /// All node names: importer, processors, exporters.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.importer.name.as_str())
            .chain(self.processors.iter().map(|p| p.name.as_str()))
            .chain(self.exporters.iter().map(|e| e.name.as_str()))
    }

    /// Count of all nodes.
    pub fn node_count(&self) -> usize {
        1 + self.processors.len() + self.exporters.len()
    }

    /// The `(protocol, address, version)` triples this flow reads or
    /// writes, importer first.
    pub fn external_entities(&self) -> impl Iterator<Item = &EntityRef> {
        std::iter::once(&self.importer.source).chain(self.exporters.iter().map(|e| &e.destination))
    }
}

/// In-memory store of admitted flow definitions, versioned per flow id.
///
/// Admission persists a definition only after validation passes; the store
/// itself never rejects. Definitions are immutable once inserted - a new
/// revision is a new `(flow_id, version)` pair.
#[derive(Default)]
pub struct DefinitionStore {
    flows: RwLock<HashMap<String, BTreeMap<Version, Arc<FlowDefinition>>>>,
}

impl DefinitionStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a definition. Re-inserting the same `(flow_id, version)`
    /// replaces it (admission re-runs replace the stored copy atomically).
    pub fn insert(&self, definition: FlowDefinition) -> Arc<FlowDefinition> {
        let shared = Arc::new(definition);
        let mut flows = self.flows.write();
        flows
            .entry(shared.flow_id.clone())
            .or_default()
            .insert(shared.version.clone(), Arc::clone(&shared));
        shared
    }

    /// The newest version of a flow.
    pub fn latest(&self, flow_id: &str) -> Result<Arc<FlowDefinition>> {
        self.flows
            .read()
            .get(flow_id)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| Error::FlowNotFound {
                flow_id: flow_id.to_string(),
            })
    }

    /// A specific version of a flow.
    pub fn get(&self, flow_id: &str, version: &Version) -> Result<Arc<FlowDefinition>> {
        self.flows
            .read()
            .get(flow_id)
            .and_then(|versions| versions.get(version).cloned())
            .ok_or_else(|| Error::FlowNotFound {
                flow_id: flow_id.to_string(),
            })
    }

    /// Ids of all admitted flows.
    pub fn flow_ids(&self) -> Vec<String> {
        self.flows.read().keys().cloned().collect()
    }
}
