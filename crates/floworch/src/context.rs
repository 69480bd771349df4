// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Runtime state of an execution: the [`ExecutionContext`] and its
//! [`BranchContext`]s.
//!
//! These types are the snapshot payload - everything the Recovery Manager
//! persists and replays lives here, so all of it is serde-serializable and
//! free of handles, channels, or other live resources. References between
//! contexts are plain ids resolved through maps, never pointers, so the
//! ownership tree stays flat: the execution owns its branches, the
//! branches name their steps.

use crate::active_address::AddressKey;
use crate::address::{BranchPath, ExecutionId, MemoryAddress, StepId, StepType};
use crate::definition::ServiceRef;
use crate::error::ErrorRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle of a whole execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Context built, nothing dispatched yet.
    Planned,
    /// Import command in flight.
    Importing,
    /// Branch processors running.
    Processing,
    /// At least one gather buffer waiting on its trigger.
    Merging,
    /// Export command(s) in flight.
    Exporting,
    /// Terminal: every exporter completed.
    Completed,
    /// Terminal: the execution was abandoned.
    Failed,
    /// Being restored after an orchestrator restart.
    Recovering,
}

impl ExecutionStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Lifecycle of one branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchStatus {
    /// Materialized, no step ready yet.
    New,
    /// First step ready to dispatch.
    Ready,
    /// At least one step dispatched.
    InProgress,
    /// All own steps done; waiting for a sibling at a merge point.
    BlockedOnMerge,
    /// Every step completed.
    Completed,
    /// Abandoned.
    Failed,
}

impl BranchStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Lifecycle of one step within an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Dependencies outstanding.
    Waiting,
    /// Dependencies satisfied, not yet dispatched.
    Ready,
    /// Command published, awaiting its result.
    InFlight,
    /// Deadline elapsed without a result.
    TimedOut,
    /// Failed or timed out, backoff timer running before re-dispatch.
    Retrying,
    /// Terminal result applied.
    Completed,
    /// Retry budget exhausted or fatal error.
    Failed,
}

impl StepStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Mutable per-step bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRuntime {
    /// Node name in the definition.
    pub node: String,
    /// Derived step id.
    pub step_id: StepId,
    /// Step kind.
    pub step_type: StepType,
    /// Current status.
    pub status: StepStatus,
    /// Dispatch attempts so far.
    pub attempts: u32,
    /// Dependencies not yet satisfied.
    pub remaining_deps: usize,
    /// Correlation id of the in-flight command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Where the step's output was written once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_address: Option<MemoryAddress>,
    /// Completion time, for merge tie-breaking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
}

/// Per-branch runtime state within one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchContext {
    /// Full branch path.
    pub branch_path: BranchPath,
    /// Current status.
    pub status: BranchStatus,
    /// Node names of the branch's steps, in position order.
    pub steps: Vec<String>,
    /// Branches this one converges with at a shared exporter.
    pub joins: Vec<BranchPath>,
    /// When the branch finished, terminal statuses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Merge priority rank, when the converging exporter configured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// Failures observed on this branch, oldest first.
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    /// Memory addresses owned by this branch's steps.
    #[serde(default)]
    pub memory_addresses: Vec<MemoryAddress>,
    /// Service versions the branch is pinned to.
    #[serde(default)]
    pub pinned_services: Vec<ServiceRef>,
}

/// What fired the execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    /// Scheduler-assigned trigger id.
    pub trigger_id: String,
    /// What fired it (cron, manual, upstream event...).
    pub source: String,
    /// When it fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
    /// Free-form payload handed to the importer. Stored as JSON text so
    /// the context stays representable in non-self-describing formats
    /// (bincode snapshots cannot drive `deserialize_any`).
    #[serde(with = "json_value_text")]
    pub payload: Value,
}

impl Default for TriggerMetadata {
    fn default() -> Self {
        Self {
            trigger_id: String::new(),
            source: String::new(),
            fired_at: None,
            payload: Value::Null,
        }
    }
}

/// Serde adapter carrying a [`Value`] as its JSON text form.
mod json_value_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// All mutable state of one flow run. Built by the planner, mutated only
/// by the execution's scheduler loop, persisted by the recovery manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Execution id (ULID, time-sortable).
    pub execution_id: ExecutionId,
    /// Flow being executed.
    pub flow_id: String,
    /// Pinned definition version.
    pub flow_version: String,
    /// When planning finished.
    pub started_at: DateTime<Utc>,
    /// When a terminal status was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Execution-level correlation id stamped on every event.
    pub correlation_id: Uuid,
    /// What fired the execution.
    pub trigger: TriggerMetadata,
    /// Branch contexts, all materialized at plan time.
    pub branches: BTreeMap<BranchPath, BranchContext>,
    /// Per-step runtime, keyed by node name.
    pub steps: BTreeMap<String, StepRuntime>,
    /// Output address allocated for each node.
    pub allocations: BTreeMap<String, MemoryAddress>,
    /// Input address allocated for each convergent exporter; merged
    /// payloads are written here before the export command goes out.
    #[serde(default)]
    pub merge_inputs: BTreeMap<String, MemoryAddress>,
    /// Active-address reservations the execution holds.
    #[serde(default)]
    pub reserved_addresses: Vec<AddressKey>,
    /// Terminal error when the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl ExecutionContext {
    /// Runtime of a node, if it exists.
    pub fn step(&self, node: &str) -> Option<&StepRuntime> {
        self.steps.get(node)
    }

    /// Mutable runtime of a node.
    pub fn step_mut(&mut self, node: &str) -> Option<&mut StepRuntime> {
        self.steps.get_mut(node)
    }

    /// Branch context of a path.
    pub fn branch(&self, path: &BranchPath) -> Option<&BranchContext> {
        self.branches.get(path)
    }

    /// Mutable branch context of a path.
    pub fn branch_mut(&mut self, path: &BranchPath) -> Option<&mut BranchContext> {
        self.branches.get_mut(path)
    }

    /// Find the node owning a correlation id, if any step is in flight
    /// under it.
    pub fn node_by_correlation(&self, correlation_id: Uuid) -> Option<&str> {
        self.steps
            .values()
            .find(|s| s.correlation_id == Some(correlation_id))
            .map(|s| s.node.as_str())
    }

    /// Whether every exporter step has completed.
    pub fn all_exports_completed(&self) -> bool {
        self.steps
            .values()
            .filter(|s| s.step_type == StepType::Export)
            .all(|s| s.status == StepStatus::Completed)
    }

    /// The public status view of this context.
    pub fn view(&self) -> ExecutionStatusView {
        ExecutionStatusView {
            execution_id: self.execution_id,
            flow_id: self.flow_id.clone(),
            flow_version: self.flow_version.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            branches: self
                .branches
                .iter()
                .map(|(path, b)| (path.as_str().to_string(), b.status))
                .collect(),
            error: self.error.clone(),
        }
    }
}

/// Externally visible execution status, returned by the admission API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatusView {
    /// Execution id.
    pub execution_id: ExecutionId,
    /// Flow being executed.
    pub flow_id: String,
    /// Pinned definition version.
    pub flow_version: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When planning finished.
    pub started_at: DateTime<Utc>,
    /// When a terminal status was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-branch status flags; partial success shows here.
    pub branches: BTreeMap<String, BranchStatus>,
    /// Terminal error when the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}
