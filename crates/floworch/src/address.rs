// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Hierarchical identifiers: branch paths, step ids, and memory addresses.
//!
//! All three have exact wire forms that replays must reproduce
//! byte-for-byte, so formatting and parsing live together here and are
//! round-trip tested:
//!
//! - branch path: dot-joined branch names rooted at `main`, e.g.
//!   `main.branchA`
//! - step id: `{flowId}:{branchPath}:{position}`
//! - memory address:
//!   `{executionId}:{flowId}:{stepType}:{branchPath}:{position}:{dataType}[:{component}]`

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of one flow run. 26-char Crockford base32, time-sortable.
pub type ExecutionId = Ulid;

/// Which kind of step produced (or will consume) a memory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// The flow's single importer.
    Import,
    /// A processor inside a branch chain.
    Process,
    /// An exporter terminating one or more branches.
    Export,
}

impl StepType {
    /// Wire segment for this step type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "IMPORT",
            Self::Process => "PROCESS",
            Self::Export => "EXPORT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "IMPORT" => Self::Import,
            "PROCESS" => Self::Process,
            "EXPORT" => Self::Export,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hierarchical branch name within a flow.
///
/// The root chain is always `main`; each divergence nests one more
/// dot-separated segment, e.g. `main.branchA.retry`. Segments never contain
/// `.` or `:` (enforced at construction).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchPath(String);

impl BranchPath {
    /// The root path every flow starts in.
    pub fn root() -> Self {
        Self("main".to_string())
    }

    /// Parse a dot-joined path, rejecting empty or malformed segments.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::MalformedStepId {
                step_id: s.to_string(),
                reason: "empty branch path".to_string(),
            });
        }
        for segment in s.split('.') {
            if segment.is_empty() || segment.contains(':') {
                return Err(Error::MalformedStepId {
                    step_id: s.to_string(),
                    reason: format!("bad branch segment '{segment}'"),
                });
            }
        }
        Ok(Self(s.to_string()))
    }

    /// Nest a new branch under this one.
    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}.{}", self.0, name))
    }

    /// The last (own) segment of the path.
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// The enclosing path, if this is not the root.
    pub fn parent(&self) -> Option<Self> {
        self.0.rsplit_once('.').map(|(head, _)| Self(head.to_string()))
    }

    /// Whether `self` encloses `other` (proper ancestor).
    pub fn is_ancestor_of(&self, other: &BranchPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'.'
    }

    /// The full dot-joined path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BranchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of one processing node within a flow.
///
/// Assigned deterministically at definition time and never mutated; the
/// position is 1-based within the node's branch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId {
    /// Owning flow.
    pub flow_id: String,
    /// Branch the step belongs to.
    pub branch_path: BranchPath,
    /// 1-based position within the branch.
    pub position: u32,
}

impl StepId {
    /// Build a step id from its parts.
    pub fn new(flow_id: impl Into<String>, branch_path: BranchPath, position: u32) -> Self {
        Self {
            flow_id: flow_id.into(),
            branch_path,
            position,
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.flow_id, self.branch_path, self.position)
    }
}

impl std::str::FromStr for StepId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = |reason: &str| Error::MalformedStepId {
            step_id: s.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = s.split(':');
        let (Some(flow_id), Some(branch), Some(position), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("expected {flowId}:{branchPath}:{position}"));
        };
        if flow_id.is_empty() {
            return Err(malformed("empty flow id"));
        }
        let branch_path = BranchPath::parse(branch)?;
        let position: u32 = position
            .parse()
            .map_err(|_| malformed("position is not a number"))?;
        Ok(Self::new(flow_id, branch_path, position))
    }
}

/// Globally unique key for a payload produced during an execution.
///
/// Branch isolation falls out of the key structure: the scheduler only ever
/// hands a worker addresses carrying that worker's own execution and branch
/// path, so cross-branch reads are impossible without the scheduler
/// explicitly granting them (as the merge step does).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryAddress {
    /// Execution that owns the entry.
    pub execution_id: ExecutionId,
    /// Flow the execution runs.
    pub flow_id: String,
    /// Kind of the producing step.
    pub step_type: StepType,
    /// Branch of the producing step.
    pub branch_path: BranchPath,
    /// Position of the producing step within its branch.
    pub position: u32,
    /// Schema name of the payload.
    pub data_type: String,
    /// Optional sub-component discriminator (e.g. `merged`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl MemoryAddress {
    /// Address of a step's primary output.
    pub fn output_of(
        execution_id: ExecutionId,
        step_id: &StepId,
        step_type: StepType,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            flow_id: step_id.flow_id.clone(),
            step_type,
            branch_path: step_id.branch_path.clone(),
            position: step_id.position,
            data_type: data_type.into(),
            component: None,
        }
    }

    /// Derive the address of a named sub-component of the same step output.
    pub fn component(&self, component: impl Into<String>) -> Self {
        Self {
            component: Some(component.into()),
            ..self.clone()
        }
    }

    /// Step id of the producing step.
    pub fn step_id(&self) -> StepId {
        StepId::new(self.flow_id.clone(), self.branch_path.clone(), self.position)
    }
}

impl std::fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.execution_id,
            self.flow_id,
            self.step_type,
            self.branch_path,
            self.position,
            self.data_type
        )?;
        if let Some(component) = &self.component {
            write!(f, ":{component}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for MemoryAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedAddress {
            address: s.to_string(),
            reason,
        };
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 && parts.len() != 7 {
            return Err(malformed(format!(
                "expected 6 or 7 ':'-separated segments, got {}",
                parts.len()
            )));
        }
        if parts[0].len() != 26 {
            return Err(malformed("execution id is not a 26-char ULID".to_string()));
        }
        let execution_id: Ulid = parts[0]
            .parse()
            .map_err(|_| malformed("execution id is not a valid ULID".to_string()))?;
        let step_type = StepType::parse(parts[2])
            .ok_or_else(|| malformed(format!("unknown step type '{}'", parts[2])))?;
        let branch_path = BranchPath::parse(parts[3])
            .map_err(|_| malformed(format!("bad branch path '{}'", parts[3])))?;
        let position: u32 = parts[4]
            .parse()
            .map_err(|_| malformed("position is not a number".to_string()))?;
        if parts[1].is_empty() || parts[5].is_empty() {
            return Err(malformed("empty flow id or data type".to_string()));
        }
        Ok(Self {
            execution_id,
            flow_id: parts[1].to_string(),
            step_type,
            branch_path,
            position,
            data_type: parts[5].to_string(),
            component: parts.get(6).map(|c| c.to_string()),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_path_nesting() {
        let root = BranchPath::root();
        assert_eq!(root.as_str(), "main");
        assert_eq!(root.name(), "main");
        assert!(root.parent().is_none());

        let sub = root.child("branchA");
        assert_eq!(sub.as_str(), "main.branchA");
        assert_eq!(sub.name(), "branchA");
        assert_eq!(sub.parent().unwrap(), root);

        assert!(root.is_ancestor_of(&sub));
        assert!(!sub.is_ancestor_of(&root));
        assert!(!root.is_ancestor_of(&root));

        // "main.br" is not an ancestor of "main.branchA" despite the prefix.
        let br = root.child("br");
        assert!(!br.is_ancestor_of(&sub));
    }

    #[test]
    fn test_branch_path_rejects_malformed() {
        assert!(BranchPath::parse("").is_err());
        assert!(BranchPath::parse("main..sub").is_err());
        assert!(BranchPath::parse("main.a:b").is_err());
        assert!(BranchPath::parse("main.subA").is_ok());
    }

    #[test]
    fn test_step_id_wire_round_trip() {
        let id = StepId::new("FLOW-001", BranchPath::root().child("subA"), 2);
        assert_eq!(id.to_string(), "FLOW-001:main.subA:2");
        let parsed: StepId = "FLOW-001:main.subA:2".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_step_id_rejects_malformed() {
        assert!("FLOW-001:main".parse::<StepId>().is_err());
        assert!("FLOW-001:main:x".parse::<StepId>().is_err());
        assert!(":main:1".parse::<StepId>().is_err());
        assert!("FLOW-001:main:1:extra".parse::<StepId>().is_err());
    }

    #[test]
    fn test_memory_address_wire_round_trip() {
        let eid = Ulid::new();
        let step = StepId::new("FLOW-L", BranchPath::root(), 1);
        let addr = MemoryAddress::output_of(eid, &step, StepType::Import, "RawData");

        let wire = addr.to_string();
        assert_eq!(wire, format!("{eid}:FLOW-L:IMPORT:main:1:RawData"));
        let parsed: MemoryAddress = wire.parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_memory_address_with_component() {
        let eid = Ulid::new();
        let step = StepId::new("FLOW-M", BranchPath::root(), 2);
        let addr =
            MemoryAddress::output_of(eid, &step, StepType::Export, "OrderRecord").component("merged");

        let wire = addr.to_string();
        assert!(wire.ends_with(":OrderRecord:merged"));
        let parsed: MemoryAddress = wire.parse().unwrap();
        assert_eq!(parsed.component.as_deref(), Some("merged"));
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_memory_address_rejects_malformed() {
        assert!("short:FLOW:IMPORT:main:1:Raw".parse::<MemoryAddress>().is_err());
        let eid = Ulid::new();
        assert!(format!("{eid}:FLOW:IMPORTED:main:1:Raw")
            .parse::<MemoryAddress>()
            .is_err());
        assert!(format!("{eid}:FLOW:IMPORT:main:one:Raw")
            .parse::<MemoryAddress>()
            .is_err());
        assert!(format!("{eid}:FLOW:IMPORT:main:1")
            .parse::<MemoryAddress>()
            .is_err());
    }

    #[test]
    fn test_execution_ids_are_time_sortable() {
        let a = Ulid::new();
        let b = Ulid::new();
        assert!(a <= b);
        assert_eq!(a.to_string().len(), 26);
    }
}
