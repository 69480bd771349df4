// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Flow-graph analysis: structure checks and deterministic branch
//! derivation.
//!
//! Derivation is the one algorithm replays depend on byte-for-byte:
//! re-deriving the same definition must always produce the identical
//! stepId and branchPath assignment, because memory addresses embed both.
//! Determinism comes from two rules - children are visited in lexicographic
//! node-name order, and exporters are assigned in a post-pass sorted by
//! name.
//!
//! Branch assignment:
//! - the importer opens the root branch `main` at position 1
//! - a node with a single successor passes its branch straight through
//! - at a divergence (out-degree > 1, the importer included) every
//!   processor child opens a nested branch, named by the child's declared
//!   branch name or a generated `b{i}` fallback
//! - exporters always join the deepest common ancestor branch of their
//!   producers, taking the next position in it

use crate::address::{BranchPath, StepId, StepType};
use crate::definition::{FlowDefinition, NodeKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Why branch derivation failed. Structure errors (cycles, unknown node
/// names) are reported by [`structure`] first; these are the residual
/// failures derivation itself can hit.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TopologyError {
    /// Two sibling processors declared the same branch name at one
    /// divergence point.
    #[error("duplicate branch name '{branch}' under divergence at '{node}'")]
    DuplicateBranchName {
        /// The divergence node.
        node: String,
        /// The contested branch name.
        branch: String,
    },

    /// A processor was reached through two different paths (in-degree > 1
    /// inside a chain).
    #[error("processor '{node}' is fed by more than one edge")]
    MultipleInputs {
        /// The multiply-fed processor.
        node: String,
    },

    /// An edge references a node that does not exist.
    #[error("edge endpoint '{node}' is not a node of the flow")]
    UnknownNode {
        /// The unknown endpoint.
        node: String,
    },

    /// The graph contains a cycle, so derivation cannot terminate.
    #[error("flow graph contains a cycle")]
    Cycle,
}

/// Structural facts about a flow graph, computed before derivation.
#[derive(Debug, Clone, Default)]
pub struct StructureReport {
    /// Edge endpoints that name no node.
    pub unknown_endpoints: Vec<String>,
    /// Whether the graph has a directed cycle.
    pub has_cycle: bool,
    /// Nodes not reachable from the importer.
    pub unreachable: Vec<String>,
    /// Non-exporter nodes with no outgoing edge.
    pub non_exporter_sinks: Vec<String>,
    /// Processors with more than one incoming edge.
    pub multi_input_processors: Vec<String>,
    /// Exporters with at least one outgoing edge.
    pub exporters_with_successors: Vec<String>,
    /// Nodes with an edge into the importer.
    pub importer_predecessors: Vec<String>,
}

impl StructureReport {
    /// Whether every structural invariant holds.
    pub fn is_clean(&self) -> bool {
        self.unknown_endpoints.is_empty()
            && !self.has_cycle
            && self.unreachable.is_empty()
            && self.non_exporter_sinks.is_empty()
            && self.multi_input_processors.is_empty()
            && self.exporters_with_successors.is_empty()
            && self.importer_predecessors.is_empty()
    }
}

/// Analyze the structural invariants of a definition's graph.
pub fn structure(definition: &FlowDefinition) -> StructureReport {
    let mut report = StructureReport::default();

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for name in definition.node_names() {
        index.insert(name, graph.add_node(name));
    }

    for edge in &definition.connections {
        let from = index.get(edge.from.as_str());
        let to = index.get(edge.to.as_str());
        match (from, to) {
            (Some(&from), Some(&to)) => {
                graph.add_edge(from, to, ());
            }
            _ => {
                if from.is_none() {
                    report.unknown_endpoints.push(edge.from.clone());
                }
                if to.is_none() {
                    report.unknown_endpoints.push(edge.to.clone());
                }
            }
        }
    }

    report.has_cycle = petgraph::algo::is_cyclic_directed(&graph);

    let importer = definition.importer.name.as_str();
    if let Some(&start) = index.get(importer) {
        let mut reached = vec![false; graph.node_count()];
        let mut dfs = Dfs::new(&graph, start);
        while let Some(nx) = dfs.next(&graph) {
            reached[nx.index()] = true;
        }
        for (name, &nx) in &index {
            if !reached[nx.index()] {
                report.unreachable.push((*name).to_string());
            }
        }
    }

    for (name, &nx) in &index {
        let kind = definition.node_kind(name);
        let out_degree = graph.neighbors_directed(nx, petgraph::Outgoing).count();
        let in_degree = graph.neighbors_directed(nx, petgraph::Incoming).count();

        match kind {
            Some(NodeKind::Exporter) => {
                if out_degree > 0 {
                    report.exporters_with_successors.push((*name).to_string());
                }
            }
            Some(NodeKind::Processor) => {
                if out_degree == 0 {
                    report.non_exporter_sinks.push((*name).to_string());
                }
                if in_degree > 1 {
                    report.multi_input_processors.push((*name).to_string());
                }
            }
            Some(NodeKind::Importer) => {
                if out_degree == 0 {
                    report.non_exporter_sinks.push((*name).to_string());
                }
                if in_degree > 0 {
                    for pred in graph.neighbors_directed(nx, petgraph::Incoming) {
                        report.importer_predecessors.push(graph[pred].to_string());
                    }
                }
            }
            None => {}
        }
    }

    // Deterministic output regardless of map iteration order.
    report.unknown_endpoints.sort();
    report.unknown_endpoints.dedup();
    report.unreachable.sort();
    report.non_exporter_sinks.sort();
    report.multi_input_processors.sort();
    report.exporters_with_successors.sort();
    report.importer_predecessors.sort();
    report
}

/// One node's derived placement in the flow.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo {
    /// Node name from the definition.
    pub node: String,
    /// Derived step id.
    pub step_id: StepId,
    /// Step kind.
    pub step_type: StepType,
    /// Number of incoming edges (dependencies to satisfy before dispatch).
    pub dependency_count: usize,
}

/// One derived branch.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchInfo {
    /// Full branch path.
    pub path: BranchPath,
    /// Node names in position order.
    pub steps: Vec<String>,
    /// Other branches this one converges with at a shared exporter.
    pub joins: BTreeSet<BranchPath>,
}

/// The fully derived topology of a flow: step placements, branch
/// membership, and adjacency.
#[derive(Debug, Clone)]
pub struct FlowTopology {
    steps: BTreeMap<String, StepInfo>,
    branches: BTreeMap<BranchPath, BranchInfo>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
}

impl FlowTopology {
    /// Placement of a named node.
    pub fn step(&self, node: &str) -> Option<&StepInfo> {
        self.steps.get(node)
    }

    /// All placements, ordered by node name.
    pub fn steps(&self) -> impl Iterator<Item = &StepInfo> {
        self.steps.values()
    }

    /// All derived branches, ordered by path.
    pub fn branches(&self) -> impl Iterator<Item = &BranchInfo> {
        self.branches.values()
    }

    /// A branch by its full path.
    pub fn branch(&self, path: &BranchPath) -> Option<&BranchInfo> {
        self.branches.get(path)
    }

    /// Resolve a branch by its short name, unique across the flow.
    pub fn branch_by_name(&self, name: &str) -> Option<&BranchInfo> {
        let mut matches = self
            .branches
            .values()
            .filter(|b| b.path.name() == name || b.path.as_str() == name);
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Downstream consumers of a node, lexicographically ordered.
    pub fn successors(&self, node: &str) -> &[String] {
        self.successors.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Upstream producers of a node, lexicographically ordered.
    pub fn predecessors(&self, node: &str) -> &[String] {
        self.predecessors.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of placed steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Find a placed step by its derived id.
    pub fn step_by_id(&self, step_id: &StepId) -> Option<&StepInfo> {
        self.steps.values().find(|s| &s.step_id == step_id)
    }
}

/// Deepest common ancestor of a set of branch paths.
fn common_ancestor(paths: &[BranchPath]) -> BranchPath {
    let Some(first) = paths.first() else {
        return BranchPath::root();
    };
    let mut prefix: Vec<&str> = first.as_str().split('.').collect();
    for path in &paths[1..] {
        let segments: Vec<&str> = path.as_str().split('.').collect();
        let shared = prefix
            .iter()
            .zip(segments.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
    }
    if prefix.is_empty() {
        return BranchPath::root();
    }
    // Segments came from already-validated paths.
    BranchPath::parse(&prefix.join(".")).unwrap_or_else(|_| BranchPath::root())
}

/// Derive branch paths, step ids, and adjacency for a definition.
///
/// Assumes [`structure`] reported clean; returns the first derivation
/// error otherwise.
pub fn derive(definition: &FlowDefinition) -> Result<FlowTopology, TopologyError> {
    // Adjacency with deterministic (lexicographic) successor order.
    let mut successors: HashMap<String, Vec<String>> = HashMap::new();
    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &definition.connections {
        for endpoint in [&edge.from, &edge.to] {
            if definition.node_kind(endpoint).is_none() {
                return Err(TopologyError::UnknownNode {
                    node: endpoint.clone(),
                });
            }
        }
        successors
            .entry(edge.from.clone())
            .or_default()
            .push(edge.to.clone());
        predecessors
            .entry(edge.to.clone())
            .or_default()
            .push(edge.from.clone());
    }
    for list in successors.values_mut().chain(predecessors.values_mut()) {
        list.sort();
        list.dedup();
    }

    let flow_id = &definition.flow_id;
    let mut steps: BTreeMap<String, StepInfo> = BTreeMap::new();
    let mut positions: HashMap<BranchPath, u32> = HashMap::new();

    let mut place = |steps: &mut BTreeMap<String, StepInfo>,
                     positions: &mut HashMap<BranchPath, u32>,
                     node: &str,
                     step_type: StepType,
                     branch: &BranchPath| {
        let position = positions
            .entry(branch.clone())
            .and_modify(|p| *p += 1)
            .or_insert(1);
        let step_id = StepId::new(flow_id.clone(), branch.clone(), *position);
        steps.insert(
            node.to_string(),
            StepInfo {
                node: node.to_string(),
                step_id,
                step_type,
                dependency_count: predecessors.get(node).map(Vec::len).unwrap_or(0),
            },
        );
    };

    // Iterative DFS over processor chains; exporters are placed afterwards.
    let importer = definition.importer.name.clone();
    place(
        &mut steps,
        &mut positions,
        &importer,
        StepType::Import,
        &BranchPath::root(),
    );

    let mut stack: Vec<(String, BranchPath)> = vec![(importer.clone(), BranchPath::root())];
    let mut guard = 0usize;
    let budget = definition.node_count() * definition.node_count() + 16;
    while let Some((node, branch)) = stack.pop() {
        guard += 1;
        if guard > budget {
            return Err(TopologyError::Cycle);
        }

        let children = successors.get(&node).map(Vec::as_slice).unwrap_or(&[]);
        let processor_children: Vec<&String> = children
            .iter()
            .filter(|c| matches!(definition.node_kind(c), Some(NodeKind::Processor)))
            .collect();
        let diverging = children.len() > 1;

        let mut seen_names: BTreeSet<String> = BTreeSet::new();
        for (i, child) in processor_children.iter().enumerate() {
            if steps.contains_key(child.as_str()) {
                return Err(TopologyError::MultipleInputs {
                    node: (*child).clone(),
                });
            }
            let child_branch = if diverging {
                let declared = definition
                    .processor(child)
                    .and_then(|p| p.branch.clone())
                    .unwrap_or_else(|| format!("b{}", i + 1));
                if !seen_names.insert(declared.clone()) {
                    return Err(TopologyError::DuplicateBranchName {
                        node: node.clone(),
                        branch: declared,
                    });
                }
                branch.child(&declared)
            } else {
                branch.clone()
            };
            place(
                &mut steps,
                &mut positions,
                child,
                StepType::Process,
                &child_branch,
            );
            // Reverse push keeps lexicographic visit order on the stack.
            stack.push(((*child).clone(), child_branch));
        }
    }

    // Exporters join the deepest common ancestor of their producers,
    // assigned in name order for determinism.
    let mut exporter_names: Vec<&str> = definition.exporters.iter().map(|e| e.name.as_str()).collect();
    exporter_names.sort_unstable();
    for name in exporter_names {
        let producer_branches: Vec<BranchPath> = predecessors
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter_map(|p| steps.get(p.as_str()))
            .map(|info| info.step_id.branch_path.clone())
            .collect();
        let branch = common_ancestor(&producer_branches);
        place(&mut steps, &mut positions, name, StepType::Export, &branch);
    }

    // Branch membership, ordered by position within each branch.
    let mut branches: BTreeMap<BranchPath, BranchInfo> = BTreeMap::new();
    let mut members: Vec<(&BranchPath, u32, &str)> = steps
        .values()
        .map(|s| (&s.step_id.branch_path, s.step_id.position, s.node.as_str()))
        .collect();
    members.sort();
    for (path, _, node) in members {
        branches
            .entry(path.clone())
            .or_insert_with(|| BranchInfo {
                path: path.clone(),
                steps: Vec::new(),
                joins: BTreeSet::new(),
            })
            .steps
            .push(node.to_string());
    }

    // Branches sharing a convergent exporter join each other.
    for exporter in &definition.exporters {
        let producer_branches: BTreeSet<BranchPath> = predecessors
            .get(exporter.name.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter_map(|p| steps.get(p.as_str()))
            .map(|info| info.step_id.branch_path.clone())
            .collect();
        if producer_branches.len() > 1 {
            for path in &producer_branches {
                if let Some(info) = branches.get_mut(path) {
                    info.joins
                        .extend(producer_branches.iter().filter(|p| *p != path).cloned());
                }
            }
        }
    }

    Ok(FlowTopology {
        steps,
        branches,
        successors,
        predecessors,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EntityRef, ExporterSpec, ImporterSpec, ProcessorSpec, ServiceRef};

    fn importer() -> ImporterSpec {
        ImporterSpec::new(
            "imp",
            ServiceRef::new("rest-importer", "1.0.0"),
            EntityRef::new("src", "1.0.0", "rest", "https://api.example.com/data"),
        )
    }

    fn exporter(name: &str) -> ExporterSpec {
        ExporterSpec::new(
            name,
            ServiceRef::new("file-exporter", "1.0.0"),
            EntityRef::new("dst", "1.0.0", "file", format!("/data/out/{name}.jsonl")),
        )
    }

    fn processor(name: &str) -> ProcessorSpec {
        ProcessorSpec::new(name, ServiceRef::new("json-proc", "1.0.0"))
    }

    fn linear_flow() -> FlowDefinition {
        FlowDefinition::new("FLOW-L", "1.0.0", importer())
            .with_processor(processor("p1"))
            .with_exporter(exporter("exp"))
            .connect("imp", "p1")
            .connect("p1", "exp")
    }

    fn parallel_flow() -> FlowDefinition {
        FlowDefinition::new("FLOW-P", "1.0.0", importer())
            .with_processor(processor("a1").in_branch("branchA"))
            .with_processor(processor("a2"))
            .with_processor(processor("b1").in_branch("branchB"))
            .with_processor(processor("b2"))
            .with_exporter(exporter("exp"))
            .connect("imp", "a1")
            .connect("a1", "a2")
            .connect("imp", "b1")
            .connect("b1", "b2")
            .connect("a2", "exp")
            .connect("b2", "exp")
    }

    #[test]
    fn test_linear_flow_stays_in_main() {
        let topo = derive(&linear_flow()).unwrap();
        assert_eq!(topo.step("imp").unwrap().step_id.to_string(), "FLOW-L:main:1");
        assert_eq!(topo.step("p1").unwrap().step_id.to_string(), "FLOW-L:main:2");
        assert_eq!(topo.step("exp").unwrap().step_id.to_string(), "FLOW-L:main:3");
        assert_eq!(topo.branches().count(), 1);
        assert_eq!(topo.step("exp").unwrap().dependency_count, 1);
    }

    #[test]
    fn test_parallel_flow_opens_named_branches() {
        let topo = derive(&parallel_flow()).unwrap();
        assert_eq!(
            topo.step("a1").unwrap().step_id.to_string(),
            "FLOW-P:main.branchA:1"
        );
        assert_eq!(
            topo.step("a2").unwrap().step_id.to_string(),
            "FLOW-P:main.branchA:2"
        );
        assert_eq!(
            topo.step("b1").unwrap().step_id.to_string(),
            "FLOW-P:main.branchB:1"
        );
        // Convergent exporter joins the common ancestor branch.
        assert_eq!(topo.step("exp").unwrap().step_id.to_string(), "FLOW-P:main:2");
        assert_eq!(topo.step("exp").unwrap().dependency_count, 2);

        let branch_a = topo.branch_by_name("branchA").unwrap();
        assert_eq!(branch_a.steps, vec!["a1", "a2"]);
        assert!(branch_a.joins.contains(&BranchPath::parse("main.branchB").unwrap()));
    }

    #[test]
    fn test_generated_branch_names_are_deterministic() {
        let flow = FlowDefinition::new("FLOW-G", "1.0.0", importer())
            .with_processor(processor("x"))
            .with_processor(processor("y"))
            .with_exporter(exporter("exp"))
            .connect("imp", "x")
            .connect("imp", "y")
            .connect("x", "exp")
            .connect("y", "exp");
        let topo = derive(&flow).unwrap();
        // Children visited lexicographically: x gets b1, y gets b2.
        assert_eq!(topo.step("x").unwrap().step_id.branch_path.as_str(), "main.b1");
        assert_eq!(topo.step("y").unwrap().step_id.branch_path.as_str(), "main.b2");
    }

    #[test]
    fn test_rederivation_is_identical() {
        let flow = parallel_flow();
        let first = derive(&flow).unwrap();
        let second = derive(&flow).unwrap();
        for step in first.steps() {
            assert_eq!(
                second.step(&step.node).unwrap().step_id,
                step.step_id,
                "step id drifted for {}",
                step.node
            );
        }
    }

    #[test]
    fn test_nested_divergence() {
        let flow = FlowDefinition::new("FLOW-N", "1.0.0", importer())
            .with_processor(processor("a1").in_branch("branchA"))
            .with_processor(processor("x1").in_branch("subA"))
            .with_processor(processor("x2").in_branch("subB"))
            .with_exporter(exporter("exp"))
            .connect("imp", "a1")
            .connect("a1", "x1")
            .connect("a1", "x2")
            .connect("x1", "exp")
            .connect("x2", "exp");
        let topo = derive(&flow).unwrap();
        // Importer has out-degree 1, so a1 inherits main.
        assert_eq!(topo.step("a1").unwrap().step_id.branch_path.as_str(), "main");
        assert_eq!(
            topo.step("x1").unwrap().step_id.to_string(),
            "FLOW-N:main.subA:1"
        );
        assert_eq!(
            topo.step("x2").unwrap().step_id.to_string(),
            "FLOW-N:main.subB:1"
        );
        // Exporter converges back to main.
        assert_eq!(topo.step("exp").unwrap().step_id.branch_path.as_str(), "main");
    }

    #[test]
    fn test_duplicate_branch_names_rejected() {
        let flow = FlowDefinition::new("FLOW-D", "1.0.0", importer())
            .with_processor(processor("x").in_branch("same"))
            .with_processor(processor("y").in_branch("same"))
            .with_exporter(exporter("exp"))
            .connect("imp", "x")
            .connect("imp", "y")
            .connect("x", "exp")
            .connect("y", "exp");
        assert!(matches!(
            derive(&flow),
            Err(TopologyError::DuplicateBranchName { .. })
        ));
    }

    #[test]
    fn test_structure_flags_problems() {
        // p2 unreachable, p3 a dead-end sink.
        let flow = FlowDefinition::new("FLOW-S", "1.0.0", importer())
            .with_processor(processor("p1"))
            .with_processor(processor("p2"))
            .with_processor(processor("p3"))
            .with_exporter(exporter("exp"))
            .connect("imp", "p1")
            .connect("p1", "exp")
            .connect("p1", "p3")
            .connect("p2", "exp");
        let report = structure(&flow);
        assert!(!report.is_clean());
        assert_eq!(report.unreachable, vec!["p2"]);
        assert_eq!(report.non_exporter_sinks, vec!["p3"]);
        assert!(!report.has_cycle);
    }

    #[test]
    fn test_structure_detects_cycle_and_multi_input() {
        let flow = FlowDefinition::new("FLOW-C", "1.0.0", importer())
            .with_processor(processor("p1"))
            .with_processor(processor("p2"))
            .with_exporter(exporter("exp"))
            .connect("imp", "p1")
            .connect("p1", "p2")
            .connect("p2", "p1")
            .connect("p2", "exp");
        let report = structure(&flow);
        assert!(report.has_cycle);
        assert_eq!(report.multi_input_processors, vec!["p1"]);
    }

    #[test]
    fn test_structure_flags_unknown_edge_endpoints() {
        let flow = FlowDefinition::new("FLOW-U", "1.0.0", importer())
            .with_exporter(exporter("exp"))
            .connect("imp", "ghost")
            .connect("imp", "exp");
        let report = structure(&flow);
        assert_eq!(report.unknown_endpoints, vec!["ghost"]);
    }
}
