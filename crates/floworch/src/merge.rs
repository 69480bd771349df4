// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The Merge Coordinator: gathering branch outputs at convergent
//! exporters and combining them.
//!
//! One [`GatherBuffer`] exists per exporter with in-degree > 1. The
//! scheduler records branch completions and failures into it; every
//! record returns a [`MergeDecision`] telling the scheduler whether to
//! keep waiting, fire the merge, or fail the exporter. The buffer itself
//! is pure state - it never touches the memory store or the bus, which
//! keeps every trigger/strategy combination unit-testable without a
//! runtime.
//!
//! Firing applies the configured strategy over the gathered payloads and
//! yields the exporter's input payload plus an audit summary that rides
//! along in the `MERGE_FIRED` telemetry event and the export command.

use crate::address::{BranchPath, MemoryAddress};
use crate::definition::{ConflictRule, MergeSpec, MergeStrategy, MergeTrigger};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One branch's contribution to a merge.
#[derive(Clone, Debug)]
pub struct BranchOutput {
    /// Producing branch.
    pub branch: BranchPath,
    /// Address the payload lives under.
    pub address: MemoryAddress,
    /// The payload bytes.
    pub payload: Arc<Vec<u8>>,
    /// When the producing step completed, for last-write-wins ordering.
    pub completed_at: DateTime<Utc>,
}

/// What the scheduler should do after recording into a buffer.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeDecision {
    /// Trigger condition not met yet.
    Wait,
    /// Trigger condition met; call [`GatherBuffer::fire`].
    Fire,
    /// The exporter can never fire; fail it.
    FailExporter {
        /// Why the merge is impossible.
        reason: String,
    },
    /// An arrival after the buffer already fired; drop with telemetry.
    DroppedLate {
        /// The late branch.
        branch: BranchPath,
    },
}

/// Result of firing a merge.
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    /// The exporter's input payload.
    pub payload: Vec<u8>,
    /// Audit summary: selected branch / contributors / reason.
    pub summary: Value,
    /// Expected branches that had not completed when the merge fired;
    /// candidates for loser cancellation under `ANY`.
    pub losers: Vec<BranchPath>,
}

/// Gather state for one convergent exporter.
#[derive(Debug)]
pub struct GatherBuffer {
    exporter: String,
    expected: BTreeSet<BranchPath>,
    spec: MergeSpec,
    accepts_partial: bool,
    arrived: BTreeMap<BranchPath, BranchOutput>,
    failed: BTreeSet<BranchPath>,
    fired: bool,
}

impl GatherBuffer {
    /// A buffer expecting output from the given branches.
    pub fn new(
        exporter: impl Into<String>,
        expected: BTreeSet<BranchPath>,
        spec: MergeSpec,
        accepts_partial: bool,
    ) -> Self {
        Self {
            exporter: exporter.into(),
            expected,
            spec,
            accepts_partial,
            arrived: BTreeMap::new(),
            failed: BTreeSet::new(),
            fired: false,
        }
    }

    /// Exporter node this buffer belongs to.
    pub fn exporter(&self) -> &str {
        &self.exporter
    }

    /// Whether the buffer already fired.
    pub fn fired(&self) -> bool {
        self.fired
    }

    /// Mark the buffer fired without re-merging. Used on recovery when a
    /// durable `MergeFired` record shows the merge already happened and
    /// its payload was restored.
    pub fn mark_fired(&mut self) {
        self.fired = true;
    }

    /// Whether this merge trigger carries a deadline, and its offset.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self.spec.trigger {
            MergeTrigger::Timeout { timeout_ms } => Some(timeout_ms),
            _ => None,
        }
    }

    /// Whether `ANY` losers should be cancelled, with the configured
    /// default applied.
    pub fn cancel_losers(&self, default: bool) -> bool {
        match self.spec.trigger {
            MergeTrigger::Any { cancel_losers } => cancel_losers.unwrap_or(default),
            _ => false,
        }
    }

    /// Resolve a configured branch name against the expected set.
    fn resolve(&self, name: &str) -> Option<BranchPath> {
        self.expected
            .iter()
            .find(|p| p.as_str() == name || p.name() == name)
            .cloned()
    }

    /// Record a successful branch contribution.
    pub fn record_success(&mut self, output: BranchOutput) -> MergeDecision {
        if self.fired {
            return MergeDecision::DroppedLate {
                branch: output.branch,
            };
        }
        if !self.expected.contains(&output.branch) {
            tracing::warn!(
                exporter = %self.exporter,
                branch = %output.branch,
                "contribution from unexpected branch ignored"
            );
            return MergeDecision::Wait;
        }
        self.arrived.insert(output.branch.clone(), output);
        self.evaluate()
    }

    /// Record a branch failure.
    pub fn record_failure(&mut self, branch: &BranchPath) -> MergeDecision {
        if self.fired || !self.expected.contains(branch) {
            return MergeDecision::Wait;
        }
        self.failed.insert(branch.clone());
        self.evaluate()
    }

    /// The merge deadline elapsed (only meaningful for `TIMEOUT`).
    pub fn deadline_elapsed(&mut self) -> MergeDecision {
        if self.fired {
            return MergeDecision::Wait;
        }
        if self.arrived.is_empty() {
            return MergeDecision::FailExporter {
                reason: "merge deadline elapsed with no branch output available".to_string(),
            };
        }
        MergeDecision::Fire
    }

    fn all_terminal(&self) -> bool {
        self.expected
            .iter()
            .all(|b| self.arrived.contains_key(b) || self.failed.contains(b))
    }

    fn evaluate(&self) -> MergeDecision {
        let all_failed = self.failed.len() == self.expected.len();
        if all_failed {
            return MergeDecision::FailExporter {
                reason: "every producing branch failed".to_string(),
            };
        }
        match &self.spec.trigger {
            MergeTrigger::All => {
                if self.arrived.len() == self.expected.len() {
                    return MergeDecision::Fire;
                }
                if !self.failed.is_empty() {
                    if !self.accepts_partial {
                        return MergeDecision::FailExporter {
                            reason: format!(
                                "branch '{}' failed and the exporter does not accept partial input",
                                self.failed.iter().next().map(|b| b.as_str()).unwrap_or("?")
                            ),
                        };
                    }
                    if self.all_terminal() {
                        return MergeDecision::Fire;
                    }
                }
                MergeDecision::Wait
            }
            MergeTrigger::Any { .. } => {
                if self.arrived.is_empty() {
                    MergeDecision::Wait
                } else {
                    MergeDecision::Fire
                }
            }
            MergeTrigger::Critical { branches } => {
                let critical: Vec<BranchPath> =
                    branches.iter().filter_map(|n| self.resolve(n)).collect();
                if critical.iter().any(|b| self.failed.contains(b)) {
                    return MergeDecision::FailExporter {
                        reason: "a critical branch failed".to_string(),
                    };
                }
                if critical.iter().all(|b| self.arrived.contains_key(b)) {
                    MergeDecision::Fire
                } else {
                    MergeDecision::Wait
                }
            }
            MergeTrigger::Timeout { .. } => {
                // Everything terminal before the deadline: no point waiting.
                if self.all_terminal() {
                    MergeDecision::Fire
                } else {
                    MergeDecision::Wait
                }
            }
        }
    }

    /// Apply the strategy and consume the trigger. Idempotent callers must
    /// check [`GatherBuffer::fired`] first.
    pub fn fire(&mut self) -> Result<MergeOutcome> {
        self.fired = true;
        let losers: Vec<BranchPath> = self
            .expected
            .iter()
            .filter(|b| !self.arrived.contains_key(*b) && !self.failed.contains(*b))
            .cloned()
            .collect();

        let (payload, summary) = match &self.spec.strategy {
            MergeStrategy::LastWriteWins => self.fire_last_write_wins()?,
            MergeStrategy::PriorityBased { order } => self.fire_priority(order)?,
            MergeStrategy::FieldLevel { mappings, conflict } => {
                self.fire_field_level(mappings, conflict.as_ref())?
            }
        };

        Ok(MergeOutcome {
            payload,
            summary,
            losers,
        })
    }

    fn fire_last_write_wins(&self) -> Result<(Vec<u8>, Value)> {
        // Latest completion wins; ties go to the lexicographically first
        // branch path.
        let selected = self
            .arrived
            .values()
            .max_by(|a, b| {
                a.completed_at
                    .cmp(&b.completed_at)
                    .then_with(|| b.branch.cmp(&a.branch))
            })
            .ok_or_else(|| Error::Merge {
                step_id: self.exporter.clone(),
                reason: "no branch output available".to_string(),
            })?;
        let summary = json!({
            "strategy": "last_write_wins",
            "selected_branch": selected.branch.name(),
            "selected_path": selected.branch.as_str(),
            "completed_at": selected.completed_at.to_rfc3339(),
        });
        Ok((selected.payload.as_ref().clone(), summary))
    }

    fn fire_priority(&self, order: &[String]) -> Result<(Vec<u8>, Value)> {
        for name in order {
            let Some(path) = self.resolve(name) else {
                continue;
            };
            if let Some(output) = self.arrived.get(&path) {
                let summary = json!({
                    "strategy": "priority_based",
                    "selected_branch": output.branch.name(),
                    "selected_path": output.branch.as_str(),
                    "reason": "priority",
                });
                return Ok((output.payload.as_ref().clone(), summary));
            }
        }
        Err(Error::Merge {
            step_id: self.exporter.clone(),
            reason: "no branch in the priority order completed successfully".to_string(),
        })
    }

    fn fire_field_level(
        &self,
        mappings: &[crate::definition::FieldMapping],
        conflict: Option<&ConflictRule>,
    ) -> Result<(Vec<u8>, Value)> {
        let mut parsed: BTreeMap<BranchPath, Value> = BTreeMap::new();
        for (branch, output) in &self.arrived {
            let value: Value =
                serde_json::from_slice(output.payload.as_ref()).map_err(|e| Error::Merge {
                    step_id: self.exporter.clone(),
                    reason: format!("branch '{branch}' payload is not JSON: {e}"),
                })?;
            parsed.insert(branch.clone(), value);
        }

        let mut target = Map::new();
        let mut provenance = Map::new();
        for mapping in mappings {
            let source_field = mapping.source_field.as_deref().unwrap_or(&mapping.target_field);
            let primary = self.resolve(&mapping.source_branch);
            let mut chosen: Option<(BranchPath, Value)> = None;

            if let Some(path) = &primary {
                if let Some(value) = parsed.get(path).and_then(|p| p.get(source_field)) {
                    chosen = Some((path.clone(), value.clone()));
                }
            }
            if chosen.is_none() {
                chosen = self.resolve_conflict(&parsed, source_field, conflict);
            }

            match chosen {
                Some((branch, value)) => {
                    provenance.insert(mapping.target_field.clone(), json!(branch.name()));
                    target.insert(mapping.target_field.clone(), value);
                }
                None => {
                    return Err(Error::Merge {
                        step_id: self.exporter.clone(),
                        reason: format!(
                            "no surviving branch supplies field '{}' (mapped from '{}')",
                            mapping.target_field, mapping.source_branch
                        ),
                    });
                }
            }
        }

        let summary = json!({
            "strategy": "field_level",
            "sources": Value::Object(provenance),
        });
        let payload = serde_json::to_vec(&Value::Object(target))?;
        Ok((payload, summary))
    }

    fn resolve_conflict(
        &self,
        parsed: &BTreeMap<BranchPath, Value>,
        source_field: &str,
        conflict: Option<&ConflictRule>,
    ) -> Option<(BranchPath, Value)> {
        match conflict {
            Some(ConflictRule::PriorityBased { order }) => order
                .iter()
                .filter_map(|n| self.resolve(n))
                .find_map(|path| {
                    parsed
                        .get(&path)
                        .and_then(|p| p.get(source_field))
                        .map(|v| (path.clone(), v.clone()))
                }),
            Some(ConflictRule::LastWriteWins) => {
                let mut candidates: Vec<&BranchOutput> = self.arrived.values().collect();
                candidates.sort_by(|a, b| {
                    b.completed_at
                        .cmp(&a.completed_at)
                        .then_with(|| a.branch.cmp(&b.branch))
                });
                candidates.into_iter().find_map(|output| {
                    parsed
                        .get(&output.branch)
                        .and_then(|p| p.get(source_field))
                        .map(|v| (output.branch.clone(), v.clone()))
                })
            }
            // Default: lexicographic order of the surviving branches.
            None => parsed.iter().find_map(|(branch, payload)| {
                payload
                    .get(source_field)
                    .map(|v| (branch.clone(), v.clone()))
            }),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{StepId, StepType};
    use crate::definition::FieldMapping;
    use ulid::Ulid;

    fn path(name: &str) -> BranchPath {
        BranchPath::root().child(name)
    }

    fn output(branch: &BranchPath, payload: &[u8], completed_at: DateTime<Utc>) -> BranchOutput {
        let step = StepId::new("FLOW-M", branch.clone(), 2);
        BranchOutput {
            branch: branch.clone(),
            address: MemoryAddress::output_of(Ulid::new(), &step, StepType::Process, "Data"),
            payload: Arc::new(payload.to_vec()),
            completed_at,
        }
    }

    fn expected(names: &[&str]) -> BTreeSet<BranchPath> {
        names.iter().map(|n| path(n)).collect()
    }

    fn spec(trigger: MergeTrigger, strategy: MergeStrategy) -> MergeSpec {
        MergeSpec { trigger, strategy }
    }

    #[test]
    fn test_all_trigger_waits_for_every_branch() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::All, MergeStrategy::LastWriteWins),
            false,
        );
        let t = Utc::now();
        assert_eq!(
            buffer.record_success(output(&path("branchA"), b"a", t)),
            MergeDecision::Wait
        );
        assert_eq!(
            buffer.record_success(output(&path("branchB"), b"b", t)),
            MergeDecision::Fire
        );
    }

    #[test]
    fn test_all_trigger_fails_without_partial_support() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::All, MergeStrategy::LastWriteWins),
            false,
        );
        let t = Utc::now();
        buffer.record_success(output(&path("branchA"), b"a", t));
        assert!(matches!(
            buffer.record_failure(&path("branchB")),
            MergeDecision::FailExporter { .. }
        ));
    }

    #[test]
    fn test_all_trigger_fires_partially_when_capable() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::All, MergeStrategy::LastWriteWins),
            true,
        );
        let t = Utc::now();
        buffer.record_success(output(&path("branchA"), b"a", t));
        assert_eq!(buffer.record_failure(&path("branchB")), MergeDecision::Fire);
        let outcome = buffer.fire().unwrap();
        assert_eq!(outcome.payload, b"a");
    }

    #[test]
    fn test_all_branches_failing_always_fails_the_exporter() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::Any { cancel_losers: None }, MergeStrategy::LastWriteWins),
            true,
        );
        assert_eq!(buffer.record_failure(&path("branchA")), MergeDecision::Wait);
        assert!(matches!(
            buffer.record_failure(&path("branchB")),
            MergeDecision::FailExporter { .. }
        ));
    }

    #[test]
    fn test_any_fires_on_first_success_and_drops_late() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::Any { cancel_losers: Some(true) }, MergeStrategy::LastWriteWins),
            false,
        );
        let t = Utc::now();
        assert_eq!(
            buffer.record_success(output(&path("branchB"), b"b", t)),
            MergeDecision::Fire
        );
        let outcome = buffer.fire().unwrap();
        assert_eq!(outcome.payload, b"b");
        assert_eq!(outcome.losers, vec![path("branchA")]);
        assert!(buffer.cancel_losers(false));

        assert_eq!(
            buffer.record_success(output(&path("branchA"), b"a", t)),
            MergeDecision::DroppedLate { branch: path("branchA") }
        );
    }

    #[test]
    fn test_critical_subset() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB", "branchC"]),
            spec(
                MergeTrigger::Critical { branches: vec!["branchA".into(), "branchC".into()] },
                MergeStrategy::LastWriteWins,
            ),
            false,
        );
        let t = Utc::now();
        buffer.record_success(output(&path("branchA"), b"a", t));
        assert_eq!(
            buffer.record_success(output(&path("branchB"), b"b", t)),
            MergeDecision::Wait
        );
        assert_eq!(
            buffer.record_success(output(&path("branchC"), b"c", t)),
            MergeDecision::Fire
        );
    }

    #[test]
    fn test_critical_branch_failure_fails_exporter() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(
                MergeTrigger::Critical { branches: vec!["branchA".into()] },
                MergeStrategy::LastWriteWins,
            ),
            true,
        );
        assert!(matches!(
            buffer.record_failure(&path("branchA")),
            MergeDecision::FailExporter { .. }
        ));
    }

    #[test]
    fn test_timeout_fires_with_available_and_fails_empty() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::Timeout { timeout_ms: 100 }, MergeStrategy::LastWriteWins),
            false,
        );
        assert_eq!(buffer.timeout_ms(), Some(100));
        assert!(matches!(
            buffer.deadline_elapsed(),
            MergeDecision::FailExporter { .. }
        ));

        let t = Utc::now();
        buffer.record_success(output(&path("branchA"), b"a", t));
        assert_eq!(buffer.deadline_elapsed(), MergeDecision::Fire);
    }

    #[test]
    fn test_last_write_wins_tie_breaks_lexicographically() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::All, MergeStrategy::LastWriteWins),
            false,
        );
        let t = Utc::now();
        buffer.record_success(output(&path("branchB"), b"b", t));
        buffer.record_success(output(&path("branchA"), b"a", t));
        let outcome = buffer.fire().unwrap();
        // Identical timestamps: lexicographically first path wins.
        assert_eq!(outcome.payload, b"a");
        assert_eq!(outcome.summary["selected_branch"], "branchA");
    }

    #[test]
    fn test_last_write_wins_prefers_latest() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(MergeTrigger::All, MergeStrategy::LastWriteWins),
            false,
        );
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(5);
        buffer.record_success(output(&path("branchA"), b"a", early));
        buffer.record_success(output(&path("branchB"), b"b", late));
        let outcome = buffer.fire().unwrap();
        assert_eq!(outcome.payload, b"b");
    }

    #[test]
    fn test_priority_selects_first_successful() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["branchA", "branchB"]),
            spec(
                MergeTrigger::All,
                MergeStrategy::PriorityBased {
                    order: vec!["branchA".into(), "branchB".into()],
                },
            ),
            true,
        );
        let t = Utc::now();
        buffer.record_success(output(&path("branchB"), b"b", t));
        buffer.record_failure(&path("branchA"));
        let outcome = buffer.fire().unwrap();
        // branchA failed, so branchB wins despite lower priority.
        assert_eq!(outcome.payload, b"b");
        assert_eq!(outcome.summary["selected_branch"], "branchB");
        assert_eq!(outcome.summary["reason"], "priority");
    }

    #[test]
    fn test_field_level_assembles_from_sources() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["a", "b", "c"]),
            spec(
                MergeTrigger::All,
                MergeStrategy::FieldLevel {
                    mappings: vec![
                        FieldMapping {
                            target_field: "customer".into(),
                            source_branch: "a".into(),
                            source_field: Some("customerInfo".into()),
                        },
                        FieldMapping {
                            target_field: "order".into(),
                            source_branch: "b".into(),
                            source_field: Some("orderData".into()),
                        },
                        FieldMapping {
                            target_field: "shipping".into(),
                            source_branch: "c".into(),
                            source_field: Some("shippingDetails".into()),
                        },
                    ],
                    conflict: None,
                },
            ),
            false,
        );
        let t = Utc::now();
        buffer.record_success(output(&path("a"), br#"{"customerInfo": {"id": "C-1"}}"#, t));
        buffer.record_success(output(&path("b"), br#"{"orderData": {"total": 42}}"#, t));
        let decision = buffer.record_success(output(&path("c"), br#"{"shippingDetails": "express"}"#, t));
        assert_eq!(decision, MergeDecision::Fire);

        let outcome = buffer.fire().unwrap();
        let merged: Value = serde_json::from_slice(&outcome.payload).unwrap();
        assert_eq!(merged["customer"]["id"], "C-1");
        assert_eq!(merged["order"]["total"], 42);
        assert_eq!(merged["shipping"], "express");
        assert_eq!(outcome.summary["sources"]["customer"], "a");
    }

    #[test]
    fn test_field_level_conflict_falls_back_by_priority() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["a", "b"]),
            spec(
                MergeTrigger::All,
                MergeStrategy::FieldLevel {
                    mappings: vec![FieldMapping {
                        target_field: "customer".into(),
                        source_branch: "a".into(),
                        source_field: None,
                    }],
                    conflict: Some(ConflictRule::PriorityBased {
                        order: vec!["b".into()],
                    }),
                },
            ),
            true,
        );
        let t = Utc::now();
        buffer.record_failure(&path("a"));
        buffer.record_success(output(&path("b"), br#"{"customer": "fallback"}"#, t));
        let outcome = buffer.fire().unwrap();
        let merged: Value = serde_json::from_slice(&outcome.payload).unwrap();
        assert_eq!(merged["customer"], "fallback");
    }

    #[test]
    fn test_field_level_unresolvable_mapping_fails() {
        let mut buffer = GatherBuffer::new(
            "exp",
            expected(&["a", "b"]),
            spec(
                MergeTrigger::All,
                MergeStrategy::FieldLevel {
                    mappings: vec![FieldMapping {
                        target_field: "customer".into(),
                        source_branch: "a".into(),
                        source_field: None,
                    }],
                    conflict: None,
                },
            ),
            true,
        );
        let t = Utc::now();
        buffer.record_failure(&path("a"));
        buffer.record_success(output(&path("b"), br#"{"unrelated": 1}"#, t));
        assert!(matches!(buffer.fire(), Err(Error::Merge { .. })));
    }
}
