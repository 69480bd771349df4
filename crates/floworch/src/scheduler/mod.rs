// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The Branch Scheduler: one event loop per execution.
//!
//! Exactly one scheduler task owns each execution's state. It consumes an
//! ordered event queue (worker results, synthetic timeouts, retry timers,
//! merge deadlines, cancellation) and applies each event atomically: the
//! transition is appended to the WAL, made durable, folded into the
//! context through [`apply_transition`], and only then do side effects
//! happen (memory writes, dispatches, telemetry). Nothing here ever waits
//! inline for a worker - dispatches are fire-and-track, and the only
//! suspension point is the queue itself.
//!
//! Failure policy per step:
//! - retriable codes (connection timeout, resource unavailable,
//!   processing timeout) retry with exponential backoff up to the step's
//!   retry budget
//! - a circuit per `(service id, version)` opens after consecutive
//!   failures and fails dispatches fast during its cooldown
//! - everything else fails the branch; sibling branches keep running
//!   (bulkhead), and the execution only fails once no exporter can fire

pub mod backoff;
pub mod circuit;

use crate::active_address::ActiveAddressRegistry;
use crate::address::{BranchPath, ExecutionId, MemoryAddress};
use crate::config::OrchestratorConfig;
use crate::context::{
    BranchStatus, ExecutionContext, ExecutionStatus, ExecutionStatusView, StepStatus,
};
use crate::definition::{FlowDefinition, NodeKind, RetryPolicy, ServiceRef};
use crate::error::{
    Error, ErrorClass, ErrorCode, ErrorContext, ErrorRecord, Result, Severity, VersionInfo,
};
use crate::events::{EventType, FlowExecutionEvent, TelemetryEmitter};
use crate::memory::MemoryStore;
use crate::merge::{BranchOutput, GatherBuffer, MergeDecision};
use crate::messaging::{
    BusAdapter, Command, CommandEnvelope, ExportCommand, ImportCommand, ProcessCommand,
    ResultEnvelope,
};
use crate::planner::PlannedExecution;
use crate::recovery::{
    apply_transition, ExecutionJournal, LeaderElector, RecoveredExecution, RecoveryManager,
    Transition,
};
use crate::topology::FlowTopology;
use crate::versioning::VersionCatalog;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use self::circuit::CircuitBreaker;

/// Events a scheduler consumes, in arrival order.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A matched worker result.
    Result(ResultEnvelope),
    /// A command deadline elapsed without a result.
    CommandTimedOut {
        /// Correlation id of the expired command.
        correlation_id: Uuid,
        /// Node the command belonged to.
        node: String,
        /// Attempt that expired.
        attempt: u32,
    },
    /// A retry backoff timer fired.
    RetryDue {
        /// Node to re-dispatch.
        node: String,
    },
    /// A merge deadline elapsed.
    MergeDeadline {
        /// Exporter whose gather buffer timed out.
        exporter: String,
    },
    /// Cancel the execution. Idempotent.
    Cancel {
        /// Why.
        reason: String,
    },
}

/// Shared collaborators every scheduler needs.
#[derive(Clone)]
pub struct SchedulerDeps {
    /// Process configuration.
    pub config: Arc<OrchestratorConfig>,
    /// Command/result correlation layer.
    pub adapter: Arc<BusAdapter>,
    /// Shared-memory payload store.
    pub memory: Arc<MemoryStore>,
    /// Active-address registry.
    pub registry: Arc<ActiveAddressRegistry>,
    /// Durable state manager.
    pub recovery: Arc<RecoveryManager>,
    /// Telemetry fan-out.
    pub telemetry: Arc<TelemetryEmitter>,
    /// Leadership gate for dispatches.
    pub elector: Arc<dyn LeaderElector>,
    /// Version catalog (merge capabilities at buffer construction).
    pub catalog: Arc<dyn VersionCatalog>,
    /// Live status views, shared with the orchestrator facade.
    pub status_board: Arc<DashMap<ExecutionId, ExecutionStatusView>>,
}

/// One execution's scheduler. Built from a plan (or a recovery) and run
/// to completion as a spawned task.
pub struct ExecutionScheduler {
    deps: SchedulerDeps,
    definition: Arc<FlowDefinition>,
    topo: FlowTopology,
    context: ExecutionContext,
    journal: ExecutionJournal,
    buffers: HashMap<String, GatherBuffer>,
    merge_summaries: HashMap<String, Value>,
    circuits: HashMap<String, CircuitBreaker>,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    event_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    recovered: bool,
}

impl ExecutionScheduler {
    /// Scheduler for a freshly planned execution.
    pub fn new(
        deps: SchedulerDeps,
        definition: Arc<FlowDefinition>,
        planned: PlannedExecution,
    ) -> (Self, mpsc::UnboundedSender<SchedulerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let buffers = build_buffers(&deps, &definition, &planned.topology);
        let scheduler = Self {
            deps,
            definition,
            topo: planned.topology,
            context: planned.context,
            journal: planned.journal,
            buffers,
            merge_summaries: HashMap::new(),
            circuits: HashMap::new(),
            event_tx: event_tx.clone(),
            event_rx,
            recovered: false,
        };
        (scheduler, event_tx)
    }

    /// Scheduler resuming a recovered execution. The memory store must
    /// already hold the recovered payloads.
    pub fn resume(
        deps: SchedulerDeps,
        recovered: RecoveredExecution,
        journal: ExecutionJournal,
    ) -> Result<(Self, mpsc::UnboundedSender<SchedulerEvent>)> {
        let definition = Arc::new(recovered.definition);
        let topo = crate::topology::derive(&definition).map_err(|e| Error::Recovery {
            execution_id: recovered.context.execution_id.to_string(),
            reason: e.to_string(),
        })?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut buffers = build_buffers(&deps, &definition, &topo);
        for exporter in &recovered.merges_fired {
            if let Some(buffer) = buffers.get_mut(exporter) {
                buffer.mark_fired();
            }
        }
        let scheduler = Self {
            deps,
            definition,
            topo,
            context: recovered.context,
            journal,
            buffers,
            merge_summaries: HashMap::new(),
            circuits: HashMap::new(),
            event_tx: event_tx.clone(),
            event_rx,
            recovered: true,
        };
        Ok((scheduler, event_tx))
    }

    /// Execution id this scheduler drives.
    pub fn execution_id(&self) -> ExecutionId {
        self.context.execution_id
    }

    /// Drive the execution to a terminal status.
    pub async fn run(mut self) {
        if let Err(e) = self.start().await {
            self.fail_execution_fatally(e).await;
        }
        while !self.context.status.is_terminal() {
            let Some(event) = self.event_rx.recv().await else {
                tracing::warn!(execution_id = %self.execution_id(), "event queue closed early");
                break;
            };
            if let Err(e) = self.handle_event(event).await {
                self.fail_execution_fatally(e).await;
            }
            if let Err(e) = self.journal.maybe_snapshot(&self.context).await {
                tracing::warn!(execution_id = %self.execution_id(), error = %e, "snapshot failed");
            }
            self.publish_view();
        }
        self.finalize().await;
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    async fn start(&mut self) -> Result<()> {
        self.publish_view();
        if self.recovered {
            self.emit(self.event(EventType::Recovered));
            self.reconcile_recovered().await?;
        } else {
            self.emit(self.event(EventType::Started));
            self.record(Transition::StatusChanged {
                status: ExecutionStatus::Importing,
            })
            .await?;
        }
        self.arm_merge_deadlines();
        self.dispatch_ready().await?;
        self.check_conclusion().await?;
        Ok(())
    }

    /// Re-prime gather buffers and requeue interrupted steps after a
    /// restart.
    async fn reconcile_recovered(&mut self) -> Result<()> {
        // Re-prime unfired buffers from branches that already finished.
        let exporters: Vec<String> = self.buffers.keys().cloned().collect();
        for exporter in exporters {
            let decisions: Vec<(String, MergeDecision)> = self
                .reprime_buffer(&exporter)
                .into_iter()
                .map(|d| (exporter.clone(), d))
                .collect();
            self.process_merge_decisions(decisions).await?;
        }

        // Interrupted steps: wait the recovery grace, then re-dispatch if
        // the retry budget allows, otherwise fail them now.
        let interrupted: Vec<String> = self
            .context
            .steps
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::InFlight | StepStatus::TimedOut | StepStatus::Retrying
                )
            })
            .map(|s| s.node.clone())
            .collect();
        for node in interrupted {
            let (attempts, policy) = {
                let step = self.context.step(&node).ok_or_else(|| Error::Recovery {
                    execution_id: self.execution_id().to_string(),
                    reason: format!("unknown step '{node}'"),
                })?;
                (step.attempts, self.retry_policy_for(&node))
            };
            if attempts <= policy.max_attempts {
                let delay = Duration::from_millis(self.deps.config.recovery.result_wait_ms);
                self.schedule_retry(&node, attempts + 1, delay).await?;
            } else {
                let error = ErrorRecord::new(
                    ErrorCode::new(ErrorClass::RecoveryError, "RETRY_BUDGET_EXHAUSTED"),
                    Severity::Major,
                    "scheduler",
                    format!("step '{node}' was in flight at crash with no retry budget left"),
                )
                .with_context(self.error_context(&node));
                self.fail_step(&node, error).await?;
            }
        }

        // Completed steps whose payload did not survive (branch-level
        // cleanup): restart them from their last completed predecessor.
        let completed: Vec<(String, Option<MemoryAddress>)> = self
            .context
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Completed && s.step_type != crate::address::StepType::Export)
            .map(|s| (s.node.clone(), s.output_address.clone()))
            .collect();
        for (node, address) in completed {
            let present = address
                .as_ref()
                .map(|a| self.deps.memory.get(a).is_ok())
                .unwrap_or(false);
            let needed = self
                .topo
                .successors(&node)
                .iter()
                .any(|succ| !self.step_status(succ).map_or(true, |s| s.is_terminal()));
            if !present && needed {
                tracing::warn!(
                    execution_id = %self.execution_id(),
                    node = %node,
                    "completed step's payload missing after recovery; re-running it"
                );
                let attempt = self.context.step(&node).map(|s| s.attempts + 1).unwrap_or(1);
                self.schedule_retry(&node, attempt, Duration::from_millis(1)).await?;
            }
        }
        Ok(())
    }

    fn reprime_buffer(&mut self, exporter: &str) -> Vec<MergeDecision> {
        let mut decisions = Vec::new();
        let Some(buffer) = self.buffers.get_mut(exporter) else {
            return decisions;
        };
        if buffer.fired() {
            return decisions;
        }
        let producers: Vec<String> = self.topo.predecessors(exporter).to_vec();
        for producer in producers {
            let Some(step) = self.context.step(&producer) else {
                continue;
            };
            match step.status {
                StepStatus::Completed => {
                    let Some(address) = step.output_address.clone() else {
                        continue;
                    };
                    if let Ok(payload) = self.deps.memory.get(&address) {
                        decisions.push(buffer.record_success(BranchOutput {
                            branch: step.step_id.branch_path.clone(),
                            address,
                            payload,
                            completed_at: step.completed_at.unwrap_or_else(Utc::now),
                        }));
                    }
                }
                StepStatus::Failed => {
                    decisions.push(buffer.record_failure(&step.step_id.branch_path.clone()));
                }
                _ => {}
            }
        }
        decisions
    }

    fn arm_merge_deadlines(&self) {
        for (exporter, buffer) in &self.buffers {
            let Some(timeout_ms) = buffer.timeout_ms() else {
                continue;
            };
            if buffer.fired() {
                continue;
            }
            // Deadline measured from execution start, so restarts do not
            // extend it.
            let elapsed = (Utc::now() - self.context.started_at)
                .to_std()
                .unwrap_or_default();
            let remaining = Duration::from_millis(timeout_ms).saturating_sub(elapsed);
            let tx = self.event_tx.clone();
            let exporter = exporter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                let _ = tx.send(SchedulerEvent::MergeDeadline { exporter });
            });
        }
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: SchedulerEvent) -> Result<()> {
        match event {
            SchedulerEvent::Result(result) if result.success => self.on_success(result).await,
            SchedulerEvent::Result(result) => self.on_failure_result(result).await,
            SchedulerEvent::CommandTimedOut {
                correlation_id,
                node,
                attempt,
            } => self.on_timeout(correlation_id, &node, attempt).await,
            SchedulerEvent::RetryDue { node } => self.on_retry_due(&node).await,
            SchedulerEvent::MergeDeadline { exporter } => self.on_merge_deadline(&exporter).await,
            SchedulerEvent::Cancel { reason } => self.on_cancel(&reason).await,
        }
    }

    async fn on_success(&mut self, result: ResultEnvelope) -> Result<()> {
        let Some(node) = self.node_of_step(&result) else {
            return Ok(());
        };

        let (step_type, branch, expected_address) = {
            let step = match self.context.step(&node) {
                Some(step) if step.status == StepStatus::InFlight => step,
                _ => {
                    tracing::debug!(node = %node, "stale success ignored");
                    return Ok(());
                }
            };
            if step.correlation_id != Some(result.correlation_id) {
                tracing::debug!(node = %node, "success for a superseded attempt ignored");
                return Ok(());
            }
            (
                step.step_type,
                step.step_id.branch_path.clone(),
                self.context.allocations.get(&node).cloned(),
            )
        };

        let completed_at = Utc::now();
        let is_export = step_type == crate::address::StepType::Export;

        let (address, schema, payload) = if is_export {
            let address = expected_address.ok_or_else(|| Error::AddressNotFound {
                address: format!("allocation for '{node}'"),
            })?;
            (address, "ExportReceipt".to_string(), Vec::new())
        } else {
            let Some(output) = result.output else {
                let error = ErrorRecord::new(
                    ErrorCode::new(ErrorClass::DataError, "MALFORMED"),
                    Severity::Major,
                    self.service_of(&node)
                        .map(|s| s.service_id.clone())
                        .unwrap_or_else(|| node.clone()),
                    "successful result carried no output payload",
                )
                .with_context(self.error_context(&node))
                .with_correlation_id(result.correlation_id);
                return self.handle_step_failure(&node, error).await;
            };
            // The allocation is authoritative; a disagreeing worker is
            // noted but does not get to relocate the payload.
            let address = expected_address.unwrap_or_else(|| output.address.clone());
            if output.address != address {
                tracing::warn!(
                    node = %node,
                    reported = %output.address,
                    allocated = %address,
                    "worker reported an unexpected output address"
                );
            }
            (address, output.schema, output.payload)
        };

        self.record(Transition::StepCompleted {
            node: node.clone(),
            address: address.clone(),
            schema: schema.clone(),
            payload: payload.clone(),
            completed_at,
        })
        .await?;

        if !is_export {
            self.deps.memory.put(&address, payload.clone(), schema.as_str())?;
            for _ in self.topo.successors(&node) {
                self.deps.memory.acquire(&address)?;
            }
            // The step's own inputs are no longer needed by it.
            for producer in self.topo.predecessors(&node).to_vec() {
                if let Some(addr) = self.context.allocations.get(&producer).cloned() {
                    let _ = self.deps.memory.release(&addr);
                }
            }
        } else if let Some(addr) = self.context.merge_inputs.get(&node).cloned() {
            let _ = self.deps.memory.release(&addr);
        } else {
            for producer in self.topo.predecessors(&node).to_vec() {
                if let Some(addr) = self.context.allocations.get(&producer).cloned() {
                    let _ = self.deps.memory.release(&addr);
                }
            }
        }

        if let Some(service) = self.service_of(&node).cloned() {
            let threshold = self.deps.config.circuit_breaker.threshold;
            let cooldown = self.deps.config.circuit_cooldown();
            self.circuits
                .entry(service.to_string())
                .or_insert_with(|| CircuitBreaker::new(threshold, cooldown))
                .record_success();
        }

        let step_id = self.context.step(&node).map(|s| s.step_id.to_string());
        self.emit(
            self.event(EventType::StepCompleted)
                .with_data(json!({
                    "step_id": step_id,
                    "node": node,
                    "address": address.to_string(),
                    "duration_ms": result.stats.duration_ms,
                }))
                .with_correlation_id(result.correlation_id),
        );

        if step_type == crate::address::StepType::Import
            && self.context.status == ExecutionStatus::Importing
        {
            self.record(Transition::StatusChanged {
                status: ExecutionStatus::Processing,
            })
            .await?;
        }

        self.update_branch_after_completion(&branch, completed_at).await?;

        // Feed gather buffers this step supplies.
        let buffered_exporters: Vec<String> = self
            .topo
            .successors(&node)
            .iter()
            .filter(|succ| self.buffers.contains_key(*succ))
            .cloned()
            .collect();
        let mut decisions = Vec::new();
        for exporter in buffered_exporters {
            if self.context.status == ExecutionStatus::Processing {
                self.record(Transition::StatusChanged {
                    status: ExecutionStatus::Merging,
                })
                .await?;
            }
            let payload = self.deps.memory.get(&address)?;
            let decision = match self.buffers.get_mut(&exporter) {
                Some(buffer) => buffer.record_success(BranchOutput {
                    branch: branch.clone(),
                    address: address.clone(),
                    payload,
                    completed_at,
                }),
                None => continue,
            };
            decisions.push((exporter, decision));
        }
        self.process_merge_decisions(decisions).await?;

        self.dispatch_ready().await?;
        self.check_conclusion().await
    }

    async fn on_failure_result(&mut self, result: ResultEnvelope) -> Result<()> {
        let Some(node) = self.node_of_step(&result) else {
            return Ok(());
        };
        let valid = self
            .context
            .step(&node)
            .map_or(false, |s| {
                s.status == StepStatus::InFlight && s.correlation_id == Some(result.correlation_id)
            });
        if !valid {
            tracing::debug!(node = %node, "stale failure ignored");
            return Ok(());
        }
        let error = result.error.unwrap_or_else(|| {
            ErrorRecord::new(
                ErrorCode::new(ErrorClass::ProcessingError, "UNSPECIFIED"),
                Severity::Major,
                node.clone(),
                "worker reported failure without an error record",
            )
            .with_context(self.error_context(&node))
            .with_correlation_id(result.correlation_id)
        });
        self.handle_step_failure(&node, error).await
    }

    async fn on_timeout(&mut self, correlation_id: Uuid, node: &str, attempt: u32) -> Result<()> {
        let valid = self.context.step(node).map_or(false, |s| {
            s.status == StepStatus::InFlight
                && s.correlation_id == Some(correlation_id)
                && s.attempts == attempt
        });
        if !valid {
            tracing::debug!(node = %node, "stale timeout ignored");
            return Ok(());
        }
        self.record(Transition::StepTimedOut {
            node: node.to_string(),
            attempt,
        })
        .await?;
        let error = ErrorRecord::new(
            ErrorCode::processing_timeout(),
            Severity::Major,
            self.service_of(node)
                .map(|s| s.service_id.clone())
                .unwrap_or_else(|| node.to_string()),
            format!("no result before the deadline (attempt {attempt})"),
        )
        .with_context(self.error_context(node))
        .with_correlation_id(correlation_id);
        self.handle_step_failure(node, error).await
    }

    async fn on_retry_due(&mut self, node: &str) -> Result<()> {
        if self.step_status(node) != Some(StepStatus::Retrying) {
            return Ok(());
        }
        self.dispatch(node).await?;
        self.check_conclusion().await
    }

    async fn on_merge_deadline(&mut self, exporter: &str) -> Result<()> {
        let decision = match self.buffers.get_mut(exporter) {
            Some(buffer) if !buffer.fired() => buffer.deadline_elapsed(),
            _ => return Ok(()),
        };
        self.process_merge_decisions(vec![(exporter.to_string(), decision)])
            .await?;
        self.dispatch_ready().await?;
        self.check_conclusion().await
    }

    async fn on_cancel(&mut self, reason: &str) -> Result<()> {
        if self.context.status.is_terminal() {
            // Duplicate cancels are no-ops.
            return Ok(());
        }
        tracing::info!(execution_id = %self.execution_id(), reason = %reason, "execution cancelled");
        let cancelled = self.deps.adapter.cancel_execution(self.execution_id()).await;
        tracing::debug!(cancelled, "in-flight cancellations requested");

        let error = ErrorRecord::new(
            ErrorCode::new(ErrorClass::SystemError, "CANCELLED"),
            Severity::Major,
            "orchestrator",
            reason.to_string(),
        )
        .with_context(ErrorContext {
            flow_id: Some(self.context.flow_id.clone()),
            execution_id: Some(self.execution_id().to_string()),
            branch_path: None,
            step_id: None,
        });
        self.record(Transition::Failed {
            error: Some(error.clone()),
            at: Utc::now(),
        })
        .await?;
        self.deps.telemetry.report_error(&error);
        self.emit(
            self.event(EventType::Cancelled)
                .with_data(json!({"reason": reason})),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch every READY step. A convergent exporter is only ready once
    /// its gather buffer fired, regardless of its dependency count.
    async fn dispatch_ready(&mut self) -> Result<()> {
        loop {
            if !self.deps.elector.is_leader() {
                tracing::warn!(
                    execution_id = %self.execution_id(),
                    "not the leader; ready steps withheld"
                );
                return Ok(());
            }
            let ready: Vec<String> = self
                .context
                .steps
                .values()
                .filter(|s| s.status == StepStatus::Ready)
                .filter(|s| {
                    self.buffers
                        .get(&s.node)
                        .map_or(true, GatherBuffer::fired)
                })
                .map(|s| s.node.clone())
                .collect();
            if ready.is_empty() {
                return Ok(());
            }
            for node in ready {
                self.dispatch(&node).await?;
            }
        }
    }

    async fn dispatch(&mut self, node: &str) -> Result<()> {
        if !self.deps.elector.is_leader() {
            tracing::warn!(
                execution_id = %self.execution_id(),
                node = %node,
                "not the leader; dispatch withheld"
            );
            return Ok(());
        }

        let Some(service) = self.service_of(node).cloned() else {
            return Err(Error::FlowNotFound {
                flow_id: self.context.flow_id.clone(),
            });
        };

        // Open circuit: fail fast. The attempt is still consumed so a
        // persistently broken service exhausts its budget.
        let circuit_open = self
            .circuits
            .get(&service.to_string())
            .map_or(false, |c| c.is_open(Instant::now()));

        let attempt = self.context.step(node).map(|s| s.attempts + 1).unwrap_or(1);
        let correlation_id = Uuid::new_v4();
        self.record(Transition::StepDispatched {
            node: node.to_string(),
            correlation_id,
            attempt,
        })
        .await?;
        self.mark_branch_started(node).await?;

        if circuit_open {
            let error = ErrorRecord::new(
                ErrorCode::resource_unavailable(),
                Severity::Minor,
                service.service_id.clone(),
                format!("circuit open for {service}; failing fast"),
            )
            .with_context(self.error_context(node))
            .with_correlation_id(correlation_id)
            .with_version_info(VersionInfo {
                component_id: Some(service.service_id.clone()),
                version: Some(service.version.to_string()),
            });
            // Deferred through the queue; processing it inline would
            // re-enter dispatch from within dispatch.
            self.enqueue_synthetic_failure(node, correlation_id, error);
            return Ok(());
        }

        let envelope = self.build_envelope(node, &service, correlation_id)?;
        if matches!(envelope.command, Command::Export(_))
            && self.context.status != ExecutionStatus::Exporting
        {
            self.record(Transition::StatusChanged {
                status: ExecutionStatus::Exporting,
            })
            .await?;
        }

        if let Err(e) = self.deps.adapter.dispatch(envelope, node, attempt).await {
            tracing::warn!(node = %node, error = %e, "publish failed");
            let error = ErrorRecord::new(
                e.code(),
                Severity::Minor,
                service.service_id.clone(),
                e.to_string(),
            )
            .with_context(self.error_context(node))
            .with_correlation_id(correlation_id);
            self.enqueue_synthetic_failure(node, correlation_id, error);
        }
        Ok(())
    }

    /// Queue a failure for a step that never reached the bus, as if a
    /// worker had reported it. Keeps dispatch non-reentrant.
    fn enqueue_synthetic_failure(&self, node: &str, correlation_id: Uuid, error: ErrorRecord) {
        let Some(step) = self.context.step(node) else {
            return;
        };
        let kind = match step.step_type {
            crate::address::StepType::Import => crate::messaging::ResultKind::Import,
            crate::address::StepType::Process => crate::messaging::ResultKind::Process,
            crate::address::StepType::Export => crate::messaging::ResultKind::Export,
        };
        let _ = self.event_tx.send(SchedulerEvent::Result(ResultEnvelope {
            correlation_id,
            execution_id: self.execution_id(),
            step_id: step.step_id.clone(),
            kind,
            success: false,
            output: None,
            error: Some(error),
            stats: Default::default(),
        }));
    }

    fn build_envelope(
        &self,
        node: &str,
        service: &ServiceRef,
        correlation_id: Uuid,
    ) -> Result<CommandEnvelope> {
        let step = self.context.step(node).ok_or_else(|| Error::FlowNotFound {
            flow_id: self.context.flow_id.clone(),
        })?;
        let output_address =
            self.context
                .allocations
                .get(node)
                .cloned()
                .ok_or_else(|| Error::AddressNotFound {
                    address: format!("allocation for '{node}'"),
                })?;

        let command = match self.definition.node_kind(node) {
            Some(NodeKind::Importer) => Command::Import(ImportCommand {
                source: self.definition.importer.source.clone(),
                service: service.clone(),
                output_address,
                parameters: json!({
                    "config": self.definition.importer.config,
                    "trigger": self.context.trigger.payload,
                }),
            }),
            Some(NodeKind::Processor) => {
                let inputs: Vec<MemoryAddress> = self
                    .topo
                    .predecessors(node)
                    .iter()
                    .filter_map(|p| self.context.allocations.get(p).cloned())
                    .collect();
                let spec = self.definition.processor(node).ok_or_else(|| Error::FlowNotFound {
                    flow_id: self.context.flow_id.clone(),
                })?;
                Command::Process(ProcessCommand {
                    service: service.clone(),
                    input_addresses: inputs,
                    output_address,
                    parameters: spec.config.clone(),
                })
            }
            Some(NodeKind::Exporter) => {
                let spec = self.definition.exporter(node).ok_or_else(|| Error::FlowNotFound {
                    flow_id: self.context.flow_id.clone(),
                })?;
                let input_address = match self.context.merge_inputs.get(node) {
                    Some(merged) => merged.clone(),
                    None => self
                        .topo
                        .predecessors(node)
                        .first()
                        .and_then(|p| self.context.allocations.get(p).cloned())
                        .ok_or_else(|| Error::AddressNotFound {
                            address: format!("input for exporter '{node}'"),
                        })?,
                };
                Command::Export(ExportCommand {
                    destination: spec.destination.clone(),
                    service: service.clone(),
                    input_address,
                    parameters: spec.config.clone(),
                    merge_audit: self
                        .merge_summaries
                        .get(node)
                        .cloned()
                        .unwrap_or(Value::Null),
                })
            }
            None => {
                return Err(Error::FlowNotFound {
                    flow_id: self.context.flow_id.clone(),
                })
            }
        };

        Ok(CommandEnvelope {
            correlation_id,
            execution_id: self.execution_id(),
            step_id: step.step_id.clone(),
            branch_path: step.step_id.branch_path.clone(),
            deadline: Utc::now()
                + chrono::Duration::milliseconds(self.deps.config.command_deadline_ms as i64),
            command,
        })
    }

    // ------------------------------------------------------------------
    // Failure policy
    // ------------------------------------------------------------------

    async fn handle_step_failure(&mut self, node: &str, error: ErrorRecord) -> Result<()> {
        let execution_id = self.execution_id();
        if let Some(service) = self.service_of(node).cloned() {
            let threshold = self.deps.config.circuit_breaker.threshold;
            let cooldown = self.deps.config.circuit_cooldown();
            let breaker = self
                .circuits
                .entry(service.to_string())
                .or_insert_with(|| CircuitBreaker::new(threshold, cooldown));
            if breaker.record_failure(Instant::now()) {
                let failures = breaker.consecutive_failures();
                tracing::warn!(
                    execution_id = %execution_id,
                    service = %service,
                    failures,
                    "circuit opened"
                );
            }
        }

        if error.error_code.is_execution_fatal() {
            self.deps.telemetry.report_error(&error);
            self.record(Transition::StepFailed {
                node: node.to_string(),
                error: error.clone(),
            })
            .await?;
            self.record(Transition::Failed {
                error: Some(error),
                at: Utc::now(),
            })
            .await?;
            self.emit(self.event(EventType::Failed));
            return Ok(());
        }

        let attempts = self.context.step(node).map(|s| s.attempts).unwrap_or(0);
        let policy = self.retry_policy_for(node);
        if error.error_code.is_retriable() && attempts <= policy.max_attempts {
            let delay = backoff::delay_for(&policy, attempts);
            tracing::info!(
                execution_id = %self.execution_id(),
                node = %node,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                code = %error.error_code,
                "retrying step"
            );
            self.schedule_retry(node, attempts + 1, delay).await?;
            return Ok(());
        }

        self.fail_step(node, error).await?;
        self.dispatch_ready().await?;
        self.check_conclusion().await
    }

    async fn schedule_retry(&mut self, node: &str, attempt: u32, delay: Duration) -> Result<()> {
        self.record(Transition::RetryScheduled {
            node: node.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        })
        .await?;
        let tx = self.event_tx.clone();
        let node = node.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SchedulerEvent::RetryDue { node });
        });
        Ok(())
    }

    /// Fail a step terminally and propagate: the owning branch fails, the
    /// downstream chain is abandoned, and gather buffers hear about the
    /// lost branch (bulkhead - sibling branches are untouched).
    async fn fail_step(&mut self, node: &str, error: ErrorRecord) -> Result<()> {
        let decisions = self.fail_step_collect(node, error).await?;
        self.process_merge_decisions(decisions).await
    }

    /// The non-reentrant half of [`fail_step`]: fails the step and its
    /// downstream chain, returning whatever merge decisions the lost
    /// branches provoked instead of processing them inline.
    async fn fail_step_collect(
        &mut self,
        node: &str,
        error: ErrorRecord,
    ) -> Result<Vec<(String, MergeDecision)>> {
        self.deps.telemetry.report_error(&error);
        self.record(Transition::StepFailed {
            node: node.to_string(),
            error: error.clone(),
        })
        .await?;
        let step_id = self.context.step(node).map(|s| s.step_id.to_string());
        self.emit(
            self.event(EventType::StepFailed)
                .with_data(json!({
                    "step_id": step_id,
                    "node": node,
                    "error_code": error.error_code.to_string(),
                })),
        );

        let branch = match self.context.step(node) {
            Some(step) => step.step_id.branch_path.clone(),
            None => BranchPath::root(),
        };
        self.fail_branch(&branch, "step failed").await?;
        self.cascade_failure(node).await
    }

    async fn fail_branch(&mut self, branch: &BranchPath, reason: &str) -> Result<()> {
        let already_terminal = self
            .context
            .branch(branch)
            .map_or(true, |b| b.status.is_terminal());
        if already_terminal {
            return Ok(());
        }
        self.record(Transition::BranchStatusChanged {
            branch: branch.clone(),
            status: BranchStatus::Failed,
            at: Some(Utc::now()),
        })
        .await?;
        self.emit(
            self.event(EventType::BranchFailed)
                .with_data(json!({"branch": branch.as_str(), "reason": reason})),
        );
        Ok(())
    }

    /// Abandon everything downstream of a dead step, collecting the merge
    /// decisions provoked along the way.
    async fn cascade_failure(&mut self, node: &str) -> Result<Vec<(String, MergeDecision)>> {
        let mut decisions = Vec::new();
        let mut queue: Vec<String> = self.topo.successors(node).to_vec();
        let mut source_branch: HashMap<String, BranchPath> = HashMap::new();
        let origin = self
            .context
            .step(node)
            .map(|s| s.step_id.branch_path.clone())
            .unwrap_or_else(BranchPath::root);
        for succ in &queue {
            source_branch.insert(succ.clone(), origin.clone());
        }
        let mut seen: BTreeSet<String> = BTreeSet::new();

        while let Some(current) = queue.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let feeding_branch = source_branch
                .get(&current)
                .cloned()
                .unwrap_or_else(|| origin.clone());

            if self.buffers.contains_key(&current) {
                let decision = match self.buffers.get_mut(&current) {
                    Some(buffer) => buffer.record_failure(&feeding_branch),
                    None => continue,
                };
                decisions.push((current, decision));
                continue;
            }

            let Some(status) = self.step_status(&current) else {
                continue;
            };
            if status.is_terminal() || status == StepStatus::InFlight {
                // An in-flight step is left to its own result/timeout.
                continue;
            }
            let upstream = ErrorRecord::new(
                ErrorCode::new(ErrorClass::PartialFailure, "UPSTREAM_FAILED"),
                Severity::Minor,
                "scheduler",
                "abandoned because an upstream step failed".to_string(),
            )
            .with_context(self.error_context(&current));
            self.record(Transition::StepFailed {
                node: current.clone(),
                error: upstream,
            })
            .await?;

            let branch = self
                .context
                .step(&current)
                .map(|s| s.step_id.branch_path.clone())
                .unwrap_or_else(BranchPath::root);
            self.fail_branch(&branch, "upstream failure").await?;

            if self.definition.node_kind(&current) == Some(NodeKind::Exporter) {
                let step_id = self.context.step(&current).map(|s| s.step_id.to_string());
                self.emit(
                    self.event(EventType::StepFailed)
                        .with_data(json!({"step_id": step_id, "node": current, "error_code": "PARTIAL_FAILURE.UPSTREAM_FAILED"})),
                );
            }

            for succ in self.topo.successors(&current).to_vec() {
                source_branch.insert(succ.clone(), branch.clone());
                queue.push(succ);
            }
        }
        Ok(decisions)
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    /// Drain a worklist of merge decisions. Failing an exporter or firing
    /// a merge can provoke further decisions (e.g. a cascade reaching
    /// another buffer), so this loops until the list is dry instead of
    /// recursing.
    async fn process_merge_decisions(
        &mut self,
        mut worklist: Vec<(String, MergeDecision)>,
    ) -> Result<()> {
        while let Some((exporter, decision)) = worklist.pop() {
            match decision {
                MergeDecision::Wait => {}
                MergeDecision::Fire => {
                    let more = self.fire_merge(&exporter).await?;
                    worklist.extend(more);
                }
                MergeDecision::FailExporter { reason } => {
                    let error = ErrorRecord::new(
                        ErrorCode::new(ErrorClass::ProcessingError, "MERGE_FAILED"),
                        Severity::Major,
                        "merge-coordinator",
                        reason,
                    )
                    .with_context(self.error_context(&exporter));
                    let more = self.fail_step_collect(&exporter, error).await?;
                    worklist.extend(more);
                }
                MergeDecision::DroppedLate { branch } => {
                    tracing::info!(
                        execution_id = %self.execution_id(),
                        exporter = %exporter,
                        branch = %branch,
                        "late merge arrival dropped"
                    );
                    self.emit(
                        self.event(EventType::BranchCompleted)
                            .with_data(json!({"branch": branch.as_str(), "late_arrival_dropped": true})),
                    );
                    self.record(Transition::BranchStatusChanged {
                        branch,
                        status: BranchStatus::Completed,
                        at: Some(Utc::now()),
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Fire one gather buffer. Returns follow-up decisions (from a failed
    /// fire cascading into other buffers) rather than processing them.
    async fn fire_merge(&mut self, exporter: &str) -> Result<Vec<(String, MergeDecision)>> {
        let outcome = {
            let buffer = self.buffers.get_mut(exporter).ok_or_else(|| Error::Merge {
                step_id: exporter.to_string(),
                reason: "no gather buffer".to_string(),
            })?;
            match buffer.fire() {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = ErrorRecord::new(
                        ErrorCode::new(ErrorClass::ProcessingError, "MERGE_FAILED"),
                        Severity::Major,
                        "merge-coordinator",
                        e.to_string(),
                    )
                    .with_context(self.error_context(exporter));
                    return self.fail_step_collect(exporter, error).await;
                }
            }
        };

        let address = self
            .context
            .merge_inputs
            .get(exporter)
            .cloned()
            .ok_or_else(|| Error::AddressNotFound {
                address: format!("merge input for '{exporter}'"),
            })?;
        let schema = address.data_type.clone();

        self.record(Transition::MergeFired {
            exporter: exporter.to_string(),
            address: address.clone(),
            schema: schema.clone(),
            payload: outcome.payload.clone(),
            summary: outcome.summary.to_string(),
        })
        .await?;
        self.deps.memory.put(&address, outcome.payload, schema.as_str())?;
        self.deps.memory.acquire(&address)?;
        self.merge_summaries
            .insert(exporter.to_string(), outcome.summary.clone());

        let mut data = json!({"exporter": exporter});
        if let (Some(obj), Some(extra)) = (data.as_object_mut(), outcome.summary.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.emit(self.event(EventType::MergeFired).with_data(data));

        // Contributing branches blocked on this merge are now complete.
        let blocked: Vec<BranchPath> = self
            .context
            .branches
            .values()
            .filter(|b| b.status == BranchStatus::BlockedOnMerge)
            .map(|b| b.branch_path.clone())
            .collect();
        for branch in blocked {
            let still_blocked = self.feeds_unfired_buffer(&branch);
            if !still_blocked {
                self.record(Transition::BranchStatusChanged {
                    branch: branch.clone(),
                    status: BranchStatus::Completed,
                    at: Some(Utc::now()),
                })
                .await?;
                self.emit(
                    self.event(EventType::BranchCompleted)
                        .with_data(json!({"branch": branch.as_str()})),
                );
            }
        }

        // Optionally cancel branches that lost the race.
        let cancel = self
            .buffers
            .get(exporter)
            .map_or(false, |b| b.cancel_losers(self.deps.config.cancel_losers_default));
        if cancel {
            for loser in outcome.losers {
                self.cancel_branch(&loser, "merge loser").await?;
            }
        }
        Ok(Vec::new())
    }

    /// Abort a losing branch after an `ANY` merge fired.
    async fn cancel_branch(&mut self, branch: &BranchPath, reason: &str) -> Result<()> {
        let nodes: Vec<String> = self
            .context
            .steps
            .values()
            .filter(|s| {
                s.step_id.branch_path == *branch || branch.is_ancestor_of(&s.step_id.branch_path)
            })
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.node.clone())
            .collect();
        for node in nodes {
            if let Some(correlation_id) = self.context.step(&node).and_then(|s| s.correlation_id) {
                self.deps.adapter.cancel_correlation(correlation_id).await;
            }
            let error = ErrorRecord::new(
                ErrorCode::new(ErrorClass::PartialFailure, "MERGE_LOSER"),
                Severity::Minor,
                "merge-coordinator",
                format!("branch lost the merge race: {reason}"),
            )
            .with_context(self.error_context(&node));
            self.record(Transition::StepFailed { node, error }).await?;
        }
        self.fail_branch(branch, reason).await
    }

    // ------------------------------------------------------------------
    // Branch + conclusion bookkeeping
    // ------------------------------------------------------------------

    async fn mark_branch_started(&mut self, node: &str) -> Result<()> {
        let branch = match self.context.step(node) {
            Some(step) => step.step_id.branch_path.clone(),
            None => return Ok(()),
        };
        let is_new = self
            .context
            .branch(&branch)
            .map_or(false, |b| matches!(b.status, BranchStatus::New | BranchStatus::Ready));
        if is_new {
            self.record(Transition::BranchStatusChanged {
                branch: branch.clone(),
                status: BranchStatus::InProgress,
                at: None,
            })
            .await?;
            self.emit(
                self.event(EventType::BranchStarted)
                    .with_data(json!({"branch": branch.as_str()})),
            );
        }
        Ok(())
    }

    async fn update_branch_after_completion(
        &mut self,
        branch: &BranchPath,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let Some(ctx) = self.context.branch(branch) else {
            return Ok(());
        };
        if ctx.status.is_terminal() {
            return Ok(());
        }
        let all_done = ctx
            .steps
            .iter()
            .all(|n| self.step_status(n) == Some(StepStatus::Completed));
        if !all_done {
            return Ok(());
        }
        if self.feeds_unfired_buffer(branch) {
            self.record(Transition::BranchStatusChanged {
                branch: branch.clone(),
                status: BranchStatus::BlockedOnMerge,
                at: None,
            })
            .await?;
        } else {
            self.record(Transition::BranchStatusChanged {
                branch: branch.clone(),
                status: BranchStatus::Completed,
                at: Some(at),
            })
            .await?;
            self.emit(
                self.event(EventType::BranchCompleted)
                    .with_data(json!({"branch": branch.as_str()})),
            );
        }
        Ok(())
    }

    fn feeds_unfired_buffer(&self, branch: &BranchPath) -> bool {
        let Some(ctx) = self.context.branch(branch) else {
            return false;
        };
        ctx.steps.iter().any(|node| {
            self.topo.successors(node).iter().any(|succ| {
                self.buffers
                    .get(succ)
                    .map_or(false, |buffer| !buffer.fired())
            })
        })
    }

    /// Conclude once every exporter is terminal: COMPLETED if any exporter
    /// delivered, FAILED otherwise.
    async fn check_conclusion(&mut self) -> Result<()> {
        if self.context.status.is_terminal() {
            return Ok(());
        }
        let exporters: Vec<String> = self
            .definition
            .exporters
            .iter()
            .map(|e| e.name.clone())
            .collect();
        let all_terminal = exporters
            .iter()
            .all(|n| self.step_status(n).map_or(false, |s| s.is_terminal()));
        if !all_terminal {
            return Ok(());
        }
        let any_completed = exporters
            .iter()
            .any(|n| self.step_status(n) == Some(StepStatus::Completed));

        if any_completed {
            self.record(Transition::Completed { at: Utc::now() }).await?;
            self.emit(
                self.event(EventType::Completed).with_data(json!({
                    "branches": self
                        .context
                        .branches
                        .iter()
                        .map(|(p, b)| (p.as_str().to_string(), format!("{:?}", b.status)))
                        .collect::<std::collections::BTreeMap<_, _>>(),
                })),
            );
        } else {
            let error = self
                .context
                .steps
                .values()
                .filter(|s| s.step_type == crate::address::StepType::Export)
                .find_map(|s| s.last_error.clone())
                .unwrap_or_else(|| {
                    ErrorRecord::new(
                        ErrorCode::new(ErrorClass::PartialFailure, "ALL_EXPORTS_FAILED"),
                        Severity::Critical,
                        "scheduler",
                        "every exporter failed",
                    )
                });
            self.deps.telemetry.report_error(&error);
            self.record(Transition::Failed {
                error: Some(error),
                at: Utc::now(),
            })
            .await?;
            self.emit(self.event(EventType::Failed));
        }
        Ok(())
    }

    async fn fail_execution_fatally(&mut self, e: Error) {
        if self.context.status.is_terminal() {
            return;
        }
        let error = ErrorRecord::new(e.code(), Severity::Critical, "scheduler", e.to_string())
            .with_context(ErrorContext {
                flow_id: Some(self.context.flow_id.clone()),
                execution_id: Some(self.execution_id().to_string()),
                branch_path: None,
                step_id: None,
            });
        self.deps.telemetry.report_error(&error);
        let transition = Transition::Failed {
            error: Some(error),
            at: Utc::now(),
        };
        if self.journal.record(&transition).await.is_err() {
            // The WAL itself is gone; all that is left is in-memory truth.
            tracing::error!(
                execution_id = %self.execution_id(),
                "failed to journal terminal failure"
            );
        }
        apply_transition(&mut self.context, &self.topo, &transition);
        self.emit(self.event(EventType::Failed));
    }

    /// Cleanup after the terminal status: cancel stragglers, release the
    /// active-address reservations, drop memory, checkpoint, and remove
    /// the durable state.
    async fn finalize(&mut self) {
        let execution_id = self.execution_id();
        self.deps.adapter.cancel_execution(execution_id).await;
        self.deps.adapter.deregister_execution(execution_id);

        let released = self.deps.registry.release_execution(execution_id);
        tracing::debug!(execution_id = %execution_id, released, "reservations released");

        if let Err(e) = self.journal.snapshot(&self.context).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "final snapshot failed");
        }
        self.deps.memory.purge_execution(execution_id);
        if let Err(e) = self.deps.recovery.remove_execution(execution_id).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "durable state removal failed");
        }
        self.publish_view();
        tracing::info!(
            execution_id = %execution_id,
            status = ?self.context.status,
            "execution finished"
        );
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    async fn record(&mut self, transition: Transition) -> Result<()> {
        self.journal.record(&transition).await?;
        apply_transition(&mut self.context, &self.topo, &transition);
        Ok(())
    }

    fn emit(&self, event: FlowExecutionEvent) {
        self.deps.telemetry.emit(event);
    }

    fn event(&self, event_type: EventType) -> FlowExecutionEvent {
        FlowExecutionEvent::new(
            self.execution_id(),
            self.context.flow_id.clone(),
            self.context.flow_version.clone(),
            event_type,
        )
        .with_correlation_id(self.context.correlation_id)
    }

    fn publish_view(&self) {
        self.deps
            .status_board
            .insert(self.execution_id(), self.context.view());
    }

    fn node_of_step(&self, result: &ResultEnvelope) -> Option<String> {
        match self.topo.step_by_id(&result.step_id) {
            Some(info) => Some(info.node.clone()),
            None => {
                tracing::warn!(step_id = %result.step_id, "result for unknown step dropped");
                None
            }
        }
    }

    fn step_status(&self, node: &str) -> Option<StepStatus> {
        self.context.step(node).map(|s| s.status)
    }

    fn service_of(&self, node: &str) -> Option<&ServiceRef> {
        self.definition.service_of(node)
    }

    fn retry_policy_for(&self, node: &str) -> RetryPolicy {
        self.definition
            .processor(node)
            .and_then(|p| p.retry.clone())
            .or_else(|| self.definition.exporter(node).and_then(|e| e.retry.clone()))
            .unwrap_or_else(|| self.deps.config.retry.clone())
    }

    fn error_context(&self, node: &str) -> ErrorContext {
        let step = self.context.step(node);
        ErrorContext {
            flow_id: Some(self.context.flow_id.clone()),
            execution_id: Some(self.execution_id().to_string()),
            branch_path: step.map(|s| s.step_id.branch_path.as_str().to_string()),
            step_id: step.map(|s| s.step_id.to_string()),
        }
    }
}

fn build_buffers(
    deps: &SchedulerDeps,
    definition: &FlowDefinition,
    topo: &FlowTopology,
) -> HashMap<String, GatherBuffer> {
    let mut buffers = HashMap::new();
    for exporter in &definition.exporters {
        let Some(info) = topo.step(&exporter.name) else {
            continue;
        };
        if info.dependency_count <= 1 {
            continue;
        }
        let expected: BTreeSet<BranchPath> = topo
            .predecessors(&exporter.name)
            .iter()
            .filter_map(|p| topo.step(p))
            .map(|s| s.step_id.branch_path.clone())
            .collect();
        let accepts_partial = deps
            .catalog
            .merge_capabilities(&exporter.service)
            .map(|c| c.accepts_partial_input)
            .unwrap_or(false);
        buffers.insert(
            exporter.name.clone(),
            GatherBuffer::new(&exporter.name, expected, exporter.merge.clone(), accepts_partial),
        );
    }
    buffers
}
