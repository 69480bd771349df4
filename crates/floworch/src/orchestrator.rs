// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The orchestrator facade.
//!
//! [`FlowOrchestrator`] wires the validator, planner, schedulers, message
//! adapter, memory store, active-address registry, recovery manager, and
//! telemetry together and exposes the admission interface: submit a flow,
//! trigger an execution, cancel it, query its status.
//!
//! There is no global mutable state beyond the two things that are global
//! by nature - the Active Address Registry and leadership - and both are
//! injected explicitly. Everything else lives per execution inside its
//! scheduler task.
//!
//! # Example
//!
//! ```rust,ignore
//! use floworch::orchestrator::FlowOrchestrator;
//!
//! let orchestrator = FlowOrchestrator::builder()
//!     .with_catalog(catalog)
//!     .build()?;
//! let report = orchestrator.submit_flow(definition)?;
//! assert!(report.is_valid());
//! let execution_id = orchestrator.trigger_execution("FLOW-L", trigger).await?;
//! ```

use crate::active_address::ActiveAddressRegistry;
use crate::address::ExecutionId;
use crate::config::OrchestratorConfig;
use crate::context::{ExecutionStatusView, TriggerMetadata};
use crate::definition::{DefinitionStore, FlowDefinition};
use crate::error::{Error, ErrorClass, ErrorCode, ErrorRecord, Result, Severity};
use crate::events::{EventSink, TelemetryEmitter, TracingEventSink};
use crate::memory::MemoryStore;
use crate::messaging::{self, BusAdapter, InMemoryBus, MessageBus};
use crate::planner::ExecutionPlanner;
use crate::recovery::{AlwaysLeader, LeaderElector, RecoveryManager};
use crate::scheduler::{ExecutionScheduler, SchedulerDeps, SchedulerEvent};
use crate::validator::{FlowValidator, ValidationMode, ValidationReport, ValidationRule};
use crate::versioning::VersionCatalog;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Builder for [`FlowOrchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    catalog: Option<Arc<dyn VersionCatalog>>,
    sinks: Vec<Arc<dyn EventSink>>,
    elector: Arc<dyn LeaderElector>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            catalog: None,
            sinks: vec![Arc::new(TracingEventSink)],
            elector: Arc::new(AlwaysLeader),
        }
    }
}

impl OrchestratorBuilder {
    /// Override the configuration.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the version catalog (required).
    pub fn with_catalog(mut self, catalog: Arc<dyn VersionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Add an event sink alongside the default tracing sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Override leadership (clustered deployments).
    pub fn with_elector(mut self, elector: Arc<dyn LeaderElector>) -> Self {
        self.elector = elector;
        self
    }

    /// Build the orchestrator and start its background tasks. Must be
    /// called within a tokio runtime.
    pub fn build(self) -> Result<FlowOrchestrator> {
        let catalog = self
            .catalog
            .ok_or_else(|| Error::Config("a version catalog is required".to_string()))?;

        let config = Arc::new(self.config);
        let bus = Arc::new(InMemoryBus::new());
        let adapter = Arc::new(BusAdapter::new(Arc::clone(&bus) as Arc<dyn MessageBus>));
        let memory = Arc::new(MemoryStore::new(config.memory_grace()));
        let registry = Arc::new(ActiveAddressRegistry::new());
        let recovery = Arc::new(RecoveryManager::new(
            config.state_dir.clone(),
            config.snapshot_interval,
        ));
        let telemetry = Arc::new(TelemetryEmitter::new(self.sinks));
        let status_board = Arc::new(DashMap::new());

        let mut background = Vec::new();
        if let Some(results) = bus.take_results() {
            background.push(tokio::spawn(messaging::run_result_pump(
                Arc::clone(&adapter),
                results,
            )));
        }
        background.push(tokio::spawn(messaging::run_deadline_sweeper(
            Arc::clone(&adapter),
            Duration::from_millis(config.deadline_sweep_ms),
        )));
        background.push(tokio::spawn(crate::memory::run_gc(
            Arc::clone(&memory),
            Duration::from_millis(config.gc_interval_ms),
        )));

        let deps = SchedulerDeps {
            config: Arc::clone(&config),
            adapter,
            memory,
            registry: Arc::clone(&registry),
            recovery: Arc::clone(&recovery),
            telemetry,
            elector: self.elector,
            catalog: Arc::clone(&catalog),
            status_board,
        };

        Ok(FlowOrchestrator {
            inner: Arc::new(Inner {
                config,
                definitions: DefinitionStore::new(),
                validator: FlowValidator::new(Arc::clone(&catalog)),
                planner: ExecutionPlanner::new(catalog, registry, recovery),
                deps,
                bus,
                executions: DashMap::new(),
                tasks: DashMap::new(),
                shutting_down: AtomicBool::new(false),
                background,
            }),
        })
    }
}

struct Inner {
    config: Arc<OrchestratorConfig>,
    definitions: DefinitionStore,
    validator: FlowValidator,
    planner: ExecutionPlanner,
    deps: SchedulerDeps,
    bus: Arc<InMemoryBus>,
    executions: DashMap<ExecutionId, mpsc::UnboundedSender<SchedulerEvent>>,
    tasks: DashMap<ExecutionId, JoinHandle<()>>,
    shutting_down: AtomicBool,
    background: Vec<JoinHandle<()>>,
}

/// Summary of a startup recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Executions resumed and running again.
    pub resumed: Vec<ExecutionId>,
    /// Executions whose durable state was unrecoverable.
    pub unrecoverable: Vec<ExecutionId>,
    /// Terminal executions whose leftover state was cleaned up.
    pub cleaned: Vec<ExecutionId>,
}

/// The flow-execution engine.
#[derive(Clone)]
pub struct FlowOrchestrator {
    inner: Arc<Inner>,
}

impl FlowOrchestrator {
    /// Start building an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// The in-process bus; workers subscribe to their service topics here.
    pub fn bus(&self) -> Arc<InMemoryBus> {
        Arc::clone(&self.inner.bus)
    }

    /// The shared memory store, for in-process workers that resolve input
    /// addresses themselves.
    pub fn memory(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.inner.deps.memory)
    }

    /// Validate a definition and persist it if admission passes. The
    /// report is returned either way; nothing is persisted on failure.
    pub fn submit_flow(&self, definition: FlowDefinition) -> Result<ValidationReport> {
        let report = self
            .inner
            .validator
            .validate(&definition, ValidationMode::Admission);
        if report.is_valid() {
            self.inner.definitions.insert(definition);
        }
        Ok(report)
    }

    /// Validate, plan, and launch one execution of a flow. Returns the
    /// execution id; rejections (validation, address conflicts) surface
    /// synchronously before any command is published.
    pub async fn trigger_execution(
        &self,
        flow_id: &str,
        trigger: TriggerMetadata,
    ) -> Result<ExecutionId> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if !self.inner.deps.elector.is_leader() {
            return Err(Error::NotLeader);
        }

        let definition = self.inner.definitions.latest(flow_id)?;
        let report = self
            .inner
            .validator
            .validate(&definition, ValidationMode::Execution);
        for warning in report.warnings() {
            if warning.rule == ValidationRule::VersionStatus {
                self.inner.deps.telemetry.report_error(&ErrorRecord::new(
                    ErrorCode::new(ErrorClass::VersionError, "DEPRECATED"),
                    Severity::Warning,
                    warning.subject.clone(),
                    warning.message.clone(),
                ));
            }
        }
        if !report.is_valid() {
            return Err(Error::Validation {
                flow_id: flow_id.to_string(),
                issue_count: report.error_count(),
            });
        }
        let topology = report.into_topology().ok_or_else(|| Error::Validation {
            flow_id: flow_id.to_string(),
            issue_count: 1,
        })?;

        let planned = self.inner.planner.plan(&definition, topology, trigger).await?;
        let execution_id = planned.context.execution_id;

        let (scheduler, event_tx) =
            ExecutionScheduler::new(self.inner.deps.clone(), definition, planned);
        self.launch(execution_id, scheduler, event_tx);
        Ok(execution_id)
    }

    /// Cancel an execution. Idempotent: cancelling a finished or already-
    /// cancelled execution is a no-op.
    pub fn cancel_execution(&self, execution_id: ExecutionId) -> Result<()> {
        if let Some(tx) = self.inner.executions.get(&execution_id) {
            let _ = tx.send(SchedulerEvent::Cancel {
                reason: "cancelled by operator".to_string(),
            });
            return Ok(());
        }
        // Not running: fine if we know it ran to termination.
        if self.inner.deps.status_board.contains_key(&execution_id) {
            return Ok(());
        }
        Err(Error::ExecutionNotFound {
            execution_id: execution_id.to_string(),
        })
    }

    /// Current status of an execution, live or terminal.
    pub fn execution_status(&self, execution_id: ExecutionId) -> Result<ExecutionStatusView> {
        self.inner
            .deps
            .status_board
            .get(&execution_id)
            .map(|v| v.clone())
            .ok_or_else(|| Error::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// Status views of every execution this orchestrator knows about.
    pub fn list_executions(&self) -> Vec<ExecutionStatusView> {
        self.inner
            .deps
            .status_board
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Restore every non-terminal execution found in the state directory.
    /// Run once at startup, before accepting new triggers.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for execution_id in self.inner.deps.recovery.list_executions()? {
            match self.inner.deps.recovery.load_execution(execution_id) {
                Ok(recovered) if recovered.context.status.is_terminal() => {
                    self.inner.deps.recovery.remove_execution(execution_id).await?;
                    report.cleaned.push(execution_id);
                }
                Ok(recovered) => {
                    if recovered.wal_truncated {
                        tracing::warn!(
                            execution_id = %execution_id,
                            "resuming from a truncated WAL; lost suffix will be re-executed"
                        );
                    }
                    // Re-take the reservations the execution held.
                    if let Err(e) = self.inner.deps.registry.reserve_all(
                        &recovered.context.reserved_addresses,
                        execution_id,
                        &recovered.context.flow_id,
                    ) {
                        self.fail_unrecoverable(execution_id, &e.to_string());
                        report.unrecoverable.push(execution_id);
                        continue;
                    }
                    // Repopulate the memory store with surviving payloads.
                    for restore in &recovered.restores {
                        match self.inner.deps.memory.put(
                            &restore.address,
                            restore.payload.clone(),
                            restore.schema.as_str(),
                        ) {
                            Ok(_) => {
                                let _ = self.inner.deps.memory.acquire(&restore.address);
                            }
                            Err(Error::AddressOccupied { .. }) => {}
                            Err(e) => tracing::warn!(
                                address = %restore.address,
                                error = %e,
                                "memory restore failed"
                            ),
                        }
                    }

                    let journal = self
                        .inner
                        .deps
                        .recovery
                        .reopen_journal(execution_id, recovered.last_seq)
                        .await?;
                    match ExecutionScheduler::resume(self.inner.deps.clone(), recovered, journal) {
                        Ok((scheduler, event_tx)) => {
                            self.launch(execution_id, scheduler, event_tx);
                            report.resumed.push(execution_id);
                        }
                        Err(e) => {
                            self.fail_unrecoverable(execution_id, &e.to_string());
                            report.unrecoverable.push(execution_id);
                        }
                    }
                }
                Err(e) => {
                    self.fail_unrecoverable(execution_id, &e.to_string());
                    report.unrecoverable.push(execution_id);
                }
            }
        }
        tracing::info!(
            resumed = report.resumed.len(),
            unrecoverable = report.unrecoverable.len(),
            cleaned = report.cleaned.len(),
            "recovery pass finished"
        );
        Ok(report)
    }

    /// Refuse new triggers, drain running executions up to the deadline,
    /// then abort whatever is left (its state is recoverable from the WAL).
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let drained = tokio::time::timeout(deadline, async {
            while !self.inner.executions.is_empty() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                remaining = self.inner.executions.len(),
                "shutdown deadline reached; aborting remaining executions"
            );
            for entry in self.inner.tasks.iter() {
                entry.value().abort();
            }
        }
        for task in &self.inner.background {
            task.abort();
        }
        tracing::info!(drained, "orchestrator shut down");
    }

    fn launch(
        &self,
        execution_id: ExecutionId,
        scheduler: ExecutionScheduler,
        event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    ) {
        self.inner
            .deps
            .adapter
            .register_execution(execution_id, event_tx.clone());
        self.inner.executions.insert(execution_id, event_tx);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            scheduler.run().await;
            inner.executions.remove(&execution_id);
            inner.tasks.remove(&execution_id);
        });
        self.inner.tasks.insert(execution_id, handle);
    }

    fn fail_unrecoverable(&self, execution_id: ExecutionId, reason: &str) {
        let record = RecoveryManager::unrecoverable_record(execution_id, reason);
        self.inner.deps.telemetry.report_error(&record);
        self.inner.deps.registry.release_execution(execution_id);
    }
}

impl std::fmt::Debug for FlowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowOrchestrator")
            .field("state_dir", &self.inner.config.state_dir)
            .field("running_executions", &self.inner.executions.len())
            .finish()
    }
}
