// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The command/result message layer.
//!
//! Workers are stateless command consumers: the orchestrator publishes
//! [`CommandEnvelope`]s to per-service topics and consumes
//! [`ResultEnvelope`]s back. The [`MessageBus`] trait is the transport
//! seam - [`InMemoryBus`] is the loopback implementation used by tests and
//! single-process embedding; a brokered deployment plugs its transport in
//! behind the same trait.
//!
//! The [`BusAdapter`] owns correlation: it registers a pending-command
//! record at dispatch, matches each incoming result against it exactly
//! once, surfaces elapsed deadlines as synthetic timeout events, and
//! delivers everything to the owning execution's scheduler queue in
//! arrival order. Cross-step ordering is deliberately not promised;
//! scheduler correctness rests on causal dependency alone.

use crate::address::{BranchPath, ExecutionId, MemoryAddress, StepId};
use crate::definition::{EntityRef, ServiceRef};
use crate::error::{Error, ErrorRecord, Result};
use crate::scheduler::SchedulerEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Kind discriminator shared by commands and results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultKind {
    /// Import command / result.
    Import,
    /// Process command / result.
    Process,
    /// Export command / result.
    Export,
}

/// Command for the flow's importer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportCommand {
    /// Source entity to read.
    pub source: EntityRef,
    /// Importer service to run.
    pub service: ServiceRef,
    /// Where to write the imported payload.
    pub output_address: MemoryAddress,
    /// Protocol parameters and service configuration.
    pub parameters: Value,
}

/// Command for a processor step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessCommand {
    /// Processor service to run.
    pub service: ServiceRef,
    /// Inputs, resolved from the producer steps' allocations.
    pub input_addresses: Vec<MemoryAddress>,
    /// Where to write the transformed payload.
    pub output_address: MemoryAddress,
    /// Service configuration.
    pub parameters: Value,
}

/// Command for an exporter step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportCommand {
    /// Destination entity to write.
    pub destination: EntityRef,
    /// Exporter service to run.
    pub service: ServiceRef,
    /// The (post-merge) input payload address.
    pub input_address: MemoryAddress,
    /// Service configuration.
    pub parameters: Value,
    /// Merge strategy metadata, carried for audit only.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub merge_audit: Value,
}

/// A worker command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Import from a source.
    Import(ImportCommand),
    /// Transform within a branch.
    Process(ProcessCommand),
    /// Export to a destination.
    Export(ExportCommand),
}

impl Command {
    /// The result kind a worker must answer with.
    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Import(_) => ResultKind::Import,
            Self::Process(_) => ResultKind::Process,
            Self::Export(_) => ResultKind::Export,
        }
    }

    /// The service the command is bound to.
    pub fn service(&self) -> &ServiceRef {
        match self {
            Self::Import(c) => &c.service,
            Self::Process(c) => &c.service,
            Self::Export(c) => &c.service,
        }
    }
}

/// A command stamped with its routing and correlation metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Correlation id matching the eventual result.
    pub correlation_id: Uuid,
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// Step being executed.
    pub step_id: StepId,
    /// Branch of the step.
    pub branch_path: BranchPath,
    /// Absolute deadline for the result.
    pub deadline: DateTime<Utc>,
    /// The command itself.
    pub command: Command,
}

/// Worker-reported execution statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Wall-clock duration of the worker's handling.
    #[serde(default)]
    pub duration_ms: u64,
    /// Records consumed.
    #[serde(default)]
    pub records_in: u64,
    /// Records produced.
    #[serde(default)]
    pub records_out: u64,
}

/// A successful step's produced output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Address the payload belongs under.
    pub address: MemoryAddress,
    /// The payload bytes; the scheduler writes them to the memory store.
    pub payload: Vec<u8>,
    /// Schema name of the payload.
    pub schema: String,
}

/// A worker's answer to one command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Correlation id of the answered command.
    pub correlation_id: Uuid,
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// Step that was executed.
    pub step_id: StepId,
    /// Result kind; must match the command's.
    pub kind: ResultKind,
    /// Whether the worker succeeded.
    pub success: bool,
    /// Produced output on success (exporters may omit it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    /// Failure details on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Worker-side statistics.
    #[serde(default)]
    pub stats: ExecutionStats,
}

impl ResultEnvelope {
    /// A successful result answering `envelope`.
    pub fn success(envelope: &CommandEnvelope, output: Option<StepOutput>) -> Self {
        Self {
            correlation_id: envelope.correlation_id,
            execution_id: envelope.execution_id,
            step_id: envelope.step_id.clone(),
            kind: envelope.command.kind(),
            success: true,
            output,
            error: None,
            stats: ExecutionStats::default(),
        }
    }

    /// A failed result answering `envelope`.
    pub fn failure(envelope: &CommandEnvelope, error: ErrorRecord) -> Self {
        Self {
            correlation_id: envelope.correlation_id,
            execution_id: envelope.execution_id,
            step_id: envelope.step_id.clone(),
            kind: envelope.command.kind(),
            success: false,
            output: None,
            error: Some(error),
            stats: ExecutionStats::default(),
        }
    }
}

/// Message delivered to a subscribed worker.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMessage {
    /// Execute this command.
    Command(CommandEnvelope),
    /// Abort work on this correlation id, best effort.
    Cancel {
        /// Correlation id being aborted.
        correlation_id: Uuid,
    },
}

/// Transport seam: publish commands, request cancellations.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a command to the service's topic.
    async fn publish(&self, envelope: CommandEnvelope) -> Result<()>;

    /// Ask the service's workers to abort a correlation id. Best effort;
    /// a worker that already replied wins the race harmlessly.
    async fn cancel(&self, service: &ServiceRef, correlation_id: Uuid) -> Result<()>;
}

/// Topic name a service's workers consume from.
pub fn service_topic(service: &ServiceRef) -> String {
    format!("commands.{}.{}", service.service_id, service.version)
}

/// Loopback bus: per-service unbounded topics and one shared result
/// stream, all in-process.
pub struct InMemoryBus {
    topics: DashMap<String, mpsc::UnboundedSender<WorkerMessage>>,
    results_tx: mpsc::UnboundedSender<ResultEnvelope>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<ResultEnvelope>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// A bus with no subscribers yet.
    pub fn new() -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            topics: DashMap::new(),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
        }
    }

    /// Subscribe a worker to a service's topic. The previous subscriber of
    /// the topic, if any, stops receiving.
    pub fn subscribe_worker(&self, service: &ServiceRef) -> mpsc::UnboundedReceiver<WorkerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.insert(service_topic(service), tx);
        rx
    }

    /// Sender workers use to submit results.
    pub fn result_sender(&self) -> mpsc::UnboundedSender<ResultEnvelope> {
        self.results_tx.clone()
    }

    /// Take the result stream; the adapter's pump consumes it. Yields
    /// `None` after the first call.
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<ResultEnvelope>> {
        self.results_rx.lock().take()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, envelope: CommandEnvelope) -> Result<()> {
        let topic = service_topic(envelope.command.service());
        let sender = self.topics.get(&topic).ok_or_else(|| Error::Publish {
            topic: topic.clone(),
            reason: "no worker subscribed".to_string(),
        })?;
        sender
            .send(WorkerMessage::Command(envelope))
            .map_err(|_| Error::Publish {
                topic,
                reason: "worker receiver dropped".to_string(),
            })
    }

    async fn cancel(&self, service: &ServiceRef, correlation_id: Uuid) -> Result<()> {
        let topic = service_topic(service);
        if let Some(sender) = self.topics.get(&topic) {
            let _ = sender.send(WorkerMessage::Cancel { correlation_id });
        }
        Ok(())
    }
}

/// In-flight command bookkeeping.
#[derive(Clone, Debug)]
pub struct PendingCommand {
    /// Owning execution.
    pub execution_id: ExecutionId,
    /// Node name of the step, as the scheduler knows it.
    pub node: String,
    /// Expected result kind.
    pub expected: ResultKind,
    /// Service the command went to, for cancellation routing.
    pub service: ServiceRef,
    /// Absolute result deadline.
    pub deadline: DateTime<Utc>,
    /// Dispatch attempt number (1-based).
    pub attempt: u32,
}

/// Correlation, timeout, and routing between the bus and the per-execution
/// scheduler queues.
pub struct BusAdapter {
    bus: Arc<dyn MessageBus>,
    pending: DashMap<Uuid, PendingCommand>,
    consumed: DashMap<Uuid, ExecutionId>,
    routes: DashMap<ExecutionId, mpsc::UnboundedSender<SchedulerEvent>>,
}

impl BusAdapter {
    /// An adapter over a transport.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            pending: DashMap::new(),
            consumed: DashMap::new(),
            routes: DashMap::new(),
        }
    }

    /// Route bus events for an execution to its scheduler queue.
    pub fn register_execution(
        &self,
        execution_id: ExecutionId,
        queue: mpsc::UnboundedSender<SchedulerEvent>,
    ) {
        self.routes.insert(execution_id, queue);
    }

    /// Stop routing for an execution and drop its correlation state.
    pub fn deregister_execution(&self, execution_id: ExecutionId) {
        self.routes.remove(&execution_id);
        self.pending.retain(|_, p| p.execution_id != execution_id);
        self.consumed.retain(|_, eid| *eid != execution_id);
    }

    /// Publish a command and start tracking its deadline.
    pub async fn dispatch(&self, envelope: CommandEnvelope, node: &str, attempt: u32) -> Result<()> {
        self.pending.insert(
            envelope.correlation_id,
            PendingCommand {
                execution_id: envelope.execution_id,
                node: node.to_string(),
                expected: envelope.command.kind(),
                service: envelope.command.service().clone(),
                deadline: envelope.deadline,
                attempt,
            },
        );
        if let Err(e) = self.bus.publish(envelope.clone()).await {
            self.pending.remove(&envelope.correlation_id);
            return Err(e);
        }
        Ok(())
    }

    /// Request cancellation of every in-flight command of an execution.
    /// Returns the number of cancellations requested.
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> usize {
        let in_flight: Vec<(Uuid, ServiceRef)> = self
            .pending
            .iter()
            .filter(|entry| entry.value().execution_id == execution_id)
            .map(|entry| (*entry.key(), entry.value().service.clone()))
            .collect();
        let count = in_flight.len();
        for (correlation_id, service) in in_flight {
            self.pending.remove(&correlation_id);
            let _ = self.bus.cancel(&service, correlation_id).await;
        }
        count
    }

    /// Request cancellation of a single in-flight command. Returns whether
    /// a pending record existed for it.
    pub async fn cancel_correlation(&self, correlation_id: Uuid) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            return false;
        };
        let _ = self.bus.cancel(&pending.service, correlation_id).await;
        true
    }

    /// Number of commands currently awaiting results.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn deliver(&self, execution_id: ExecutionId, event: SchedulerEvent) {
        match self.routes.get(&execution_id) {
            Some(route) => {
                if route.send(event).is_err() {
                    tracing::warn!(
                        execution_id = %execution_id,
                        "scheduler queue closed; dropping bus event"
                    );
                }
            }
            None => tracing::warn!(
                execution_id = %execution_id,
                "no scheduler registered; dropping bus event"
            ),
        }
    }

    /// Handle one incoming result. At most one terminal result is ever
    /// delivered per correlation id: duplicates, unknown correlations, and
    /// kind mismatches are dropped here.
    pub fn handle_result(&self, result: ResultEnvelope) {
        if self.consumed.contains_key(&result.correlation_id) {
            tracing::warn!(
                correlation_id = %result.correlation_id,
                execution_id = %result.execution_id,
                "duplicate result dropped"
            );
            return;
        }
        let Some((_, pending)) = self.pending.remove(&result.correlation_id) else {
            tracing::warn!(
                correlation_id = %result.correlation_id,
                execution_id = %result.execution_id,
                "unmatched result dropped"
            );
            return;
        };
        if pending.expected != result.kind || pending.execution_id != result.execution_id {
            tracing::warn!(
                correlation_id = %result.correlation_id,
                expected = ?pending.expected,
                got = ?result.kind,
                "mismatched result dropped"
            );
            return;
        }
        self.consumed.insert(result.correlation_id, result.execution_id);
        self.deliver(result.execution_id, SchedulerEvent::Result(result));
    }

    /// Surface every elapsed deadline as a synthetic timeout event.
    pub fn sweep_deadlines(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        let count = expired.len();
        for correlation_id in expired {
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    node = %pending.node,
                    attempt = pending.attempt,
                    "command deadline elapsed"
                );
                self.deliver(
                    pending.execution_id,
                    SchedulerEvent::CommandTimedOut {
                        correlation_id,
                        node: pending.node,
                        attempt: pending.attempt,
                    },
                );
            }
        }
        count
    }
}

/// Pump results from the bus into the adapter until the stream closes.
pub async fn run_result_pump(
    adapter: Arc<BusAdapter>,
    mut results: mpsc::UnboundedReceiver<ResultEnvelope>,
) {
    while let Some(result) = results.recv().await {
        adapter.handle_result(result);
    }
    tracing::debug!("result stream closed; pump exiting");
}

/// Periodically surface elapsed command deadlines.
pub async fn run_deadline_sweeper(adapter: Arc<BusAdapter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        adapter.sweep_deadlines(Utc::now());
    }
}
