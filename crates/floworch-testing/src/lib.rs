// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Testing utilities for FlowOrch applications.
//!
//! [`MockWorker`] is a scripted worker service: it subscribes to its
//! service topic on the in-memory bus, answers commands according to a
//! queue of [`MockOutcome`]s, and records everything it saw. Use it to
//! exercise retry policies, timeouts, merges, and recovery without any
//! real importer/processor/exporter.
//!
//! # Example
//!
//! ```rust,ignore
//! use floworch_testing::{MockOutcome, MockWorker};
//!
//! let worker = MockWorker::new(ServiceRef::new("json-proc", "1.0.0"))
//!     .with_json_payload(serde_json::json!({"transformed": true}))
//!     .script([MockOutcome::Fail(ErrorCode::connection_timeout()), MockOutcome::Succeed]);
//! let _handle = worker.spawn(orchestrator.bus(), orchestrator.memory());
//! ```

use chrono::Utc;
use floworch::definition::ServiceRef;
use floworch::error::{ErrorCode, ErrorRecord, Severity};
use floworch::memory::MemoryStore;
use floworch::messaging::{
    Command, CommandEnvelope, ExecutionStats, InMemoryBus, ResultEnvelope, StepOutput,
    WorkerMessage,
};
use async_trait::async_trait;
use floworch::service::{
    ExportCapable, ImportCapable, ProcessCapable, ServiceLifecycle, ServiceState, WorkerOutcome,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// How the worker answers one command.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    /// Produce the configured payload and report success.
    Succeed,
    /// Report failure with the given code.
    Fail(ErrorCode),
    /// Never reply, forcing the orchestrator's deadline to fire.
    Timeout,
    /// Sleep before succeeding.
    DelayMs(u64),
}

type PayloadFn = dyn Fn(&CommandEnvelope, &[Arc<Vec<u8>>]) -> Vec<u8> + Send + Sync;

/// A scripted worker bound to one `(service id, version)`.
pub struct MockWorker {
    service: ServiceRef,
    script: Mutex<VecDeque<MockOutcome>>,
    default_outcome: MockOutcome,
    payload: Box<PayloadFn>,
    seen: Mutex<Vec<CommandEnvelope>>,
    cancelled: Mutex<Vec<uuid::Uuid>>,
    export_inputs: Mutex<Vec<Vec<u8>>>,
}

impl MockWorker {
    /// A worker that always succeeds, echoing its first input (or a
    /// stub object for importers).
    pub fn new(service: ServiceRef) -> Self {
        Self {
            service,
            script: Mutex::new(VecDeque::new()),
            default_outcome: MockOutcome::Succeed,
            payload: Box::new(|envelope, inputs| match inputs.first() {
                Some(input) => input.as_ref().clone(),
                None => serde_json::to_vec(&serde_json::json!({
                    "imported_by": envelope.command.service().service_id,
                }))
                .unwrap_or_default(),
            }),
            seen: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            export_inputs: Mutex::new(Vec::new()),
        }
    }

    /// Answer commands in this order, falling back to the default
    /// outcome once the script is exhausted.
    pub fn script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        *self.script.lock() = outcomes.into_iter().collect();
        self
    }

    /// Change the fallback outcome (default: succeed).
    pub fn default_outcome(mut self, outcome: MockOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Produce a fixed JSON payload on success.
    pub fn with_json_payload(mut self, value: serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(&value).unwrap_or_default();
        self.payload = Box::new(move |_, _| bytes.clone());
        self
    }

    /// Produce payloads with a custom function over the command and its
    /// resolved inputs.
    pub fn with_payload(
        mut self,
        f: impl Fn(&CommandEnvelope, &[Arc<Vec<u8>>]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.payload = Box::new(f);
        self
    }

    /// Every command envelope this worker received.
    pub fn seen(&self) -> Vec<CommandEnvelope> {
        self.seen.lock().clone()
    }

    /// How many commands this worker received.
    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Correlation ids the orchestrator asked to abort.
    pub fn cancellations(&self) -> Vec<uuid::Uuid> {
        self.cancelled.lock().clone()
    }

    /// Input payloads this worker exported, in arrival order.
    pub fn export_inputs(&self) -> Vec<Vec<u8>> {
        self.export_inputs.lock().clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone())
    }

    /// Subscribe to the bus and start answering commands. The returned
    /// handle aborts the worker when dropped via [`JoinHandle::abort`].
    pub fn spawn(self: Arc<Self>, bus: Arc<InMemoryBus>, memory: Arc<MemoryStore>) -> JoinHandle<()> {
        let mut rx = bus.subscribe_worker(&self.service);
        let results = bus.result_sender();
        tokio::spawn(async move {
            let mut lifecycle = ServiceLifecycle::new();
            let _ = lifecycle.transition(ServiceState::Initialized);
            let _ = lifecycle.transition(ServiceState::Ready);

            while let Some(message) = rx.recv().await {
                let envelope = match message {
                    WorkerMessage::Command(envelope) => envelope,
                    WorkerMessage::Cancel { correlation_id } => {
                        self.cancelled.lock().push(correlation_id);
                        continue;
                    }
                };
                self.seen.lock().push(envelope.clone());
                let _ = lifecycle.transition(ServiceState::Processing);

                let outcome = self.next_outcome();
                let reply = self.answer(&envelope, outcome, &memory).await;
                if let Some(reply) = reply {
                    let _ = results.send(reply);
                }
                let _ = lifecycle.transition(ServiceState::Ready);
            }
        })
    }

    async fn answer(
        &self,
        envelope: &CommandEnvelope,
        outcome: MockOutcome,
        memory: &MemoryStore,
    ) -> Option<ResultEnvelope> {
        let started = Utc::now();
        let outcome = match outcome {
            MockOutcome::DelayMs(ms) => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                MockOutcome::Succeed
            }
            other => other,
        };
        match outcome {
            MockOutcome::Timeout => {
                tracing::debug!(
                    correlation_id = %envelope.correlation_id,
                    "mock worker swallowing command"
                );
                None
            }
            MockOutcome::Fail(code) => {
                let record = ErrorRecord::new(
                    code,
                    Severity::Major,
                    self.service.service_id.clone(),
                    "scripted failure",
                )
                .with_correlation_id(envelope.correlation_id);
                Some(ResultEnvelope::failure(envelope, record))
            }
            MockOutcome::Succeed | MockOutcome::DelayMs(_) => {
                let inputs = match self.resolve_inputs(envelope, memory) {
                    Ok(inputs) => inputs,
                    Err(record) => return Some(ResultEnvelope::failure(envelope, record)),
                };
                let mut reply = match &envelope.command {
                    Command::Import(c) => match self.handle_import(envelope, c).await {
                        Ok(payload) => ResultEnvelope::success(
                            envelope,
                            Some(StepOutput {
                                address: c.output_address.clone(),
                                schema: c.output_address.data_type.clone(),
                                payload,
                            }),
                        ),
                        Err(record) => ResultEnvelope::failure(envelope, record),
                    },
                    Command::Process(c) => match self.handle_process(envelope, c, &inputs).await {
                        Ok(payload) => ResultEnvelope::success(
                            envelope,
                            Some(StepOutput {
                                address: c.output_address.clone(),
                                schema: c.output_address.data_type.clone(),
                                payload,
                            }),
                        ),
                        Err(record) => ResultEnvelope::failure(envelope, record),
                    },
                    Command::Export(c) => {
                        let Some(input) = inputs.first() else {
                            return Some(ResultEnvelope::failure(
                                envelope,
                                ErrorRecord::new(
                                    ErrorCode::new(
                                        floworch::error::ErrorClass::DataError,
                                        "INPUT_MISSING",
                                    ),
                                    Severity::Major,
                                    self.service.service_id.clone(),
                                    "export command resolved no input payload",
                                ),
                            ));
                        };
                        match self.handle_export(envelope, c, input).await {
                            Ok(()) => ResultEnvelope::success(envelope, None),
                            Err(record) => ResultEnvelope::failure(envelope, record),
                        }
                    }
                };
                reply.stats = ExecutionStats {
                    duration_ms: (Utc::now() - started).num_milliseconds().max(0) as u64,
                    records_in: inputs.len() as u64,
                    records_out: 1,
                };
                Some(reply)
            }
        }
    }

    fn resolve_inputs(
        &self,
        envelope: &CommandEnvelope,
        memory: &MemoryStore,
    ) -> std::result::Result<Vec<Arc<Vec<u8>>>, ErrorRecord> {
        let addresses = match &envelope.command {
            Command::Import(_) => Vec::new(),
            Command::Process(c) => c.input_addresses.clone(),
            Command::Export(c) => vec![c.input_address.clone()],
        };
        let mut inputs = Vec::with_capacity(addresses.len());
        for address in addresses {
            match memory.get(&address) {
                Ok(payload) => inputs.push(payload),
                Err(e) => {
                    return Err(ErrorRecord::new(
                        ErrorCode::new(floworch::error::ErrorClass::DataError, "INPUT_MISSING"),
                        Severity::Major,
                        self.service.service_id.clone(),
                        e.to_string(),
                    )
                    .with_correlation_id(envelope.correlation_id));
                }
            }
        }
        Ok(inputs)
    }
}

#[async_trait]
impl ImportCapable for MockWorker {
    async fn handle_import(
        &self,
        envelope: &CommandEnvelope,
        _command: &floworch::messaging::ImportCommand,
    ) -> WorkerOutcome {
        Ok((self.payload)(envelope, &[]))
    }
}

#[async_trait]
impl ProcessCapable for MockWorker {
    async fn handle_process(
        &self,
        envelope: &CommandEnvelope,
        _command: &floworch::messaging::ProcessCommand,
        inputs: &[Arc<Vec<u8>>],
    ) -> WorkerOutcome {
        Ok((self.payload)(envelope, inputs))
    }
}

#[async_trait]
impl ExportCapable for MockWorker {
    async fn handle_export(
        &self,
        _envelope: &CommandEnvelope,
        _command: &floworch::messaging::ExportCommand,
        input: &Arc<Vec<u8>>,
    ) -> std::result::Result<(), ErrorRecord> {
        self.export_inputs.lock().push(input.as_ref().clone());
        Ok(())
    }
}
