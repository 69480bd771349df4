// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Structured telemetry events.
//!
//! The orchestrator is write-only towards telemetry: every lifecycle
//! transition of an execution emits one [`FlowExecutionEvent`] into a
//! fan-out of [`EventSink`]s. Sinks must be cheap and non-blocking - the
//! scheduler emits from its hot path and never awaits a sink. Anything
//! that needs real IO buffers internally.

use crate::address::ExecutionId;
use crate::error::{ErrorRecord, Severity};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Execution planned and dispatching began.
    Started,
    /// A branch received its first dispatch.
    BranchStarted,
    /// A step completed successfully.
    StepCompleted,
    /// A step exhausted its retry budget or failed fatally.
    StepFailed,
    /// A merge trigger fired at a convergent exporter.
    MergeFired,
    /// Every step of a branch completed.
    BranchCompleted,
    /// A branch was abandoned.
    BranchFailed,
    /// The execution reached COMPLETED.
    Completed,
    /// The execution reached FAILED.
    Failed,
    /// The execution was cancelled.
    Cancelled,
    /// The execution was restored after an orchestrator restart.
    Recovered,
}

/// One telemetry event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowExecutionEvent {
    /// Execution the event belongs to.
    pub execution_id: ExecutionId,
    /// Flow being executed.
    pub flow_id: String,
    /// Version of the flow definition.
    pub flow_version: String,
    /// Event kind.
    pub event_type: EventType,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload (step ids, branch paths, merge outcome...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Correlation id tying the event to a command, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl FlowExecutionEvent {
    /// Build an event stamped with the current time.
    pub fn new(
        execution_id: ExecutionId,
        flow_id: impl Into<String>,
        flow_version: impl Into<String>,
        event_type: EventType,
    ) -> Self {
        Self {
            execution_id,
            flow_id: flow_id.into(),
            flow_version: flow_version.into(),
            event_type,
            timestamp: Utc::now(),
            data: Value::Null,
            correlation_id: None,
        }
    }

    /// Attach the event payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Receives emitted events. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn emit(&self, event: &FlowExecutionEvent);
}

/// Sink that logs every event through `tracing`.
#[derive(Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &FlowExecutionEvent) {
        tracing::info!(
            execution_id = %event.execution_id,
            flow_id = %event.flow_id,
            event = ?event.event_type,
            data = %event.data,
            "flow execution event"
        );
    }
}

/// Sink that fans events into a tokio broadcast channel for live
/// subscribers. Events published while no subscriber exists are dropped,
/// which is the semantics a write-only stream wants.
pub struct BroadcastEventSink {
    tx: tokio::sync::broadcast::Sender<FlowExecutionEvent>,
}

impl BroadcastEventSink {
    /// A sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowExecutionEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &FlowExecutionEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event.clone());
    }
}

/// Sink that records every event in memory; for tests and introspection.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<FlowExecutionEvent>>,
}

impl MemoryEventSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<FlowExecutionEvent> {
        self.events.lock().clone()
    }

    /// Event types in emission order, for compact assertions.
    pub fn event_types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &FlowExecutionEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Fan-out of sinks plus the error-reporting path.
pub struct TelemetryEmitter {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl TelemetryEmitter {
    /// An emitter over the given sinks. A tracing sink is almost always
    /// one of them.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    /// Emitter with only the tracing sink.
    pub fn tracing_only() -> Self {
        Self::new(vec![Arc::new(TracingEventSink)])
    }

    /// Emit one event to every sink.
    pub fn emit(&self, event: FlowExecutionEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }

    /// Report an error record at a level matching its severity. CRITICAL
    /// records carry an `alert` field so log-based alerting can key on it.
    pub fn report_error(&self, record: &ErrorRecord) {
        match record.severity {
            Severity::Critical => tracing::error!(
                code = %record.error_code,
                source = %record.source,
                execution_id = record.context.execution_id.as_deref().unwrap_or(""),
                alert = true,
                "{}",
                record.message
            ),
            Severity::Major => tracing::error!(
                code = %record.error_code,
                source = %record.source,
                execution_id = record.context.execution_id.as_deref().unwrap_or(""),
                "{}",
                record.message
            ),
            Severity::Minor | Severity::Warning => tracing::warn!(
                code = %record.error_code,
                source = %record.source,
                "{}",
                record.message
            ),
            Severity::Info => tracing::info!(code = %record.error_code, "{}", record.message),
        }
    }
}
