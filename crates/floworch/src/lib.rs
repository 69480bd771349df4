// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # FlowOrch
//!
//! A distributed data-pipeline orchestration engine. A *flow* is a
//! validated DAG rooted at exactly one importer, fanning out through
//! branches of processors, and terminating at one or more exporters,
//! which merge branch outputs under a configured strategy.
//!
//! The crate is the orchestrator core:
//!
//! - [`validator`] admits flow definitions (topology, versions, schemas)
//! - [`planner`] materializes an execution: branch contexts, memory
//!   addresses, active-address reservations
//! - [`scheduler`] drives each execution through an event loop - one
//!   single-writer task per execution, commands out, results in
//! - [`memory`] passes payloads between steps through a write-once,
//!   reference-counted store with hierarchical addressing
//! - [`merge`] gathers branch outputs at convergent exporters and applies
//!   last-write-wins, priority, or field-level merging
//! - [`recovery`] makes every transition durable (WAL + snapshots) and
//!   resumes in-flight executions after a crash
//! - [`orchestrator`] is the facade: submit, trigger, cancel, status
//!
//! Workers (importers, processors, exporters) are external, stateless
//! command consumers; [`messaging`] defines their contract and an
//! in-process bus for tests and single-process embedding.
//!
//! # Example
//!
//! ```rust,ignore
//! use floworch::prelude::*;
//!
//! let orchestrator = FlowOrchestrator::builder()
//!     .with_catalog(catalog)
//!     .build()?;
//!
//! orchestrator.submit_flow(definition)?;
//! let execution_id = orchestrator
//!     .trigger_execution("FLOW-L", TriggerMetadata::default())
//!     .await?;
//! let status = orchestrator.execution_status(execution_id)?;
//! ```

pub mod active_address;
pub mod address;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod events;
pub mod memory;
pub mod merge;
pub mod messaging;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod topology;
pub mod validator;
pub mod versioning;

pub use address::{BranchPath, ExecutionId, MemoryAddress, StepId, StepType};
pub use config::OrchestratorConfig;
pub use context::{
    BranchStatus, ExecutionContext, ExecutionStatus, ExecutionStatusView, StepStatus,
    TriggerMetadata,
};
pub use definition::{
    EntityRef, ExporterSpec, FlowDefinition, ImporterSpec, MergeSpec, MergeStrategy, MergeTrigger,
    ProcessorSpec, RetryPolicy, ServiceRef,
};
pub use error::{Error, ErrorCode, ErrorRecord, Result, Severity};
pub use events::{EventType, FlowExecutionEvent};
pub use orchestrator::FlowOrchestrator;
pub use validator::{ValidationMode, ValidationReport};
pub use versioning::{VersionCatalog, VersionStatus};

/// The common imports embedders want.
pub mod prelude {
    pub use crate::address::{BranchPath, ExecutionId, MemoryAddress, StepId, StepType};
    pub use crate::config::OrchestratorConfig;
    pub use crate::context::{BranchStatus, ExecutionStatus, ExecutionStatusView, TriggerMetadata};
    pub use crate::definition::{
        EntityRef, ExporterSpec, FieldMapping, FlowDefinition, ImporterSpec, MergeSpec,
        MergeStrategy, MergeTrigger, ProcessorSpec, RetryPolicy, ServiceRef,
    };
    pub use crate::error::{Error, ErrorCode, ErrorRecord, Result, Severity};
    pub use crate::events::{EventType, FlowExecutionEvent, MemoryEventSink};
    pub use crate::orchestrator::FlowOrchestrator;
    pub use crate::schema::{DataSchema, FieldSpec, FieldType, ValidationRules};
    pub use crate::validator::{ValidationMode, ValidationReport};
    pub use crate::versioning::{
        MergeCapabilities, ServiceRegistration, StaticVersionCatalog, VersionCatalog, VersionStatus,
    };
}
