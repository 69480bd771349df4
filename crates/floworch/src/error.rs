// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error taxonomy and error types for FlowOrch.
//!
//! Two layers live here and they are deliberately distinct:
//!
//! - [`ErrorCode`] is *data*: the dotted taxonomy (`CONNECTION_ERROR.TIMEOUT`)
//!   carried on the wire inside [`ErrorRecord`]s, persisted in WAL entries,
//!   and consulted by the scheduler's retry policy. It round-trips through
//!   serde as its dotted string form.
//! - [`Error`] is the crate's Rust error type, used for fallible APIs inside
//!   the orchestrator process. A worker failure is not an `Error` - it is a
//!   successful delivery of a result that happens to carry an `ErrorRecord`.
//!
//! Mapping between the two is explicit: see [`Error::code`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Top-level class of a dotted error code.
///
/// The wire form is the SCREAMING_SNAKE prefix before the first `.`,
/// e.g. `CONNECTION_ERROR` in `CONNECTION_ERROR.TIMEOUT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorClass {
    /// Transport-level failures reaching a source, destination, or broker.
    ConnectionError,
    /// Credential and authorization failures.
    AuthenticationError,
    /// Payloads that are malformed or violate their declared schema.
    DataError,
    /// Resource contention, exhaustion, or unavailability.
    ResourceError,
    /// Failures inside a transformation or export step.
    ProcessingError,
    /// Orchestrator-internal faults.
    SystemError,
    /// Version catalog and compatibility failures.
    VersionError,
    /// A worker service crashed mid-command.
    ComponentCrash,
    /// A merge fired with a strict subset of its expected inputs.
    PartialFailure,
    /// Faults raised while recovering in-flight executions.
    RecoveryError,
}

impl ErrorClass {
    /// The SCREAMING_SNAKE wire prefix for this class.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::DataError => "DATA_ERROR",
            Self::ResourceError => "RESOURCE_ERROR",
            Self::ProcessingError => "PROCESSING_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
            Self::VersionError => "VERSION_ERROR",
            Self::ComponentCrash => "COMPONENT_CRASH",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::RecoveryError => "RECOVERY_ERROR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECTION_ERROR" => Self::ConnectionError,
            "AUTHENTICATION_ERROR" => Self::AuthenticationError,
            "DATA_ERROR" => Self::DataError,
            "RESOURCE_ERROR" => Self::ResourceError,
            "PROCESSING_ERROR" => Self::ProcessingError,
            "SYSTEM_ERROR" => Self::SystemError,
            "VERSION_ERROR" => Self::VersionError,
            "COMPONENT_CRASH" => Self::ComponentCrash,
            "PARTIAL_FAILURE" => Self::PartialFailure,
            "RECOVERY_ERROR" => Self::RecoveryError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dotted error code: class prefix plus a free-form detail segment.
///
/// The taxonomy is extensible within a class - workers may report any
/// detail string under a known prefix and the orchestrator will carry it
/// through unchanged. Retry decisions only inspect the well-known codes
/// (see [`ErrorCode::is_retriable`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    class: ErrorClass,
    detail: String,
}

impl ErrorCode {
    /// Build a code from a class and detail segment.
    pub fn new(class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }

    /// `CONNECTION_ERROR.TIMEOUT` - no response from a remote endpoint.
    pub fn connection_timeout() -> Self {
        Self::new(ErrorClass::ConnectionError, "TIMEOUT")
    }

    /// `RESOURCE_ERROR.UNAVAILABLE` - a required resource is temporarily gone.
    pub fn resource_unavailable() -> Self {
        Self::new(ErrorClass::ResourceError, "UNAVAILABLE")
    }

    /// `RESOURCE_ERROR.CONFLICT` - an active-address reservation clash.
    pub fn resource_conflict() -> Self {
        Self::new(ErrorClass::ResourceError, "CONFLICT")
    }

    /// `PROCESSING_ERROR.PROCESSING_TIMEOUT` - a worker exceeded its deadline.
    pub fn processing_timeout() -> Self {
        Self::new(ErrorClass::ProcessingError, "PROCESSING_TIMEOUT")
    }

    /// `PROCESSING_ERROR.TRANSFORMATION_FAILED` - a transformation raised.
    pub fn transformation_failed() -> Self {
        Self::new(ErrorClass::ProcessingError, "TRANSFORMATION_FAILED")
    }

    /// The class prefix of this code.
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// The detail segment after the first `.`.
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Whether the scheduler may transparently retry a step failing with
    /// this code. Only the three codes called out by the propagation policy
    /// are retriable; everything else promotes to a branch failure once
    /// surfaced.
    pub fn is_retriable(&self) -> bool {
        matches!(
            (self.class, self.detail.as_str()),
            (ErrorClass::ConnectionError, "TIMEOUT")
                | (ErrorClass::ResourceError, "UNAVAILABLE")
                | (ErrorClass::ProcessingError, "PROCESSING_TIMEOUT")
        )
    }

    /// Whether this code is fatal to the whole execution rather than a
    /// single branch.
    pub fn is_execution_fatal(&self) -> bool {
        matches!(
            self.class,
            ErrorClass::SystemError | ErrorClass::RecoveryError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class, self.detail)
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, detail) = s
            .split_once('.')
            .ok_or_else(|| Error::InvalidErrorCode { code: s.to_string() })?;
        let class = ErrorClass::parse(prefix)
            .ok_or_else(|| Error::InvalidErrorCode { code: s.to_string() })?;
        if detail.is_empty() {
            return Err(Error::InvalidErrorCode { code: s.to_string() });
        }
        Ok(Self::new(class, detail))
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Severity attached to every reported error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Something to watch, no action required.
    Warning,
    /// Degraded but the execution can continue.
    Minor,
    /// A branch or step was lost.
    Major,
    /// The execution (or the orchestrator) is in trouble; alerts fire.
    Critical,
}

/// Identifiers locating an error within the flow hierarchy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Flow the error occurred in, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Execution the error occurred in, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Branch path within the execution, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_path: Option<String>,
    /// Step within the branch, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Version details of the component that produced an error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Service or entity id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// Declared version of that component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The structured error record carried in result messages, telemetry and
/// WAL entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Dotted taxonomy code.
    pub error_code: ErrorCode,
    /// Severity as judged by the reporting component.
    pub severity: Severity,
    /// Id of the component that raised the error.
    pub source: String,
    /// Flow/branch/step/execution ids locating the failure.
    #[serde(default)]
    pub context: ErrorContext,
    /// Human-readable description.
    pub message: String,
    /// When the error was raised.
    pub timestamp: DateTime<Utc>,
    /// Correlation id of the command this error answers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Version of the reporting component.
    #[serde(default)]
    pub version_info: VersionInfo,
}

impl ErrorRecord {
    /// Build a record with the current timestamp and empty context.
    pub fn new(
        error_code: ErrorCode,
        severity: Severity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_code,
            severity,
            source: source.into(),
            context: ErrorContext::default(),
            message: message.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            version_info: VersionInfo::default(),
        }
    }

    /// Attach flow/execution/branch/step ids.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Attach the correlation id of the command this error answers.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach the reporting component's version details.
    pub fn with_version_info(mut self, version_info: VersionInfo) -> Self {
        self.version_info = version_info;
        self
    }
}

/// Error type for orchestrator operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// A flow definition failed validation. The report carries the issues.
    #[error("flow '{flow_id}' failed validation with {issue_count} issue(s)")]
    Validation {
        /// The flow that was rejected.
        flow_id: String,
        /// Number of blocking issues found.
        issue_count: usize,
    },

    /// An active-address reservation clashed with a running execution.
    #[error("address '{address}' ({protocol} v{version}) is held by execution {holder}")]
    AddressConflict {
        /// Protocol of the contested address.
        protocol: String,
        /// The contested address.
        address: String,
        /// Version component of the reservation key.
        version: String,
        /// Execution currently holding the reservation.
        holder: String,
    },

    /// A memory address string did not match the wire form.
    #[error("malformed memory address '{address}': {reason}")]
    MalformedAddress {
        /// The offending address string.
        address: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A step id string did not match the wire form.
    #[error("malformed step id '{step_id}': {reason}")]
    MalformedStepId {
        /// The offending step id string.
        step_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An error-code string did not match `CLASS.DETAIL`.
    #[error("invalid error code '{code}'")]
    InvalidErrorCode {
        /// The offending code string.
        code: String,
    },

    /// Write to a memory address that already holds a live entry.
    #[error("memory address '{address}' already holds a live entry")]
    AddressOccupied {
        /// The address that was written twice.
        address: String,
    },

    /// Read of a memory address with no live entry.
    #[error("memory address '{address}' not found")]
    AddressNotFound {
        /// The missing address.
        address: String,
    },

    /// Lookup of an unknown flow definition.
    #[error("flow '{flow_id}' is not registered")]
    FlowNotFound {
        /// The unknown flow id.
        flow_id: String,
    },

    /// Lookup of an unknown execution.
    #[error("execution '{execution_id}' is not known to this orchestrator")]
    ExecutionNotFound {
        /// The unknown execution id.
        execution_id: String,
    },

    /// Lookup of an unknown service version in the catalog.
    #[error("service '{service_id}' v{version} is not in the version catalog")]
    ServiceNotFound {
        /// The unknown service id.
        service_id: String,
        /// The requested version.
        version: String,
    },

    /// Dispatch attempted while this replica is not the leader.
    #[error("this orchestrator replica is not the leader")]
    NotLeader,

    /// New work refused because shutdown is in progress.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// The scheduler's event queue closed unexpectedly.
    #[error("execution '{execution_id}' scheduler is gone")]
    SchedulerGone {
        /// The execution whose scheduler terminated.
        execution_id: String,
    },

    /// A command could not be handed to the broker.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        /// Topic the publish targeted.
        topic: String,
        /// Why it failed.
        reason: String,
    },

    /// A durable-state artifact failed its integrity check.
    #[error("durable state corrupted at {path}: {reason}")]
    CorruptState {
        /// Path of the corrupt artifact.
        path: String,
        /// Which integrity check failed.
        reason: String,
    },

    /// Recovery could not restore an execution.
    #[error("recovery of execution '{execution_id}' failed: {reason}")]
    Recovery {
        /// The execution that could not be restored.
        execution_id: String,
        /// Why recovery gave up.
        reason: String,
    },

    /// Merge could not produce an exporter input.
    #[error("merge at exporter '{step_id}' failed: {reason}")]
    Merge {
        /// The exporter step whose merge failed.
        step_id: String,
        /// Why the merge failed.
        reason: String,
    },

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error from the durable-state layer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary (de)serialization error from snapshots and the WAL.
    #[error("binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON (de)serialization error from payloads and definitions.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The taxonomy code this process-level error maps to when it must be
    /// reported outward as an [`ErrorRecord`].
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::new(ErrorClass::DataError, "VALIDATION"),
            Self::AddressConflict { .. } => ErrorCode::resource_conflict(),
            Self::MalformedAddress { .. } | Self::MalformedStepId { .. } | Self::Json(_) => {
                ErrorCode::new(ErrorClass::DataError, "MALFORMED")
            }
            Self::InvalidErrorCode { .. } => ErrorCode::new(ErrorClass::DataError, "MALFORMED"),
            Self::AddressOccupied { .. } => ErrorCode::new(ErrorClass::SystemError, "DOUBLE_WRITE"),
            Self::AddressNotFound { .. } => ErrorCode::new(ErrorClass::ResourceError, "NOT_FOUND"),
            Self::FlowNotFound { .. } | Self::ExecutionNotFound { .. } => {
                ErrorCode::new(ErrorClass::ResourceError, "NOT_FOUND")
            }
            Self::ServiceNotFound { .. } => ErrorCode::new(ErrorClass::VersionError, "UNKNOWN_SERVICE"),
            Self::NotLeader => ErrorCode::new(ErrorClass::SystemError, "NOT_LEADER"),
            Self::ShuttingDown => ErrorCode::new(ErrorClass::SystemError, "SHUTTING_DOWN"),
            Self::SchedulerGone { .. } => ErrorCode::new(ErrorClass::SystemError, "SCHEDULER_GONE"),
            Self::Publish { .. } => ErrorCode::resource_unavailable(),
            Self::CorruptState { .. } => ErrorCode::new(ErrorClass::RecoveryError, "CORRUPT_STATE"),
            Self::Recovery { .. } => ErrorCode::new(ErrorClass::RecoveryError, "UNRECOVERABLE"),
            Self::Merge { .. } => ErrorCode::new(ErrorClass::ProcessingError, "MERGE_FAILED"),
            Self::Config(_) => ErrorCode::new(ErrorClass::SystemError, "CONFIG"),
            Self::Io(_) => ErrorCode::new(ErrorClass::SystemError, "IO"),
            Self::Bincode(_) => ErrorCode::new(ErrorClass::SystemError, "SERIALIZATION"),
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;
