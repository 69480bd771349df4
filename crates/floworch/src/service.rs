// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Worker service contract.
//!
//! Worker internals are out of scope for the orchestrator; what is
//! specified here is the seam they implement. Instead of a deep service
//! class hierarchy there are three small capability traits - a worker
//! implements whichever subset it supports - plus the shared lifecycle
//! state machine every worker advertises.
//!
//! Handlers are pure over their inputs: the hosting harness resolves
//! memory addresses to payload bytes before calling, and wraps the return
//! value into a [`crate::messaging::ResultEnvelope`]. A failing handler
//! returns an [`ErrorRecord`], not a transport error - worker failure is
//! a successfully delivered result.

use crate::error::ErrorRecord;
use crate::messaging::{CommandEnvelope, ExportCommand, ImportCommand, ProcessCommand};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Outcome of a worker handler: produced payload bytes or a structured
/// failure.
pub type WorkerOutcome = std::result::Result<Vec<u8>, ErrorRecord>;

/// Can execute [`ImportCommand`]s.
#[async_trait]
pub trait ImportCapable: Send + Sync {
    /// Read the source entity and return the imported payload.
    async fn handle_import(&self, envelope: &CommandEnvelope, command: &ImportCommand)
        -> WorkerOutcome;
}

/// Can execute [`ProcessCommand`]s.
#[async_trait]
pub trait ProcessCapable: Send + Sync {
    /// Transform the resolved input payloads into an output payload.
    async fn handle_process(
        &self,
        envelope: &CommandEnvelope,
        command: &ProcessCommand,
        inputs: &[Arc<Vec<u8>>],
    ) -> WorkerOutcome;
}

/// Can execute [`ExportCommand`]s.
#[async_trait]
pub trait ExportCapable: Send + Sync {
    /// Write the resolved input payload to the destination entity.
    async fn handle_export(
        &self,
        envelope: &CommandEnvelope,
        command: &ExportCommand,
        input: &Arc<Vec<u8>>,
    ) -> std::result::Result<(), ErrorRecord>;
}

/// Lifecycle states every worker service advertises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Constructed, nothing loaded.
    Uninitialized,
    /// Configuration loaded, connections not yet opened.
    Initialized,
    /// Idle and able to accept a command.
    Ready,
    /// Currently executing a command.
    Processing,
    /// Faulted; requires re-initialization or termination.
    Error,
    /// Shut down for good.
    Terminated,
}

impl ServiceState {
    /// Legal transitions of the lifecycle machine.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Uninitialized, Initialized)
                | (Initialized, Ready)
                | (Ready, Processing)
                | (Processing, Ready)
                | (Ready, Terminated)
                | (Initialized, Terminated)
                | (Error, Initialized)
                | (Error, Terminated)
                | (Uninitialized, Terminated)
        ) || (next == Error && !matches!(self, Terminated))
    }
}

/// An illegal lifecycle transition.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("illegal service transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    /// State the service was in.
    pub from: ServiceState,
    /// State that was requested.
    pub to: ServiceState,
}

/// Reusable lifecycle state, composed into worker hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceLifecycle {
    state: ServiceState,
}

impl Default for ServiceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLifecycle {
    /// A fresh, uninitialized lifecycle.
    pub fn new() -> Self {
        Self {
            state: ServiceState::Uninitialized,
        }
    }

    /// Current state.
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Apply a transition, rejecting illegal ones.
    pub fn transition(&mut self, to: ServiceState) -> std::result::Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_lifecycle() {
        let mut lifecycle = ServiceLifecycle::new();
        for state in [
            ServiceState::Initialized,
            ServiceState::Ready,
            ServiceState::Processing,
            ServiceState::Ready,
            ServiceState::Terminated,
        ] {
            lifecycle.transition(state).unwrap();
        }
        assert_eq!(lifecycle.state(), ServiceState::Terminated);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut lifecycle = ServiceLifecycle::new();
        // Cannot go straight to Ready.
        let err = lifecycle.transition(ServiceState::Ready).unwrap_err();
        assert_eq!(err.from, ServiceState::Uninitialized);

        // Terminated is final, even for Error.
        lifecycle.transition(ServiceState::Terminated).unwrap();
        assert!(lifecycle.transition(ServiceState::Error).is_err());
        assert!(lifecycle.transition(ServiceState::Initialized).is_err());
    }

    #[test]
    fn test_error_is_reachable_from_any_live_state() {
        for from in [
            ServiceState::Uninitialized,
            ServiceState::Initialized,
            ServiceState::Ready,
            ServiceState::Processing,
        ] {
            assert!(from.can_transition_to(ServiceState::Error), "{from:?}");
        }
        // And recoverable via re-initialization.
        let mut lifecycle = ServiceLifecycle::new();
        lifecycle.transition(ServiceState::Error).unwrap();
        lifecycle.transition(ServiceState::Initialized).unwrap();
        assert_eq!(lifecycle.state(), ServiceState::Initialized);
    }
}
