// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Orchestrator configuration.
//!
//! Every knob has a serde default, so an empty TOML document is a valid
//! configuration. Flow definitions may override retry settings per step;
//! everything else is process-wide.

use crate::definition::RetryPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Circuit-breaker settings applied per `(service id, version)` within an
/// execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_circuit_threshold")]
    pub threshold: u32,
    /// How long an open circuit fails fast before a probe is allowed.
    #[serde(default = "default_circuit_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_circuit_threshold(),
            cooldown_ms: default_circuit_cooldown_ms(),
        }
    }
}

/// Recovery-specific deadlines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How long recovery waits for a delayed result before re-dispatching
    /// an in-flight step.
    #[serde(default = "default_result_wait_ms")]
    pub result_wait_ms: u64,
    /// Deadline stamped on re-dispatched commands.
    #[serde(default = "default_redispatch_deadline_ms")]
    pub redispatch_deadline_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            result_wait_ms: default_result_wait_ms(),
            redispatch_deadline_ms: default_redispatch_deadline_ms(),
        }
    }
}

/// Process-wide orchestrator settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding per-execution WAL streams and snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Default retry policy for steps without an override.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Recovery deadlines.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Default command deadline.
    #[serde(default = "default_command_deadline_ms")]
    pub command_deadline_ms: u64,
    /// Grace window zero-reference memory entries linger for.
    #[serde(default = "default_memory_grace_ms")]
    pub memory_grace_ms: u64,
    /// Applied transitions between snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u32,
    /// Whether `ANY` merges cancel losing branches unless the merge spec
    /// says otherwise.
    #[serde(default)]
    pub cancel_losers_default: bool,
    /// How often the bus adapter scans for expired command deadlines.
    #[serde(default = "default_deadline_sweep_ms")]
    pub deadline_sweep_ms: u64,
    /// How often the memory store sweeps expired entries.
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            recovery: RecoveryConfig::default(),
            command_deadline_ms: default_command_deadline_ms(),
            memory_grace_ms: default_memory_grace_ms(),
            snapshot_interval: default_snapshot_interval(),
            cancel_losers_default: false,
            deadline_sweep_ms: default_deadline_sweep_ms(),
            gc_interval_ms: default_gc_interval_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a TOML file from disk.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Default command deadline as a [`Duration`].
    pub fn command_deadline(&self) -> Duration {
        Duration::from_millis(self.command_deadline_ms)
    }

    /// Memory grace window as a [`Duration`].
    pub fn memory_grace(&self) -> Duration {
        Duration::from_millis(self.memory_grace_ms)
    }

    /// Circuit cooldown as a [`Duration`].
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker.cooldown_ms)
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("floworch-state")
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_result_wait_ms() -> u64 {
    2_000
}

fn default_redispatch_deadline_ms() -> u64 {
    30_000
}

fn default_command_deadline_ms() -> u64 {
    60_000
}

fn default_memory_grace_ms() -> u64 {
    120_000
}

fn default_snapshot_interval() -> u32 {
    16
}

fn default_deadline_sweep_ms() -> u64 {
    50
}

fn default_gc_interval_ms() -> u64 {
    10_000
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.circuit_breaker.threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_override() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            command_deadline_ms = 5000
            cancel_losers_default = true

            [circuit_breaker]
            threshold = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.command_deadline_ms, 5_000);
        assert!(config.cancel_losers_default);
        assert_eq!(config.circuit_breaker.threshold, 2);
        // Untouched keys keep their defaults.
        assert_eq!(config.circuit_breaker.cooldown_ms, 30_000);
        assert_eq!(config.snapshot_interval, 16);
    }

    #[test]
    fn test_malformed_toml_is_a_config_error() {
        assert!(matches!(
            OrchestratorConfig::from_toml_str("not toml at all ["),
            Err(Error::Config(_))
        ));
    }
}
