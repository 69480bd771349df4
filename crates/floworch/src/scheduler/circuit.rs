// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-service circuit breaker.
//!
//! Scoped to one execution and keyed by `(service id, version)`: after
//! `threshold` consecutive failures of the same service the circuit opens
//! and dispatches to it fail fast until the cooldown elapses. A single
//! success closes it again.

use std::time::{Duration, Instant};

/// Circuit state for one service within one execution.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    /// A closed breaker.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// Whether dispatches should fail fast right now.
    pub fn is_open(&self, now: Instant) -> bool {
        self.open_until.map_or(false, |until| now < until)
    }

    /// Record a failure; returns true if this one opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold && !self.is_open(now) {
            self.open_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    /// Record a success, closing the circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    /// Consecutive failures seen so far.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
