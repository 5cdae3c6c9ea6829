//! Circuit breaker around store access.
//!
//! Counts consecutive failed flush cycles. Once open, regular cycles are
//! skipped until the reset timeout passes, so a dead store is not hammered
//! and queued records keep their remaining attempts.

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Cycles proceed normally
    Closed,
    /// Cycles are skipped
    Open,
    /// One probe cycle is allowed through
    HalfOpen,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for the relational store.
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a cycle may touch the store. Moves an expired open breaker
    /// to half-open.
    pub fn is_allowed(&self) -> bool {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if expired {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    info!("Store circuit breaker half-open, probing");
                }
                expired
            }
        }
    }

    /// Record a cycle that reached the store successfully.
    pub fn record_success(&self) {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                    info!("Store circuit breaker closed (recovered)");
                }
            }
            CircuitState::Open => state.failure_count = 0,
        }
    }

    /// Record a cycle that failed to reach or commit to the store.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(
                        failures = state.failure_count,
                        reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                        "Store circuit breaker opened"
                    );
                } else {
                    debug!(
                        failures = state.failure_count,
                        threshold = self.failure_threshold,
                        "Store circuit breaker recorded failure"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.success_count = 0;
                state.opened_at = Some(Instant::now());
                warn!("Store circuit breaker reopened from half-open state");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Consecutive failures recorded.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Time left before an open breaker allows a probe.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let state = self.state.lock();
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(at)) => Some(self.reset_timeout.saturating_sub(at.elapsed())),
            _ => None,
        }
    }
}
