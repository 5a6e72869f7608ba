//! Per-device circuit breaker.
//!
//! States are explicit tagged values in a table keyed by device id. All
//! transitions take the current instant from the caller so they can be
//! driven deterministically in tests.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    /// One trial request is in flight.
    HalfOpen { trial_started: Instant },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::Closed { consecutive_failures: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The caller is the half-open trial.
    Trial,
    Rejected { retry_in: Duration },
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened,
    Reopened,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub device_id: i64,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub open_for_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreakerTable {
    threshold: u32,
    open_timeout: Duration,
    states: HashMap<i64, CircuitState>,
}

impl CircuitBreakerTable {
    pub fn new(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_timeout,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, device_id: i64) -> CircuitState {
        self.states.get(&device_id).copied().unwrap_or_default()
    }

    pub fn admit(&mut self, device_id: i64, now: Instant) -> Admission {
        let state = self.states.entry(device_id).or_default();
        match *state {
            CircuitState::Closed { .. } => Admission::Allowed,
            CircuitState::Open { opened_at } => {
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.open_timeout {
                    *state = CircuitState::HalfOpen { trial_started: now };
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: self.open_timeout - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen { trial_started } => {
                // A trial that never reported back does not wedge the breaker.
                let elapsed = now.saturating_duration_since(trial_started);
                if elapsed >= self.open_timeout {
                    *state = CircuitState::HalfOpen { trial_started: now };
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: self.open_timeout - elapsed,
                    }
                }
            }
        }
    }

    pub fn on_success(&mut self, device_id: i64) {
        self.states.insert(device_id, CircuitState::default());
    }

    pub fn on_failure(&mut self, device_id: i64, now: Instant) -> Transition {
        let threshold = self.threshold;
        let state = self.states.entry(device_id).or_default();
        match *state {
            CircuitState::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= threshold {
                    *state = CircuitState::Open { opened_at: now };
                    Transition::Opened
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                    Transition::None
                }
            }
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Open { opened_at: now };
                Transition::Reopened
            }
            CircuitState::Open { .. } => Transition::None,
        }
    }

    pub fn reset(&mut self, device_id: i64) {
        self.states.remove(&device_id);
    }

    pub fn snapshot(&self, now: Instant) -> Vec<BreakerStatus> {
        let mut out: Vec<BreakerStatus> = self
            .states
            .iter()
            .map(|(device_id, state)| BreakerStatus {
                device_id: *device_id,
                state: state.name(),
                consecutive_failures: match state {
                    CircuitState::Closed { consecutive_failures } => *consecutive_failures,
                    _ => self.threshold,
                },
                open_for_ms: match state {
                    CircuitState::Open { opened_at } => {
                        Some(now.saturating_duration_since(*opened_at).as_millis() as u64)
                    }
                    _ => None,
                },
            })
            .collect();
        out.sort_by_key(|s| s.device_id);
        out
    }
}
