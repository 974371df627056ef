//! Per-key circuit breaker.
//!
//! - **Closed**: connect attempts pass through
//! - **Open**: attempts fail fast until the open duration elapses
//! - **HalfOpen**: one trial attempt decides between Closed and Open
//!
//! The breaker lives inside the pool's per-key state and is only touched
//! under that lock, so it needs no synchronization of its own.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::settings::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    /// Start of the half-open trial; a trial older than the open duration
    /// counts as abandoned
    trial_started: Option<Instant>,
    open_count: u64,
}

impl CircuitBreaker {
    pub fn new(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            open_duration: Duration::from_millis(settings.open_duration_ms),
            state: CircuitState::Closed,
            opened_at: None,
            consecutive_failures: 0,
            trial_started: None,
            open_count: 0,
        }
    }

    /// Current state, with an elapsed open window reported as half-open
    pub fn state(&self) -> CircuitState {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) if opened_at.elapsed() >= self.open_duration => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn open_count(&self) -> u64 {
        self.open_count
    }

    /// `Err(retry_after)` if the attempt must not be made.
    pub fn allow_request(&mut self) -> Result<(), Duration> {
        if self.state() == CircuitState::HalfOpen && self.state == CircuitState::Open {
            tracing::info!("Circuit breaker half-open, allowing a trial connect");
            self.state = CircuitState::HalfOpen;
            self.trial_started = None;
        }

        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(self.retry_after()),
            CircuitState::HalfOpen => match self.trial_started {
                Some(started) if started.elapsed() < self.open_duration => {
                    Err(self.open_duration.saturating_sub(started.elapsed()))
                }
                _ => {
                    self.trial_started = Some(Instant::now());
                    Ok(())
                }
            },
        }
    }

    fn retry_after(&self) -> Duration {
        self.opened_at
            .map(|t| self.open_duration.saturating_sub(t.elapsed()))
            .unwrap_or(self.open_duration)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state != CircuitState::Closed {
            tracing::info!("Circuit breaker closing after a successful trial");
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.trial_started = None;
    }

    /// Returns true if this failure opened the circuit
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let opens = match self.state {
            CircuitState::Closed => self.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                false
            }
        };

        if opens {
            self.state = CircuitState::Open;
            self.opened_at = Some(Instant::now());
            self.trial_started = None;
            self.open_count += 1;
            tracing::warn!(
                consecutive_failures = self.consecutive_failures,
                threshold = self.failure_threshold,
                open_duration_ms = self.open_duration.as_millis() as u64,
                "Circuit breaker opening"
            );
        }
        opens
    }
}
