//! Per-target circuit breakers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use docmirror_common::{Clock, Error, Result};

/// Thresholds of the breaker state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Failures within one window that open the circuit.
    pub failure_threshold: u32,
    /// Length of the failure counting window, in seconds.
    pub window_secs: u64,
    /// Time an open circuit rejects calls before probing, in seconds.
    pub cooldown_secs: u64,
    /// Trial calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl CircuitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
            half_open_max_calls: 1,
        }
    }
}

/// Breaker state of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Counters of one target's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    /// Failures counted in the current window.
    pub failures: u32,
    pub window_start: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    /// Trial calls admitted since entering half-open.
    pub trials_issued: u32,
    /// Trial calls that succeeded since entering half-open.
    pub trial_successes: u32,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failures: 0,
            window_start: None,
            opened_at: None,
            trials_issued: 0,
            trial_successes: 0,
        }
    }
}

impl CircuitState {
    fn open(&mut self, now: DateTime<Utc>) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(now);
        self.trials_issued = 0;
        self.trial_successes = 0;
    }
}

/// Registry of breakers keyed by target.
///
/// Every report is a single mutation under one lock, so concurrent calls
/// against the same target cannot lose updates.
pub struct CircuitBreakers {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    targets: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreakers {
    /// Create an empty registry.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn targets(&self) -> MutexGuard<'_, HashMap<String, CircuitState>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask for permission to call `target`.
    ///
    /// # Errors
    /// - `Error::CircuitOpen` while the circuit is open, or half-open with
    ///   all trial calls already handed out
    pub fn try_acquire(&self, target: &str) -> Result<()> {
        let now = self.clock.now();
        let mut targets = self.targets();
        let state = targets.entry(target.to_string()).or_default();

        if state.status == CircuitStatus::Open {
            let reopen_at = state.opened_at.map(|at| at + to_chrono(self.config.cooldown()));
            match reopen_at {
                Some(at) if now < at => {
                    return Err(Error::CircuitOpen(target.to_string()));
                }
                _ => {
                    info!("Circuit for {} is half-open", target);
                    state.status = CircuitStatus::HalfOpen;
                    state.trials_issued = 0;
                    state.trial_successes = 0;
                }
            }
        }

        if state.status == CircuitStatus::HalfOpen {
            if state.trials_issued >= self.config.half_open_max_calls {
                return Err(Error::CircuitOpen(target.to_string()));
            }
            state.trials_issued += 1;
            debug!(
                "Trial call {} of {} admitted for {}",
                state.trials_issued, self.config.half_open_max_calls, target
            );
        }

        Ok(())
    }

    /// Report a call that got an answer from the remote.
    pub fn record_success(&self, target: &str) {
        let mut targets = self.targets();
        let state = targets.entry(target.to_string()).or_default();

        if state.status == CircuitStatus::HalfOpen {
            state.trial_successes += 1;
            if state.trial_successes >= self.config.half_open_max_calls {
                info!("Circuit for {} closed after successful trial", target);
                *state = CircuitState::default();
            }
        }
    }

    /// Report a transient failure.
    pub fn record_failure(&self, target: &str) {
        let now = self.clock.now();
        let window = to_chrono(self.config.window());
        let mut targets = self.targets();
        let state = targets.entry(target.to_string()).or_default();

        match state.status {
            CircuitStatus::Closed => {
                let expired = state
                    .window_start
                    .map(|start| now - start >= window)
                    .unwrap_or(true);
                if expired {
                    state.window_start = Some(now);
                    state.failures = 0;
                }
                state.failures += 1;
                if state.failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit for {} opened after {} failures",
                        target, state.failures
                    );
                    state.open(now);
                }
            }
            CircuitStatus::HalfOpen => {
                warn!("Trial call for {} failed, circuit reopened", target);
                state.failures += 1;
                state.open(now);
            }
            // Late report from a call admitted before the circuit opened.
            CircuitStatus::Open => {
                state.failures += 1;
            }
        }
    }

    /// Current state of a target; unknown targets are closed.
    pub fn snapshot(&self, target: &str) -> CircuitState {
        self.targets().get(target).cloned().unwrap_or_default()
    }

    /// Current state of a target after applying any due cooldown.
    pub fn status(&self, target: &str) -> CircuitStatus {
        let state = self.snapshot(target);
        match (state.status, state.opened_at) {
            (CircuitStatus::Open, Some(at))
                if self.clock.now() >= at + to_chrono(self.config.cooldown()) =>
            {
                CircuitStatus::HalfOpen
            }
            (status, _) => status,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmirror_common::ManualClock;

    fn breakers(clock: Arc<ManualClock>) -> CircuitBreakers {
        CircuitBreakers::new(CircuitConfig::default(), clock)
    }

    #[test]
    fn test_opens_at_threshold() {
        let clock = Arc::new(ManualClock::default());
        let breakers = breakers(clock.clone());

        for _ in 0..4 {
            breakers.record_failure("tasks");
        }
        assert_eq!(breakers.snapshot("tasks").status, CircuitStatus::Closed);
        assert!(breakers.try_acquire("tasks").is_ok());

        breakers.record_failure("tasks");
        let state = breakers.snapshot("tasks");
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.failures, 5);
        assert!(matches!(
            breakers.try_acquire("tasks"),
            Err(Error::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let clock = Arc::new(ManualClock::default());
        let breakers = breakers(clock.clone());

        for _ in 0..4 {
            breakers.record_failure("tasks");
        }
        clock.advance(Duration::from_secs(61));
        breakers.record_failure("tasks");

        let state = breakers.snapshot("tasks");
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failures, 1);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let clock = Arc::new(ManualClock::default());
        let breakers = breakers(clock.clone());
        for _ in 0..5 {
            breakers.record_failure("tasks");
        }

        clock.advance(Duration::from_secs(29));
        assert!(breakers.try_acquire("tasks").is_err());

        clock.advance(Duration::from_secs(1));
        assert_eq!(breakers.status("tasks"), CircuitStatus::HalfOpen);
        assert!(breakers.try_acquire("tasks").is_ok());
        assert!(breakers.try_acquire("tasks").is_err());
        assert_eq!(breakers.snapshot("tasks").trials_issued, 1);
    }

    #[test]
    fn test_successful_trial_closes() {
        let clock = Arc::new(ManualClock::default());
        let breakers = breakers(clock.clone());
        for _ in 0..5 {
            breakers.record_failure("tasks");
        }
        clock.advance(Duration::from_secs(30));

        breakers.try_acquire("tasks").unwrap();
        breakers.record_success("tasks");

        let state = breakers.snapshot("tasks");
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failures, 0);
        assert!(breakers.try_acquire("tasks").is_ok());
    }

    #[test]
    fn test_failed_trial_reopens_with_new_timestamp() {
        let clock = Arc::new(ManualClock::default());
        let breakers = breakers(clock.clone());
        for _ in 0..5 {
            breakers.record_failure("tasks");
        }
        let first_open = breakers.snapshot("tasks").opened_at;

        clock.advance(Duration::from_secs(30));
        breakers.try_acquire("tasks").unwrap();
        breakers.record_failure("tasks");

        let state = breakers.snapshot("tasks");
        assert_eq!(state.status, CircuitStatus::Open);
        assert!(state.opened_at > first_open);
        assert!(breakers.try_acquire("tasks").is_err());
    }

    #[test]
    fn test_targets_are_independent() {
        let clock = Arc::new(ManualClock::default());
        let breakers = breakers(clock);
        for _ in 0..5 {
            breakers.record_failure("tasks");
        }
        assert!(breakers.try_acquire("calendar").is_ok());
        assert_eq!(breakers.snapshot("calendar"), CircuitState::default());
    }

    #[test]
    fn test_multiple_trials_must_all_succeed() {
        let clock = Arc::new(ManualClock::default());
        let config = CircuitConfig {
            half_open_max_calls: 2,
            ..Default::default()
        };
        let breakers = CircuitBreakers::new(config, clock.clone());
        for _ in 0..5 {
            breakers.record_failure("tasks");
        }
        clock.advance(Duration::from_secs(30));

        breakers.try_acquire("tasks").unwrap();
        breakers.try_acquire("tasks").unwrap();
        breakers.record_success("tasks");
        assert_eq!(breakers.snapshot("tasks").status, CircuitStatus::HalfOpen);

        breakers.record_success("tasks");
        assert_eq!(breakers.snapshot("tasks").status, CircuitStatus::Closed);
    }
}
