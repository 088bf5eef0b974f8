//! Retry strategy with exponential backoff for transient errors.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use docmirror_common::{Error, ErrorClass, Result};

use crate::circuit::CircuitBreakers;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap for exponential growth, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
    /// Hard timeout of a single attempt, in milliseconds.
    pub call_timeout_ms: u64,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            call_timeout_ms: 30_000,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout_ms = call_timeout.as_millis() as u64;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Calculate delay after the given zero-based failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// What happened while executing an operation with retries.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts that actually called the operation.
    pub attempts: u32,
    pub elapsed: Duration,
    /// The last refusal came from the circuit breaker, not the remote.
    pub circuit_rejected: bool,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// One-line description of a failure, for history records.
    pub fn failure_summary(&self) -> Option<String> {
        self.result.as_ref().err().map(|err| {
            if self.circuit_rejected && self.attempts == 0 {
                err.to_string()
            } else {
                format!(
                    "{} (after {} attempt(s) in {:?})",
                    err, self.attempts, self.elapsed
                )
            }
        })
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Retry executor for running remote calls with retry logic.
///
/// Every attempt is gated by the circuit breaker of its target and reports
/// its outcome back to it.
pub struct RetryExecutor {
    config: RetryConfig,
    breakers: Arc<CircuitBreakers>,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig, breakers: Arc<CircuitBreakers>) -> Self {
        Self { config, breakers }
    }

    /// Execute an operation against `target` with retry logic.
    ///
    /// Transient errors are retried with backoff up to `max_attempts` total
    /// attempts; anything else is returned after the first attempt.
    pub async fn execute<F, Fut, T>(&self, target: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let call_timeout = self.config.call_timeout();
        let mut attempts = 0;

        loop {
            if let Err(err) = self.breakers.try_acquire(target) {
                debug!("Call to {} rejected: {}", target, err);
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                    elapsed: started.elapsed(),
                    circuit_rejected: true,
                };
            }

            attempts += 1;
            let result = match timeout(call_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(call_timeout)),
            };

            let err = match result {
                Ok(value) => {
                    self.breakers.record_success(target);
                    if attempts > 1 {
                        debug!("Call to {} succeeded after {} attempts", target, attempts);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        elapsed: started.elapsed(),
                        circuit_rejected: false,
                    };
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                // The remote answered; only transient failures count against it.
                if err.class() == ErrorClass::Permanent {
                    self.breakers.record_success(target);
                }
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                    elapsed: started.elapsed(),
                    circuit_rejected: false,
                };
            }

            self.breakers.record_failure(target);
            if attempts >= self.config.max_attempts {
                warn!(
                    "Call to {} failed after {} attempts: {}",
                    target, attempts, err
                );
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                    elapsed: started.elapsed(),
                    circuit_rejected: false,
                };
            }

            let mut delay = self.config.delay_for_attempt(attempts - 1);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }
            warn!(
                "Attempt {} against {} failed: {}. Retrying in {:?}...",
                attempts, target, err, delay
            );
            sleep(delay).await;
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }
}
