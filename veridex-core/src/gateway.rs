//! Resilient access to external dependencies.
//!
//! Every call to an embedding or generation provider goes through a
//! [`ResilientGateway`]: a circuit breaker gates admission, each attempt
//! runs under a timeout, and transient failures are retried with
//! exponential backoff. When the circuit is open, calls fail fast with
//! [`GatewayError::CircuitOpen`] without touching the dependency.

use rand::Rng;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{GatewayError, ProviderError};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// Closed admits all calls. After `failure_threshold` consecutive failures
/// the circuit opens and rejects calls for `cooldown`; the first call after
/// the cooldown runs as a half-open trial. A successful trial closes the
/// circuit and resets the count; a failed trial reopens it for a full
/// cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed right now. An open circuit whose cooldown
    /// has elapsed transitions to half-open and admits the trial call.
    pub fn is_call_permitted(&self) -> bool {
        let mut state = self.state.lock().expect("circuit lock poisoned");
        match *state {
            CircuitState::Closed { .. } | CircuitState::HalfOpen => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    *state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("circuit lock poisoned");
        *state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("circuit lock poisoned");
        *state = match *state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    CircuitState::Open {
                        since: Instant::now(),
                    }
                } else {
                    CircuitState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed half-open trial reopens for a full cooldown.
            CircuitState::HalfOpen | CircuitState::Open { .. } => CircuitState::Open {
                since: Instant::now(),
            },
        };
    }

    pub fn is_open(&self) -> bool {
        !self.is_call_permitted()
    }
}

/// Retry policy plus circuit breaker for one named dependency.
#[derive(Debug)]
pub struct ResilientGateway {
    dependency: &'static str,
    breaker: CircuitBreaker,
    max_attempts: u32,
    backoff_base: Duration,
    attempt_timeout: Duration,
}

impl ResilientGateway {
    pub fn new(
        dependency: &'static str,
        failure_threshold: u32,
        cooldown: Duration,
        max_attempts: u32,
        backoff_base: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            dependency,
            breaker: CircuitBreaker::new(failure_threshold, cooldown),
            max_attempts: max_attempts.max(1),
            backoff_base,
            attempt_timeout,
        }
    }

    pub fn dependency(&self) -> &'static str {
        self.dependency
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `make_call` under the gateway policy.
    ///
    /// Each attempt checks the circuit, runs under the per-attempt timeout,
    /// and feeds its outcome back into the breaker. Transient errors
    /// (timeouts, unavailability) are retried with exponential backoff and
    /// jitter; non-transient provider errors are returned unchanged on the
    /// first occurrence so callers can react to them (for example a
    /// malformed-output retry with a stricter prompt).
    pub async fn call<T, F, Fut>(&self, make_call: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_message = String::new();

        for attempt in 0..self.max_attempts {
            if !self.breaker.is_call_permitted() {
                warn!(
                    dependency = self.dependency,
                    "circuit open, failing fast"
                );
                return Err(GatewayError::CircuitOpen {
                    dependency: self.dependency.to_string(),
                });
            }

            let outcome = tokio::time::timeout(self.attempt_timeout, make_call()).await;
            let error = match outcome {
                Ok(Ok(value)) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => ProviderError::Timeout {
                    timeout_ms: self.attempt_timeout.as_millis() as u64,
                },
            };

            if !error.is_transient() {
                // The dependency answered; this is not a liveness failure.
                return Err(GatewayError::Provider {
                    dependency: self.dependency.to_string(),
                    source: error,
                });
            }

            self.breaker.record_failure();
            last_message = error.to_string();
            debug!(
                dependency = self.dependency,
                attempt,
                error = %error,
                "transient failure"
            );

            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
        }

        Err(GatewayError::DependencyUnavailable {
            dependency: self.dependency.to_string(),
            attempts: self.max_attempts,
            message: last_message,
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let base = self
            .backoff_base
            .saturating_mul(1u32 << shift)
            .min(MAX_BACKOFF);
        let jitter_ms = if self.backoff_base.as_millis() > 0 {
            rand::thread_rng().gen_range(0..self.backoff_base.as_millis() as u64)
        } else {
            0
        };
        base + Duration::from_millis(jitter_ms)
    }
}
