//! Retry logic.
//!
//! # Responsibilities
//! - Run a forwarding attempt up to `attempts` times
//! - Decide whether an outcome is retryable (network, timeout, 5xx)
//! - Sleep the configured backoff between attempts
//! - Enforce the overall deadline and caller cancellation at every await
//!
//! # Design Decisions
//! - Explicit bounded loop with a 1-based attempt index
//! - The deadline is checked before every call and every sleep; a backoff
//!   that would outlive the deadline ends the loop with the last error
//! - Target selection happens inside each attempt, so a failing target is
//!   not retried directly
//! - 4xx responses are returned on first sight

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{BackoffKind, RetryConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::timeouts::Deadline;

/// Bounded retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub jitter: bool,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single() -> Self {
        Self {
            attempts: 1,
            backoff: BackoffKind::None,
            base_delay: Duration::ZERO,
            max_delay: None,
            jitter: false,
        }
    }

    /// Delay after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(
            self.backoff,
            attempt,
            self.base_delay.as_millis() as u64,
            self.max_delay.map(|d| d.as_millis() as u64),
            self.jitter,
        )
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            backoff: config.backoff,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: config.max_delay_ms.map(Duration::from_millis),
            jitter: config.jitter,
        }
    }
}

/// Drives attempts of one logical request.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    service: String,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, service: impl Into<String>) -> Self {
        Self {
            policy,
            service: service.into(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt(index, deadline)` until it succeeds, fails for good, the
    /// attempts run out, the deadline passes, or `cancel` fires.
    ///
    /// The attempt receives the overall deadline and is expected to bound its
    /// own call by `deadline.attempt_budget(..)`; the executor still caps
    /// each attempt at the deadline.
    pub async fn execute<T, F, Fut>(
        &self,
        deadline: Deadline,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> GatewayResult<T>
    where
        F: FnMut(u32, Deadline) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last_error: Option<GatewayError> = None;

        for index in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            if deadline.expired() {
                return Err(last_error.unwrap_or(GatewayError::UpstreamTimeout(deadline.limit())));
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                result = tokio::time::timeout_at(deadline.instant(), attempt(index, deadline)) => {
                    match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(GatewayError::UpstreamTimeout(deadline.limit())),
                    }
                }
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() {
                // Nothing left to select after an upstream failure: report
                // the upstream failure, not the empty pool.
                if error.is_selection_failure() {
                    if let Some(previous) = last_error {
                        tracing::debug!(
                            service = %self.service,
                            attempt = index,
                            reason = %error,
                            "No target for retry, returning last upstream error"
                        );
                        return Err(previous);
                    }
                }
                return Err(error);
            }

            if index == attempts {
                tracing::warn!(
                    service = %self.service,
                    attempts,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return Err(error);
            }

            let delay = self.policy.delay(index);
            if delay >= deadline.remaining() {
                tracing::warn!(
                    service = %self.service,
                    attempt = index,
                    delay_ms = delay.as_millis() as u64,
                    remaining_ms = deadline.remaining().as_millis() as u64,
                    error = %error,
                    "Backoff would exceed deadline, giving up"
                );
                return Err(error);
            }

            tracing::info!(
                service = %self.service,
                attempt = index,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after backoff"
            );
            metrics::record_retry(&self.service);
            last_error = Some(error);

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::UpstreamTimeout(deadline.limit())))
    }
}
