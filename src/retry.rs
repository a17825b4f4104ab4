//! Capped exponential backoff and classified retry.
//!
//! This module provides the retry machinery shared by the readiness gate,
//! the exec stream recovery, and cluster bootstrap waits. A schedule is a
//! pure description ([`BackoffConfig`]); whether a given failure is worth
//! another attempt is decided per call site by a classifier returning
//! [`RetryClass`], so the same schedule shape serves different failure
//! classes.
//!
//! # Example
//!
//! ```ignore
//! use testclusters::retry::{retry_classified, BackoffConfig, RetryClass};
//!
//! let result = retry_classified(
//!     &BackoffConfig::default(),
//!     "fetch_service_account",
//!     |err| match err {
//!         Error::Kube(kube::Error::Api(ae)) if ae.code == 404 => RetryClass::Retryable,
//!         _ => RetryClass::Terminal,
//!     },
//!     || async { api.get("default").await.map_err(Error::from) },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// A capped exponential retry schedule.
///
/// The schedule itself performs no I/O; [`retry_classified`] sleeps between
/// attempts on the caller's task. Invariants: `initial_delay > 0`,
/// `multiplier >= 1`, `max_steps >= 1`. The cumulative time slept across all
/// steps never exceeds `total_cap`.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Exponential growth factor applied per attempt
    pub multiplier: f64,
    /// Jitter applied to each delay as a +/- fraction (0.0 disables jitter)
    pub jitter_fraction: f64,
    /// Maximum number of attempts before the last error is surfaced
    pub max_steps: u32,
    /// Hard cap on cumulative sleep time across all attempts
    pub total_cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1500),
            multiplier: 1.5,
            jitter_fraction: 0.0,
            max_steps: 20,
            total_cap: Duration::from_secs(3 * 60),
        }
    }
}

impl BackoffConfig {
    /// The un-jittered delay that follows `attempt` (0-based).
    ///
    /// Monotonically non-decreasing in `attempt` for `multiplier >= 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor)
    }

    /// Apply the configured jitter to a delay
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_fraction..1.0 + self.jitter_fraction);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Whether a failed attempt is worth repeating.
///
/// Returned by the per-call-site classifier instead of relying on dynamic
/// inspection of error values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient; try again under the schedule
    Retryable,
    /// Permanent; surface immediately
    Terminal,
}

/// Execute an async operation under a backoff schedule.
///
/// Each failure is passed to `classify`: a [`RetryClass::Terminal`] failure
/// is returned immediately with zero further attempts, a
/// [`RetryClass::Retryable`] one is retried until `max_steps` attempts have
/// run or the cumulative sleep would exceed `total_cap`, at which point the
/// last error is returned.
pub async fn retry_classified<F, Fut, T, E, C>(
    config: &BackoffConfig,
    operation_name: &str,
    classify: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> RetryClass,
{
    let mut slept = Duration::ZERO;
    let max_steps = config.max_steps.max(1);

    for attempt in 0..max_steps {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if classify(&e) == RetryClass::Terminal {
                    error!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Operation failed with terminal error"
                    );
                    return Err(e);
                }
                if attempt + 1 >= max_steps {
                    error!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let remaining = config.total_cap.saturating_sub(slept);
                if remaining.is_zero() {
                    error!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Operation failed after exhausting backoff time cap"
                    );
                    return Err(e);
                }
                let delay = config.jittered(config.delay_for(attempt)).min(remaining);

                warn!(
                    operation = %operation_name,
                    attempt = attempt + 1,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
                slept += delay;
            }
        }
    }

    unreachable!("retry loop returns from within its final attempt")
}

/// Re-invoke a single-shot convergence check until it succeeds or a
/// wall-clock timeout elapses.
///
/// The check stays side-effect free; this helper only loops it at a fixed
/// interval. On timeout the check's last error is returned, so assertion
/// failures read as the unmet expectation rather than a generic timeout.
pub async fn poll_until<F, Fut, T, E>(
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = tokio::time::Instant::now();
    loop {
        match check().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if started.elapsed() + interval > timeout {
                    warn!(error = %e, "Convergence check did not pass within timeout");
                    return Err(e);
                }
                tokio::time::sleep(interval).await;
            }
        }
    }
}
