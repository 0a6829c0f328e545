//! Retry policy for connecting and for retrying commands.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// A sequence of waits between attempts.
pub trait Backoff: Send {
    /// The wait before the next attempt, or `None` to give up.
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Start the sequence over.
    fn reset(&mut self);
}

/// Exponential backoff policy.
///
/// The `n`th wait is `initial_interval * multiplier^n`, capped at
/// `max_interval`, then spread uniformly by `randomization_factor` in both
/// directions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoffPolicy {
    /// First wait.
    pub initial_interval: Duration,
    /// Growth factor between waits.
    pub multiplier: f64,
    /// Jitter as a fraction of the current interval, in `[0, 1]`.
    pub randomization_factor: f64,
    /// Cap on the un-jittered interval.
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first attempt.
    /// `None` retries forever.
    pub max_elapsed_time: Option<Duration>,
}

impl ExponentialBackoffPolicy {
    /// Set the first wait.
    #[must_use]
    pub const fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    /// Set the interval cap.
    #[must_use]
    pub const fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the total time budget.
    #[must_use]
    pub const fn with_max_elapsed_time(mut self, elapsed: Option<Duration>) -> Self {
        self.max_elapsed_time = elapsed;
        self
    }

    /// Begin a fresh sequence of waits.
    #[must_use]
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: self.clone(),
            current_interval: self.initial_interval,
            started: Instant::now(),
        }
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
        }
    }
}

/// Running state of an [`ExponentialBackoffPolicy`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: ExponentialBackoffPolicy,
    current_interval: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    fn jittered(&self, interval: Duration) -> Duration {
        let factor = self.policy.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return interval;
        }
        // Uniform in [interval * (1 - factor), interval * (1 + factor)].
        interval.mul_f64(fastrand::f64().mul_add(2.0 * factor, 1.0 - factor))
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_elapsed_time {
            if self.started.elapsed() > max {
                return None;
            }
        }

        let interval = self.current_interval.min(self.policy.max_interval);
        self.current_interval = interval
            .mul_f64(self.policy.multiplier.max(1.0))
            .min(self.policy.max_interval);
        Some(self.jittered(interval))
    }

    fn reset(&mut self) {
        self.current_interval = self.policy.initial_interval;
        self.started = Instant::now();
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or `backoff` gives up. `notify` sees each retried error and the
/// wait that follows it.
///
/// # Errors
///
/// Returns the last error from `operation`.
pub async fn retry_notify<T, E, B, F, Fut, C, N>(
    mut backoff: B,
    mut operation: F,
    should_retry: C,
    mut notify: N,
) -> Result<T, E>
where
    B: Backoff,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    N: FnMut(&E, Duration),
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempts, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }
                let Some(wait) = backoff.next_backoff() else {
                    debug!(attempts, "Backoff exhausted; giving up");
                    return Err(err);
                };
                notify(&err, wait);
                tokio::time::sleep(wait).await;
            }
        }
    }
}
