use serde::Deserialize;
use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Attempts made after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    5.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = self.initial_delay * self.backoff_multiplier.powi(attempt as i32);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = vec![];
        if !(self.initial_delay >= 0.0 && self.initial_delay.is_finite()) {
            problems.push("retry_policy: initial_delay must be a non-negative number".to_string());
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            problems.push("retry_policy: backoff_multiplier must be at least 1".to_string());
        }
        problems
    }
}

/// Runs `op` until it succeeds or `policy.max_retries` retries have failed,
/// sleeping on the current thread between attempts. The last error is
/// returned unchanged.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    with_retry_using(policy, thread::sleep, op)
}

pub fn with_retry_using<T, E, F, S>(policy: &RetryPolicy, mut sleep: S, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
    S: FnMut(Duration),
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    "attempt failed: {}, retrying in {:.1}s",
                    err,
                    delay.as_secs_f64()
                );
                sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
