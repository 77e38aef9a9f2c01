//! Bounded exponential backoff for service calls that answer "try again later".
//!
//! The wait before retrying attempt `n` is `min(retry_after, base_delay * 2^n)`,
//! where `retry_after` is the bound supplied by the server (or a caller
//! default). A policy with `max_attempts = Some(m)` allows waits while
//! `n < m`; the attempt that reaches `m` fails with [`RetryExhausted`].
//!
//! Sleeping goes through the [`Sleeper`] trait so that callers (and tests) can
//! observe every wait without blocking in real time.
//!
//! # Example
//!
//! ```
//! use fabric_deploy_retry::BackoffProfile;
//! use std::time::Duration;
//!
//! let throttle = BackoffProfile::Throttle.to_policy();
//! assert_eq!(
//!     throttle.delay_for(1, Duration::from_secs(60)),
//!     Duration::from_secs(20)
//! );
//! assert!(throttle.allows(4));
//! assert!(!throttle.allows(5));
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix used for nested progress lines.
pub const INDENT: &str = "->";

/// Predefined backoff policies for the waits the deployment core performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffProfile {
    /// HTTP 429 responses
    Throttle,
    /// Display name still reserved after a delete (HTTP 400)
    NameReserved,
    /// Long-running operation status polling
    OperationPoll,
    /// Environment library publish state polling
    EnvironmentPublish,
}

impl BackoffProfile {
    /// Get the default policy for this profile.
    pub fn to_policy(&self) -> BackoffPolicy {
        match self {
            BackoffProfile::Throttle => BackoffPolicy::new(Duration::from_secs(10), Some(5)),
            BackoffProfile::NameReserved => BackoffPolicy::new(Duration::from_secs(30), Some(5)),
            BackoffProfile::OperationPoll => BackoffPolicy::new(Duration::from_millis(500), None),
            BackoffProfile::EnvironmentPublish => {
                BackoffPolicy::new(Duration::from_secs(5), Some(20))
            }
        }
    }
}

/// Exponential backoff with an optional attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay multiplied by `2^attempt`.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Waits are allowed while `attempt < max_attempts`. `None` never gives up.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffProfile::Throttle.to_policy()
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Replace the attempt ceiling, keeping the base delay.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether another wait is allowed after `attempt` attempts.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }

    /// Delay for `attempt`, bounded by `retry_after`.
    pub fn delay_for(&self, attempt: u32, retry_after: Duration) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(retry_after)
    }

    /// Plan the wait that follows `attempt`, or fail once the ceiling is reached.
    pub fn next_wait(&self, attempt: u32, retry_after: Duration) -> Result<Wait, RetryExhausted> {
        if !self.allows(attempt) {
            return Err(RetryExhausted {
                max_attempts: self.max_attempts.unwrap_or(attempt),
            });
        }
        Ok(Wait {
            attempt,
            delay: self.delay_for(attempt, retry_after),
        })
    }
}

/// A planned wait between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wait {
    pub attempt: u32,
    pub delay: Duration,
}

impl Wait {
    /// Human-readable progress line, e.g. `->API is throttled. Checking again in 20 seconds (Attempt 1)...`.
    pub fn describe(&self, prefix: &str) -> String {
        let secs = self.delay.as_secs_f64();
        let amount = if secs.fract() == 0.0 {
            format!("{secs:.0}")
        } else {
            format!("{secs:.2}")
        };
        let unit = if secs == 1.0 { "second" } else { "seconds" };
        let sep = if prefix.is_empty() { "" } else { " " };
        format!(
            "{INDENT}{prefix}{sep}Checking again in {amount} {unit} (Attempt {})...",
            self.attempt
        )
    }
}

/// Raised when a policy's attempt ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Maximum retry attempts ({max_attempts}) exceeded.")]
pub struct RetryExhausted {
    pub max_attempts: u32,
}

/// Blocking wait abstraction.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|delays| delays.clone())
            .unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(delay);
        }
    }
}

/// Outcome of one polling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Failure of a [`RetryExecutor::run`] loop.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Exhausted(#[from] RetryExhausted),
    #[error("{0}")]
    Operation(E),
}

/// Runs a polling operation until it reports ready, waiting between attempts.
pub struct RetryExecutor {
    policy: BackoffPolicy,
    retry_after: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryExecutor {
    pub fn new(policy: BackoffPolicy, retry_after: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            policy,
            retry_after,
            sleeper,
        }
    }

    /// Execute `operation` until it returns [`Poll::Ready`].
    ///
    /// The operation receives the current attempt number (starting at 1).
    /// `on_wait` is invoked before every sleep so the caller can report it.
    pub fn run<T, E, F, W>(&self, mut operation: F, mut on_wait: W) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<Poll<T>, E>,
        W: FnMut(&Wait),
    {
        let mut attempt = 1;

        loop {
            match operation(attempt).map_err(RetryError::Operation)? {
                Poll::Ready(value) => return Ok(value),
                Poll::Pending => {
                    let wait = self.policy.next_wait(attempt, self.retry_after)?;
                    on_wait(&wait);
                    self.sleeper.sleep(wait.delay);
                    attempt += 1;
                }
            }
        }
    }
}
