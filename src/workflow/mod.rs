//! Durable-task building blocks: activity retry policies and the activity
//! runner.
//!
//! Side effects live in activities; the surrounding workflow code only
//! sequences them. An activity is retried per its policy, each attempt
//! bounded by a start-to-close timeout.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

pub mod poll;
pub mod registration;

pub use poll::{PollOutcome, PollWorkflow};
pub use registration::{
    PaymentSpec, RegistrationInput, RegistrationOutcome, RegistrationStatus, RegistrationWorkflow,
};

/// Exponential retry policy for activities.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the given zero-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt as i32);
        let delay = self.initial_interval.mul_f64(factor.max(1.0));
        delay.min(self.max_interval)
    }
}

/// Default start-to-close timeout for poll activities.
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("activity {activity} timed out after {timeout:?}")]
    Timeout {
        activity: &'static str,
        timeout: Duration,
    },
    #[error("activity {activity} failed after {attempts} attempts: {message}")]
    Exhausted {
        activity: &'static str,
        attempts: u32,
        message: String,
    },
}

/// Run `op` with retries per `policy`, each attempt bounded by `timeout`.
///
/// A timed-out attempt counts like a failed one; the error of the final
/// attempt is surfaced.
pub async fn run_activity<T, E, F, Fut>(
    activity: &'static str,
    policy: &RetryPolicy,
    timeout: Duration,
    mut op: F,
) -> Result<T, ActivityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_message = String::new();
    for attempt in 0..max_attempts {
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => {
                last_message = error.to_string();
                tracing::warn!(
                    activity,
                    attempt,
                    error = %error,
                    "activity attempt failed"
                );
            }
            Err(_) => {
                if attempt + 1 == max_attempts {
                    return Err(ActivityError::Timeout { activity, timeout });
                }
                last_message = format!("attempt timed out after {timeout:?}");
                tracing::warn!(activity, attempt, ?timeout, "activity attempt timed out");
            }
        }
        if attempt + 1 < max_attempts {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        }
    }
    Err(ActivityError::Exhausted {
        activity,
        attempts: max_attempts,
        message: last_message,
    })
}
