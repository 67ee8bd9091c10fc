//! Retry combinator for conflicting store transactions.
//!
//! Only [`XenliteError::Conflict`] is retried; every other outcome, success or
//! failure, is returned to the caller unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use xenlite_shared::errors::{XenliteError, XenliteResult};

/// Delay inserted between attempts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    Immediate,
    /// Same delay before every retry.
    Fixed { millis: u64 },
    /// Doubling delay, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Fixed { millis } => Duration::from_millis(*millis),
            Backoff::Exponential { initial_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(63);
                let ms = initial_ms.saturating_mul(1u64 << shift).min(*max_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// Bound and pacing of a retry loop.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed. `None` retries until the conflict clears.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff: Backoff::Immediate,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `op` until it returns something other than a conflict.
///
/// `op` receives the 1-based attempt number and must redo all of its work
/// on every call.
pub fn retry_on_conflict<T, F>(policy: &RetryPolicy, op: F) -> XenliteResult<T>
where
    F: FnMut(u32) -> XenliteResult<T>,
{
    retry_on_conflict_with(policy, std::thread::sleep, op)
}

/// [`retry_on_conflict`] with an injectable sleep.
pub fn retry_on_conflict_with<T, F, S>(policy: &RetryPolicy, mut sleep: S, mut op: F) -> XenliteResult<T>
where
    F: FnMut(u32) -> XenliteResult<T>,
    S: FnMut(Duration),
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match op(attempt) {
            Err(XenliteError::Conflict) => {
                if let Some(max) = policy.max_attempts
                    && attempt >= max
                {
                    tracing::warn!(attempt, "store transaction still conflicting, giving up");
                    return Err(XenliteError::Conflict);
                }
                let delay = policy.backoff.delay(attempt);
                tracing::debug!(attempt, ?delay, "store transaction conflict, retrying");
                if !delay.is_zero() {
                    sleep(delay);
                }
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_retries_through_conflicts() {
        let mut calls = 0;
        let result = retry_on_conflict(&RetryPolicy::unbounded(), |attempt| {
            calls += 1;
            if attempt <= 5 {
                Err(XenliteError::Conflict)
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 6);
        assert_eq!(calls, 6);
    }

    #[test]
    fn test_bounded_gives_up() {
        let mut calls = 0;
        let result: XenliteResult<()> = retry_on_conflict(&RetryPolicy::bounded(3), |_| {
            calls += 1;
            Err(XenliteError::Conflict)
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_other_errors_not_retried() {
        let mut calls = 0;
        let result: XenliteResult<()> = retry_on_conflict(&RetryPolicy::unbounded(), |_| {
            calls += 1;
            Err(XenliteError::Store("permission denied".into()))
        });
        assert!(matches!(result, Err(XenliteError::Store(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_backoff_is_injected() {
        let policy = RetryPolicy::unbounded().with_backoff(Backoff::Exponential {
            initial_ms: 10,
            max_ms: 25,
        });
        let mut slept = Vec::new();
        let result = retry_on_conflict_with(
            &policy,
            |d| slept.push(d),
            |attempt| {
                if attempt < 4 {
                    Err(XenliteError::Conflict)
                } else {
                    Ok(())
                }
            },
        );
        assert!(result.is_ok());
        assert_eq!(
            slept,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(25)
            ]
        );
    }

    #[test]
    fn test_immediate_backoff_never_sleeps() {
        let mut slept = 0;
        let _ = retry_on_conflict_with(
            &RetryPolicy::unbounded(),
            |_| slept += 1,
            |attempt| {
                if attempt < 3 {
                    Err(XenliteError::Conflict)
                } else {
                    Ok(())
                }
            },
        );
        assert_eq!(slept, 0);
    }

    #[test]
    fn test_fixed_backoff() {
        assert_eq!(Backoff::Fixed { millis: 7 }.delay(1), Duration::from_millis(7));
        assert_eq!(Backoff::Fixed { millis: 7 }.delay(9), Duration::from_millis(7));
    }
}
