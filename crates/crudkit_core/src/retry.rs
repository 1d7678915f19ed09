//! Contention-aware retry for submits.
//!
//! # Responsibility
//! - Retry an operation only while it fails with backend contention.
//! - Space attempts with a fixed plus randomized delay.
//!
//! # Invariants
//! - At most `retry_count` attempts are made.
//! - A delay precedes every attempt except the first.
//! - Exhausting the budget is reported as `CrudError::RetryExhausted`.
//! - Non-contention errors are returned from the attempt that raised them.

use crate::cancel::CancellationToken;
use crate::error::{is_contention_error, CrudError, CrudResult};
use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `SQLITE_BUSY`: another connection holds a conflicting lock.
pub const SQLITE_BUSY_CODE: i32 = 5;
/// `SQLITE_LOCKED`: a conflicting lock inside the same shared cache.
pub const SQLITE_LOCKED_CODE: i32 = 6;

/// Retry budget and backoff for deadlock-aware submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub min_delay_ms: u64,
    pub randomized_delay_ms: u64,
    /// Primary SQLite result codes treated as contention.
    pub contention_codes: Vec<i32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            min_delay_ms: 300,
            randomized_delay_ms: 600,
            contention_codes: vec![SQLITE_BUSY_CODE, SQLITE_LOCKED_CODE],
        }
    }
}

impl RetryPolicy {
    /// Builds a policy with the default contention codes.
    pub fn new(retry_count: u32, min_delay: Duration, randomized_delay: Duration) -> Self {
        Self {
            retry_count,
            min_delay_ms: duration_ms(min_delay),
            randomized_delay_ms: duration_ms(randomized_delay),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> CrudResult<()> {
        if self.retry_count == 0 {
            return Err(CrudError::Config(
                "retry.retry_count must be at least 1".to_string(),
            ));
        }
        if self.contention_codes.is_empty() {
            return Err(CrudError::Config(
                "retry.contention_codes cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Picks the delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        let jitter = if self.randomized_delay_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.randomized_delay_ms)
        };
        Duration::from_millis(self.min_delay_ms.saturating_add(jitter))
    }

    /// Runs `attempt` under this policy, sleeping with `std::thread::sleep`
    /// or the token's interruptible wait when one is supplied.
    pub fn run<T>(
        &self,
        cancel: Option<&CancellationToken>,
        attempt: impl FnMut() -> CrudResult<T>,
    ) -> CrudResult<T> {
        run_with_retry(
            self,
            |delay| match cancel {
                Some(token) => {
                    if token.sleep(delay) {
                        Err(CrudError::Cancelled)
                    } else {
                        Ok(())
                    }
                }
                None => {
                    std::thread::sleep(delay);
                    Ok(())
                }
            },
            || match cancel {
                Some(token) if token.is_cancelled() => Err(CrudError::Cancelled),
                _ => Ok(()),
            },
            attempt,
        )
    }
}

pub(crate) fn run_with_retry<T>(
    policy: &RetryPolicy,
    mut sleep: impl FnMut(Duration) -> CrudResult<()>,
    mut check_cancelled: impl FnMut() -> CrudResult<()>,
    mut attempt: impl FnMut() -> CrudResult<T>,
) -> CrudResult<T> {
    let budget = policy.retry_count.max(1);

    for attempt_no in 1..=budget {
        check_cancelled()?;

        match attempt() {
            Ok(value) => return Ok(value),
            Err(CrudError::Sqlite(err))
                if is_contention_error(&err, &policy.contention_codes) =>
            {
                if attempt_no == budget {
                    warn!(
                        "event=submit_retry module=retry status=exhausted attempts={} error={}",
                        attempt_no, err
                    );
                    return Err(CrudError::RetryExhausted {
                        attempts: attempt_no,
                        source: err,
                    });
                }

                let delay = policy.next_delay();
                warn!(
                    "event=submit_retry module=retry status=contended attempt={} delay_ms={} error={}",
                    attempt_no,
                    delay.as_millis(),
                    err
                );
                sleep(delay)?;
            }
            Err(err) => return Err(err),
        }
    }

    unreachable!("retry loop returns from its final attempt")
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
