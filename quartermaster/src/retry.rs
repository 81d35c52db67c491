//! Retry-until-ready support for acquire callbacks.
//!
//! The registry never retries an acquisition: the first attempt's outcome is
//! memoized for the life of the process. A resource whose backend may still
//! be booting when the process starts handles that *inside* its acquire
//! callback, by wrapping its connect logic in [`retry_until_ready`]. Only
//! failures constructed with [`AcquireError::not_ready`] are retried;
//! everything else propagates immediately and becomes the key's memoized
//! outcome.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::AcquireError;

/// Retry configuration for [`retry_until_ready`].
///
/// A fixed pause between attempts, optionally bounded. Deliberately not a
/// backoff curve: the intended use is a process booting alongside its
/// backends, where polling at a steady interval until the backend turns up
/// is the wanted behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub interval: Duration,
    /// Attempt budget; `None` keeps trying until the backend turns up.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    /// Five seconds between attempts, unbounded.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// An unbounded policy with the given pause between attempts.
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Caps the number of attempts; the final not-ready error propagates
    /// once the budget is spent.
    #[must_use]
    pub const fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            interval: self.interval,
            max_attempts: Some(max_attempts),
        }
    }
}

/// Runs `attempt` until it succeeds, pausing on not-ready failures.
///
/// Terminal failures (anything not constructed with
/// [`AcquireError::not_ready`]) propagate after the attempt that produced
/// them. `operation` names the work in the retry log lines.
///
/// ```
/// use quartermaster::{retry_until_ready, AcquireError, RetryPolicy};
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let calls = AtomicU32::new(0);
/// let policy = RetryPolicy::every(Duration::from_millis(1));
///
/// let port = retry_until_ready(&policy, "gateway.connect", || async {
///     if calls.fetch_add(1, Ordering::SeqCst) < 2 {
///         Err(AcquireError::not_ready("gateway still booting"))
///     } else {
///         Ok(4242_u16)
///     }
/// })
/// .await?;
///
/// assert_eq!(port, 4242);
/// assert_eq!(calls.load(Ordering::SeqCst), 3);
/// # Ok::<_, AcquireError>(())
/// # }).unwrap();
/// ```
pub async fn retry_until_ready<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, AcquireError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AcquireError>>,
{
    let mut attempts = 0_u32;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation, attempts, "backend became ready after retries");
                }
                return Ok(value);
            }
            Err(error) if error.is_not_ready() => {
                if let Some(max) = policy.max_attempts {
                    if attempts >= max {
                        warn!(
                            operation,
                            attempts,
                            error = %error,
                            "attempt budget exhausted"
                        );
                        return Err(error);
                    }
                }
                warn!(
                    operation,
                    attempts,
                    interval = ?policy.interval,
                    error = %error,
                    "backend not ready, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
            Err(error) => return Err(error),
        }
    }
}
