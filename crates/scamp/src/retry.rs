//! Bounded retry executor.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Default number of attempts before giving up.
pub const MAX_RETRIES: u32 = 10;

/// Outcome of one failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Try again if attempts remain.
    Retry(E),
    /// Stop now.
    Fatal(E),
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("exceeded retry limit after {attempts} attempts: {last}")]
    MaxRetries { attempts: u32, last: E },

    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    pub fn is_max_retries(&self) -> bool {
        matches!(self, RetryError::MaxRetries { .. })
    }

    /// The error from the last attempt, whichever way the run ended.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetries { last, .. } => last,
            RetryError::Fatal(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause between attempts. Only `run_async` sleeps.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Call `f` with attempt numbers starting at 1 until it succeeds, returns
    /// [`Attempt::Fatal`], or `max_attempts` calls have failed.
    pub fn run<T, E, F>(&self, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, Attempt<E>>,
    {
        let mut attempt = 1;
        loop {
            match f(attempt) {
                Ok(value) => return Ok(value),
                Err(Attempt::Fatal(e)) => return Err(RetryError::Fatal(e)),
                Err(Attempt::Retry(e)) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::MaxRetries { attempts: attempt, last: e });
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Async form of [`run`](Self::run), sleeping `backoff` between attempts.
    pub async fn run_async<T, E, F, Fut>(&self, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Attempt<E>>>,
    {
        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Fatal(e)) => return Err(RetryError::Fatal(e)),
                Err(Attempt::Retry(e)) => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::MaxRetries { attempts: attempt, last: e });
                    }
                }
            }
            if !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_on_first_success() {
        let mut calls = Vec::new();
        let result: Result<u32, RetryError<&str>> = RetryPolicy::default().run(|attempt| {
            calls.push(attempt);
            if attempt < 3 {
                Err(Attempt::Retry("not yet"))
            } else {
                Ok(attempt * 10)
            }
        });
        assert_eq!(result.unwrap(), 30);
        assert_eq!(calls, vec![1, 2, 3]);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut calls = 0;
        let err = RetryPolicy::default()
            .run(|attempt| -> Result<(), _> {
                calls += 1;
                Err(Attempt::Retry(attempt))
            })
            .unwrap_err();
        assert_eq!(calls, MAX_RETRIES);
        assert!(err.is_max_retries());
        assert!(matches!(err, RetryError::MaxRetries { attempts: 10, last: 10 }));
    }

    #[test]
    fn test_fatal_stops_immediately() {
        let mut calls = 0;
        let err = RetryPolicy::default()
            .run(|_| -> Result<(), _> {
                calls += 1;
                Err(Attempt::Fatal("boom"))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(!err.is_max_retries());
        assert_eq!(err.into_inner(), "boom");
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let mut calls = 0;
        let _ = policy.run(|_| -> Result<(), _> {
            calls += 1;
            Err(Attempt::Retry(()))
        });
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_sleeps_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        let start = tokio::time::Instant::now();

        let err = policy
            .run_async(|attempt| async move { Err::<(), _>(Attempt::Retry(attempt)) })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::MaxRetries { attempts: 3, last: 3 }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(500));
    }
}
