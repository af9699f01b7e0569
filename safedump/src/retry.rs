//! Retry, backoff and scheduling helpers.

use crate::error::{Result, SafedumpError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Default schedule for storage uploads: 1s, 2s, 4s, ... capped at 30s.
    pub fn for_uploads() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Next delay, doubling per attempt with up to 20% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        self.attempt += 1;
        let capped = exp.min(self.max);
        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        capped.mul_f64(1.0 + jitter)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Sleep that respects cancellation. Returns false if cancelled before the
/// interval elapsed.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Run an operation with retries under exponential backoff. Cancellation
/// aborts between attempts; the last error is surfaced when the ceiling is
/// reached.
pub async fn with_retries<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::for_uploads();
    loop {
        if cancel.is_cancelled() {
            return Err(SafedumpError::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if backoff.attempts() + 1 >= max_attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    backoff.attempts(),
                    max_attempts,
                    e,
                    delay
                );
                if !cancellable_sleep(delay, cancel).await {
                    return Err(SafedumpError::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let d1 = b.next_delay();
        let d2 = b.next_delay();
        let d3 = b.next_delay();
        assert!(d1 >= Duration::from_millis(100));
        assert!(d2 >= Duration::from_millis(200));
        // 400ms doubled would exceed the cap; jitter adds at most 20%.
        assert!(d3 <= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_cancellable_sleep_returns_false_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!cancellable_sleep(Duration::from_secs(10), &token).await);
    }

    #[tokio::test]
    async fn test_with_retries_eventually_succeeds() {
        let attempts = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = with_retries("test", 5, &token, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SafedumpError::Storage("transient".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_respects_ceiling() {
        let token = CancellationToken::new();
        let result: Result<()> = with_retries("test", 1, &token, || async {
            Err(SafedumpError::Storage("permanent".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
