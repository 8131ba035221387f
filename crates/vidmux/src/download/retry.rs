// Retry loop shared by the length probe, range fetches and single-pass downloads.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::DownloadError;

/// How often, and how patiently, a request is repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, the first one included. Zero behaves like one.
    pub attempts: u32,
    /// Pause after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any pause, jitter included.
    pub max_delay: Duration,
    /// Double the pause after every failure.
    pub exponential: bool,
    /// Add up to half of `base_delay` of random slack.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    /// Three tries, one second apart.
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            base_delay: delay,
            max_delay: delay,
            exponential: false,
            jitter: false,
        }
    }

    /// `base_delay`, `2 * base_delay`, ... up to `max_delay`, with jitter.
    pub fn exponential(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
            exponential: true,
            jitter: true,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Pause before try number `failed + 1`, where `failed` counts from zero.
    fn pause_after(&self, failed: u32) -> Duration {
        let mut pause = if self.exponential {
            let factor = 2u32.checked_pow(failed).unwrap_or(u32::MAX);
            self.base_delay
                .checked_mul(factor)
                .map_or(self.max_delay, |d| d.min(self.max_delay))
        } else {
            self.base_delay.min(self.max_delay)
        };

        if self.jitter {
            let headroom = self.max_delay.saturating_sub(pause).min(self.base_delay / 2);
            let headroom_ms = u64::try_from(headroom.as_millis()).unwrap_or(u64::MAX);
            if headroom_ms > 0 {
                pause += Duration::from_millis(rand::rng().random_range(0..headroom_ms));
            }
        }
        pause
    }
}

/// Outcome of one try.
pub enum RetryAction<T> {
    Success(T),
    /// Worth another try.
    Retry(DownloadError),
    /// Give up now.
    Fail(DownloadError),
}

impl<T> RetryAction<T> {
    /// Sort a result using [`DownloadError::is_retryable`].
    pub fn from_result(result: Result<T, DownloadError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of tries
/// or `token` is cancelled. The closure gets the zero-based try number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let last = policy.max_attempts() - 1;
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt == last => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let pause = policy.pause_after(attempt);
        attempt += 1;
        warn!(
            attempt,
            of = policy.max_attempts(),
            pause_ms = pause.as_millis() as u64,
            error = %err,
            "Transient failure, trying again"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Transport-level failures worth repeating. Redirect loops and builder errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn short_body() -> DownloadError {
        DownloadError::LengthMismatch {
            expected: 10,
            actual: 3,
        }
    }

    #[test]
    fn test_default_is_three_tries_one_second_apart() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        for failed in [0, 1, 7, 40] {
            assert_eq!(policy.pause_after(failed), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_exponential_doubles_until_capped() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::exponential(10, Duration::from_millis(250), Duration::from_secs(3))
        };
        assert_eq!(policy.pause_after(0), Duration::from_millis(250));
        assert_eq!(policy.pause_after(2), Duration::from_secs(1));
        assert_eq!(policy.pause_after(5), Duration::from_secs(3));
        assert_eq!(policy.pause_after(64), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(400), Duration::from_secs(1));
        for failed in 0..16 {
            assert!(policy.pause_after(failed) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_repeated() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy, &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                RetryAction::from_result(Err(DownloadError::EmptyBody {
                    url: "http://host/a".into(),
                }))
            }
        })
        .await;
        assert!(matches!(result, Err(DownloadError::EmptyBody { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_last_try() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy, &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { RetryAction::Retry(short_body()) }
        })
        .await;
        assert!(matches!(result, Err(DownloadError::LengthMismatch { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_on_final_try() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let value = retry_with_backoff(&policy, &token, |attempt| async move {
            match attempt {
                0 | 1 => RetryAction::Retry(short_body()),
                _ => RetryAction::Success(attempt),
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_try() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();
        let result = retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(()) }).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_cuts_pause_short() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(60));
        let token = CancellationToken::new();
        let trigger = token.clone();
        let result: Result<(), _> = retry_with_backoff(&policy, &token, |_| {
            trigger.cancel();
            async { RetryAction::Retry(short_body()) }
        })
        .await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
