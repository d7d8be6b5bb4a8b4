//! Caller-level retry with exponential backoff.
//!
//! An orchestration attempt is terminal: whatever it resolves to is final.
//! This module wraps *fresh* attempts for callers that want another try
//! when an attempt failed for a reason that may be transient.
//!
//! # Retry Strategy
//!
//! - Only retries attempts that resolved to a retryable [`Failure`](crate::Failure)
//!   (connection or transport level)
//! - Never retries a received payload, a fallback value, or a caller-side
//!   wait timeout
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay` to prevent excessive wait times

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use tokio::time::sleep;

use crate::{
    // ---
    log_debug,
    Resolution,
    Result,
    RetryConfig,
};

/// Run attempts until one does not resolve to a retryable failure.
///
/// If `retry_config` is `None`, the operation executes exactly once.
///
/// # Backoff Algorithm
///
/// - First retry: `initial_delay` (with jitter)
/// - Subsequent retries: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25% randomization to prevent synchronized retries
///
/// # Returns
///
/// The first resolution that is not a retryable failure, the last failure
/// once attempts are exhausted, or the first error.
pub async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> Result<Resolution<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Resolution<T>>>,
{
    let retry_config = match retry_config {
        Some(cfg) => cfg,
        None => {
            // No retry configured, just execute once
            return operation().await;
        }
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        let failure = match operation().await {
            Ok(Resolution::Failed(failure)) if failure.is_retryable() => failure,
            other => return other,
        };

        attempt += 1;

        if attempt > retry_config.max_attempts {
            log_debug!(
                "retry exhausted after {} attempts, last failure: {failure}",
                retry_config.max_attempts
            );
            return Ok(Resolution::Failed(failure));
        }

        let jittered_delay = apply_jitter(current_delay);

        log_debug!(
            "retry attempt {}/{}, waiting {:?} before retry (failure: {failure})",
            attempt,
            retry_config.max_attempts,
            jittered_delay
        );

        sleep(jittered_delay).await;

        let next_delay =
            Duration::from_secs_f64(current_delay.as_secs_f64() * retry_config.multiplier as f64);
        current_delay = next_delay.min(retry_config.max_delay);
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..1.0 range
    let random_factor = (hash % 1000) as f64 / 1000.0;

    // Range of 0.75x to 1.25x the original delay
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Failure, FailureKind, RoundtripError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_no_retry_on_received() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(Some(&fast_retry(3)), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RoundtripError>(Resolution::Received(42))
            }
        })
        .await;

        assert_eq!(result.unwrap(), Resolution::Received(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_config_executes_once() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(None, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RoundtripError>(Resolution::<u8>::Failed(Failure::connection(
                    "refused",
                )))
            }
        })
        .await;

        assert!(result.unwrap().is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_retryable_failure() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(Some(&fast_retry(3)), || {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Ok::<_, RoundtripError>(Resolution::Failed(Failure::transport(
                        "connection reset",
                    )))
                } else {
                    Ok(Resolution::Received("payload"))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), Resolution::Received("payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_last_failure() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(Some(&fast_retry(2)), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RoundtripError>(Resolution::<()>::Failed(Failure::connection(format!(
                    "refused #{n}"
                ))))
            }
        })
        .await;

        // Initial attempt + 2 retries = 3 total calls
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.unwrap(),
            Resolution::Failed(Failure::connection("refused #2"))
        );
    }

    #[tokio::test]
    async fn test_no_retry_on_non_retryable_outcomes() {
        // ---
        let cases: Vec<Result<Resolution<&str>>> = vec![
            Ok(Resolution::Failed(Failure::subscription("destination unavailable"))),
            Ok(Resolution::TimedOut("completeOnTimeout")),
            Err(RoundtripError::WaitTimeout(Duration::from_millis(1))),
        ];

        for case in cases {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let mut case = Some(case);

            let result = retry_with_backoff(Some(&fast_retry(3)), || {
                counter.fetch_add(1, Ordering::SeqCst);
                let next = case.take().expect("called more than once");
                async move { next }
            })
            .await;

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            match result {
                Ok(Resolution::Failed(f)) => assert_eq!(f.kind(), FailureKind::Subscription),
                Ok(Resolution::TimedOut(v)) => assert_eq!(v, "completeOnTimeout"),
                Err(err) => assert!(matches!(err, RoundtripError::WaitTimeout(_))),
                Ok(other) => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_delay_cap() {
        // ---
        let retry_config = RetryConfig {
            max_attempts: 5,
            multiplier: 10.0, // Aggressive multiplier
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50), // Low cap
        };
        let start = Instant::now();

        let _result = retry_with_backoff(Some(&retry_config), || async {
            Ok::<_, RoundtripError>(Resolution::<()>::Failed(Failure::transport("down")))
        })
        .await;

        // With jitter the longest single delay is 62.5ms, so 5 retries
        // stay under ~320ms.
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(320),
            "max_delay cap not working: {elapsed:?}",
        );
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);

        for _ in 0..100 {
            let jittered = apply_jitter(delay);

            assert!(
                jittered >= Duration::from_millis(75),
                "jitter too low: {jittered:?}",
            );
            assert!(
                jittered <= Duration::from_millis(125),
                "jitter too high: {jittered:?}",
            );
        }
    }
}
