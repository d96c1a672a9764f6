//! Fixed-interval, cancellable wait loops
//!
//! Used for DNS propagation, ACME order status and backend task status.
//! Every iteration checks cancellation before the network call and before
//! the sleep, and both are raced against the cancellation token.

use crate::error::{ProvisionError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default time to wait for a poll loop to settle (5 minutes)
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 300;

/// Default interval between poll attempts
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Timeout and interval of a poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS),
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

/// Fail with `Cancelled` if the token has fired
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ProvisionError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleep for `duration` unless cancelled first
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `fut` unless cancelled first; an in-flight call is abandoned on cancellation
pub async fn run_or_cancel<T, Fut>(cancel: &CancellationToken, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
        result = fut => result,
    }
}

/// Call `check` every `settings.interval` until it yields a value
///
/// `check` returns `Ok(None)` while the condition is not met yet. Errors from
/// `check` end the loop immediately; elapsing `settings.timeout` fails with
/// `PollTimeout`.
pub async fn poll_until<T, F, Fut>(
    cancel: &CancellationToken,
    settings: PollSettings,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        ensure_active(cancel)?;
        attempt += 1;

        if let Some(value) = run_or_cancel(cancel, check()).await? {
            debug!(what = %what, attempt, elapsed_ms = start.elapsed().as_millis() as u64, "Poll condition met");
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            return Err(ProvisionError::PollTimeout {
                what: what.to_string(),
                elapsed,
            });
        }

        debug!(what = %what, attempt, "Condition not met yet, waiting");
        ensure_active(cancel)?;
        sleep_or_cancel(cancel, settings.interval).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_poll_returns_value_when_ready() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let settings = PollSettings::new(Duration::from_secs(5), Duration::from_millis(10));

        let value = poll_until(&cancel, settings, "counter", || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n >= 3 { Some(n) } else { None })
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let cancel = CancellationToken::new();
        let settings = PollSettings::new(Duration::from_millis(50), Duration::from_millis(10));

        let err = poll_until(&cancel, settings, "never", || async { Ok::<Option<()>, _>(None) })
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::PollTimeout { ref what, .. } if what == "never"));
    }

    #[tokio::test]
    async fn test_poll_propagates_check_error() {
        let cancel = CancellationToken::new();
        let err = poll_until(&cancel, PollSettings::default(), "task", || async {
            Err::<Option<()>, _>(ProvisionError::backend("task status", "task failed"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProvisionError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_cancel_during_sleep_returns_promptly() {
        let cancel = CancellationToken::new();
        let settings = PollSettings::new(Duration::from_secs(600), Duration::from_secs(30));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = poll_until(&cancel, settings, "propagation", || async { Ok::<Option<()>, _>(None) })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_abandons_inflight_call() {
        let cancel = CancellationToken::new();
        let settings = PollSettings::new(Duration::from_secs(600), Duration::from_secs(1));
        let completed = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let counter = completed.clone();
        let started = std::time::Instant::now();
        let err = poll_until(&cancel, settings, "slow backend", || {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<()>, _>(None)
            }
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = poll_until(&cancel, PollSettings::default(), "status", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<Option<()>, _>(Some(()))
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
