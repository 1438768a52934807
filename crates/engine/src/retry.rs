//! Per-call timeout and bounded retry around transport calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::VaultError;
use crate::transport::TransportError;

/// Why a retried call gave up.
#[derive(Debug)]
pub(crate) enum CallError {
    Cancelled,
    /// A non-retryable error on any attempt.
    Fatal(TransportError),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: TransportError },
}

impl CallError {
    /// Maps into the engine taxonomy.
    ///
    /// `NotFound` and `Integrity` keep their own variants; everything else
    /// goes through `describe`, which receives the last error and the
    /// number of attempts made.
    pub(crate) fn into_vault_error(
        self,
        describe: impl FnOnce(TransportError, u32) -> VaultError,
    ) -> VaultError {
        match self {
            CallError::Cancelled => VaultError::Cancelled,
            CallError::Fatal(
                e @ (TransportError::NotFound(_) | TransportError::Integrity { .. }),
            ) => e.into(),
            CallError::Fatal(e) => describe(e, 1),
            CallError::Exhausted { attempts, last } => describe(last, attempts),
        }
    }
}

/// Runs `fut` with a deadline; expiry becomes [`TransportError::Timeout`].
pub(crate) async fn with_timeout<T>(
    call_timeout: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(call_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Calls `op` until it succeeds, fails fatally, runs out of attempts or
/// `cancel` fires. Each attempt is bounded by `call_timeout`.
pub(crate) async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    call_timeout: Duration,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
            r = with_timeout(call_timeout, op()) => r,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(CallError::Fatal(e)),
            Err(e) => e,
        };

        if attempt >= policy.max_attempts {
            return Err(CallError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            call = what,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "call failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = call_with_retry(&policy(5), Duration::from_secs(5), &cancel, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TransportError::Unavailable("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let err = call_with_retry(&policy(5), Duration::from_secs(5), &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransportError::NotFound("archive".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, CallError::Fatal(TransportError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let err = call_with_retry(&policy(3), Duration::from_secs(5), &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransportError::Throttled("slow down".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, CallError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let cancel = CancellationToken::new();
        let err = call_with_retry(&policy(2), Duration::from_secs(1), &cancel, "test", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, TransportError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            CallError::Exhausted {
                last: TransportError::Timeout,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = call_with_retry(&policy(5), Duration::from_secs(1), &cancel, "test", || async {
            Ok::<_, TransportError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
    }

    #[test]
    fn into_vault_error_keeps_not_found_and_integrity() {
        let err = CallError::Fatal(TransportError::NotFound("job".into()))
            .into_vault_error(|e, _| VaultError::Transport(e));
        assert!(matches!(err, VaultError::NotFound(_)));

        let err = CallError::Exhausted {
            attempts: 4,
            last: TransportError::Timeout,
        }
        .into_vault_error(|e, attempts| VaultError::Upload {
            offset: 0,
            reason: format!("{e} after {attempts} attempts"),
        });
        assert!(matches!(err, VaultError::Upload { reason, .. } if reason.contains("4 attempts")));
    }
}
