use std::future::Future;
use std::time::Duration;

use tokio::time;
use tracing::{debug, warn};

use crate::error::RuntimeError;
use crate::policies::RetryPolicy;

/// Runs a runtime call with a per-attempt deadline and backoff on transient errors.
///
/// - Exceeding `deadline` counts as [`RuntimeError::Timeout`] (transient).
/// - Transient errors sleep `policy.delay_after(attempt)` and try again.
/// - After `policy.max_attempts` transient failures the error is escalated to
///   [`RuntimeError::RetriesExhausted`], which is permanent.
/// - Any other error is returned as-is on the first occurrence.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    deadline: Option<Duration>,
    mut call: F,
) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = match deadline {
            Some(limit) => match time::timeout(limit, call()).await {
                Ok(res) => res,
                Err(_) => Err(RuntimeError::Timeout { op, timeout: limit }),
            },
            None => call().await,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => err,
            Err(err) => return Err(err),
        };

        match policy.delay_after(attempt) {
            Some(delay) => {
                debug!(op, attempt, ?delay, error = %err, "transient runtime error, retrying");
                time::sleep(delay).await;
            }
            None => {
                warn!(op, attempts = attempt, error = %err, "runtime call kept failing");
                return Err(RuntimeError::RetriesExhausted {
                    op,
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::{BackoffPolicy, JitterPolicy};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffPolicy {
                first: Duration::from_millis(100),
                max: Duration::from_secs(1),
                factor: 2.0,
                jitter: JitterPolicy::None,
            },
            max_attempts: attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = call_with_retry(&policy(5), "status", None, move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RuntimeError::Transient {
                        op: "status",
                        error: "connection refused".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out: Result<(), _> = call_with_retry(&policy(5), "launch", None, move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(RuntimeError::Auth { error: "denied".into() }) }
        })
        .await;
        assert!(matches!(out, Err(RuntimeError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_escalates_after_cap() {
        let out: Result<(), _> =
            call_with_retry(&policy(3), "launch", Some(Duration::from_secs(2)), || async {
                time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        match out {
            Err(RuntimeError::RetriesExhausted { op, attempts, last }) => {
                assert_eq!(op, "launch");
                assert_eq!(attempts, 3);
                assert!(last.contains("timed out"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
