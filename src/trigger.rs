//! Admission checks and the trigger retry wrapper.
//!
//! Every admission path ends in [`RunCoordinator::trigger`]. What differs
//! is who may call it and what happens when the call itself fails:
//!
//! | Path | Secret | Unconfigured secret |
//! |------|--------|---------------------|
//! | `POST /admin/reindex` | `ADMIN_API_TOKEN` | rejected (503) |
//! | `GET /cron/*` | `CRON_SECRET` | allowed |
//! | scheduled task | none | n/a, retried with backoff |
//!
//! The cron path is deliberately permissive so local and preview
//! deployments can be poked without a secret; the admin path is not.
//!
//! [`RunCoordinator::trigger`]: crate::coordinator::RunCoordinator::trigger

use std::future::Future;
use std::time::Duration;

use crate::config::ScheduleConfig;
use crate::error::{AuthRejected, TriggerError};

/// Check the `Authorization` header of an on-demand request.
pub fn authorize_admin(configured: Option<&str>, header: Option<&str>) -> Result<(), AuthRejected> {
    let Some(secret) = configured else {
        return Err(AuthRejected::Unconfigured);
    };
    check_bearer(secret, header)
}

/// Check the `Authorization` header of a platform-cron request.
pub fn authorize_cron(configured: Option<&str>, header: Option<&str>) -> Result<(), AuthRejected> {
    match configured {
        Some(secret) => check_bearer(secret, header),
        None => Ok(()),
    }
}

fn check_bearer(secret: &str, header: Option<&str>) -> Result<(), AuthRejected> {
    let token = header.and_then(bearer_token).ok_or(AuthRejected::Missing)?;
    if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
        Ok(())
    } else {
        Err(AuthRejected::Mismatch)
    }
}

/// Extract the token of a `Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Exponential backoff for trigger-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(10),
        }
    }
}

impl From<&ScheduleConfig> for RetryPolicy {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial: Duration::from_millis(config.initial_backoff_ms),
            cap: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

/// Outcome of [`retry_with_backoff`] together with the attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub attempts: u32,
    pub result: Result<T, TriggerError>,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// Only [`TriggerError::Infrastructure`] is retried. A run that completed
/// with failed stages is a success at this level.
pub async fn retry_with_backoff<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TriggerError>>,
{
    let mut attempt = 1;
    loop {
        let result = op(attempt).await;
        match result {
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "trigger failed, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => {
                return Retried {
                    attempts: attempt,
                    result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn admin_fails_closed_without_secret() {
        assert_eq!(
            authorize_admin(None, Some("Bearer anything")),
            Err(AuthRejected::Unconfigured)
        );
        assert_eq!(authorize_admin(None, None), Err(AuthRejected::Unconfigured));
    }

    #[test]
    fn admin_requires_exact_token() {
        assert_eq!(authorize_admin(Some("s3cret"), Some("Bearer s3cret")), Ok(()));
        assert_eq!(
            authorize_admin(Some("s3cret"), Some("Bearer s3cret2")),
            Err(AuthRejected::Mismatch)
        );
        assert_eq!(
            authorize_admin(Some("s3cret"), Some("Bearer S3CRET")),
            Err(AuthRejected::Mismatch)
        );
        assert_eq!(authorize_admin(Some("s3cret"), None), Err(AuthRejected::Missing));
        assert_eq!(
            authorize_admin(Some("s3cret"), Some("Basic s3cret")),
            Err(AuthRejected::Missing)
        );
    }

    #[test]
    fn cron_is_permissive_without_secret() {
        assert_eq!(authorize_cron(None, None), Ok(()));
        assert_eq!(authorize_cron(None, Some("Bearer whatever")), Ok(()));
        assert_eq!(authorize_cron(Some("c"), None), Err(AuthRejected::Missing));
        assert_eq!(authorize_cron(Some("c"), Some("Bearer c")), Ok(()));
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("BEARER  abc "), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retries_infrastructure_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let retried = retry_with_backoff(fast_policy(), move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TriggerError::Infrastructure(anyhow::anyhow!("db down")))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(retried.attempts, 3);
        assert_eq!(retried.result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let retried: Retried<()> = retry_with_backoff(fast_policy(), |_| async {
            Err(TriggerError::Infrastructure(anyhow::anyhow!("still down")))
        })
        .await;
        assert_eq!(retried.attempts, 3);
        assert!(retried.result.is_err());
    }

    #[tokio::test]
    async fn never_retries_run_already_in_progress() {
        let retried: Retried<()> = retry_with_backoff(fast_policy(), |_| async {
            Err(TriggerError::RunAlreadyInProgress {
                pipeline: "all".into(),
                run_id: "r1".into(),
                started_at: 0,
            })
        })
        .await;
        assert_eq!(retried.attempts, 1);
        assert!(matches!(
            retried.result,
            Err(TriggerError::RunAlreadyInProgress { .. })
        ));
    }
}
