use crate::error::TidedbError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff schedule: doubles from the initial delay, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before the attempt following `failures` failed attempts.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exp);
        delay.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

type RetryPredicate = Arc<dyn Fn(u32, &TidedbError) -> bool + Send + Sync>;

/// Give-up policy for a remote resolver: retry forever, never, up to a
/// failure count, or per a caller predicate over `(failures, error)`.
#[derive(Clone, Default)]
pub enum ShouldRetry {
    #[default]
    Always,
    Never,
    Limit(u32),
    Predicate(RetryPredicate),
}

impl ShouldRetry {
    pub fn predicate(f: impl Fn(u32, &TidedbError) -> bool + Send + Sync + 'static) -> Self {
        ShouldRetry::Predicate(Arc::new(f))
    }

    /// Whether another attempt should follow `failures` failed ones.
    pub fn allows(&self, failures: u32, error: &TidedbError) -> bool {
        match self {
            ShouldRetry::Always => true,
            ShouldRetry::Never => false,
            ShouldRetry::Limit(max) => failures < *max,
            ShouldRetry::Predicate(f) => f(failures, error),
        }
    }
}

impl std::fmt::Debug for ShouldRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShouldRetry::Always => write!(f, "Always"),
            ShouldRetry::Never => write!(f, "Never"),
            ShouldRetry::Limit(n) => write!(f, "Limit({n})"),
            ShouldRetry::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl From<bool> for ShouldRetry {
    fn from(b: bool) -> Self {
        if b { ShouldRetry::Always } else { ShouldRetry::Never }
    }
}

impl From<u32> for ShouldRetry {
    fn from(limit: u32) -> Self {
        ShouldRetry::Limit(limit)
    }
}

/// Retry an operation until it succeeds. Used by the pull loop, whose
/// retries are unbounded; errors are logged and backed off, never
/// surfaced.
pub async fn retry_unbounded<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TidedbError>>,
{
    let mut failures: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return value,
            Err(error) => {
                failures = failures.saturating_add(1);
                let delay = policy.backoff(failures);
                warn!(
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
