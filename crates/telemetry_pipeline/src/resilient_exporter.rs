//! Resilient Exporter Wrapper
//!
//! [`RetryingExporter`] decorates any base [`TelemetryExporter`] with a
//! per-attempt timeout and bounded retries with jittered exponential backoff.
//!
//! ```text
//! attempt 1 ──fail──► sleep(d1) ──► attempt 2 ──fail──► sleep(d2) ──► ... attempt N
//!
//! d_r = min(initial_delay · multiplier^(r-1) · (1 ± jitter), max_delay)
//! ```
//!
//! A `Throttled` failure carrying a `Retry-After` hint waits for the hint
//! instead (still capped at `max_delay`). Non-retryable failures end the loop
//! immediately.

use crate::error::ExportError;
use crate::exporter::{ExportResult, TelemetryExporter};
use crate::invariants::debug_assert_attempts_bounded;
use crate::item::Batch;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per batch, the first one included (0 is treated as 1).
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (caps exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double delay each retry).
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts per batch.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Un-jittered, uncapped delay before retry `retry` (1-indexed).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Jittered delay before retry `retry` (1-indexed), capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).min(self.max_delay);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
            Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(self.max_delay)
        } else {
            base
        };
        delay.min(self.max_delay)
    }
}

// =============================================================================
// RETRYING EXPORTER
// =============================================================================

/// An exporter wrapper that bounds each attempt by a timeout and retries
/// retryable failures with exponential backoff.
///
/// # Example
///
/// ```ignore
/// let retrying = RetryingExporter::new(HttpExporter::new(endpoint)?, RetryPolicy::default())
///     .with_attempt_timeout(Duration::from_secs(10));
///
/// // Up to 5 attempts, each bounded by 10s
/// retrying.export(batch).await?;
/// ```
pub struct RetryingExporter<E: TelemetryExporter> {
    inner: E,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    /// Metrics: export attempts made, first attempts included
    total_attempts: AtomicU64,
    /// Metrics: retries made (attempts after the first)
    total_retries: AtomicU64,
    /// Metrics: successful exports after retry (not first attempt)
    recovered_exports: AtomicU64,
}

impl<E: TelemetryExporter> RetryingExporter<E> {
    /// Create a new retrying exporter with the given policy.
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            attempt_timeout: Duration::from_secs(10),
            total_attempts: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    /// Create with the default retry policy.
    pub fn with_defaults(inner: E) -> Self {
        Self::new(inner, RetryPolicy::default())
    }

    /// Upper bound for a single export call.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the total number of export attempts made.
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts.load(Ordering::Relaxed)
    }

    /// Returns the total number of retry attempts made.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Returns exports that succeeded after at least one retry.
    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }

    async fn attempt(&self, batch: Batch) -> ExportResult {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.attempt_timeout, self.inner.export(batch)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout(self.attempt_timeout)),
        }
    }
}

impl<E: TelemetryExporter> TelemetryExporter for RetryingExporter<E> {
    async fn export(&self, batch: Batch) -> ExportResult {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            debug_assert_attempts_bounded!(attempt, max_attempts);

            let error = match self.attempt(batch.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err(ExportError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = error
                .retry_after()
                .map_or_else(|| self.policy.delay_for_retry(attempt), |hint| {
                    hint.min(self.policy.max_delay)
                });
            tracing::warn!(
                exporter = self.inner.name(),
                kind = %batch.kind(),
                items = batch.len(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "export failed, retrying"
            );

            self.total_retries.fetch_add(1, Ordering::Relaxed);
            sleep(delay).await;
            attempt += 1;
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;
    use crate::item::testing::span;
    use crate::item::Resource;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn make_test_batch() -> Batch {
        Batch::from_items(Arc::new(Resource::new("svc")), vec![span("test")]).unwrap()
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(0.0)
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        let delays: Vec<u64> = (1..=7).map(|r| policy.delay_for_retry(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.delay_for_retry(2);
            assert!(d >= Duration::from_millis(1600) && d <= Duration::from_millis(2400), "{d:?}");
        }
        // Cap applies after jitter
        for _ in 0..200 {
            assert!(policy.delay_for_retry(10) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_jitter_near_duration_max_saturates() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::MAX)
            .with_max_delay(Duration::MAX)
            .with_jitter(0.5);
        for retry in 1..=50 {
            assert!(policy.delay_for_retry(retry) > Duration::from_secs(1));
        }
    }

    #[test]
    fn test_zero_retries_means_one_attempt() {
        assert_eq!(RetryPolicy::default().with_max_retries(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let base = InMemoryExporter::new();
        base.fail_next(2, ExportError::Transport("simulated failure".into()));
        let retrying = RetryingExporter::new(base, fast_policy(5));

        let start = Instant::now();
        retrying.export(make_test_batch()).await.unwrap();

        assert_eq!(retrying.total_attempts(), 3);
        assert_eq!(retrying.total_retries(), 2);
        assert_eq!(retrying.recovered_exports(), 1);
        assert_eq!(retrying.inner().batches().len(), 1);
        // 100ms + 200ms of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_after_max_attempts() {
        let base = InMemoryExporter::new();
        base.fail_next(100, ExportError::Transport("refused".into()));
        let retrying = RetryingExporter::new(base, fast_policy(3));

        let err = retrying.export(make_test_batch()).await.unwrap_err();
        assert_eq!(
            err,
            ExportError::RetriesExhausted {
                attempts: 3,
                last: Box::new(ExportError::Transport("refused".into())),
            }
        );
        assert_eq!(retrying.inner().export_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_not_retried() {
        let base = InMemoryExporter::new();
        base.fail_next(1, ExportError::Rejected("400 Bad Request".into()));
        let retrying = RetryingExporter::new(base, fast_policy(5));

        let err = retrying.export(make_test_batch()).await.unwrap_err();
        assert_eq!(err, ExportError::Rejected("400 Bad Request".into()));
        assert_eq!(retrying.total_attempts(), 1);
        assert_eq!(retrying.total_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let base = InMemoryExporter::new().with_delay(Duration::from_secs(60));
        let retrying =
            RetryingExporter::new(base, fast_policy(2)).with_attempt_timeout(Duration::from_secs(1));

        let err = retrying.export(make_test_batch()).await.unwrap_err();
        match err {
            ExportError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(*last, ExportError::Timeout(Duration::from_secs(1)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honored() {
        let base = InMemoryExporter::new();
        base.fail_next(
            1,
            ExportError::Throttled {
                retry_after: Some(Duration::from_millis(700)),
            },
        );
        let retrying = RetryingExporter::new(base, fast_policy(3));

        let start = Instant::now();
        retrying.export(make_test_batch()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }
}
