// ============================================================================
// Conflict Retry Module
// ============================================================================
//
// Re-runs operations that were aborted by optimistic concurrency control.
//
// - Classification is injected (ConflictClassifier), never hardcoded
// - Backoff: base * 2^attempt plus jitter in (0, base * 2^attempt * fraction]
// - Only the backoff sleep is a suspension point owned by the executor;
//   it is raced against the caller's CancellationToken
//
// ============================================================================

pub mod classify;

pub use classify::{ConflictClass, ConflictClassifier, DEFAULT_CONFLICT_CODES, OccClassifier};

use crate::core::RetryError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Largest exponent applied to the base backoff.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// Upper bound accepted for the base backoff.
pub const MAX_BASE_BACKOFF: Duration = Duration::from_secs(60);

/// Configuration for automatic conflict retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of invocations, including the first one.
    pub max_attempts: u32,
    /// Base delay, doubled for every further attempt. Configured in
    /// milliseconds (`base_backoff_ms`).
    #[serde(rename = "base_backoff_ms", with = "duration_ms")]
    pub base_backoff: Duration,
    /// Upper bound of the random component as a fraction of the current backoff.
    pub jitter_fraction: f64,
    /// Seed for the jitter generator. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            jitter_fraction: 0.5,
            seed: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            ..Self::default()
        }
    }

    /// Set maximum attempts
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set base backoff
    pub fn base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Set jitter fraction
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Fix the jitter seed so that the delay sequence is reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate policy
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }

        if self.base_backoff > MAX_BASE_BACKOFF {
            return Err(format!(
                "base_backoff must be at most {}ms",
                MAX_BASE_BACKOFF.as_millis()
            ));
        }

        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err("jitter_fraction must be within [0, 1)".to_string());
        }

        Ok(())
    }
}

mod duration_ms {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Delay generator for one retry loop.
///
/// Each loop owns its generator, so concurrent loops never contend on a
/// shared random source.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    base: Duration,
    jitter_fraction: f64,
    rng: StdRng,
}

impl BackoffSchedule {
    pub fn new(policy: &RetryPolicy) -> Self {
        let rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            base: policy.base_backoff,
            jitter_fraction: policy.jitter_fraction.clamp(0.0, 0.999),
            rng,
        }
    }

    /// Deterministic part of the delay before retry number `attempt + 1`.
    pub fn exponential(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(1u32 << attempt.min(MAX_BACKOFF_SHIFT))
    }

    /// Random part, in `[1ns, backoff * fraction]`, or zero when jitter is disabled.
    pub fn jitter(&mut self, backoff: Duration) -> Duration {
        let ceiling = (backoff.as_nanos() as f64 * self.jitter_fraction) as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.gen_range(1..=ceiling))
    }

    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let backoff = self.exponential(attempt);
        backoff.saturating_add(self.jitter(backoff))
    }
}

/// What a retry loop did, regardless of its outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Number of times the operation was invoked.
    pub attempts: u32,
    /// Every backoff slept, in order.
    pub delays: Vec<Duration>,
}

impl RetryReport {
    pub fn sleeps(&self) -> usize {
        self.delays.len()
    }

    pub fn total_backoff(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Re-invokes an operation while it fails with transient conflicts.
///
/// # Examples
///
/// ```ignore
/// let executor = RetryExecutor::new(RetryPolicy::default());
/// let count = executor
///     .execute(|| async { ledger.has_rows().await })
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct RetryExecutor<C = OccClassifier> {
    policy: RetryPolicy,
    classifier: C,
    cancel: Option<CancellationToken>,
}

impl RetryExecutor<OccClassifier> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_classifier(policy, OccClassifier::default())
    }
}

impl Default for RetryExecutor<OccClassifier> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<C> RetryExecutor<C> {
    pub fn with_classifier(policy: RetryPolicy, classifier: C) -> Self {
        Self {
            policy,
            classifier,
            cancel: None,
        }
    }

    /// Stop retrying as soon as `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Runs `operation` until it succeeds, fails terminally, runs out of
    /// attempts, or the cancellation token fires.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        C: ConflictClassifier<E>,
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_report(operation).await.0
    }

    /// Same as [`execute`](Self::execute), also returning what the loop did.
    pub async fn execute_with_report<T, E, F, Fut>(
        &self,
        mut operation: F,
    ) -> (Result<T, RetryError<E>>, RetryReport)
    where
        C: ConflictClassifier<E>,
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut schedule = BackoffSchedule::new(&self.policy);
        let mut report = RetryReport::default();

        loop {
            if self.is_cancelled() {
                let attempts = report.attempts;
                return (Err(RetryError::Cancelled { attempts, last: None }), report);
            }

            report.attempts += 1;
            let attempts = report.attempts;

            let err = match operation().await {
                Ok(value) => return (Ok(value), report),
                Err(err) => err,
            };

            if !self.classifier.classify(&err).is_transient() {
                return (Err(RetryError::Terminal { attempts, source: err }), report);
            }

            if attempts >= max_attempts {
                warn!(attempts, error = %err, "conflict retry limit exceeded");
                return (Err(RetryError::Exhausted { attempts, source: err }), report);
            }

            let delay = schedule.next_delay(attempts - 1);
            warn!(
                attempt = attempts,
                max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after optimistic concurrency conflict"
            );
            report.delays.push(delay);

            if !self.sleep(delay).await {
                return (
                    Err(RetryError::Cancelled {
                        attempts,
                        last: Some(err),
                    }),
                    report,
                );
            }
        }
    }

    /// Returns `false` when interrupted by cancellation.
    async fn sleep(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_backoff, Duration::from_millis(10));
        assert_eq!(policy.jitter_fraction, 0.5);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().max_attempts(0).validate().is_err());
        assert!(RetryPolicy::default().jitter_fraction(1.0).validate().is_err());
        assert!(RetryPolicy::default().jitter_fraction(-0.1).validate().is_err());
        assert!(RetryPolicy::default().jitter_fraction(0.0).validate().is_ok());
    }

    #[test]
    fn test_exponential_doubles() {
        let schedule = BackoffSchedule::new(&RetryPolicy::default());
        assert_eq!(schedule.exponential(0), Duration::from_millis(10));
        assert_eq!(schedule.exponential(1), Duration::from_millis(20));
        assert_eq!(schedule.exponential(4), Duration::from_millis(160));
    }

    #[test]
    fn test_jitter_is_bounded_and_nonzero() {
        let mut schedule = BackoffSchedule::new(&RetryPolicy::default().seed(7));
        for attempt in 0..8 {
            let backoff = schedule.exponential(attempt);
            let jitter = schedule.jitter(backoff);
            assert!(jitter > Duration::ZERO);
            assert!(jitter <= backoff / 2);
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let mut schedule = BackoffSchedule::new(&RetryPolicy::default().jitter_fraction(0.0));
        assert_eq!(schedule.next_delay(0), Duration::from_millis(10));
        assert_eq!(schedule.next_delay(2), Duration::from_millis(40));
    }

    #[test]
    fn test_same_seed_same_delays() {
        let policy = RetryPolicy::default().seed(42);
        let mut a = BackoffSchedule::new(&policy);
        let mut b = BackoffSchedule::new(&policy);
        for attempt in 0..5 {
            assert_eq!(a.next_delay(attempt), b.next_delay(attempt));
        }
    }

    #[test]
    fn test_huge_attempt_index_saturates() {
        let schedule = BackoffSchedule::new(&RetryPolicy::default());
        assert_eq!(schedule.exponential(64), schedule.exponential(MAX_BACKOFF_SHIFT));
    }

    #[test]
    fn test_sub_millisecond_base_is_kept() {
        let policy = RetryPolicy::new(5, Duration::from_micros(500)).jitter_fraction(0.0);
        let mut schedule = BackoffSchedule::new(&policy);
        assert_eq!(schedule.next_delay(0), Duration::from_micros(500));
        assert_eq!(schedule.next_delay(1), Duration::from_millis(1));
    }

    #[test]
    fn test_oversized_base_is_rejected_and_never_overflows() {
        let policy = RetryPolicy::default().base_backoff(Duration::from_millis(u64::MAX));
        assert!(policy.validate().is_err());
        assert!(
            RetryPolicy::default()
                .base_backoff(MAX_BASE_BACKOFF)
                .validate()
                .is_ok()
        );

        let mut schedule = BackoffSchedule::new(&policy.seed(1));
        assert_eq!(schedule.next_delay(30), Duration::MAX);
    }

    #[test]
    fn test_policy_reads_milliseconds_from_json() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{ "max_attempts": 3, "base_backoff_ms": 25 }"#).unwrap();
        assert_eq!(policy.base_backoff, Duration::from_millis(25));
        assert_eq!(policy.jitter_fraction, 0.5);
    }

    #[test]
    fn test_report_totals() {
        let report = RetryReport {
            attempts: 3,
            delays: vec![Duration::from_millis(12), Duration::from_millis(25)],
        };
        assert_eq!(report.sleeps(), 2);
        assert_eq!(report.total_backoff(), Duration::from_millis(37));
    }
}
