//! Retry/backoff policy and the failure decision.
//!
//! The per-job retry budget lives on the job (`max_retries`); this module
//! owns the queue-wide delay policy and decides, for one failed attempt,
//! whether the job goes to `retry` or `failed`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Job, JobStatus};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^retry_count
    #[default]
    Exponential,
    /// Linear backoff: base * (retry_count + 1)
    Linear,
}

/// Queue-wide retry delay policy.
///
/// Every strategy is monotonic non-decreasing in `retry_count` and capped
/// at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows `retry_count` consumed retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // 2^63 already exceeds any sane cap; clamp the exponent.
                let exp = 2_f64.powi(retry_count.min(63) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (retry_count as f64 + 1.0),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Decide the outcome of a failed attempt.
    ///
    /// `retryable == false` (permanent failures) fails the job regardless of
    /// its remaining budget.
    pub fn decide(&self, job: &Job, retryable: bool, now: DateTime<Utc>) -> FailureDecision {
        if !retryable || job.retry_count >= job.max_retries {
            return FailureDecision::Fail;
        }

        let delay = self.delay_for(job.retry_count);
        FailureDecision::Retry {
            retry_count: job.retry_count + 1,
            scheduled_for: now + chrono::Duration::from_std(delay).unwrap_or_default(),
        }
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Re-run after `scheduled_for` with the incremented counter.
    Retry {
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
    },
    /// Retries exhausted or the error is permanent.
    Fail,
}

impl FailureDecision {
    pub fn status(&self) -> JobStatus {
        match self {
            FailureDecision::Retry { .. } => JobStatus::Retry,
            FailureDecision::Fail => JobStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::JobData;
    use crate::jobs::types::NewJob;
    use caseflow_core::{OrgId, UserId};
    use proptest::prelude::*;

    fn job_with(max_retries: u32, retry_count: u32) -> Job {
        let mut job = NewJob::new(OrgId::new(), UserId::new(), JobData::maintenance("vacuum"))
            .with_max_retries(max_retries)
            .into_job(Utc::now());
        job.retry_count = retry_count;
        job
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
    }

    #[test]
    fn zero_max_retries_fails_immediately() {
        let policy = RetryPolicy::default();
        let job = job_with(0, 0);
        assert_eq!(policy.decide(&job, true, Utc::now()), FailureDecision::Fail);
    }

    #[test]
    fn retry_schedules_after_backoff() {
        let policy = RetryPolicy::fixed(Duration::from_secs(30));
        let now = Utc::now();
        let job = job_with(3, 1);

        match policy.decide(&job, true, now) {
            FailureDecision::Retry {
                retry_count,
                scheduled_for,
            } => {
                assert_eq!(retry_count, 2);
                assert_eq!(scheduled_for, now + chrono::Duration::seconds(30));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn permanent_errors_skip_remaining_budget() {
        let policy = RetryPolicy::default();
        let job = job_with(5, 0);
        assert_eq!(policy.decide(&job, false, Utc::now()), FailureDecision::Fail);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: delays never shrink as retries accumulate and never pass the cap.
        #[test]
        fn backoff_is_monotonic_and_bounded(
            base_ms in 1u64..60_000,
            cap_factor in 1u64..1_000,
            strategy in prop_oneof![
                Just(BackoffStrategy::Fixed),
                Just(BackoffStrategy::Exponential),
                Just(BackoffStrategy::Linear),
            ],
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms * cap_factor),
                strategy,
            };

            let mut previous = Duration::ZERO;
            for retry_count in 0..70 {
                let delay = policy.delay_for(retry_count);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }

        /// Property: feeding any number of failures never pushes retry_count past max_retries.
        #[test]
        fn retry_count_never_exceeds_budget(
            max_retries in 0u32..=10,
            failures in 1usize..30,
        ) {
            let policy = RetryPolicy::default();
            let mut job = job_with(max_retries, 0);

            for _ in 0..failures {
                match policy.decide(&job, true, Utc::now()) {
                    FailureDecision::Retry { retry_count, .. } => job.retry_count = retry_count,
                    FailureDecision::Fail => break,
                }
                prop_assert!(job.retry_count <= job.max_retries);
            }
        }
    }
}
