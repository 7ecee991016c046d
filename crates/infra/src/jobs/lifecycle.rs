//! State-machine mutations on a job record.
//!
//! Stores call these while holding whatever makes the write atomic for them
//! (an entry lock in memory, a row lock in Postgres), so every backend
//! applies the same transition rules. Fencing-token checks happen in the
//! store before these run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::JobStoreError;
use super::types::{Job, JobAttempt, JobProgress, JobStatus};

/// A status transition requested through the fenced update path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
    /// New retry counter (only for `retry`)
    pub retry_count: Option<u32>,
    /// Next eligibility time (only for `retry`)
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Bump the fencing token so the current holder's writes go stale
    pub revoke_lease: bool,
}

impl StatusUpdate {
    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Completed,
            at,
            error: None,
            retry_count: None,
            scheduled_for: None,
            revoke_lease: false,
        }
    }

    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(error.into()),
            ..Self::completed(at)
        }
    }

    pub fn retry(
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: JobStatus::Retry,
            error: Some(error.into()),
            retry_count: Some(retry_count),
            scheduled_for: Some(scheduled_for),
            ..Self::completed(at)
        }
    }

    /// Revoke a running job that exceeded its timeout.
    pub fn stalled(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Stalled,
            error: Some(error.into()),
            revoke_lease: true,
            ..Self::completed(at)
        }
    }
}

/// Control operations applied by callers (single or bulk). Delete is a
/// store operation of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    /// Re-queue keeping `retry_count`
    Retry,
    /// Re-queue with `retry_count = 0`
    Restart,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Cancel => "cancel",
            ControlAction::Retry => "retry",
            ControlAction::Restart => "restart",
        }
    }
}

impl Job {
    /// Take ownership for `owner`: `pending|queued|retry -> running`.
    ///
    /// Due `pending`/`retry` jobs pass through `queued` in the same step.
    pub fn claim(&mut self, owner: &str, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        if !self.status.is_claimable() || !self.is_due(now) {
            return Err(self.invalid_transition(JobStatus::Running));
        }

        self.status = JobStatus::Running;
        self.lock_owner = Some(owner.to_string());
        self.lock_token += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `pending|retry -> queued` once due. Returns whether anything changed.
    pub fn promote(&mut self, now: DateTime<Utc>) -> bool {
        if matches!(self.status, JobStatus::Pending | JobStatus::Retry) && self.is_due(now) {
            self.status = JobStatus::Queued;
            self.updated_at = now;
            true
        } else {
            false
        }
    }

    pub fn apply_update(&mut self, update: &StatusUpdate) -> Result<(), JobStoreError> {
        if !self.status.can_transition_to(update.status) {
            return Err(self.invalid_transition(update.status));
        }
        let retry_count = update.retry_count.unwrap_or(self.retry_count + 1);
        if update.status == JobStatus::Retry && retry_count > self.max_retries {
            return Err(self.invalid_transition(JobStatus::Retry));
        }

        if self.status == JobStatus::Running {
            self.close_attempt(update.at, update.error.clone());
        }

        match update.status {
            JobStatus::Completed => {
                self.completed_at.get_or_insert(update.at);
                self.last_error = None;
            }
            JobStatus::Failed => {
                self.failed_at.get_or_insert(update.at);
                self.last_error = update.error.clone();
            }
            JobStatus::Retry => {
                self.retry_count = retry_count;
                self.scheduled_for = update.scheduled_for.unwrap_or(update.at);
                // started_at always describes the current attempt
                self.started_at = None;
                self.last_error = update.error.clone();
            }
            JobStatus::Stalled => {
                self.last_error = update.error.clone();
            }
            _ => {}
        }

        if update.revoke_lease {
            self.lock_token += 1;
        }
        self.status = update.status;
        self.lock_owner = None;
        self.updated_at = update.at;
        Ok(())
    }

    pub fn apply_control(
        &mut self,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let target = match action {
            ControlAction::Cancel => JobStatus::Cancelled,
            ControlAction::Retry | ControlAction::Restart => JobStatus::Queued,
        };
        let allowed = match action {
            ControlAction::Cancel => self.status.can_transition_to(JobStatus::Cancelled),
            ControlAction::Retry | ControlAction::Restart => {
                matches!(self.status, JobStatus::Failed | JobStatus::Cancelled)
            }
        };
        if !allowed {
            return Err(JobStoreError::InvalidState {
                id: self.id,
                status: self.status,
                operation: action.as_str(),
            });
        }

        if self.status == JobStatus::Running {
            // Cooperative: the holder keeps running but its token is dead.
            self.close_attempt(now, Some("cancelled".to_string()));
            self.lock_token += 1;
        }

        match action {
            ControlAction::Cancel => {}
            ControlAction::Retry | ControlAction::Restart => {
                if action == ControlAction::Restart {
                    self.retry_count = 0;
                }
                self.scheduled_for = now;
                self.started_at = None;
                self.last_error = None;
                self.progress = None;
            }
        }

        self.status = target;
        self.lock_owner = None;
        self.updated_at = now;
        Ok(())
    }

    /// Progress may only be written by the holder of a running job.
    pub fn set_progress(&mut self, progress: JobProgress, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.progress = Some(progress);
        self.updated_at = now;
        true
    }

    fn close_attempt(&mut self, finished_at: DateTime<Utc>, error: Option<String>) {
        if let Some(started_at) = self.started_at {
            self.history
                .push(JobAttempt::new(self.attempt(), started_at, finished_at, error));
        }
    }

    fn invalid_transition(&self, to: JobStatus) -> JobStoreError {
        JobStoreError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::payload::JobData;
    use crate::jobs::types::NewJob;
    use caseflow_core::{OrgId, UserId};

    fn pending(max_retries: u32) -> Job {
        NewJob::new(OrgId::new(), UserId::new(), JobData::email_storage("e", "c"))
            .with_max_retries(max_retries)
            .into_job(Utc::now())
    }

    fn running(max_retries: u32) -> Job {
        let mut job = pending(max_retries);
        job.claim("worker-a", Utc::now()).unwrap();
        job
    }

    #[test]
    fn claim_sets_lease_and_bumps_token() {
        let mut job = pending(3);
        let now = Utc::now();
        job.claim("worker-a", now).unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.lock_owner.as_deref(), Some("worker-a"));
        assert_eq!(job.lock_token, 1);
        assert_eq!(job.started_at, Some(now));
        assert!(job.scheduled_for <= now);
    }

    #[test]
    fn claim_refuses_future_jobs() {
        let mut job = pending(3);
        job.scheduled_for = Utc::now() + chrono::Duration::hours(1);
        assert!(job.claim("worker-a", Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn completion_clears_error_and_lock() {
        let mut job = running(3);
        job.last_error = Some("earlier".into());
        job.apply_update(&StatusUpdate::completed(Utc::now())).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.last_error.is_none());
        assert!(job.lock_owner.is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
    }

    #[test]
    fn retry_reschedules_and_keeps_invariant() {
        let mut job = running(2);
        let later = Utc::now() + chrono::Duration::seconds(10);
        job.apply_update(&StatusUpdate::retry(1, later, "boom", Utc::now()))
            .unwrap();

        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.scheduled_for, later);
        assert!(job.started_at.is_none());
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn retry_past_budget_is_rejected() {
        let mut job = running(1);
        job.retry_count = 1;
        let err = job
            .apply_update(&StatusUpdate::retry(2, Utc::now(), "x", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn stall_revokes_the_lease() {
        let mut job = running(2);
        let token = job.lock_token;
        job.apply_update(&StatusUpdate::stalled("timed out", Utc::now()))
            .unwrap();

        assert_eq!(job.status, JobStatus::Stalled);
        assert_eq!(job.lock_token, token + 1);
        assert!(job.lock_owner.is_none());
    }

    #[test]
    fn completed_is_terminal() {
        let mut job = running(2);
        job.apply_update(&StatusUpdate::completed(Utc::now())).unwrap();
        assert!(job.apply_update(&StatusUpdate::failed("late", Utc::now())).is_err());
        assert!(job.apply_control(ControlAction::Retry, Utc::now()).is_err());
        assert!(job.apply_control(ControlAction::Cancel, Utc::now()).is_err());
    }

    #[test]
    fn cancel_running_is_cooperative() {
        let mut job = running(2);
        let token = job.lock_token;
        job.apply_control(ControlAction::Cancel, Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.lock_token, token + 1);
        assert_eq!(job.history.last().unwrap().error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn retry_keeps_counter_restart_resets_it() {
        let mut job = running(3);
        job.retry_count = 2;
        job.apply_update(&StatusUpdate::failed("bad", Utc::now())).unwrap();

        let mut retried = job.clone();
        retried.apply_control(ControlAction::Retry, Utc::now()).unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 2);
        assert!(retried.last_error.is_none());
        // Lifecycle timestamps are written once and survive a re-run.
        assert_eq!(retried.failed_at, job.failed_at);

        let mut restarted = job;
        restarted.apply_control(ControlAction::Restart, Utc::now()).unwrap();
        assert_eq!(restarted.retry_count, 0);
    }

    #[test]
    fn terminal_timestamps_are_set_once() {
        let first = Utc::now();
        let mut job = running(1);
        job.apply_update(&StatusUpdate::failed("first", first)).unwrap();

        job.apply_control(ControlAction::Restart, first).unwrap();
        job.claim("w2", first).unwrap();
        let later = first + chrono::Duration::seconds(30);
        job.apply_update(&StatusUpdate::failed("second", later)).unwrap();

        assert_eq!(job.failed_at, Some(first));
        assert_eq!(job.last_error.as_deref(), Some("second"));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn progress_requires_running() {
        let mut job = pending(0);
        assert!(!job.set_progress(JobProgress::new(1, 2), Utc::now()));

        job.claim("w", Utc::now()).unwrap();
        assert!(job.set_progress(JobProgress::new(1, 2), Utc::now()));
        assert_eq!(job.progress, Some(JobProgress::new(1, 2)));
    }
}
