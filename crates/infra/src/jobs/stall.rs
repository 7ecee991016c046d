//! Stall detection: recovers running jobs whose attempt outlived its timeout.
//!
//! Runs on its own interval, independent of the worker pool. A recovered job
//! goes `running -> stalled` under the token observed at scan time, then
//! through the retry decision like any other failure. The revocation bumps
//! the token, so the original worker's late result is rejected. A job left in
//! `stalled` by an interrupted sweep is picked up again by the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::ExecutionError;
use super::lifecycle::StatusUpdate;
use super::retry::{FailureDecision, RetryPolicy};
use super::store::{JobStore, JobStoreError, UpdateOutcome};
use super::types::{Job, JobStatus};

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    /// Moved to `retry`
    pub retried: usize,
    /// Moved to `failed`
    pub failed: usize,
    /// Finished or was revoked between the scan and the transition
    pub skipped: usize,
    pub errors: usize,
}

pub struct StallDetector {
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    interval: Duration,
    batch_size: usize,
}

impl std::fmt::Debug for StallDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StallDetector")
            .field("interval", &self.interval)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl StallDetector {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// One scan over overdue running jobs.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, JobStoreError> {
        let overdue = self.store.find_overdue(now, self.batch_size).await?;
        let mut report = SweepReport {
            scanned: overdue.len(),
            ..SweepReport::default()
        };

        for job in overdue {
            match self.recover(&job, now).await {
                Ok(Some(FailureDecision::Retry { .. })) => report.retried += 1,
                Ok(Some(FailureDecision::Fail)) => report.failed += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(job_id = %job.id, error = %e, "stall recovery failed");
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                retried = report.retried,
                failed = report.failed,
                skipped = report.skipped,
                "stall sweep finished"
            );
        }
        Ok(report)
    }

    async fn recover(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureDecision>, JobStoreError> {
        let error = ExecutionError::Stalled {
            timeout_ms: job.timeout_ms,
        };

        // A job already in `stalled` was revoked by an earlier sweep whose
        // second write never landed; resume from the decision step.
        let stalled = if job.status == JobStatus::Stalled {
            debug!(job_id = %job.id, "resuming interrupted stall recovery");
            job.clone()
        } else {
            let revoke = StatusUpdate::stalled(error.to_string(), now);
            match self.store.update_status(job.id, job.lock_token, revoke).await {
                Ok(UpdateOutcome::Applied(stalled)) => {
                    warn!(
                        job_id = %stalled.id,
                        org_id = %stalled.org_id,
                        lock_owner = job.lock_owner.as_deref().unwrap_or_default(),
                        timeout_ms = job.timeout_ms,
                        "job stalled, lease revoked"
                    );
                    stalled
                }
                Ok(UpdateOutcome::Stale) => {
                    debug!(job_id = %job.id, "job moved on before stall recovery");
                    return Ok(None);
                }
                // Finished between the scan and the transition.
                Err(JobStoreError::InvalidTransition { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        };

        let decision = self.retry.decide(&stalled, error.is_retryable(), now);
        let update = match decision {
            FailureDecision::Retry {
                retry_count,
                scheduled_for,
            } => StatusUpdate::retry(retry_count, scheduled_for, error.to_string(), now),
            FailureDecision::Fail => StatusUpdate::failed(error.to_string(), now),
        };

        match self.store.update_status(stalled.id, stalled.lock_token, update).await {
            Ok(UpdateOutcome::Applied(job)) => {
                debug!(job_id = %job.id, status = %job.status, "stalled job resolved");
                Ok(Some(decision))
            }
            // Cancelled, deleted or resolved by another sweep meanwhile.
            Ok(UpdateOutcome::Stale) | Err(JobStoreError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> StallDetectorHandle {
        let token = shutdown.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.sweep(Utc::now()).await {
                    warn!(error = %e, "stall sweep failed");
                }
            }
            debug!("stall detector stopped");
        });

        StallDetectorHandle { shutdown, join }
    }
}

/// Handle to a running stall detector.
#[derive(Debug)]
pub struct StallDetectorHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl StallDetectorHandle {
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "stall detector ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::lifecycle::ControlAction;
    use crate::jobs::payload::JobData;
    use crate::jobs::query::{JobFilter, JobPage, Pagination};
    use crate::jobs::store::{ClaimRequest, InMemoryJobStore, JobStats, Lease};
    use crate::jobs::types::{JobId, JobProgress, NewJob};
    use async_trait::async_trait;
    use caseflow_core::{OrgId, UserId};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store whose first non-stall status write fails.
    struct FailingResolveStore {
        inner: Arc<InMemoryJobStore>,
        fail_next_resolve: AtomicBool,
    }

    #[async_trait]
    impl JobStore for FailingResolveStore {
        async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
            self.inner.create(new_job).await
        }

        async fn try_claim(&self, request: &ClaimRequest) -> Result<Option<Job>, JobStoreError> {
            self.inner.try_claim(request).await
        }

        async fn update_status(
            &self,
            id: JobId,
            expected_token: u64,
            update: StatusUpdate,
        ) -> Result<UpdateOutcome, JobStoreError> {
            if update.status != JobStatus::Stalled
                && self.fail_next_resolve.swap(false, Ordering::SeqCst)
            {
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.update_status(id, expected_token, update).await
        }

        async fn report_progress(
            &self,
            id: JobId,
            expected_token: u64,
            progress: JobProgress,
        ) -> Result<UpdateOutcome, JobStoreError> {
            self.inner.report_progress(id, expected_token, progress).await
        }

        async fn lease(&self, id: JobId) -> Result<Option<Lease>, JobStoreError> {
            self.inner.lease(id).await
        }

        async fn get(&self, org_id: OrgId, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(org_id, id).await
        }

        async fn query(
            &self,
            org_id: OrgId,
            filter: &JobFilter,
            pagination: &Pagination,
        ) -> Result<JobPage, JobStoreError> {
            self.inner.query(org_id, filter, pagination).await
        }

        async fn delete(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
            self.inner.delete(org_id, id).await
        }

        async fn control(
            &self,
            org_id: OrgId,
            id: JobId,
            action: ControlAction,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            self.inner.control(org_id, id, action, now).await
        }

        async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
            self.inner.promote_due(now).await
        }

        async fn find_overdue(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.find_overdue(now, limit).await
        }

        async fn purge_finished(
            &self,
            org_id: OrgId,
            before: DateTime<Utc>,
        ) -> Result<usize, JobStoreError> {
            self.inner.purge_finished(org_id, before).await
        }

        async fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
            self.inner.stats(org_id).await
        }
    }

    async fn running(store: &Arc<InMemoryJobStore>, max_retries: u32) -> Job {
        store
            .create(
                NewJob::new(OrgId::new(), UserId::new(), JobData::maintenance("vacuum"))
                    .with_timeout_ms(1_000)
                    .with_max_retries(max_retries),
            )
            .await
            .unwrap();
        store
            .try_claim(&ClaimRequest::new("w1", Utc::now()))
            .await
            .unwrap()
            .unwrap()
    }

    fn detector(store: Arc<InMemoryJobStore>) -> StallDetector {
        StallDetector::new(store, RetryPolicy::fixed(Duration::from_secs(5)))
    }

    fn past_timeout(job: &Job) -> DateTime<Utc> {
        job.started_at.unwrap() + chrono::Duration::seconds(5)
    }

    #[tokio::test]
    async fn overdue_job_is_retried_and_old_token_is_dead() {
        let store = InMemoryJobStore::arc();
        let job = running(&store, 2).await;

        let report = detector(store.clone()).sweep(past_timeout(&job)).await.unwrap();
        assert_eq!(report, SweepReport { scanned: 1, retried: 1, ..Default::default() });

        let stored = store.get(job.org_id, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.lock_token, job.lock_token + 1);

        let late = store
            .update_status(job.id, job.lock_token, StatusUpdate::completed(Utc::now()))
            .await
            .unwrap();
        assert_eq!(late, UpdateOutcome::Stale);
    }

    #[tokio::test]
    async fn exhausted_budget_fails_the_job() {
        let store = InMemoryJobStore::arc();
        let job = running(&store, 0).await;

        let report = detector(store.clone()).sweep(past_timeout(&job)).await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = store.get(job.org_id, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("stalled"));
    }

    #[tokio::test]
    async fn jobs_within_timeout_are_left_alone() {
        let store = InMemoryJobStore::arc();
        let job = running(&store, 1).await;

        let report = detector(store.clone()).sweep(job.started_at.unwrap()).await.unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn completion_racing_the_sweep_wins() {
        let store = InMemoryJobStore::arc();
        let job = running(&store, 1).await;
        let detector = detector(store.clone());

        // Scanned as overdue, but the worker finishes first.
        store
            .update_status(job.id, job.lock_token, StatusUpdate::completed(Utc::now()))
            .await
            .unwrap();
        assert!(detector.recover(&job, past_timeout(&job)).await.unwrap().is_none());

        let stored = store.get(job.org_id, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_job_is_not_recovered() {
        let store = InMemoryJobStore::arc();
        let job = running(&store, 1).await;
        store
            .control(job.org_id, job.id, ControlAction::Cancel, Utc::now())
            .await
            .unwrap();

        let report = detector(store.clone()).sweep(past_timeout(&job)).await.unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn interrupted_recovery_is_resumed_by_the_next_sweep() {
        let inner = InMemoryJobStore::arc();
        let job = running(&inner, 2).await;
        let store = Arc::new(FailingResolveStore {
            inner: inner.clone(),
            fail_next_resolve: AtomicBool::new(true),
        });
        let detector = StallDetector::new(store, RetryPolicy::fixed(Duration::from_secs(5)));
        let at = past_timeout(&job);

        let first = detector.sweep(at).await.unwrap();
        assert_eq!(first, SweepReport { scanned: 1, errors: 1, ..Default::default() });
        let stuck = inner.get(job.org_id, job.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Stalled);

        let second = detector.sweep(at).await.unwrap();
        assert_eq!(second, SweepReport { scanned: 1, retried: 1, ..Default::default() });

        let stored = inner.get(job.org_id, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.lock_token, job.lock_token + 1);
        assert!(inner.find_overdue(at, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_detector_sweeps_on_its_interval() {
        let store = InMemoryJobStore::arc();
        let job = running(&store, 0).await;
        let handle = detector(store.clone())
            .with_interval(Duration::from_millis(20))
            .spawn(CancellationToken::new());

        // Timeout is 1s of wall clock; allow a few sweeps after it passes.
        let mut status = JobStatus::Running;
        for _ in 0..150 {
            status = store.get(job.org_id, job.id).await.unwrap().unwrap().status;
            if status == JobStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;

        assert_eq!(status, JobStatus::Failed);
    }
}
