//! Job storage: the store abstraction and the in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use caseflow_core::OrgId;

use super::lifecycle::{ControlAction, StatusUpdate};
use super::query::{JobFilter, JobPage, Pagination};
use super::types::{Job, JobId, JobProgress, JobStatus, NewJob, ValidationError};

/// Durable, org-scoped storage for job records.
///
/// Every mutation that a worker, the stall detector or a caller performs goes
/// through one of these operations. Implementations must make each of them
/// atomic per job: no two callers may both succeed in claiming the same job,
/// and fenced writes compare the token and write in one step.
///
/// ## Fencing
///
/// `lock_token` increments on every claim and every revocation (stall,
/// cancel of a running job). A writer holding an older token gets
/// [`UpdateOutcome::Stale`], which is an expected outcome rather than an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and persist a submission as a `pending` job.
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError>;

    /// Atomically claim the best due job: priority descending, then
    /// `scheduled_for` ascending. Returns `None` when nothing is eligible.
    async fn try_claim(&self, request: &ClaimRequest) -> Result<Option<Job>, JobStoreError>;

    /// Conditional transition keyed on the fencing token.
    async fn update_status(
        &self,
        id: JobId,
        expected_token: u64,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, JobStoreError>;

    /// Fenced progress write from the lease holder.
    async fn report_progress(
        &self,
        id: JobId,
        expected_token: u64,
        progress: JobProgress,
    ) -> Result<UpdateOutcome, JobStoreError>;

    /// Current lease state, regardless of org. Used by workers to notice
    /// revocation while a handler runs.
    async fn lease(&self, id: JobId) -> Result<Option<Lease>, JobStoreError>;

    /// Fetch a job. Jobs of other orgs are reported as absent.
    async fn get(&self, org_id: OrgId, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Filtered, sorted, paginated listing within one org.
    async fn query(
        &self,
        org_id: OrgId,
        filter: &JobFilter,
        pagination: &Pagination,
    ) -> Result<JobPage, JobStoreError>;

    /// Irreversibly remove a job that is not running.
    async fn delete(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError>;

    /// Apply a cancel/retry/restart request atomically.
    async fn control(
        &self,
        org_id: OrgId,
        id: JobId,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Move due `pending`/`retry` jobs into `queued`. Returns how many moved.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Running jobs whose attempt exceeded `timeout_ms`, plus jobs left in
    /// `stalled` by an interrupted recovery. Oldest start first.
    async fn find_overdue(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Delete finished jobs of one org last touched before `before`.
    async fn purge_finished(
        &self,
        org_id: OrgId,
        before: DateTime<Utc>,
    ) -> Result<usize, JobStoreError>;

    /// Per-status counts for one org.
    async fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("cannot {operation} job {id} while {status}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        operation: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Parameters for one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Worker instance taking the lease
    pub owner: String,
    pub now: DateTime<Utc>,
    /// Statuses considered eligible (intersected with the claimable set)
    pub statuses: Vec<JobStatus>,
    /// Restrict to one org (e.g. a dedicated worker)
    pub org_id: Option<OrgId>,
}

impl ClaimRequest {
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            now,
            statuses: vec![JobStatus::Queued, JobStatus::Pending, JobStatus::Retry],
            org_id: None,
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<JobStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn for_org(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn accepts(&self, job: &Job) -> bool {
        job.status.is_claimable()
            && self.statuses.contains(&job.status)
            && job.is_due(self.now)
            && self.org_id.is_none_or(|org| job.org_id == org)
    }
}

/// Result of a fenced write.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(Job),
    /// The caller's token was superseded; nothing was written.
    Stale,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }

    pub fn into_job(self) -> Option<Job> {
        match self {
            UpdateOutcome::Applied(job) => Some(job),
            UpdateOutcome::Stale => None,
        }
    }
}

/// Snapshot of who holds a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub status: JobStatus,
    pub lock_token: u64,
    pub lock_owner: Option<String>,
}

impl Lease {
    /// Whether the holder of `token` may still act on the job.
    pub fn is_held_by(&self, token: u64) -> bool {
        self.status == JobStatus::Running && self.lock_token == token
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retry: usize,
    pub stalled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, count: usize) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
            JobStatus::Retry => &mut self.retry,
            JobStatus::Stalled => &mut self.stalled,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.queued
            + self.running
            + self.completed
            + self.failed
            + self.cancelled
            + self.retry
            + self.stalled
    }
}

/// Dispatch order: higher priority first, then earlier `scheduled_for`.
/// Creation time and id break remaining ties deterministically.
pub fn dispatch_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.scheduled_for.cmp(&b.scheduled_for))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// In-memory job store for tests/dev.
///
/// Records live in a sharded map; each mutation holds only the lock of the
/// entry it changes. Claims pick a candidate from a snapshot and then
/// compare-and-swap it under its entry lock, retrying when another claimer
/// won the race.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn candidates(&self, request: &ClaimRequest) -> Vec<(JobId, u64)> {
        let mut eligible: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| request.accepts(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        eligible.sort_by(dispatch_order);
        eligible.into_iter().map(|j| (j.id, j.lock_token)).collect()
    }

    fn fenced<F>(
        &self,
        id: JobId,
        expected_token: u64,
        apply: F,
    ) -> Result<UpdateOutcome, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<bool, JobStoreError>,
    {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(UpdateOutcome::Stale);
        };
        if entry.lock_token != expected_token {
            return Ok(UpdateOutcome::Stale);
        }
        if apply(entry.value_mut())? {
            Ok(UpdateOutcome::Applied(entry.value().clone()))
        } else {
            Ok(UpdateOutcome::Stale)
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        new_job.validate()?;
        let job = new_job.into_job(Utc::now());
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn try_claim(&self, request: &ClaimRequest) -> Result<Option<Job>, JobStoreError> {
        // Losing a race only moves on to the next candidate. A pass that loses
        // every race means other claimers made progress, so take a fresh
        // snapshot; `None` only once nothing is eligible.
        loop {
            let candidates = self.candidates(request);
            if candidates.is_empty() {
                return Ok(None);
            }
            for (id, token) in candidates {
                let Some(mut entry) = self.jobs.get_mut(&id) else {
                    continue;
                };
                let job = entry.value_mut();
                if job.lock_token != token || !request.accepts(job) {
                    continue;
                }
                job.claim(&request.owner, request.now)?;
                return Ok(Some(job.clone()));
            }
        }
    }

    async fn update_status(
        &self,
        id: JobId,
        expected_token: u64,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, JobStoreError> {
        self.fenced(id, expected_token, |job| {
            job.apply_update(&update)?;
            Ok(true)
        })
    }

    async fn report_progress(
        &self,
        id: JobId,
        expected_token: u64,
        progress: JobProgress,
    ) -> Result<UpdateOutcome, JobStoreError> {
        self.fenced(id, expected_token, |job| {
            Ok(job.set_progress(progress, Utc::now()))
        })
    }

    async fn lease(&self, id: JobId) -> Result<Option<Lease>, JobStoreError> {
        Ok(self.jobs.get(&id).map(|job| Lease {
            status: job.status,
            lock_token: job.lock_token,
            lock_owner: job.lock_owner.clone(),
        }))
    }

    async fn get(&self, org_id: OrgId, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .jobs
            .get(&id)
            .filter(|job| job.org_id == org_id)
            .map(|job| job.clone()))
    }

    async fn query(
        &self,
        org_id: OrgId,
        filter: &JobFilter,
        pagination: &Pagination,
    ) -> Result<JobPage, JobStoreError> {
        pagination.validate()?;
        let matches: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.org_id == org_id && filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(JobPage::from_matches(matches, *pagination))
    }

    async fn delete(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
        let removed = self
            .jobs
            .remove_if(&id, |_, job| job.org_id == org_id && job.status != JobStatus::Running);
        if let Some((_, job)) = removed {
            return Ok(job);
        }

        match self.jobs.get(&id) {
            Some(job) if job.org_id == org_id => Err(JobStoreError::InvalidState {
                id,
                status: job.status,
                operation: "delete",
            }),
            _ => Err(JobStoreError::NotFound(id)),
        }
    }

    async fn control(
        &self,
        org_id: OrgId,
        id: JobId,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut entry = match self.jobs.get_mut(&id) {
            Some(entry) if entry.org_id == org_id => entry,
            _ => return Err(JobStoreError::NotFound(id)),
        };
        entry.value_mut().apply_control(action, now)?;
        Ok(entry.value().clone())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut promoted = 0;
        for mut entry in self.jobs.iter_mut() {
            if entry.value_mut().promote(now) {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn find_overdue(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut overdue: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.is_overdue(now))
            .map(|entry| entry.value().clone())
            .collect();
        overdue.sort_by_key(|job| job.started_at);
        overdue.truncate(limit);
        Ok(overdue)
    }

    async fn purge_finished(
        &self,
        org_id: OrgId,
        before: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let before_len = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.org_id == org_id && job.status.is_terminal() && job.updated_at < before)
        });
        Ok(before_len.saturating_sub(self.jobs.len()))
    }

    async fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for entry in self.jobs.iter().filter(|entry| entry.org_id == org_id) {
            stats.record(entry.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, new_job: NewJob) -> Result<Job, JobStoreError> {
        (**self).create(new_job).await
    }

    async fn try_claim(&self, request: &ClaimRequest) -> Result<Option<Job>, JobStoreError> {
        (**self).try_claim(request).await
    }

    async fn update_status(
        &self,
        id: JobId,
        expected_token: u64,
        update: StatusUpdate,
    ) -> Result<UpdateOutcome, JobStoreError> {
        (**self).update_status(id, expected_token, update).await
    }

    async fn report_progress(
        &self,
        id: JobId,
        expected_token: u64,
        progress: JobProgress,
    ) -> Result<UpdateOutcome, JobStoreError> {
        (**self).report_progress(id, expected_token, progress).await
    }

    async fn lease(&self, id: JobId) -> Result<Option<Lease>, JobStoreError> {
        (**self).lease(id).await
    }

    async fn get(&self, org_id: OrgId, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(org_id, id).await
    }

    async fn query(
        &self,
        org_id: OrgId,
        filter: &JobFilter,
        pagination: &Pagination,
    ) -> Result<JobPage, JobStoreError> {
        (**self).query(org_id, filter, pagination).await
    }

    async fn delete(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
        (**self).delete(org_id, id).await
    }

    async fn control(
        &self,
        org_id: OrgId,
        id: JobId,
        action: ControlAction,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).control(org_id, id, action, now).await
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).promote_due(now).await
    }

    async fn find_overdue(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_overdue(now, limit).await
    }

    async fn purge_finished(
        &self,
        org_id: OrgId,
        before: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        (**self).purge_finished(org_id, before).await
    }

    async fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
        (**self).stats(org_id).await
    }
}
