//! Handler registration and the execution context handed to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use caseflow_core::OrgId;

use super::payload::JobData;
use super::store::{JobStore, JobStoreError, UpdateOutcome};
use super::types::{Job, JobProgress, JobType};

/// Why an attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Failure worth retrying (network, lock contention, ...)
    #[error("{0}")]
    Transient(String),
    /// Failure that will not go away on retry
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("stalled: no completion within {timeout_ms}ms")]
    Stalled { timeout_ms: u64 },
    #[error("cancelled")]
    Cancelled,
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("no handler registered for job type {0}")]
    NoHandler(JobType),
}

impl ExecutionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the retry budget applies. Permanent failures and missing
    /// handlers fail the job outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Transient(_)
                | ExecutionError::Timeout { .. }
                | ExecutionError::Stalled { .. }
                | ExecutionError::Panicked(_)
        )
    }
}

impl From<JobStoreError> for ExecutionError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Storage(msg) => ExecutionError::Transient(msg),
            other => ExecutionError::Permanent(other.to_string()),
        }
    }
}

/// What a handler gets for one attempt.
///
/// The cancellation token fires when the job is cancelled or its lease is
/// revoked, and when the attempt times out. Handlers should check it
/// between units of work.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    cancel: CancellationToken,
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("lock_token", &self.job.lock_token)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken, store: Arc<dyn JobStore>) -> Self {
        Self { job, cancel, store }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn data(&self) -> &JobData {
        &self.job.data
    }

    pub fn org_id(&self) -> OrgId {
        self.job.org_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt should stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(Cancelled)` if the attempt should stop; a cheap checkpoint.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record progress under this attempt's lease.
    ///
    /// A stale lease means someone else owns the job now: the attempt is
    /// cancelled and `Err(Cancelled)` is returned.
    pub async fn report_progress(&self, completed: u32, total: u32) -> Result<(), ExecutionError> {
        let outcome = self
            .store
            .report_progress(self.job.id, self.job.lock_token, JobProgress::new(completed, total))
            .await?;
        match outcome {
            UpdateOutcome::Applied(_) => Ok(()),
            UpdateOutcome::Stale => {
                debug!(job_id = %self.job.id, "progress rejected, lease is gone");
                self.cancel.cancel();
                Err(ExecutionError::Cancelled)
            }
        }
    }
}

/// Business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> Result<(), ExecutionError>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
{
    async fn execute(&self, ctx: JobContext) -> Result<(), ExecutionError> {
        (self.f)(ctx).await
    }
}

/// Job type -> handler map. At most one handler per type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(job_type, handler).is_some() {
            info!(%job_type, "replaced job handler");
        } else {
            debug!(%job_type, "registered job handler");
        }
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, job_type: JobType, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler { f }));
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

/// Purges the org's finished jobs older than the payload's retention window.
pub struct RetentionCleanupHandler {
    store: Arc<dyn JobStore>,
}

impl RetentionCleanupHandler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for RetentionCleanupHandler {
    async fn execute(&self, ctx: JobContext) -> Result<(), ExecutionError> {
        let JobData::CleanupStorage(payload) = ctx.data() else {
            return Err(ExecutionError::permanent("expected a cleanup_storage payload"));
        };
        ctx.checkpoint()?;

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(payload.retention_days));
        let purged = self.store.purge_finished(ctx.org_id(), cutoff).await?;
        info!(
            org_id = %ctx.org_id(),
            retention_days = payload.retention_days,
            purged,
            "purged finished jobs"
        );
        ctx.report_progress(1, 1).await
    }
}

/// Assigns a single email to a case. Implemented by the email subsystem.
#[async_trait]
pub trait EmailAssigner: Send + Sync {
    async fn assign(&self, org_id: OrgId, email_id: &str, case_id: &str)
        -> Result<(), ExecutionError>;
}

/// Works through an `email_bulk_assignment` payload in order, reporting
/// progress after each email and stopping at the first cancelled checkpoint.
pub struct BulkAssignmentHandler<A> {
    assigner: A,
}

impl<A: EmailAssigner> BulkAssignmentHandler<A> {
    pub fn new(assigner: A) -> Self {
        Self { assigner }
    }
}

#[async_trait]
impl<A: EmailAssigner> JobHandler for BulkAssignmentHandler<A> {
    async fn execute(&self, ctx: JobContext) -> Result<(), ExecutionError> {
        let JobData::EmailBulkAssignment(payload) = ctx.data() else {
            return Err(ExecutionError::permanent("expected an email_bulk_assignment payload"));
        };
        let total = u32::try_from(payload.email_ids.len()).unwrap_or(u32::MAX);

        for (done, email_id) in payload.email_ids.iter().enumerate() {
            ctx.checkpoint()?;
            self.assigner
                .assign(ctx.org_id(), email_id, &payload.case_id)
                .await?;
            let done = u32::try_from(done + 1).unwrap_or(u32::MAX);
            ctx.report_progress(done, total).await?;
        }
        Ok(())
    }
}
