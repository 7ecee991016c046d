//! Worker pool: claims jobs and runs their handlers with timeout and
//! cooperative cancellation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, JobQueueConfig};

use super::handler::{ExecutionError, HandlerRegistry, JobContext, JobHandler};
use super::lifecycle::StatusUpdate;
use super::retry::FailureDecision;
use super::scheduler::Scheduler;
use super::store::{JobStore, JobStoreError, UpdateOutcome};
use super::types::{Job, JobId, JobStatus};

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Results rejected because the lease had moved on
    pub results_discarded: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    running: AtomicUsize,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            jobs_claimed: self.claimed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            results_discarded: self.discarded.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// How one attempt ended, as recorded in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The fenced write was applied; the job is now in this state.
    Recorded(Job),
    /// The lease was superseded (stall recovery, cancel, delete); the
    /// attempt's result was dropped.
    Discarded,
}

/// A fixed number of execution slots sharing one store.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    scheduler: Scheduler,
    config: JobQueueConfig,
    counters: Arc<PoolCounters>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("instance_id", &self.config.instance_id)
            .field("workers", &self.config.workers)
            .field("registry", &self.registry)
            .finish()
    }
}

impl WorkerPool {
    /// Fails on a config the slot loop or lease watch cannot run with
    /// (zero workers or intervals).
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: JobQueueConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let scheduler = Scheduler::new(store.clone(), config.instance_id.clone());
        Ok(Self {
            store,
            registry,
            scheduler,
            config,
            counters: Arc::new(PoolCounters::default()),
        })
    }

    /// Restrict which jobs this pool claims.
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Start `config.workers` slots. They stop claiming once `shutdown`
    /// fires; in-flight attempts run to completion.
    pub fn spawn(self, shutdown: CancellationToken) -> WorkerPoolHandle {
        let pool = Arc::new(self);
        let slots = (0..pool.config.workers)
            .map(|slot| {
                let pool = pool.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.slot_loop(slot, shutdown).await })
            })
            .collect();

        info!(
            instance_id = %pool.config.instance_id,
            workers = pool.config.workers,
            "worker pool started"
        );

        WorkerPoolHandle {
            shutdown,
            slots,
            counters: pool.counters.clone(),
        }
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        debug!(slot, "worker slot started");
        while !shutdown.is_cancelled() {
            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(e) => {
                    warn!(slot, error = %e, "claim failed");
                    false
                }
            };
            if worked {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(slot, "worker slot stopped");
    }

    /// Claim and run at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> Result<bool, JobStoreError> {
        let Some(job) = self.scheduler.claim_next(Utc::now()).await? else {
            return Ok(false);
        };
        self.counters.claimed.fetch_add(1, Ordering::Relaxed);
        info!(
            job_id = %job.id,
            org_id = %job.org_id,
            job_type = %job.job_type(),
            attempt = job.attempt(),
            worker = %self.scheduler.instance_id(),
            "claimed job"
        );

        self.counters.running.fetch_add(1, Ordering::Relaxed);
        let outcome = self.execute(job).await;
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
        outcome.map(|_| true)
    }

    /// Run a claimed job's handler and record the result under its lease.
    pub async fn execute(&self, job: Job) -> Result<AttemptOutcome, JobStoreError> {
        let result = match self.registry.get(job.job_type()) {
            Some(handler) => self.run_attempt(handler, &job).await,
            None => Err(ExecutionError::NoHandler(job.job_type())),
        };
        self.record(&job, result).await
    }

    async fn run_attempt(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &Job,
    ) -> Result<(), ExecutionError> {
        let cancel = CancellationToken::new();
        let ctx = JobContext::new(job.clone(), cancel.clone(), self.store.clone());
        let mut task = tokio::spawn(async move { handler.execute(ctx).await });
        let watch = self.spawn_lease_watch(job.id, job.lock_token, cancel.clone());

        let timeout = Duration::from_millis(job.timeout_ms);
        let result = tokio::select! {
            joined = &mut task => joined.unwrap_or_else(|e| Err(join_failure(e))),
            _ = tokio::time::sleep(timeout) => {
                // The handler keeps running until it notices; its result is ignored.
                cancel.cancel();
                Err(ExecutionError::Timeout { timeout_ms: job.timeout_ms })
            }
        };

        watch.abort();
        result
    }

    /// Poll the lease while the attempt runs; cancel the attempt once the
    /// job is revoked, cancelled or deleted.
    fn spawn_lease_watch(
        &self,
        id: JobId,
        token: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let period = self.config.lease_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match store.lease(id).await {
                    Ok(Some(lease)) if lease.is_held_by(token) => {}
                    Ok(lease) => {
                        info!(
                            job_id = %id,
                            status = ?lease.map(|l| l.status),
                            "lease lost, cancelling attempt"
                        );
                        cancel.cancel();
                        return;
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "lease check failed"),
                }
            }
        })
    }

    async fn record(
        &self,
        job: &Job,
        result: Result<(), ExecutionError>,
    ) -> Result<AttemptOutcome, JobStoreError> {
        let now = Utc::now();
        let update = match &result {
            Ok(()) => StatusUpdate::completed(now),
            Err(err) => match self.config.retry.decide(job, err.is_retryable(), now) {
                FailureDecision::Retry {
                    retry_count,
                    scheduled_for,
                } => StatusUpdate::retry(retry_count, scheduled_for, err.to_string(), now),
                FailureDecision::Fail => StatusUpdate::failed(err.to_string(), now),
            },
        };

        let outcome = match self.store.update_status(job.id, job.lock_token, update).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record job result");
                return Err(e);
            }
        };

        match outcome {
            UpdateOutcome::Applied(updated) => {
                match updated.status {
                    JobStatus::Completed => {
                        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                        info!(job_id = %updated.id, "job completed");
                    }
                    JobStatus::Retry => {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            job_id = %updated.id,
                            retry_count = updated.retry_count,
                            scheduled_for = %updated.scheduled_for,
                            error = updated.last_error.as_deref().unwrap_or_default(),
                            "job failed, retry scheduled"
                        );
                    }
                    _ => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            job_id = %updated.id,
                            retry_count = updated.retry_count,
                            error = updated.last_error.as_deref().unwrap_or_default(),
                            "job failed"
                        );
                    }
                }
                Ok(AttemptOutcome::Recorded(updated))
            }
            UpdateOutcome::Stale => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    job_id = %job.id,
                    lock_token = job.lock_token,
                    "lease superseded, result discarded"
                );
                Ok(AttemptOutcome::Discarded)
            }
        }
    }
}

fn join_failure(err: JoinError) -> ExecutionError {
    if !err.is_panic() {
        return ExecutionError::Cancelled;
    }
    let panic = err.into_panic();
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ExecutionError::Panicked(msg)
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    slots: Vec<JoinHandle<()>>,
    counters: Arc<PoolCounters>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Stop claiming and wait for in-flight attempts to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for slot in self.slots {
            if let Err(e) = slot.await {
                warn!(error = %e, "worker slot ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::lifecycle::ControlAction;
    use crate::jobs::payload::JobData;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobType, NewJob};
    use caseflow_core::{OrgId, UserId};

    fn config() -> JobQueueConfig {
        JobQueueConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(10))
            .with_lease_check_interval(Duration::from_millis(10))
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(30)))
            .with_instance_id("test-worker")
    }

    fn pool(store: Arc<InMemoryJobStore>, registry: HandlerRegistry) -> WorkerPool {
        WorkerPool::new(store, Arc::new(registry), config()).unwrap()
    }

    async fn submit(store: &Arc<InMemoryJobStore>, max_retries: u32) -> Job {
        store
            .create(
                NewJob::new(OrgId::new(), UserId::new(), JobData::maintenance("reindex"))
                    .with_max_retries(max_retries)
                    .with_timeout_ms(1_000),
            )
            .await
            .unwrap()
    }

    async fn reload(store: &Arc<InMemoryJobStore>, job: &Job) -> Job {
        store.get(job.org_id, job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_handler_completes_the_job() {
        let store = InMemoryJobStore::arc();
        let job = submit(&store, 3).await;
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::MaintenanceTask, |_ctx| async { Ok(()) });

        let pool = pool(store.clone(), registry);
        assert!(pool.run_once().await.unwrap());

        let stored = reload(&store, &job).await;
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(pool.stats().jobs_succeeded, 1);
        assert!(!pool.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn transient_failure_schedules_a_retry() {
        let store = InMemoryJobStore::arc();
        let job = submit(&store, 2).await;
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::MaintenanceTask, |_ctx| async {
            Err(ExecutionError::transient("db unavailable"))
        });

        let pool = pool(store.clone(), registry);
        pool.run_once().await.unwrap();

        let stored = reload(&store, &job).await;
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.scheduled_for > Utc::now());
        assert_eq!(stored.last_error.as_deref(), Some("db unavailable"));

        // Not due yet
        assert!(!pool.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn zero_retries_fails_on_first_error() {
        let store = InMemoryJobStore::arc();
        let job = submit(&store, 0).await;
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::MaintenanceTask, |_ctx| async {
            Err(ExecutionError::transient("boom"))
        });

        pool(store.clone(), registry).run_once().await.unwrap();

        let stored = reload(&store, &job).await;
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.failed_at.is_some());
    }

    #[tokio::test]
    async fn permanent_failure_and_missing_handler_fail_outright() {
        let store = InMemoryJobStore::arc();
        let job = submit(&store, 5).await;
        let pool = pool(store.clone(), HandlerRegistry::new());
        pool.run_once().await.unwrap();

        let stored = reload(&store, &job).await;
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("no handler"));
        assert_eq!(pool.stats().jobs_failed, 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_retried() {
        let store = InMemoryJobStore::arc();
        let job = submit(&store, 1).await;
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::MaintenanceTask, |ctx| async move {
            if ctx.job().retry_count == 0 {
                panic!("handler bug");
            }
            Ok(())
        });

        pool(store.clone(), registry).run_once().await.unwrap();

        let stored = reload(&store, &job).await;
        assert_eq!(stored.status, JobStatus::Retry);
        assert!(stored.last_error.unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let store = InMemoryJobStore::arc();
        let job = submit(&store, 1).await;
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::MaintenanceTask, |ctx| async move {
            // Ignores the deadline until cancelled.
            ctx.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });

        pool(store.clone(), registry).run_once().await.unwrap();

        let stored = reload(&store, &job).await;
        assert_eq!(stored.status, JobStatus::Retry);
        assert_eq!(stored.last_error.as_deref(), Some("timed out after 1000ms"));
    }

    #[tokio::test]
    async fn cancelled_job_discards_the_late_result() {
        let store = InMemoryJobStore::arc();
        let job = submit(&store, 3).await;
        let mut registry = HandlerRegistry::new();
        let control_store = store.clone();
        registry.register_fn(JobType::MaintenanceTask, move |ctx| {
            let store = control_store.clone();
            async move {
                let job = ctx.job().clone();
                store
                    .control(job.org_id, job.id, ControlAction::Cancel, Utc::now())
                    .await
                    .unwrap();
                // Cooperative: wait for the lease watch to notice.
                ctx.cancelled().await;
                Ok(())
            }
        });

        let pool = pool(store.clone(), registry);
        pool.run_once().await.unwrap();

        let stored = reload(&store, &job).await;
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(pool.stats().results_discarded, 1);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let store = InMemoryJobStore::arc();
        let registry = Arc::new(HandlerRegistry::new());

        let zero_lease = config().with_lease_check_interval(Duration::ZERO);
        assert!(matches!(
            WorkerPool::new(store.clone(), registry.clone(), zero_lease),
            Err(ConfigError::Invalid(msg)) if msg.contains("lease check")
        ));

        let zero_poll = config().with_poll_interval(Duration::ZERO);
        assert!(WorkerPool::new(store, registry, zero_poll).is_err());
    }

    #[tokio::test]
    async fn spawned_pool_drains_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let mut jobs = Vec::new();
        for _ in 0..5 {
            jobs.push(submit(&store, 0).await);
        }
        let mut registry = HandlerRegistry::new();
        registry.register_fn(JobType::MaintenanceTask, |_ctx| async { Ok(()) });

        let handle = pool(store.clone(), registry).spawn(CancellationToken::new());
        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.stats().jobs_succeeded, 5);
        handle.shutdown().await;

        for job in &jobs {
            assert_eq!(reload(&store, job).await.status, JobStatus::Completed);
        }
    }
}
