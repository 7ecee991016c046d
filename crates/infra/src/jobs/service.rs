//! The job queue as the application sees it: submit, list, control, and the
//! background runtime (worker pool plus stall detector).

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use caseflow_core::{OrgId, UserId};

use crate::config::{ConfigError, JobQueueConfig};

use super::bulk::{BulkCoordinator, BulkRequest, BulkSummary};
use super::executor::{PoolStats, WorkerPool, WorkerPoolHandle};
use super::handler::{
    ExecutionError, HandlerRegistry, JobContext, JobHandler, RetentionCleanupHandler,
};
use super::lifecycle::ControlAction;
use super::payload::JobData;
use super::query::{JobFilter, JobPage, Pagination};
use super::stall::{StallDetector, StallDetectorHandle};
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobMetadata, JobPriority, JobType, NewJob, ValidationError};

/// A submission as it arrives from the outer (HTTP) layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    /// Per-attempt timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<JobMetadata>,
}

impl SubmitJobRequest {
    pub fn new(job_type: JobType, data: serde_json::Value) -> Self {
        Self {
            job_type,
            data,
            priority: None,
            timeout: None,
            max_retries: None,
            scheduled_for: None,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

/// Job queue service.
///
/// Built once at process start. Handlers are registered before
/// [`start`](Self::start); the runtime works from a snapshot of the registry.
pub struct JobQueueService {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    config: JobQueueConfig,
    bulk: BulkCoordinator,
}

impl std::fmt::Debug for JobQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueueService")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

impl JobQueueService {
    /// Create a service with the built-in `cleanup_storage` handler registered.
    ///
    /// The config is validated here so a bad interval or worker count is
    /// reported to the caller instead of killing a background task later.
    pub fn new(store: Arc<dyn JobStore>, config: JobQueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut registry = HandlerRegistry::new();
        registry.register(
            JobType::CleanupStorage,
            Arc::new(RetentionCleanupHandler::new(store.clone())),
        );
        Ok(Self {
            bulk: BulkCoordinator::new(store.clone()),
            store,
            registry,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.registry.register(job_type, handler);
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: JobType, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        self.registry.register_fn(job_type, f);
    }

    /// Validate and persist a submission, filling unset fields from config.
    pub async fn submit(
        &self,
        org_id: OrgId,
        user_id: UserId,
        request: SubmitJobRequest,
    ) -> Result<Job, JobStoreError> {
        let data = JobData::parse(request.job_type, request.data)?;
        let mut new_job = NewJob::new(org_id, user_id, data)
            .with_priority(request.priority.unwrap_or_default())
            .with_timeout_ms(request.timeout.unwrap_or(self.config.defaults.timeout_ms))
            .with_max_retries(request.max_retries.unwrap_or(self.config.defaults.max_retries));
        if let Some(at) = request.scheduled_for {
            new_job = new_job.scheduled_for(at);
        }
        if let Some(metadata) = request.metadata {
            new_job.metadata = metadata;
        }

        let job = self.store.create(new_job).await?;
        info!(
            job_id = %job.id,
            org_id = %org_id,
            job_type = %job.job_type(),
            priority = job.priority.as_str(),
            scheduled_for = %job.scheduled_for,
            "job submitted"
        );
        Ok(job)
    }

    pub async fn get(&self, org_id: OrgId, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(org_id, id).await
    }

    pub async fn list(
        &self,
        org_id: OrgId,
        filter: &JobFilter,
        pagination: &Pagination,
    ) -> Result<JobPage, JobStoreError> {
        self.store.query(org_id, filter, pagination).await
    }

    pub async fn cancel(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
        self.store.control(org_id, id, ControlAction::Cancel, Utc::now()).await
    }

    pub async fn retry(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
        self.store.control(org_id, id, ControlAction::Retry, Utc::now()).await
    }

    pub async fn restart(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
        self.store.control(org_id, id, ControlAction::Restart, Utc::now()).await
    }

    pub async fn delete(&self, org_id: OrgId, id: JobId) -> Result<Job, JobStoreError> {
        self.store.delete(org_id, id).await
    }

    pub async fn bulk(
        &self,
        org_id: OrgId,
        request: &BulkRequest,
    ) -> Result<BulkSummary, ValidationError> {
        self.bulk.execute(org_id, request).await
    }

    pub async fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
        self.store.stats(org_id).await
    }

    /// Start the worker pool and the stall detector.
    pub fn start(&self) -> Result<JobQueueHandle, ConfigError> {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(
            self.store.clone(),
            Arc::new(self.registry.clone()),
            self.config.clone(),
        )?
        .spawn(shutdown.child_token());
        let stall = StallDetector::new(self.store.clone(), self.config.retry.clone())
            .with_interval(self.config.stall_sweep_interval)
            .with_batch_size(self.config.stall_batch_size)
            .spawn(shutdown.child_token());

        info!(
            instance_id = %self.config.instance_id,
            handlers = ?self.registry.registered_types(),
            "job queue started"
        );
        Ok(JobQueueHandle {
            shutdown,
            pool,
            stall,
        })
    }
}

/// Handle to a running job queue.
#[derive(Debug)]
pub struct JobQueueHandle {
    shutdown: CancellationToken,
    pool: WorkerPoolHandle,
    stall: StallDetectorHandle,
}

impl JobQueueHandle {
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop claiming, let in-flight attempts finish, and join every task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
        self.stall.shutdown().await;
        info!("job queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{ClaimRequest, InMemoryJobStore};
    use crate::jobs::types::JobStatus;
    use serde_json::json;
    use std::time::Duration;

    fn service() -> JobQueueService {
        JobQueueService::new(InMemoryJobStore::arc(), JobQueueConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn submit_applies_defaults() {
        let service = service();
        let org = OrgId::new();
        let job = service
            .submit(
                org,
                UserId::new(),
                SubmitJobRequest::new(
                    JobType::EmailStorage,
                    json!({"emailId": "e", "caseId": "c"}),
                ),
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.timeout_ms, 300_000);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.case_id.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn submit_rejects_bad_payloads_and_ranges() {
        let service = service();
        let org = OrgId::new();

        let err = service
            .submit(
                org,
                UserId::new(),
                SubmitJobRequest::new(JobType::EmailStorage, json!({"emailId": "e"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Validation(_)));

        let err = service
            .submit(
                org,
                UserId::new(),
                SubmitJobRequest::new(JobType::MaintenanceTask, json!({"task": "t"}))
                    .with_max_retries(11),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Validation(ref v) if v.field == "maxRetries"));

        assert_eq!(service.stats(org).await.unwrap().total(), 0);
    }

    #[test]
    fn submit_request_deserializes_from_the_wire() {
        let request: SubmitJobRequest = serde_json::from_value(json!({
            "type": "export_case_data",
            "data": {"caseId": "c-1", "format": "csv"},
            "priority": "urgent",
            "timeout": 5000,
            "maxRetries": 1,
            "metadata": {"source": "dashboard"}
        }))
        .unwrap();

        assert_eq!(request.job_type, JobType::ExportCaseData);
        assert_eq!(request.priority, Some(JobPriority::Urgent));
        assert_eq!(request.timeout, Some(5000));
        assert_eq!(request.metadata.unwrap()["source"], "dashboard");
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let zero_sweep = JobQueueConfig::default().with_stall_sweep_interval(Duration::ZERO);
        let err = JobQueueService::new(InMemoryJobStore::arc(), zero_sweep).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("stall sweep")));

        let no_workers = JobQueueConfig::default().with_workers(0);
        assert!(JobQueueService::new(InMemoryJobStore::arc(), no_workers).is_err());
    }

    #[tokio::test]
    async fn started_queue_recovers_stalled_jobs() {
        let store = InMemoryJobStore::arc();
        let config = JobQueueConfig::default()
            .with_workers(1)
            .with_stall_sweep_interval(Duration::from_millis(20));
        let service = JobQueueService::new(store.clone(), config).unwrap();
        let org = OrgId::new();
        let job = service
            .submit(
                org,
                UserId::new(),
                SubmitJobRequest::new(JobType::MaintenanceTask, json!({"task": "t"}))
                    .with_timeout(1_000)
                    .with_max_retries(0),
            )
            .await
            .unwrap();
        // Held by a worker outside this process that never reports back.
        store
            .try_claim(&ClaimRequest::new("gone-worker", chrono::Utc::now()))
            .await
            .unwrap()
            .unwrap();

        let handle = service.start().unwrap();
        let mut status = JobStatus::Running;
        for _ in 0..150 {
            status = service.get(org, job.id).await.unwrap().unwrap().status;
            if status == JobStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;

        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn cleanup_handler_is_registered_by_default() {
        assert!(service().registry().contains(JobType::CleanupStorage));
    }
}
