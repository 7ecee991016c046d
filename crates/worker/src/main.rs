use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use caseflow_core::OrgId;
use caseflow_infra::config::JobQueueConfig;
use caseflow_infra::jobs::{
    BulkAssignmentHandler, EmailAssigner, ExecutionError, InMemoryJobStore, JobContext, JobData,
    JobQueueService, JobStore, JobType, PostgresJobStore,
};

/// Assigner used until the case service is wired in: records the assignment
/// in the log only.
struct LoggingAssigner;

#[async_trait]
impl EmailAssigner for LoggingAssigner {
    async fn assign(
        &self,
        org_id: OrgId,
        email_id: &str,
        case_id: &str,
    ) -> Result<(), ExecutionError> {
        tracing::info!(org_id = %org_id, email_id, case_id, "email assigned to case");
        Ok(())
    }
}

async fn log_payload(ctx: JobContext) -> Result<(), ExecutionError> {
    ctx.checkpoint()?;
    match ctx.data() {
        JobData::EmailStorage(payload) => {
            tracing::info!(
                job_id = %ctx.job().id,
                email_id = %payload.email_id,
                case_id = %payload.case_id,
                "storing email"
            );
        }
        JobData::EmailContentAnalysis(payload) => {
            tracing::info!(
                job_id = %ctx.job().id,
                email_id = %payload.email_id,
                "analysing email content"
            );
        }
        other => {
            tracing::info!(job_id = %ctx.job().id, job_type = %other.job_type(), "running job");
        }
    }
    Ok(())
}

async fn build_store() -> anyhow::Result<Arc<dyn JobStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PostgresJobStore::connect(&url)
                .await
                .context("failed to connect job store")?;
            tracing::info!("using postgres job store");
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; jobs are kept in memory and lost on exit");
            Ok(InMemoryJobStore::arc())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    caseflow_observability::init();

    let config = JobQueueConfig::from_env().context("invalid job queue configuration")?;
    let store = build_store().await?;

    let mut service =
        JobQueueService::new(store, config).context("invalid job queue configuration")?;
    service.register(
        JobType::EmailBulkAssignment,
        Arc::new(BulkAssignmentHandler::new(LoggingAssigner)),
    );
    for job_type in [
        JobType::EmailStorage,
        JobType::EmailContentAnalysis,
        JobType::MaintenanceTask,
        JobType::ExportCaseData,
    ] {
        service.register_fn(job_type, log_payload);
    }

    let handle = service.start().context("failed to start job queue")?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested, draining in-flight jobs");
    handle.shutdown().await;
    Ok(())
}
