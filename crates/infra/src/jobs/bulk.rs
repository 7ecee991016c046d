//! Bulk control: apply one operation to up to [`MAX_BULK_IDS`] jobs.
//!
//! Each id is handled independently; partial success is the normal result.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use caseflow_core::OrgId;

use super::lifecycle::ControlAction;
use super::store::{JobStore, JobStoreError};
use super::types::{JobId, ValidationError};

pub const MAX_BULK_IDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    Cancel,
    Retry,
    Delete,
    Restart,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Cancel => "cancel",
            BulkOperation::Retry => "retry",
            BulkOperation::Delete => "delete",
            BulkOperation::Restart => "restart",
        }
    }

    fn control_action(&self) -> Option<ControlAction> {
        match self {
            BulkOperation::Cancel => Some(ControlAction::Cancel),
            BulkOperation::Retry => Some(ControlAction::Retry),
            BulkOperation::Restart => Some(ControlAction::Restart),
            BulkOperation::Delete => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub job_ids: Vec<String>,
    pub operation: BulkOperation,
    /// Reserved for operation-specific options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl BulkRequest {
    pub fn new<I, S>(operation: BulkOperation, job_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            job_ids: job_ids.into_iter().map(|id| id.to_string()).collect(),
            operation,
            parameters: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job_ids.is_empty() || self.job_ids.len() > MAX_BULK_IDS {
            return Err(ValidationError::new(
                "jobIds",
                format!(
                    "must contain between 1 and {MAX_BULK_IDS} ids, got {}",
                    self.job_ids.len()
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum BulkItemOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    pub job_id: String,
    #[serde(flatten)]
    pub outcome: BulkItemOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSummary {
    pub operations_processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub details: Vec<BulkItemResult>,
}

impl BulkSummary {
    fn push(&mut self, job_id: String, outcome: BulkItemOutcome) {
        self.operations_processed += 1;
        match &outcome {
            BulkItemOutcome::Succeeded => self.succeeded += 1,
            BulkItemOutcome::Skipped(_) => self.skipped += 1,
            BulkItemOutcome::Failed(_) => self.failed += 1,
        }
        self.details.push(BulkItemResult { job_id, outcome });
    }
}

#[derive(Clone)]
pub struct BulkCoordinator {
    store: Arc<dyn JobStore>,
}

impl std::fmt::Debug for BulkCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkCoordinator").finish_non_exhaustive()
    }
}

impl BulkCoordinator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Apply `request.operation` to every id within `org_id`.
    ///
    /// Only a malformed request is an error; per-job problems are reported
    /// in the summary. Duplicate ids are processed once.
    pub async fn execute(
        &self,
        org_id: OrgId,
        request: &BulkRequest,
    ) -> Result<BulkSummary, ValidationError> {
        request.validate()?;

        let mut seen = HashSet::new();
        let mut summary = BulkSummary::default();
        for raw in &request.job_ids {
            if !seen.insert(raw.as_str()) {
                continue;
            }
            let outcome = match raw.parse::<JobId>() {
                Ok(id) => self.apply(org_id, id, request.operation).await,
                Err(_) => BulkItemOutcome::Skipped("not found".to_string()),
            };
            debug!(job_id = %raw, operation = request.operation.as_str(), ?outcome, "bulk item");
            summary.push(raw.clone(), outcome);
        }

        info!(
            org_id = %org_id,
            operation = request.operation.as_str(),
            processed = summary.operations_processed,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "bulk operation finished"
        );
        Ok(summary)
    }

    async fn apply(&self, org_id: OrgId, id: JobId, operation: BulkOperation) -> BulkItemOutcome {
        let result = match operation.control_action() {
            Some(action) => self
                .store
                .control(org_id, id, action, Utc::now())
                .await
                .map(|_| ()),
            None => self.store.delete(org_id, id).await.map(|_| ()),
        };

        match result {
            Ok(()) => BulkItemOutcome::Succeeded,
            Err(JobStoreError::NotFound(_)) => BulkItemOutcome::Skipped("not found".to_string()),
            Err(
                e @ (JobStoreError::InvalidState { .. } | JobStoreError::InvalidTransition { .. }),
            ) => BulkItemOutcome::Skipped(e.to_string()),
            Err(e) => BulkItemOutcome::Failed(e.to_string()),
        }
    }
}
