//! Dispatch: turns due work into claimed work.
//!
//! Ordering is strict priority (`urgent > high > normal > low`), then
//! `scheduled_for` ascending. There is no aging: a steady stream of
//! higher-priority work can starve lower priorities indefinitely.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use caseflow_core::OrgId;

use super::store::{ClaimRequest, JobStore, JobStoreError};
use super::types::{Job, JobStatus};

/// Claims jobs on behalf of one worker instance.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    instance_id: String,
    statuses: Vec<JobStatus>,
    org_id: Option<OrgId>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("instance_id", &self.instance_id)
            .field("statuses", &self.statuses)
            .field("org_id", &self.org_id)
            .finish()
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            statuses: vec![JobStatus::Queued, JobStatus::Pending, JobStatus::Retry],
            org_id: None,
        }
    }

    /// Only claim jobs in these statuses.
    pub fn with_statuses(mut self, statuses: Vec<JobStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    /// Only claim jobs of one org.
    pub fn for_org(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Promote due jobs, then claim the best one for this instance.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let promoted = self.store.promote_due(now).await?;
        if promoted > 0 {
            debug!(promoted, "promoted due jobs to queued");
        }

        let mut request = ClaimRequest::new(self.instance_id.clone(), now)
            .with_statuses(self.statuses.clone());
        if let Some(org_id) = self.org_id {
            request = request.for_org(org_id);
        }
        self.store.try_claim(&request).await
    }
}
