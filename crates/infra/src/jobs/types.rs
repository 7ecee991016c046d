//! Core job types: identifiers, status machine, priorities and the job record.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use caseflow_core::{OrgId, UserId};

use super::payload::JobData;

/// Smallest allowed per-attempt timeout.
pub const MIN_TIMEOUT_MS: u64 = 1_000;
/// Largest allowed per-attempt timeout (one hour).
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;
/// Upper bound for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| ValidationError::new("id", format!("invalid job id: {e}")))
    }
}

/// Closed set of job types. Selects the handler and the payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EmailStorage,
    EmailBulkAssignment,
    EmailContentAnalysis,
    CleanupStorage,
    MaintenanceTask,
    ExportCaseData,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::EmailStorage,
        JobType::EmailBulkAssignment,
        JobType::EmailContentAnalysis,
        JobType::CleanupStorage,
        JobType::MaintenanceTask,
        JobType::ExportCaseData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EmailStorage => "email_storage",
            JobType::EmailBulkAssignment => "email_bulk_assignment",
            JobType::EmailContentAnalysis => "email_content_analysis",
            JobType::CleanupStorage => "cleanup_storage",
            JobType::MaintenanceTask => "maintenance_task",
            JobType::ExportCaseData => "export_case_data",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::new("type", format!("unknown job type: {s}")))
    }
}

/// Job execution status.
///
/// Valid edges:
///
/// ```text
/// pending ──► queued ──► running ──► completed
///    │          │          │ ├──► failed ──► queued (retry/restart)
///    │          │          │ ├──► retry ───► queued
///    │          │          │ └──► stalled ─► retry | failed
///    └──────────┴──► cancelled ◄─┘ (running: cooperative)
/// retry ──► cancelled,  cancelled ──► queued (retry/restart)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for `scheduled_for`
    Pending,
    /// Eligible for claiming
    Queued,
    /// Held by a worker
    Running,
    /// Finished successfully
    Completed,
    /// Retries exhausted or permanent failure
    Failed,
    /// Cancelled by a caller
    Cancelled,
    /// Waiting for its backoff delay to elapse
    Retry,
    /// Exceeded its timeout without reporting back
    Stalled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Retry,
        JobStatus::Stalled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retry => "retry",
            JobStatus::Stalled => "stalled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the status machine has an edge `self -> next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retry)
                | (Running, Stalled)
                | (Running, Cancelled)
                | (Retry, Queued)
                | (Retry, Cancelled)
                | (Stalled, Retry)
                | (Stalled, Failed)
                | (Failed, Queued)
                | (Cancelled, Queued)
        )
    }

    /// Statuses from which a due job may be claimed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued | JobStatus::Retry)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| ValidationError::new("status", format!("unknown status: {s}")))
    }
}

/// Job priority, totally ordered `Urgent > High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Urgent,
    ];

    /// Numeric rank used by SQL ordering (higher runs first).
    pub fn rank(&self) -> i16 {
        match self {
            JobPriority::Low => 1,
            JobPriority::Normal => 2,
            JobPriority::High => 3,
            JobPriority::Urgent => 4,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        JobPriority::ALL.into_iter().find(|p| p.rank() == rank)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Urgent => "urgent",
        }
    }
}

impl FromStr for JobPriority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobPriority::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ValidationError::new("priority", format!("unknown priority: {s}")))
    }
}

/// Malformed submission or request parameter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Sub-progress reported by a running handler (e.g. "3 of 5 emails").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub completed: u32,
    pub total: u32,
}

impl JobProgress {
    pub fn new(completed: u32, total: u32) -> Self {
        Self {
            completed: completed.min(total),
            total,
        }
    }
}

/// Record of a finished execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobAttempt {
    pub fn new(
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        Self {
            attempt,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

/// Caller-supplied annotations. Not interpreted by the queue.
pub type JobMetadata = BTreeMap<String, serde_json::Value>;

/// A background job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Tenant scope, immutable
    pub org_id: OrgId,
    /// Submitter
    pub user_id: UserId,
    /// Typed payload; its tag is the job type
    pub data: JobData,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Wall-clock budget for one attempt
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Retries consumed so far (never exceeds `max_retries`)
    pub retry_count: u32,
    /// Earliest time the job may be claimed
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current (or last) attempt
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Worker instance currently holding the job
    pub lock_owner: Option<String>,
    /// Fencing token; bumped on every claim and every revocation
    pub lock_token: u64,
    pub progress: Option<JobProgress>,
    pub metadata: JobMetadata,
    /// Denormalized from `data` for cross-type filtering
    pub case_id: Option<String>,
    pub history: Vec<JobAttempt>,
}

impl Job {
    pub fn job_type(&self) -> JobType {
        self.data.job_type()
    }

    /// Due for claiming at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }

    /// Running longer than its timeout at `now`, or already revoked as
    /// stalled and still waiting for its retry/fail decision.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started)) => {
                (now - started).num_milliseconds() > self.timeout_ms as i64
            }
            (JobStatus::Stalled, _) => true,
            _ => false,
        }
    }

    /// The attempt number of the current execution (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// A job submission, before it has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub org_id: OrgId,
    pub user_id: UserId,
    pub data: JobData,
    pub priority: JobPriority,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub metadata: JobMetadata,
}

impl NewJob {
    pub fn new(org_id: OrgId, user_id: UserId, data: JobData) -> Self {
        Self {
            org_id,
            user_id,
            data,
            priority: JobPriority::Normal,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_for: None,
            metadata: JobMetadata::new(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check ranges and the payload's required fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(ValidationError::new(
                "timeout",
                format!(
                    "must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS} ms, got {}",
                    self.timeout_ms
                ),
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ValidationError::new(
                "maxRetries",
                format!("must be at most {MAX_RETRIES_LIMIT}, got {}", self.max_retries),
            ));
        }
        self.data.validate()
    }

    /// Materialize the record: fresh id, `pending`, zero retries.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        let case_id = self.data.case_id().map(str::to_string);
        Job {
            id: JobId::new(),
            org_id: self.org_id,
            user_id: self.user_id,
            data: self.data,
            status: JobStatus::Pending,
            priority: self.priority,
            timeout_ms: self.timeout_ms,
            max_retries: self.max_retries,
            retry_count: 0,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
            lock_owner: None,
            lock_token: 0,
            progress: None,
            metadata: self.metadata,
            case_id,
            history: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_job() -> NewJob {
        NewJob::new(
            OrgId::new(),
            UserId::new(),
            JobData::email_storage("email-1", "case-1"),
        )
    }

    #[test]
    fn priorities_are_totally_ordered() {
        let mut ps = vec![
            JobPriority::Low,
            JobPriority::Urgent,
            JobPriority::Normal,
            JobPriority::High,
        ];
        ps.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            ps,
            vec![
                JobPriority::Urgent,
                JobPriority::High,
                JobPriority::Normal,
                JobPriority::Low
            ]
        );
    }

    #[test]
    fn status_machine_edges() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stalled));
        assert!(JobStatus::Stalled.can_transition_to(JobStatus::Retry));
        assert!(JobStatus::Cancelled.can_transition_to(JobStatus::Queued));

        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Stalled.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Retry.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn status_and_type_parse_from_wire_names() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
        assert!("sleeping".parse::<JobStatus>().is_err());
    }

    #[test]
    fn new_job_defaults() {
        let now = Utc::now();
        let job = storage_job().into_job(now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.scheduled_for, now);
        assert_eq!(job.case_id.as_deref(), Some("case-1"));
        assert_eq!(job.lock_token, 0);
        assert!(job.lock_owner.is_none());
    }

    #[test]
    fn validate_rejects_out_of_range_settings() {
        assert!(storage_job().validate().is_ok());

        let err = storage_job().with_timeout_ms(999).validate().unwrap_err();
        assert_eq!(err.field, "timeout");

        let err = storage_job()
            .with_timeout_ms(MAX_TIMEOUT_MS + 1)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "timeout");

        let err = storage_job().with_max_retries(11).validate().unwrap_err();
        assert_eq!(err.field, "maxRetries");
    }

    #[test]
    fn overdue_when_running_past_timeout_or_left_stalled() {
        let now = Utc::now();
        let mut job = storage_job().with_timeout_ms(1_000).into_job(now);
        assert!(!job.is_overdue(now + chrono::Duration::seconds(5)));

        job.status = JobStatus::Running;
        job.started_at = Some(now);
        assert!(!job.is_overdue(now + chrono::Duration::milliseconds(1_000)));
        assert!(job.is_overdue(now + chrono::Duration::milliseconds(1_001)));

        job.status = JobStatus::Stalled;
        assert!(job.is_overdue(now));
    }

    #[test]
    fn job_serializes_camel_case() {
        let job = storage_job().into_job(Utc::now());
        let json = serde_json::to_value(&job).unwrap();

        assert!(json.get("orgId").is_some());
        assert!(json.get("scheduledFor").is_some());
        assert_eq!(json["maxRetries"], 3);
        assert!(json.get("org_id").is_none());

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
