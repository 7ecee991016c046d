//! Job query interface for dashboards.
//!
//! All queries are org-scoped and paginated. The in-memory store evaluates
//! [`JobFilter::matches`] and [`Pagination::compare`] directly; the Postgres
//! store translates the same filter into SQL.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use caseflow_core::UserId;

use super::types::{Job, JobPriority, JobStatus, JobType, ValidationError};

pub const MAX_PAGE_LIMIT: u32 = 100;
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

/// A filter value that is either a single value or a set of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: PartialEq> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v),
            OneOrMany::Many(vs) => vs.as_slice(),
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.as_slice().contains(value)
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        OneOrMany::One(value)
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(values: Vec<T>) -> Self {
        OneOrMany::Many(values)
    }
}

/// Filter criteria for job queries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    pub status: Option<OneOrMany<JobStatus>>,
    #[serde(rename = "type")]
    pub job_type: Option<OneOrMany<JobType>>,
    pub priority: Option<OneOrMany<JobPriority>>,
    pub user_id: Option<UserId>,
    pub case_id: Option<String>,
    /// Inclusive lower bound on `created_at`
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub created_to: Option<DateTime<Utc>>,
    /// Case-insensitive substring over the job id and metadata
    pub search: Option<String>,
}

impl JobFilter {
    pub fn with_status(mut self, status: impl Into<OneOrMany<JobStatus>>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_type(mut self, job_type: impl Into<OneOrMany<JobType>>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<OneOrMany<JobPriority>>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_to = Some(to);
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Normalized search needle (trimmed, lowercase); `None` when blank.
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = &self.status {
            if !status.contains(&job.status) {
                return false;
            }
        }
        if let Some(job_type) = &self.job_type {
            if !job_type.contains(&job.job_type()) {
                return false;
            }
        }
        if let Some(priority) = &self.priority {
            if !priority.contains(&job.priority) {
                return false;
            }
        }
        if self.user_id.is_some_and(|u| u != job.user_id) {
            return false;
        }
        if let Some(case_id) = &self.case_id {
            if job.case_id.as_deref() != Some(case_id.as_str()) {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| job.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| job.created_at > to) {
            return false;
        }
        match self.search_term() {
            Some(needle) => search_matches(job, &needle),
            None => true,
        }
    }
}

fn search_matches(job: &Job, needle: &str) -> bool {
    if job.id.to_string().contains(needle) {
        return true;
    }
    job.metadata.iter().any(|(key, value)| {
        let value = match value {
            serde_json::Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        key.to_lowercase().contains(needle) || value.contains(needle)
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Created,
    Started,
    Completed,
    Priority,
    Status,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Page selection and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// Zero-based page index
    pub page: u32,
    /// Page size, 1..=100
    pub limit: u32,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 0,
            limit: DEFAULT_PAGE_LIMIT,
            sort_by: SortField::Created,
            sort_order: SortOrder::Desc,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page,
            limit,
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, sort_by: SortField, sort_order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.sort_order = sort_order;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::new(
                "limit",
                format!("must be between 1 and {MAX_PAGE_LIMIT}, got {}", self.limit),
            ));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit)
    }

    /// Total order used for listing. Missing timestamps sort last in both
    /// directions; ties fall back to the job id so pages are stable.
    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let primary = match self.sort_by {
            SortField::Created => self.directed(a.created_at.cmp(&b.created_at)),
            SortField::Started => self.compare_optional(a.started_at, b.started_at),
            SortField::Completed => self.compare_optional(a.completed_at, b.completed_at),
            SortField::Priority => self.directed(a.priority.cmp(&b.priority)),
            SortField::Status => self.directed(a.status.as_str().cmp(b.status.as_str())),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    fn directed(&self, ordering: Ordering) -> Ordering {
        match self.sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }

    fn compare_optional(&self, a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => self.directed(a.cmp(&b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// One page of matching jobs plus the size of the full filtered set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Matches across all pages
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl JobPage {
    /// Sort and slice an already filtered set.
    pub fn from_matches(mut jobs: Vec<Job>, pagination: Pagination) -> Self {
        let total = jobs.len() as u64;
        jobs.sort_by(|a, b| pagination.compare(a, b));

        let offset = pagination.offset();
        let jobs: Vec<Job> = jobs
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(pagination.limit as usize)
            .collect();
        let has_more = offset + (jobs.len() as u64) < total;

        Self {
            jobs,
            total,
            pagination,
            has_more,
        }
    }
}
