//! Typed job payloads.
//!
//! `JobData` is a tagged union with one variant per [`JobType`]. Submissions
//! arrive as `(type, json)`; [`JobData::parse`] picks the variant from the tag,
//! deserializes the payload into it and checks the variant's required fields.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::types::{JobType, ValidationError};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailStoragePayload {
    pub email_id: String,
    pub case_id: String,
    #[serde(default)]
    pub include_attachments: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAssignmentPayload {
    /// Emails to assign, processed in order
    pub email_ids: Vec<String>,
    pub case_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentAnalysisPayload {
    pub email_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub analysis_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPayload {
    /// Finished jobs older than this many days are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePayload {
    pub task: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Pdf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseExportPayload {
    pub case_id: String,
    #[serde(default)]
    pub format: ExportFormat,
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

/// Type-specific payload. The tag is the job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobData {
    EmailStorage(EmailStoragePayload),
    EmailBulkAssignment(BulkAssignmentPayload),
    EmailContentAnalysis(ContentAnalysisPayload),
    CleanupStorage(CleanupPayload),
    MaintenanceTask(MaintenancePayload),
    ExportCaseData(CaseExportPayload),
}

impl JobData {
    pub fn email_storage(email_id: impl Into<String>, case_id: impl Into<String>) -> Self {
        Self::EmailStorage(EmailStoragePayload {
            email_id: email_id.into(),
            case_id: case_id.into(),
            include_attachments: false,
        })
    }

    pub fn bulk_assignment<I, S>(email_ids: I, case_id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::EmailBulkAssignment(BulkAssignmentPayload {
            email_ids: email_ids.into_iter().map(Into::into).collect(),
            case_id: case_id.into(),
        })
    }

    pub fn content_analysis(email_id: impl Into<String>) -> Self {
        Self::EmailContentAnalysis(ContentAnalysisPayload {
            email_id: email_id.into(),
            case_id: None,
            analysis_types: Vec::new(),
        })
    }

    pub fn cleanup(retention_days: u32) -> Self {
        Self::CleanupStorage(CleanupPayload { retention_days })
    }

    pub fn maintenance(task: impl Into<String>) -> Self {
        Self::MaintenanceTask(MaintenancePayload {
            task: task.into(),
            parameters: serde_json::Value::Null,
        })
    }

    pub fn case_export(case_id: impl Into<String>, format: ExportFormat) -> Self {
        Self::ExportCaseData(CaseExportPayload {
            case_id: case_id.into(),
            format,
        })
    }

    /// Build and validate the variant selected by `job_type`.
    pub fn parse(job_type: JobType, data: serde_json::Value) -> Result<Self, ValidationError> {
        let parsed = match job_type {
            JobType::EmailStorage => Self::EmailStorage(decode(job_type, data)?),
            JobType::EmailBulkAssignment => Self::EmailBulkAssignment(decode(job_type, data)?),
            JobType::EmailContentAnalysis => Self::EmailContentAnalysis(decode(job_type, data)?),
            JobType::CleanupStorage => Self::CleanupStorage(decode(job_type, data)?),
            JobType::MaintenanceTask => Self::MaintenanceTask(decode(job_type, data)?),
            JobType::ExportCaseData => Self::ExportCaseData(decode(job_type, data)?),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobData::EmailStorage(_) => JobType::EmailStorage,
            JobData::EmailBulkAssignment(_) => JobType::EmailBulkAssignment,
            JobData::EmailContentAnalysis(_) => JobType::EmailContentAnalysis,
            JobData::CleanupStorage(_) => JobType::CleanupStorage,
            JobData::MaintenanceTask(_) => JobType::MaintenanceTask,
            JobData::ExportCaseData(_) => JobType::ExportCaseData,
        }
    }

    /// Case the payload refers to, if any.
    pub fn case_id(&self) -> Option<&str> {
        match self {
            JobData::EmailStorage(p) => Some(&p.case_id),
            JobData::EmailBulkAssignment(p) => Some(&p.case_id),
            JobData::EmailContentAnalysis(p) => p.case_id.as_deref(),
            JobData::ExportCaseData(p) => Some(&p.case_id),
            JobData::CleanupStorage(_) | JobData::MaintenanceTask(_) => None,
        }
    }

    /// The untagged payload, as stored next to the job type.
    pub fn to_json(&self) -> serde_json::Value {
        let encoded = match self {
            JobData::EmailStorage(p) => serde_json::to_value(p),
            JobData::EmailBulkAssignment(p) => serde_json::to_value(p),
            JobData::EmailContentAnalysis(p) => serde_json::to_value(p),
            JobData::CleanupStorage(p) => serde_json::to_value(p),
            JobData::MaintenanceTask(p) => serde_json::to_value(p),
            JobData::ExportCaseData(p) => serde_json::to_value(p),
        };
        // Plain structs of strings/numbers always encode.
        encoded.unwrap_or(serde_json::Value::Null)
    }

    /// Required-field checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            JobData::EmailStorage(p) => {
                require_non_blank("emailId", &p.email_id)?;
                require_non_blank("caseId", &p.case_id)
            }
            JobData::EmailBulkAssignment(p) => {
                if p.email_ids.is_empty() {
                    return Err(ValidationError::new("emailIds", "must not be empty"));
                }
                if let Some(idx) = p.email_ids.iter().position(|id| id.trim().is_empty()) {
                    return Err(ValidationError::new(
                        "emailIds",
                        format!("entry {idx} is blank"),
                    ));
                }
                require_non_blank("caseId", &p.case_id)
            }
            JobData::EmailContentAnalysis(p) => {
                require_non_blank("emailId", &p.email_id)?;
                match &p.case_id {
                    Some(case_id) => require_non_blank("caseId", case_id),
                    None => Ok(()),
                }
            }
            JobData::CleanupStorage(p) => {
                if p.retention_days == 0 {
                    return Err(ValidationError::new("retentionDays", "must be at least 1"));
                }
                Ok(())
            }
            JobData::MaintenanceTask(p) => require_non_blank("task", &p.task),
            JobData::ExportCaseData(p) => require_non_blank("caseId", &p.case_id),
        }
    }
}

fn decode<T: DeserializeOwned>(
    job_type: JobType,
    data: serde_json::Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(data)
        .map_err(|e| ValidationError::new("data", format!("{job_type} payload: {e}")))
}

fn require_non_blank(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new(field, "is required"))
    } else {
        Ok(())
    }
}
