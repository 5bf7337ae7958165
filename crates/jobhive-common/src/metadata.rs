use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::JobError,
    ids::{BatchId, JobId},
    status::JobStatus,
    types::{ExitInfo, JobFailure, JobRecord, JobState, ResultRef},
};

/// Flat on-disk shape of a job record (`metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    pub status: JobStatus,
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub core_count: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_info: Option<ExitInfo>,
    #[serde(default)]
    pub error: Option<JobFailure>,
    #[serde(default)]
    pub result_ref: Option<ResultRef>,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
}

impl From<JobRecord> for JobMetadata {
    fn from(record: JobRecord) -> Self {
        let status = record.status();
        let started_at = record.state.started_at();
        let finished_at = record.state.finished_at();
        let (exit_info, error, result_ref) = match record.state {
            JobState::Pending | JobState::Running { .. } => (None, None, None),
            JobState::Completed {
                exit_info,
                result_ref,
                ..
            } => (Some(exit_info), None, Some(result_ref)),
            JobState::Failed {
                exit_info, error, ..
            } => (exit_info, Some(error), None),
            JobState::Cancelled { exit_info, .. } => (exit_info, None, None),
            JobState::Interrupted { error, .. } => (None, Some(error), None),
        };

        Self {
            id: record.id,
            name: record.name,
            batch_id: record.batch_id,
            status,
            program: record.program,
            arguments: record.arguments,
            core_count: record.core_count,
            timeout_ms: record
                .timeout
                .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            created_at: record.created_at,
            started_at,
            finished_at,
            exit_info,
            error,
            result_ref,
            sequence: record.sequence,
            result_path: record.result_path,
        }
    }
}

impl TryFrom<JobMetadata> for JobRecord {
    type Error = JobError;

    fn try_from(meta: JobMetadata) -> Result<Self, Self::Error> {
        let id = meta.id;
        let missing = |field: &str| {
            JobError::InvalidRecord(format!(
                "job {id} is {} but has no {field}",
                meta.status
            ))
        };
        let unexpected = |field: &str| {
            JobError::InvalidRecord(format!(
                "job {id} is {} but carries {field}",
                meta.status
            ))
        };

        if meta.status != JobStatus::Completed && meta.result_ref.is_some() {
            return Err(unexpected("result_ref"));
        }
        if !matches!(meta.status, JobStatus::Failed | JobStatus::Interrupted) && meta.error.is_some() {
            return Err(unexpected("error"));
        }
        if !meta.status.is_terminal() && (meta.finished_at.is_some() || meta.exit_info.is_some()) {
            return Err(unexpected("terminal data"));
        }

        let state = match meta.status {
            JobStatus::Pending => {
                if meta.started_at.is_some() {
                    return Err(unexpected("started_at"));
                }
                JobState::Pending
            }
            JobStatus::Running => JobState::Running {
                started_at: meta.started_at.ok_or_else(|| missing("started_at"))?,
            },
            JobStatus::Completed => JobState::Completed {
                started_at: meta.started_at.ok_or_else(|| missing("started_at"))?,
                finished_at: meta.finished_at.ok_or_else(|| missing("finished_at"))?,
                exit_info: meta.exit_info.ok_or_else(|| missing("exit_info"))?,
                result_ref: meta.result_ref.ok_or_else(|| missing("result_ref"))?,
            },
            JobStatus::Failed => JobState::Failed {
                started_at: meta.started_at,
                finished_at: meta.finished_at.ok_or_else(|| missing("finished_at"))?,
                exit_info: meta.exit_info,
                error: meta.error.ok_or_else(|| missing("error"))?,
            },
            JobStatus::Cancelled => JobState::Cancelled {
                started_at: meta.started_at,
                finished_at: meta.finished_at.ok_or_else(|| missing("finished_at"))?,
                exit_info: meta.exit_info,
            },
            JobStatus::Interrupted => {
                if meta.exit_info.is_some() {
                    return Err(unexpected("exit_info"));
                }
                JobState::Interrupted {
                    started_at: meta.started_at,
                    finished_at: meta.finished_at.ok_or_else(|| missing("finished_at"))?,
                    error: meta.error.ok_or_else(|| missing("error"))?,
                }
            }
        };

        Ok(Self {
            id,
            sequence: meta.sequence,
            name: meta.name,
            batch_id: meta.batch_id,
            program: meta.program,
            arguments: meta.arguments,
            core_count: meta.core_count,
            timeout: meta.timeout_ms.map(Duration::from_millis),
            result_path: meta.result_path,
            created_at: meta.created_at,
            state,
        })
    }
}
