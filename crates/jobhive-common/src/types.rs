use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ids::{BatchId, JobId},
    metadata::JobMetadata,
    options::whole_millis,
    status::{FailureReason, JobStatus, TerminationReason},
    time::now_not_before,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub reason: TerminationReason,
}

impl ExitInfo {
    pub fn exited(code: Option<i32>) -> Self {
        Self {
            code,
            signal: None,
            reason: TerminationReason::Exited,
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason == TerminationReason::Exited && self.code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Location of a finished job's result artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(pub PathBuf);

/// Status plus the data that only exists in that status.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Completed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        exit_info: ExitInfo,
        result_ref: ResultRef,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_info: Option<ExitInfo>,
        error: JobFailure,
    },
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_info: Option<ExitInfo>,
    },
    Interrupted {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        error: JobFailure,
    },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Running { .. } => JobStatus::Running,
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Cancelled { .. } => JobStatus::Cancelled,
            Self::Interrupted { .. } => JobStatus::Interrupted,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending => None,
            Self::Running { started_at } | Self::Completed { started_at, .. } => Some(*started_at),
            Self::Failed { started_at, .. }
            | Self::Cancelled { started_at, .. }
            | Self::Interrupted { started_at, .. } => *started_at,
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending | Self::Running { .. } => None,
            Self::Completed { finished_at, .. }
            | Self::Failed { finished_at, .. }
            | Self::Cancelled { finished_at, .. }
            | Self::Interrupted { finished_at, .. } => Some(*finished_at),
        }
    }

    pub fn exit_info(&self) -> Option<&ExitInfo> {
        match self {
            Self::Completed { exit_info, .. } => Some(exit_info),
            Self::Failed { exit_info, .. } | Self::Cancelled { exit_info, .. } => {
                exit_info.as_ref()
            }
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobFailure> {
        match self {
            Self::Failed { error, .. } | Self::Interrupted { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn result_ref(&self) -> Option<&ResultRef> {
        match self {
            Self::Completed { result_ref, .. } => Some(result_ref),
            _ => None,
        }
    }
}

/// Input to `JobStore::create`; everything that is fixed at submission.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub program: String,
    pub arguments: Vec<String>,
    pub batch_id: Option<BatchId>,
    pub core_count: Option<u32>,
    pub timeout: Option<Duration>,
    pub result_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "JobMetadata", try_from = "JobMetadata")]
pub struct JobRecord {
    pub id: JobId,
    pub sequence: u64,
    pub name: String,
    pub batch_id: Option<BatchId>,
    pub program: String,
    pub arguments: Vec<String>,
    pub core_count: Option<u32>,
    pub timeout: Option<Duration>,
    pub result_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
}

impl JobRecord {
    pub fn new(id: JobId, sequence: u64, created_at: DateTime<Utc>, job: NewJob) -> Self {
        Self {
            id,
            sequence,
            name: job.name,
            batch_id: job.batch_id,
            program: job.program,
            arguments: job.arguments,
            core_count: job.core_count,
            timeout: job.timeout.map(whole_millis),
            result_path: job.result_path,
            created_at,
            state: JobState::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Time spent running: up to now while running, up to `finished_at` afterwards.
    pub fn runtime(&self) -> Option<Duration> {
        let started_at = self.state.started_at()?;
        let until = self
            .state
            .finished_at()
            .unwrap_or_else(|| now_not_before(started_at));
        (until - started_at).to_std().ok()
    }

    pub fn to_running(&self) -> JobState {
        JobState::Running {
            started_at: now_not_before(self.created_at),
        }
    }

    pub fn to_completed(&self, exit_info: ExitInfo, result_ref: ResultRef) -> JobState {
        let started_at = self
            .state
            .started_at()
            .unwrap_or(self.created_at);
        JobState::Completed {
            started_at,
            finished_at: now_not_before(started_at),
            exit_info,
            result_ref,
        }
    }

    pub fn to_failed(&self, exit_info: Option<ExitInfo>, error: JobFailure) -> JobState {
        JobState::Failed {
            started_at: self.state.started_at(),
            finished_at: self.finish_time(),
            exit_info,
            error,
        }
    }

    pub fn to_cancelled(&self, exit_info: Option<ExitInfo>) -> JobState {
        JobState::Cancelled {
            started_at: self.state.started_at(),
            finished_at: self.finish_time(),
            exit_info,
        }
    }

    pub fn to_interrupted(&self, message: impl Into<String>) -> JobState {
        JobState::Interrupted {
            started_at: self.state.started_at(),
            finished_at: self.finish_time(),
            error: JobFailure::new(FailureReason::Interrupted, message),
        }
    }

    fn finish_time(&self) -> DateTime<Utc> {
        now_not_before(self.state.started_at().unwrap_or(self.created_at))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub batch_id: Option<BatchId>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|status| record.status() == status)
            && self
                .batch_id
                .as_ref()
                .is_none_or(|batch| record.batch_id.as_ref() == Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::time::now;

    fn record() -> JobRecord {
        JobRecord::new(
            JobId::generate(),
            1,
            now(),
            NewJob {
                name: "dock".to_string(),
                program: "/bin/true".to_string(),
                arguments: vec![],
                batch_id: None,
                core_count: Some(4),
                timeout: None,
                result_path: None,
            },
        )
    }

    #[test]
    fn new_record_is_pending_without_terminal_data() {
        let record = record();
        assert_eq!(record.status(), JobStatus::Pending);
        assert!(record.state.exit_info().is_none());
        assert!(record.state.error().is_none());
        assert!(record.state.result_ref().is_none());
        assert!(record.runtime().is_none());
    }

    #[test]
    fn finish_time_never_precedes_start() {
        let mut record = record();
        let future = now() + ChronoDuration::minutes(5);
        record.state = JobState::Running { started_at: future };

        let cancelled = record.to_cancelled(None);
        assert_eq!(cancelled.finished_at(), Some(future));
        assert_eq!(cancelled.started_at(), Some(future));
        assert_eq!(record.to_cancelled(None).status(), JobStatus::Cancelled);
    }

    #[test]
    fn runtime_is_fixed_once_finished() {
        let mut record = record();
        let started_at = now() - ChronoDuration::seconds(10);
        record.state = JobState::Failed {
            started_at: Some(started_at),
            finished_at: started_at + ChronoDuration::seconds(4),
            exit_info: Some(ExitInfo::exited(Some(2))),
            error: JobFailure::new(FailureReason::Execution, "exit code 2"),
        };
        assert_eq!(record.runtime(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn filter_matches_status_and_batch() {
        let batch = BatchId::generate();
        let mut record = record();
        record.batch_id = Some(batch.clone());

        assert!(JobFilter::all().matches(&record));
        assert!(JobFilter::all().with_status(JobStatus::Pending).matches(&record));
        assert!(!JobFilter::all().with_status(JobStatus::Running).matches(&record));
        assert!(JobFilter::all().with_batch(batch).matches(&record));
        assert!(!JobFilter::all().with_batch(BatchId::generate()).matches(&record));
    }

    #[test]
    fn exit_info_success_requires_clean_exit() {
        assert!(ExitInfo::exited(Some(0)).is_success());
        assert!(!ExitInfo::exited(Some(1)).is_success());
        let killed = ExitInfo {
            code: None,
            signal: Some(15),
            reason: TerminationReason::Cancelled,
        };
        assert!(!killed.is_success());
    }
}
