pub mod config;
pub mod manager;

pub use config::ManagerConfig;
pub use jobhive_common::{
    BatchId, ExitInfo, FailureReason, JobError, JobFailure, JobFilter, JobId, JobRecord,
    JobState, JobStatus, Result, ResultRef, SubmitOptions, TerminationReason, args::flag_args,
    options::MAX_TIMEOUT,
};
pub use manager::{
    BatchSubmission, BatchSummary, DEFAULT_LOG_TAIL, JobManager, LogTail, ProgramProbe,
    ResultLookup, probe_program,
};
