pub mod args;
pub mod error;
pub mod ids;
pub mod metadata;
pub mod options;
pub mod status;
pub mod time;
pub mod types;

pub use error::{JobError, Result};
pub use ids::{BatchId, JobId};
pub use options::SubmitOptions;
pub use status::{FailureReason, JobStatus, TerminationReason};
pub use types::{ExitInfo, JobFailure, JobFilter, JobRecord, JobState, NewJob, ResultRef};
