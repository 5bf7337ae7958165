use std::path::PathBuf;

use thiserror::Error;

use crate::{ids::JobId, status::JobStatus};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("failed to launch {program}: {message}")]
    Launch { program: String, message: String },
    #[error("corrupt job metadata at {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },
    #[error("invalid job record: {0}")]
    InvalidRecord(String),
    #[error("job manager is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn kind_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "NotFoundError",
            Self::IllegalTransition { .. } => "IllegalTransition",
            Self::Launch { .. } => "LaunchError",
            Self::Corrupt { .. } => "CorruptMetadata",
            Self::InvalidRecord(_) => "InvalidRecord",
            Self::ShuttingDown => "ShuttingDown",
            Self::Internal(_) => "InternalError",
            Self::Io(_) => "InternalError",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
