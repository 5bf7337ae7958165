use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use crate::error::{JobError, Result};

/// Longest accepted job timeout (one year).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-submission resource hints and result declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOptions {
    /// Advisory; handed to the program, never used for admission.
    pub core_count: Option<u32>,
    pub timeout: Option<Duration>,
    /// Result artifact, relative to the job's output area.
    pub result_path: Option<PathBuf>,
}

impl SubmitOptions {
    pub fn with_core_count(mut self, core_count: u32) -> Self {
        self.core_count = Some(core_count);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_result_path(mut self, result_path: impl Into<PathBuf>) -> Self {
        self.result_path = Some(result_path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.core_count == Some(0) {
            return Err(JobError::validation("core_count must be positive"));
        }
        if let Some(timeout) = self.timeout {
            validate_timeout(timeout)?;
        }
        if let Some(result_path) = &self.result_path {
            validate_result_path(result_path)?;
        }
        Ok(())
    }
}

pub fn validate_timeout(timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(JobError::validation("timeout must be positive"));
    }
    if timeout > MAX_TIMEOUT {
        return Err(JobError::validation(format!(
            "timeout must not exceed {}s",
            MAX_TIMEOUT.as_secs()
        )));
    }
    Ok(())
}

/// Rounds up to whole milliseconds, the precision timeouts are stored with.
pub fn whole_millis(timeout: Duration) -> Duration {
    let millis = timeout.as_millis() + u128::from(timeout.subsec_nanos() % 1_000_000 != 0);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

pub fn validate_program(program: &str) -> Result<()> {
    if program.trim().is_empty() {
        return Err(JobError::validation("program path must not be empty"));
    }
    if program.contains('\0') {
        return Err(JobError::validation("program path must not contain NUL bytes"));
    }
    Ok(())
}

pub fn validate_arguments(arguments: &[String]) -> Result<()> {
    if let Some(position) = arguments.iter().position(|arg| arg.contains('\0')) {
        return Err(JobError::validation(format!(
            "argument {position} must not contain NUL bytes"
        )));
    }
    Ok(())
}

fn validate_result_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return Err(JobError::validation(format!(
            "result_path must be a relative path: {}",
            path.display()
        )));
    }

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(JobError::validation(format!(
                    "result_path must stay inside the output area: {}",
                    path.display()
                )));
            }
        }
    }

    Ok(())
}
