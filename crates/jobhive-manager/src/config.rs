use std::{path::PathBuf, time::Duration};

use jobhive_common::{JobError, Result, options::MAX_TIMEOUT};
use jobhive_runner::DEFAULT_TERMINATION_GRACE;

pub const DEFAULT_ROOT: &str = "./jobhive";
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Directory holding one subdirectory per job.
    pub root: PathBuf,
    pub max_concurrent: usize,
    /// Time between SIGTERM and SIGKILL when a job is stopped.
    pub termination_grace: Duration,
    /// Applied to submissions that carry no timeout of their own.
    pub default_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            termination_grace: DEFAULT_TERMINATION_GRACE,
            default_timeout: None,
        }
    }
}

impl ManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Defaults overridden by `JOBHIVE_ROOT`, `JOBHIVE_MAX_CONCURRENT`,
    /// `JOBHIVE_TERMINATE_GRACE_SECS` and `JOBHIVE_DEFAULT_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();
        if let Some(root) = value("JOBHIVE_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Some(raw) = value("JOBHIVE_MAX_CONCURRENT") {
            config.max_concurrent = raw.parse().map_err(|_| {
                JobError::validation(format!("JOBHIVE_MAX_CONCURRENT must be an integer: {raw}"))
            })?;
        }
        if let Some(raw) = value("JOBHIVE_TERMINATE_GRACE_SECS") {
            config.termination_grace = parse_secs("JOBHIVE_TERMINATE_GRACE_SECS", &raw)?;
        }
        if let Some(raw) = value("JOBHIVE_DEFAULT_TIMEOUT_SECS") {
            config.default_timeout = Some(parse_secs("JOBHIVE_DEFAULT_TIMEOUT_SECS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(JobError::validation("job root must not be empty"));
        }
        if self.max_concurrent == 0 {
            return Err(JobError::validation("max_concurrent must be positive"));
        }
        if let Some(timeout) = self.default_timeout {
            if timeout.is_zero() {
                return Err(JobError::validation("default timeout must be positive"));
            }
            if timeout > MAX_TIMEOUT {
                return Err(JobError::validation(format!(
                    "default timeout must not exceed {}s",
                    MAX_TIMEOUT.as_secs()
                )));
            }
        }
        Ok(())
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    raw.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| {
            JobError::validation(format!("{key} must be a non-negative number of seconds: {raw}"))
        })
}
