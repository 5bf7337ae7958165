use async_trait::async_trait;
use jobhive_common::{ExitInfo, Result};

use crate::{handle::ProcessHandle, runner::RunRequest};

/// Something that can run a job's process to completion.
///
/// `Err` is reserved for launch failures; once the process exists the
/// outcome, including timeouts and stops, comes back as `ExitInfo`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: RunRequest, handle: ProcessHandle) -> Result<ExitInfo>;
}
