use std::{
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use jobhive_common::{ExitInfo, JobError, JobId, JobRecord, Result, TerminationReason};
use jobhive_store::{JobPaths, LogSink, LogWriter};
use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    handle::{ProcessHandle, StopRequest, stop_signal},
    traits::Executor,
};

pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(10);
const MAX_LINE_BYTES: u64 = 64 * 1024;
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to launch one job's process.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub job_id: JobId,
    pub program: String,
    pub arguments: Vec<String>,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub core_count: Option<u32>,
}

impl RunRequest {
    pub fn new(record: &JobRecord, paths: &JobPaths) -> Self {
        Self {
            job_id: record.id.clone(),
            program: record.program.clone(),
            arguments: record.arguments.clone(),
            work_dir: paths.work.clone(),
            output_dir: paths.output.clone(),
            timeout: record.timeout,
            core_count: record.core_count,
        }
    }
}

enum Supervision {
    Exited(ExitStatus),
    Stop(StopRequest),
}

/// Launches and supervises external programs, one process group per job.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    log: LogSink,
    grace: Duration,
}

impl ProcessRunner {
    pub fn new(log: LogSink) -> Self {
        Self {
            log,
            grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    /// Grace period used when the watchdog fires.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Runs the request to completion.
    ///
    /// `Err` means the program never started; everything after a successful
    /// spawn is reported through the returned `ExitInfo`.
    pub async fn run(&self, request: &RunRequest, handle: &ProcessHandle) -> Result<ExitInfo> {
        let job_id = &request.job_id;
        let mut stop_rx = handle.subscribe();
        if let Some(stop) = *stop_rx.borrow_and_update() {
            debug!(job_id = %job_id, reason = ?stop.reason, "stop requested before launch");
            return Ok(ExitInfo {
                code: None,
                signal: None,
                reason: stop.reason,
            });
        }

        let writer = self.log.writer(job_id).await?;
        let mut child = self.spawn(request).await?;
        let pid = child.id();
        info!(job_id = %job_id, pid = ?pid, program = %request.program, "process launched");
        self.note(job_id, &format!("launched {} (pid {})", request.program, display_pid(pid)))
            .await;

        let pumps = [
            child.stdout.take().map(|stdout| spawn_pump(stdout, writer.clone())),
            child.stderr.take().map(|stderr| spawn_pump(stderr, writer)),
        ];

        // A limit past the clock's range never fires.
        let deadline = request
            .timeout
            .and_then(|limit| Instant::now().checked_add(limit));
        let supervision = tokio::select! {
            status = child.wait() => Supervision::Exited(status?),
            () = deadline_elapsed(deadline) => Supervision::Stop(StopRequest {
                reason: TerminationReason::Timeout,
                grace: self.grace,
            }),
            stop = stop_signal(&mut stop_rx) => Supervision::Stop(stop),
        };

        let exit = match supervision {
            Supervision::Exited(status) => exit_info(status, TerminationReason::Exited),
            Supervision::Stop(stop) => self.escalate(&mut child, pid, job_id, stop).await?,
        };

        for pump in pumps.into_iter().flatten() {
            if timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
                debug!(job_id = %job_id, "output pipe still held open after exit, detaching");
            }
        }

        self.note(job_id, &describe_exit(&exit)).await;
        info!(
            job_id = %job_id,
            code = ?exit.code,
            signal = ?exit.signal,
            reason = ?exit.reason,
            "process finished"
        );
        Ok(exit)
    }

    async fn spawn(&self, request: &RunRequest) -> Result<Child> {
        let mut command = Command::new(&request.program);
        command
            .args(&request.arguments)
            .current_dir(&request.work_dir)
            .env("JOBHIVE_JOB_ID", request.job_id.as_str())
            .env("JOBHIVE_OUTPUT_DIR", &request.output_dir)
            .env("JOBHIVE_WORK_DIR", &request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(core_count) = request.core_count {
            command.env("JOBHIVE_CORE_COUNT", core_count.to_string());
        }

        command.spawn().map_err(|err| {
            warn!(job_id = %request.job_id, program = %request.program, error = %err, "failed to launch process");
            JobError::Launch {
                program: request.program.clone(),
                message: err.to_string(),
            }
        })
    }

    /// SIGTERM to the whole process group, SIGKILL once `stop.grace` runs out.
    async fn escalate(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        job_id: &JobId,
        stop: StopRequest,
    ) -> Result<ExitInfo> {
        if let Some(status) = child.try_wait()? {
            return Ok(exit_info(status, TerminationReason::Exited));
        }

        self.note(
            job_id,
            &format!("stopping ({}), sending SIGTERM", reason_label(stop.reason)),
        )
        .await;
        signal_group(pid, Signal::SIGTERM, job_id);

        let status = match timeout(stop.grace, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                self.note(job_id, "grace period elapsed, sending SIGKILL").await;
                signal_group(pid, Signal::SIGKILL, job_id);
                if let Err(err) = child.start_kill() {
                    debug!(job_id = %job_id, error = %err, "direct kill after SIGKILL failed");
                }
                child.wait().await?
            }
        };
        // Reap anything the leader left behind in its group.
        signal_group(pid, Signal::SIGKILL, job_id);
        Ok(exit_info(status, stop.reason))
    }

    async fn note(&self, job_id: &JobId, message: &str) {
        if let Err(err) = self.log.note(job_id, message).await {
            warn!(job_id = %job_id, error = %err, "failed to write job log note");
        }
    }
}

#[async_trait]
impl Executor for ProcessRunner {
    async fn execute(&self, request: RunRequest, handle: ProcessHandle) -> Result<ExitInfo> {
        self.run(&request, &handle).await
    }
}

fn spawn_pump<R>(reader: R, writer: LogWriter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(err) = writer.write_line(&line).await {
                        warn!(error = %err, "failed to append process output to job log");
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to read process output");
                    break;
                }
            }
        }
    })
}

fn signal_group(pid: Option<u32>, signal: Signal, job_id: &JobId) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(job_id = %job_id, pid, signal = %signal, error = %err, "failed to signal process group"),
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn exit_info(status: ExitStatus, reason: TerminationReason) -> ExitInfo {
    let signal = status.signal();
    let reason = match reason {
        TerminationReason::Exited if signal.is_some() => TerminationReason::Signaled,
        other => other,
    };
    ExitInfo {
        code: status.code(),
        signal,
        reason,
    }
}

fn describe_exit(exit: &ExitInfo) -> String {
    match (exit.code, exit.signal) {
        (Some(code), _) => format!("{} with exit code {code}", reason_label(exit.reason)),
        (None, Some(signal)) => format!("{} by signal {signal}", reason_label(exit.reason)),
        (None, None) => reason_label(exit.reason).to_string(),
    }
}

fn reason_label(reason: TerminationReason) -> &'static str {
    match reason {
        TerminationReason::Exited => "exited",
        TerminationReason::Signaled => "terminated",
        TerminationReason::Timeout => "timed out",
        TerminationReason::Cancelled => "cancelled",
        TerminationReason::Shutdown => "stopped for shutdown",
    }
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
}
