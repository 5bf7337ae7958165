use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use jobhive_common::{
    BatchId, JobError, JobFailure, JobFilter, JobId, JobRecord, JobStatus, NewJob, Result,
    ResultRef, SubmitOptions,
    options::{validate_arguments, validate_program},
};
use jobhive_runner::{Executor, ProcessRunner};
use jobhive_scheduler::{Scheduler, SchedulerStats};
use jobhive_store::{JobStore, LogSink, RecoveryReport};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ManagerConfig;

pub const DEFAULT_LOG_TAIL: usize = 50;
const DEFAULT_BATCH_NAME: &str = "batch";

/// Outcome of asking for a job's result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    Ready(ResultRef),
    /// The job has not finished yet.
    NotReady(JobStatus),
    /// The job finished without producing a result.
    Unavailable {
        status: JobStatus,
        error: Option<JobFailure>,
    },
}

/// Requested lines of a job's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    /// Lines in the whole log at the time it was read.
    pub total_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSubmission {
    pub batch_id: BatchId,
    pub job_ids: Vec<JobId>,
}

/// Per-status member counts for one batch, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub interrupted: usize,
    pub job_ids: Vec<JobId>,
}

impl BatchSummary {
    fn collect(batch_id: BatchId, members: &[JobRecord]) -> Self {
        let mut summary = Self {
            batch_id,
            total: members.len(),
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            interrupted: 0,
            job_ids: Vec::with_capacity(members.len()),
        };
        for member in members {
            let count = match member.status() {
                JobStatus::Pending => &mut summary.pending,
                JobStatus::Running => &mut summary.running,
                JobStatus::Completed => &mut summary.completed,
                JobStatus::Failed => &mut summary.failed,
                JobStatus::Cancelled => &mut summary.cancelled,
                JobStatus::Interrupted => &mut summary.interrupted,
            };
            *count += 1;
            summary.job_ids.push(member.id.clone());
        }
        summary
    }

    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.pending == 0 && self.running == 0
    }
}

/// Whether a program can be launched from this environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramProbe {
    pub program: String,
    pub resolved: Option<PathBuf>,
    pub executable: bool,
    pub message: String,
}

/// Entry point for submitting and observing external jobs.
///
/// Cheap to clone; all clones share one store and one scheduler.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    store: JobStore,
    log: LogSink,
    scheduler: Scheduler,
    recovery: RecoveryReport,
}

impl JobManager {
    pub async fn open(config: ManagerConfig) -> Result<Self> {
        let runner = ProcessRunner::new(LogSink::new(&config.root))
            .with_grace(config.termination_grace);
        Self::open_with_executor(config, Arc::new(runner)).await
    }

    /// Opens the store, reconciles what a previous run left behind and
    /// re-enqueues jobs that never started.
    pub async fn open_with_executor(
        config: ManagerConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        config.validate()?;
        let (store, recovery) = JobStore::open(&config.root).await?;
        let log = LogSink::new(store.root());
        let scheduler = Scheduler::new(
            store.clone(),
            executor,
            config.max_concurrent,
            config.termination_grace,
        );

        for id in &recovery.interrupted {
            if let Err(err) = log.note(id, "job interrupted: manager restarted while it was running").await {
                warn!(job_id = %id, error = %err, "failed to write job log note");
            }
        }
        if !recovery.pending.is_empty() {
            scheduler.enqueue(recovery.pending.iter().cloned()).await?;
        }

        info!(
            root = %store.root().display(),
            max_concurrent = config.max_concurrent,
            requeued = recovery.pending.len(),
            "job manager ready"
        );
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                log,
                scheduler,
                recovery,
            }),
        })
    }

    /// Validates and durably records the job, then queues it.
    pub async fn submit(
        &self,
        program: impl Into<String>,
        arguments: Vec<String>,
        name: Option<&str>,
        options: SubmitOptions,
    ) -> Result<JobId> {
        let program = program.into();
        let name = name.map_or_else(|| default_name(&program), str::to_string);
        let job = self.prepare(program, arguments, name, None, &options)?;
        self.ensure_accepting().await?;

        let record = self.inner.store.create(job).await?;
        self.note(&record.id, &format!("submitted {}", describe_command(&record)))
            .await;
        if let Err(err) = self.inner.scheduler.enqueue([record.id.clone()]).await {
            self.abandon(std::slice::from_ref(&record)).await;
            return Err(err);
        }
        info!(job_id = %record.id, name = %record.name, program = %record.program, "job submitted");
        Ok(record.id)
    }

    /// Submits one job per argument list under a shared batch id.
    ///
    /// Every item is validated before any job is created. Members are named
    /// `<name>_<n>`, counting from 1.
    pub async fn submit_batch(
        &self,
        program: impl Into<String>,
        items: Vec<Vec<String>>,
        name: Option<&str>,
        options: SubmitOptions,
    ) -> Result<BatchSubmission> {
        if items.is_empty() {
            return Err(JobError::validation("batch must contain at least one item"));
        }
        let program = program.into();
        let base = name.unwrap_or(DEFAULT_BATCH_NAME);
        let batch_id = BatchId::generate();

        let jobs = items
            .into_iter()
            .enumerate()
            .map(|(index, arguments)| {
                self.prepare(
                    program.clone(),
                    arguments,
                    format!("{base}_{}", index + 1),
                    Some(batch_id.clone()),
                    &options,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        self.ensure_accepting().await?;

        let mut created: Vec<JobRecord> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.inner.store.create(job).await {
                Ok(record) => created.push(record),
                Err(err) => {
                    self.abandon(&created).await;
                    return Err(err);
                }
            }
        }

        for record in &created {
            self.note(
                &record.id,
                &format!("submitted {} (batch {batch_id})", describe_command(record)),
            )
            .await;
        }
        let job_ids: Vec<JobId> = created.iter().map(|record| record.id.clone()).collect();
        if let Err(err) = self.inner.scheduler.enqueue(job_ids.iter().cloned()).await {
            self.abandon(&created).await;
            return Err(err);
        }
        info!(batch_id = %batch_id, jobs = job_ids.len(), program = %program, "batch submitted");
        Ok(BatchSubmission { batch_id, job_ids })
    }

    pub async fn status(&self, id: &JobId) -> Result<JobRecord> {
        self.inner.store.get(id).await
    }

    /// Last `tail` lines of the job's log; `0` returns the whole log.
    pub async fn log(&self, id: &JobId, tail: usize) -> Result<LogTail> {
        self.inner.store.get(id).await?;
        let lines = self.inner.log.tail(id, tail).await?;
        let total_lines = self.inner.log.line_count(id).await?;
        Ok(LogTail { lines, total_lines })
    }

    pub async fn result(&self, id: &JobId) -> Result<ResultLookup> {
        let record = self.inner.store.get(id).await?;
        let status = record.status();
        Ok(match record.state.result_ref() {
            Some(result_ref) => ResultLookup::Ready(result_ref.clone()),
            None if !status.is_terminal() => ResultLookup::NotReady(status),
            None => ResultLookup::Unavailable {
                status,
                error: record.state.error().cloned(),
            },
        })
    }

    /// Idempotent; returns the status the job ends up in.
    pub async fn cancel(&self, id: &JobId) -> Result<JobStatus> {
        Ok(self.inner.scheduler.cancel(id).await?.status())
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.inner.store.list(filter).await
    }

    pub async fn batch_summary(&self, batch_id: &BatchId) -> BatchSummary {
        let members = self
            .inner
            .store
            .list(&JobFilter::all().with_batch(batch_id.clone()))
            .await;
        BatchSummary::collect(batch_id.clone(), &members)
    }

    /// Resolves `program` the way a launch would and reports whether it can
    /// be executed.
    pub fn probe_program(&self, program: &str) -> ProgramProbe {
        probe_program(program)
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats().await
    }

    /// Stops accepting work and interrupts running jobs. Queued jobs stay
    /// `pending` and are picked up by the next `open`.
    pub async fn shutdown(&self) {
        self.inner
            .scheduler
            .shutdown(self.inner.config.termination_grace)
            .await;
        info!(root = %self.inner.store.root().display(), "job manager stopped");
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// What `open` found on disk.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    fn prepare(
        &self,
        program: String,
        arguments: Vec<String>,
        name: String,
        batch_id: Option<BatchId>,
        options: &SubmitOptions,
    ) -> Result<NewJob> {
        validate_program(&program)?;
        validate_arguments(&arguments)?;
        options.validate()?;
        Ok(NewJob {
            name,
            program,
            arguments,
            batch_id,
            core_count: options.core_count,
            timeout: options.timeout.or(self.inner.config.default_timeout),
            result_path: options.result_path.clone(),
        })
    }

    async fn ensure_accepting(&self) -> Result<()> {
        if self.inner.scheduler.is_accepting().await {
            Ok(())
        } else {
            Err(JobError::ShuttingDown)
        }
    }

    /// Cancels records whose submission failed after they were created, so
    /// a caller that got an error never has a job run on its behalf.
    async fn abandon(&self, created: &[JobRecord]) {
        for record in created {
            let abandoned = self
                .inner
                .store
                .update(&record.id, |current| Some(current.to_cancelled(None)))
                .await;
            if let Err(err) = abandoned {
                warn!(job_id = %record.id, error = %err, "failed to cancel abandoned submission");
                continue;
            }
            self.note(&record.id, "job cancelled: submission abandoned").await;
        }
    }

    async fn note(&self, id: &JobId, message: &str) {
        if let Err(err) = self.inner.log.note(id, message).await {
            warn!(job_id = %id, error = %err, "failed to write job log note");
        }
    }
}

pub fn probe_program(program: &str) -> ProgramProbe {
    let program = program.to_string();
    if let Err(err) = validate_program(&program) {
        return ProgramProbe {
            program,
            resolved: None,
            executable: false,
            message: err.to_string(),
        };
    }

    match which::which(&program) {
        Ok(resolved) => ProgramProbe {
            message: format!("{program} resolves to {}", resolved.display()),
            program,
            resolved: Some(resolved),
            executable: true,
        },
        Err(err) => {
            let path = Path::new(&program);
            let resolved = (path.components().count() > 1 && path.exists())
                .then(|| path.to_path_buf());
            let message = match &resolved {
                Some(resolved) => format!("{} exists but is not executable", resolved.display()),
                None => format!("{program} not found: {err}"),
            };
            ProgramProbe {
                program,
                resolved,
                executable: false,
                message,
            }
        }
    }
}

fn default_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "job".to_string())
}

fn describe_command(record: &JobRecord) -> String {
    if record.arguments.is_empty() {
        record.program.clone()
    } else {
        format!("{} {}", record.program, record.arguments.join(" "))
    }
}
