use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
    time::Duration,
};

use jobhive_common::{
    ExitInfo, FailureReason, JobError, JobFailure, JobId, JobRecord, JobState, JobStatus,
    ResultRef, Result, TerminationReason,
};
use jobhive_runner::{Executor, ProcessHandle, RunRequest};
use jobhive_store::{JobStore, LogSink};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

const DISPATCH_RETRY_DELAY: Duration = Duration::from_millis(200);
const FINALIZE_ATTEMPTS: u32 = 4;
const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bounded-concurrency FIFO dispatcher for stored jobs.
///
/// Every admission decision is made under one queue lock: enqueueing,
/// dispatching and cancelling a queued job never interleave.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    capacity: usize,
    grace: Duration,
    store: JobStore,
    log: LogSink,
    executor: Arc<dyn Executor>,
    state: Mutex<QueueState>,
    wake: Arc<Notify>,
}

struct QueueState {
    queue: VecDeque<JobId>,
    running: HashMap<JobId, RunningJob>,
    accepting: bool,
}

struct RunningJob {
    handle: ProcessHandle,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub capacity: usize,
    pub queued: usize,
    pub running: usize,
    pub accepting: bool,
}

impl Scheduler {
    /// Must be called from within a tokio runtime; the dispatcher runs as a
    /// background task.
    pub fn new(
        store: JobStore,
        executor: Arc<dyn Executor>,
        capacity: usize,
        grace: Duration,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let inner = Arc::new(SchedulerInner {
            capacity: capacity.max(1),
            grace,
            log: LogSink::new(store.root()),
            store,
            executor,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                running: HashMap::new(),
                accepting: true,
            }),
            wake: wake.clone(),
        });
        tokio::spawn(run_dispatcher(Arc::downgrade(&inner), wake));
        Self { inner }
    }

    /// Appends `ids` to the queue in one step, so a batch is never split by
    /// a concurrent submission.
    pub async fn enqueue(&self, ids: impl IntoIterator<Item = JobId>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.accepting {
            return Err(JobError::ShuttingDown);
        }
        let before = state.queue.len();
        state.queue.extend(ids);
        let added = state.queue.len() - before;
        let queued = state.queue.len();
        drop(state);

        debug!(added, queued, "jobs enqueued");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Cancels a queued or running job.
    ///
    /// A queued job is dropped from the queue and never launched. A running
    /// job is marked `cancelled` first and then terminated; it keeps its slot
    /// until the process has exited. Terminal jobs are returned unchanged.
    pub async fn cancel(&self, id: &JobId) -> Result<JobRecord> {
        let mut state = self.inner.state.lock().await;
        if let Some(position) = state.queue.iter().position(|queued| queued == id) {
            state.queue.remove(position);
            let cancelled = self.mark_cancelled(id).await;
            if cancelled.is_err() {
                state.queue.insert(position, id.clone());
            }
            drop(state);
            return cancelled;
        }
        let handle = state.running.get(id).map(|running| running.handle.clone());
        drop(state);

        let record = self.mark_cancelled(id).await?;
        if record.status() == JobStatus::Cancelled
            && let Some(handle) = handle
            && handle.terminate(TerminationReason::Cancelled, self.inner.grace)
        {
            debug!(job_id = %id, "termination requested");
        }
        Ok(record)
    }

    /// Stops admission, terminates running jobs with reason `shutdown` and
    /// waits for their supervisors to record the outcome. Queued jobs stay
    /// `pending` on disk.
    pub async fn shutdown(&self, grace: Duration) {
        let supervisors = {
            let mut state = self.inner.state.lock().await;
            state.accepting = false;
            let left_pending = state.queue.len();
            state.queue.clear();
            for running in state.running.values() {
                running.handle.terminate(TerminationReason::Shutdown, grace);
            }
            info!(
                running = state.running.len(),
                left_pending,
                "scheduler shutting down"
            );
            state
                .running
                .values_mut()
                .filter_map(|running| running.supervisor.take())
                .collect::<Vec<_>>()
        };
        self.inner.wake.notify_one();

        for supervisor in supervisors {
            if let Err(err) = supervisor.await {
                warn!(error = %err, "job supervisor ended abnormally");
            }
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock().await;
        SchedulerStats {
            capacity: self.inner.capacity,
            queued: state.queue.len(),
            running: state.running.len(),
            accepting: state.accepting,
        }
    }

    pub async fn is_accepting(&self) -> bool {
        self.inner.state.lock().await.accepting
    }

    /// Starts queued jobs until capacity is reached. Returns `false` once the
    /// scheduler has stopped accepting work.
    async fn dispatch(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        while state.accepting && state.running.len() < self.inner.capacity {
            let Some(id) = state.queue.pop_front() else {
                break;
            };

            let mut claimed = false;
            let record = match self
                .inner
                .store
                .update(&id, |current| {
                    (current.status() == JobStatus::Pending).then(|| {
                        claimed = true;
                        current.to_running()
                    })
                })
                .await
            {
                Ok(record) => record,
                Err(err) => {
                    warn!(job_id = %id, error = %err, "failed to mark job running, retrying shortly");
                    state.queue.push_front(id);
                    self.retry_dispatch_later();
                    break;
                }
            };
            if !claimed {
                debug!(job_id = %id, status = %record.status(), "queued job is no longer pending, skipping");
                continue;
            }

            let handle = ProcessHandle::new();
            let supervisor = tokio::spawn(self.clone().supervise(record, handle.clone()));
            state.running.insert(
                id,
                RunningJob {
                    handle,
                    supervisor: Some(supervisor),
                },
            );
        }
        state.accepting
    }

    fn retry_dispatch_later(&self) {
        let wake = self.inner.wake.clone();
        tokio::spawn(async move {
            sleep(DISPATCH_RETRY_DELAY).await;
            wake.notify_one();
        });
    }

    async fn supervise(self, record: JobRecord, handle: ProcessHandle) {
        let id = record.id.clone();
        debug!(job_id = %id, program = %record.program, "job dispatched");
        let request = RunRequest::new(&record, &self.inner.store.paths(&id));

        // A panicking executor must not take the bookkeeping below with it.
        let executor = self.inner.executor.clone();
        let execution = tokio::spawn(async move { executor.execute(request, handle).await });
        let outcome = match execution.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(job_id = %id, error = %err, "job execution task ended abnormally");
                Err(JobError::Internal(format!("execution task ended abnormally: {err}")))
            }
        };
        self.finalize(&record, outcome).await;

        self.inner.state.lock().await.running.remove(&id);
        self.inner.wake.notify_one();
    }

    /// Records the outcome unless the job already reached a terminal state
    /// (for example through cancellation), in which case this is a no-op.
    async fn finalize(&self, record: &JobRecord, outcome: Result<ExitInfo>) {
        let id = &record.id;
        let paths = self.inner.store.paths(id);
        let result_ref = ResultRef(match &record.result_path {
            Some(result_path) => paths.output.join(result_path),
            None => paths.output,
        });

        let next = settle(record, outcome, result_ref);

        let updated = match self.persist_outcome(id, &next).await {
            Ok(updated) => updated,
            Err(err) => {
                error!(job_id = %id, error = %err, "failed to persist job outcome, keeping it in memory only");
                match self
                    .inner
                    .store
                    .publish_unpersisted(id, |current| finish(current, &next))
                    .await
                {
                    Ok(updated) => updated,
                    Err(err) => {
                        error!(job_id = %id, error = %err, "failed to publish job outcome");
                        return;
                    }
                }
            }
        };

        if updated.state != next {
            debug!(job_id = %id, status = %updated.status(), "job already settled, discarding process outcome");
            return;
        }
        let summary = match updated.state.error() {
            Some(error) => format!("job {}: {}", updated.status(), error.message),
            None => format!("job {}", updated.status()),
        };
        self.note(id, &summary).await;
        info!(
            job_id = %id,
            status = %updated.status(),
            runtime_ms = updated.runtime().map(|runtime| runtime.as_millis() as u64),
            "job finished"
        );
    }

    async fn persist_outcome(&self, id: &JobId, next: &JobState) -> Result<JobRecord> {
        let mut attempt = 1;
        loop {
            match self.inner.store.update(id, |current| finish(current, next)).await {
                Err(err) if attempt < FINALIZE_ATTEMPTS && !matches!(err, JobError::NotFound(_)) => {
                    warn!(job_id = %id, attempt, code = err.kind_code(), error = %err, "failed to record job outcome, retrying");
                    sleep(FINALIZE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn mark_cancelled(&self, id: &JobId) -> Result<JobRecord> {
        let mut cancelled = false;
        let record = self
            .inner
            .store
            .update(id, |current| {
                matches!(current.status(), JobStatus::Pending | JobStatus::Running).then(|| {
                    cancelled = true;
                    current.to_cancelled(None)
                })
            })
            .await?;
        if cancelled {
            self.note(id, "job cancelled").await;
            info!(job_id = %id, "job cancelled");
        }
        Ok(record)
    }

    async fn note(&self, id: &JobId, message: &str) {
        if let Err(err) = self.inner.log.note(id, message).await {
            warn!(job_id = %id, error = %err, "failed to write job log note");
        }
    }
}

async fn run_dispatcher(scheduler: Weak<SchedulerInner>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        let Some(inner) = scheduler.upgrade() else {
            break;
        };
        if !(Scheduler { inner }).dispatch().await {
            debug!("dispatcher stopped");
            break;
        }
    }
}

/// The settled state, unless the job already left `running` (cancelled).
fn finish(current: &JobRecord, next: &JobState) -> Option<JobState> {
    (current.status() == JobStatus::Running).then(|| next.clone())
}

fn settle(current: &JobRecord, outcome: Result<ExitInfo>, result_ref: ResultRef) -> JobState {
    let exit = match outcome {
        Ok(exit) => exit,
        Err(err @ JobError::Launch { .. }) => {
            return current.to_failed(None, JobFailure::new(FailureReason::Launch, err.to_string()));
        }
        Err(err) => {
            return current.to_failed(
                None,
                JobFailure::new(FailureReason::Execution, err.to_string()),
            );
        }
    };

    if exit.is_success() {
        return current.to_completed(exit, result_ref);
    }
    match exit.reason {
        TerminationReason::Exited => {
            let message = match exit.code {
                Some(code) => format!("process exited with code {code}"),
                None => "process exited without a status code".to_string(),
            };
            current.to_failed(Some(exit), JobFailure::new(FailureReason::Execution, message))
        }
        TerminationReason::Signaled => {
            let message = match exit.signal {
                Some(signal) => format!("process terminated by signal {signal}"),
                None => "process terminated by a signal".to_string(),
            };
            current.to_failed(Some(exit), JobFailure::new(FailureReason::Execution, message))
        }
        TerminationReason::Timeout => {
            let message = match current.timeout {
                Some(timeout) => format!("process exceeded its timeout of {}s", timeout.as_secs_f64()),
                None => "process exceeded its timeout".to_string(),
            };
            current.to_failed(Some(exit), JobFailure::new(FailureReason::Timeout, message))
        }
        TerminationReason::Cancelled => current.to_cancelled(Some(exit)),
        TerminationReason::Shutdown => {
            current.to_interrupted("job manager shut down while the job was running")
        }
    }
}
