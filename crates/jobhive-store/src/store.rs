use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, RwLock as StdRwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use jobhive_common::{
    JobError, JobFilter, JobId, JobRecord, JobState, JobStatus, NewJob, Result, time::now,
};
use tokio::{
    fs,
    io::AsyncWriteExt,
    sync::{Mutex, RwLock},
};
use tracing::{debug, info, warn};

use crate::layout::{JobPaths, STAGING_DIR_NAME};

const INTERRUPTED_MESSAGE: &str = "job was running when the manager stopped; no process is supervising it";

/// Durable job records: one directory per job plus an in-memory index.
///
/// Each record has its own write lock. A mutation is written to disk before
/// the new snapshot is published, so readers never see unpersisted state and
/// never wait on disk I/O.
#[derive(Debug, Clone)]
pub struct JobStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    root: PathBuf,
    index: RwLock<HashMap<JobId, Arc<JobSlot>>>,
    next_sequence: AtomicU64,
}

#[derive(Debug)]
struct JobSlot {
    write_lock: Mutex<()>,
    current: StdRwLock<JobRecord>,
}

impl JobSlot {
    fn new(record: JobRecord) -> Self {
        Self {
            write_lock: Mutex::new(()),
            current: StdRwLock::new(record),
        }
    }

    fn snapshot(&self) -> JobRecord {
        match self.current.read() {
            Ok(record) => record.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, record: JobRecord) {
        match self.current.write() {
            Ok(mut current) => *current = record,
            Err(poisoned) => *poisoned.into_inner() = record,
        }
    }
}

/// What `JobStore::open` found on disk.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub loaded: usize,
    /// Jobs forced from `running` to `interrupted`.
    pub interrupted: Vec<JobId>,
    /// Jobs still `pending`, oldest submission first.
    pub pending: Vec<JobId>,
    /// Directories that could not be loaded, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

impl JobStore {
    /// Opens (or initialises) the store at `root` and reconciles what a
    /// previous process left behind.
    pub async fn open(root: impl Into<PathBuf>) -> Result<(Self, RecoveryReport)> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let store = Self {
            inner: Arc::new(StoreInner {
                root,
                index: RwLock::new(HashMap::new()),
                next_sequence: AtomicU64::new(1),
            }),
        };
        let report = store.recover().await?;
        Ok((store, report))
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn paths(&self, id: &JobId) -> JobPaths {
        JobPaths::new(&self.inner.root, id)
    }

    pub async fn create(&self, job: NewJob) -> Result<JobRecord> {
        let id = self.allocate_id().await?;
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::SeqCst);
        let record = JobRecord::new(id.clone(), sequence, now(), job);

        let staging = JobPaths::staging(&self.inner.root, &id);
        let target = self.paths(&id);
        if let Err(err) = build_scaffold(&staging, &target, &record).await {
            if let Err(cleanup_err) = fs::remove_dir_all(&staging.dir).await
                && cleanup_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(job_id = %id, error = %cleanup_err, "failed to remove staged job directory");
            }
            return Err(err);
        }

        self.inner
            .index
            .write()
            .await
            .insert(id.clone(), Arc::new(JobSlot::new(record.clone())));
        debug!(job_id = %id, sequence, name = %record.name, "job record created");
        Ok(record)
    }

    pub async fn get(&self, id: &JobId) -> Result<JobRecord> {
        Ok(self.slot(id).await?.snapshot())
    }

    pub async fn contains(&self, id: &JobId) -> bool {
        self.inner.index.read().await.contains_key(id)
    }

    /// Applies `transition` to the job under its write lock.
    ///
    /// The closure sees the latest snapshot and returns the next state, or
    /// `None` to leave the record untouched. Moves that are not edges of the
    /// state machine are rejected with `IllegalTransition`.
    pub async fn update<F>(&self, id: &JobId, transition: F) -> Result<JobRecord>
    where
        F: FnOnce(&JobRecord) -> Option<JobState>,
    {
        self.apply(id, transition, true).await
    }

    /// Same as `update` without touching disk.
    ///
    /// Only for outcomes the disk refused to take: the in-memory record moves
    /// on while `metadata.json` keeps the last persisted state, which the next
    /// `open` reconciles.
    pub async fn publish_unpersisted<F>(&self, id: &JobId, transition: F) -> Result<JobRecord>
    where
        F: FnOnce(&JobRecord) -> Option<JobState>,
    {
        self.apply(id, transition, false).await
    }

    async fn apply<F>(&self, id: &JobId, transition: F, persist: bool) -> Result<JobRecord>
    where
        F: FnOnce(&JobRecord) -> Option<JobState>,
    {
        let slot = self.slot(id).await?;
        let _guard = slot.write_lock.lock().await;

        let current = slot.snapshot();
        let Some(next_state) = transition(&current) else {
            return Ok(current);
        };

        let from = current.status();
        let to = next_state.status();
        if !from.can_transition_to(to) {
            return Err(JobError::IllegalTransition {
                id: id.clone(),
                from,
                to,
            });
        }

        let mut next = current;
        next.state = next_state;
        if persist {
            write_metadata(&self.paths(id), &next).await?;
            debug!(job_id = %id, %from, %to, "job transitioned");
        } else {
            warn!(job_id = %id, %from, %to, "job transitioned in memory only");
        }
        slot.publish(next.clone());
        Ok(next)
    }

    /// Snapshots matching `filter`, in submission order.
    pub async fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .inner
            .index
            .read()
            .await
            .values()
            .map(|slot| slot.snapshot())
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by_key(|record| record.sequence);
        records
    }

    async fn slot(&self, id: &JobId) -> Result<Arc<JobSlot>> {
        self.inner
            .index
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.clone()))
    }

    async fn allocate_id(&self) -> Result<JobId> {
        for _ in 0..8 {
            let id = JobId::generate();
            if self.contains(&id).await {
                continue;
            }
            if fs::try_exists(self.paths(&id).dir).await? {
                continue;
            }
            return Ok(id);
        }
        Err(JobError::Internal("could not allocate a unique job id".to_string()))
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        let root = &self.inner.root;
        let staging_root = root.join(STAGING_DIR_NAME);
        match fs::remove_dir_all(&staging_root).await {
            Ok(()) => debug!(path = %staging_root.display(), "discarded staged job directories"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(JobError::Io(err)),
        }

        let mut report = RecoveryReport::default();
        let mut loaded = Vec::new();
        let mut entries = fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.metadata().await?.is_dir() {
                continue;
            }

            let id = JobId::from(name);
            match load_job_dir(&self.paths(&id), &id).await {
                Ok(record) => loaded.push(record),
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping unreadable job directory");
                    report.skipped.push((entry.path(), err.to_string()));
                }
            }
        }

        loaded.sort_by_key(|record| record.sequence);
        let max_sequence = loaded.iter().map(|record| record.sequence).max().unwrap_or(0);
        self.inner
            .next_sequence
            .store(max_sequence.saturating_add(1), Ordering::SeqCst);

        let mut index = self.inner.index.write().await;
        for mut record in loaded {
            match record.status() {
                JobStatus::Running => {
                    record.state = record.to_interrupted(INTERRUPTED_MESSAGE);
                    write_metadata(&self.paths(&record.id), &record).await?;
                    warn!(job_id = %record.id, "running job had no supervisor, marked interrupted");
                    report.interrupted.push(record.id.clone());
                }
                JobStatus::Pending => report.pending.push(record.id.clone()),
                _ => {}
            }
            report.loaded += 1;
            index.insert(record.id.clone(), Arc::new(JobSlot::new(record)));
        }
        drop(index);

        info!(
            root = %root.display(),
            loaded = report.loaded,
            interrupted = report.interrupted.len(),
            pending = report.pending.len(),
            skipped = report.skipped.len(),
            "job store recovered"
        );
        Ok(report)
    }
}

async fn build_scaffold(staging: &JobPaths, target: &JobPaths, record: &JobRecord) -> Result<()> {
    fs::create_dir_all(&staging.output).await?;
    fs::create_dir_all(&staging.work).await?;
    fs::File::create(&staging.log).await?;
    write_metadata(staging, record).await?;
    fs::rename(&staging.dir, &target.dir).await?;
    Ok(())
}

async fn write_metadata(paths: &JobPaths, record: &JobRecord) -> Result<()> {
    let payload = serde_json::to_vec_pretty(record).map_err(|err| {
        JobError::Internal(format!(
            "failed to serialize job metadata {}: {err}",
            paths.metadata.display()
        ))
    })?;

    let tmp_path = paths.metadata_tmp();
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(&payload).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, &paths.metadata).await?;
    Ok(())
}

async fn load_job_dir(paths: &JobPaths, id: &JobId) -> Result<JobRecord> {
    let tmp_path = paths.metadata_tmp();
    match fs::remove_file(&tmp_path).await {
        Ok(()) => debug!(path = %tmp_path.display(), "removed partial metadata write"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(JobError::Io(err)),
    }

    let bytes = fs::read(&paths.metadata).await.map_err(|err| JobError::Corrupt {
        path: paths.metadata.clone(),
        message: err.to_string(),
    })?;
    let record: JobRecord = serde_json::from_slice(&bytes).map_err(|err| JobError::Corrupt {
        path: paths.metadata.clone(),
        message: format!("failed to parse job metadata: {err}"),
    })?;
    if &record.id != id {
        return Err(JobError::Corrupt {
            path: paths.metadata.clone(),
            message: format!("metadata belongs to job {}", record.id),
        });
    }

    fs::create_dir_all(&paths.output).await?;
    fs::create_dir_all(&paths.work).await?;
    if !fs::try_exists(&paths.log).await? {
        fs::File::create(&paths.log).await?;
    }
    Ok(record)
}
