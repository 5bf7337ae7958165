#![allow(dead_code)]

use std::{sync::Once, time::Duration};

use jobhive_manager::{JobId, JobManager, JobRecord, JobStatus, ManagerConfig};
use tempfile::TempDir;
use tokio::time::{Instant, sleep};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub dir: TempDir,
    pub manager: JobManager,
}

impl Harness {
    pub async fn new(max_concurrent: usize) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let manager = JobManager::open(config(&dir, max_concurrent)).await.unwrap();
        Self { dir, manager }
    }

    /// Opens a second manager on the same root, as a restarted process would.
    pub async fn reopen(&self, max_concurrent: usize) -> JobManager {
        JobManager::open(config(&self.dir, max_concurrent)).await.unwrap()
    }

    pub async fn sh(&self, script: &str) -> JobId {
        self.manager
            .submit("sh", vec!["-c".to_string(), script.to_string()], None, Default::default())
            .await
            .unwrap()
    }
}

pub fn config(dir: &TempDir, max_concurrent: usize) -> ManagerConfig {
    ManagerConfig::new(dir.path().join("jobs"))
        .with_max_concurrent(max_concurrent)
        .with_termination_grace(Duration::from_millis(500))
}

pub fn sh_args(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

pub async fn wait_for_status(
    manager: &JobManager,
    id: &JobId,
    status: JobStatus,
    limit: Duration,
) -> JobRecord {
    let deadline = Instant::now() + limit;
    loop {
        let record = manager.status(id).await.unwrap();
        if record.status() == status {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} is {} after {limit:?}, expected {status}",
            record.status()
        );
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_terminal(manager: &JobManager, id: &JobId, limit: Duration) -> JobRecord {
    let deadline = Instant::now() + limit;
    loop {
        let record = manager.status(id).await.unwrap();
        if record.is_terminal() {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} still {} after {limit:?}",
            record.status()
        );
        sleep(Duration::from_millis(20)).await;
    }
}
