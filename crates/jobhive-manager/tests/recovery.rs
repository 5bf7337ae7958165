mod common;

use std::time::Duration;

use common::{Harness, config, sh_args, wait_for_status, wait_terminal};
use jobhive_common::NewJob;
use jobhive_manager::{
    FailureReason, JobFilter, JobId, JobManager, JobStatus, MAX_TIMEOUT, SubmitOptions,
};
use jobhive_store::JobStore;
use tempfile::TempDir;

fn sh_job(script: &str) -> NewJob {
    NewJob {
        name: "recovered".to_string(),
        program: "sh".to_string(),
        arguments: sh_args(script),
        batch_id: None,
        core_count: None,
        timeout: None,
        result_path: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn running_jobs_become_interrupted_after_restart() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("jobs");

    let id = {
        let (store, _) = JobStore::open(&root).await.unwrap();
        let record = store.create(sh_job("sleep 30")).await.unwrap();
        store
            .update(&record.id, |current| Some(current.to_running()))
            .await
            .unwrap();
        record.id
    };

    let manager = JobManager::open(config(&dir, 1)).await.unwrap();
    assert_eq!(manager.recovery().interrupted, vec![id.clone()]);

    let record = manager.status(&id).await.unwrap();
    assert_eq!(record.status(), JobStatus::Interrupted);
    assert_eq!(record.state.error().unwrap().reason, FailureReason::Interrupted);
    assert!(record.state.finished_at().is_some());

    let log = manager.log(&id, 0).await.unwrap().lines;
    assert!(log.iter().any(|line| line.contains("manager restarted")));
    assert_eq!(manager.cancel(&id).await.unwrap(), JobStatus::Interrupted);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_jobs_resume_after_restart() {
    let harness = Harness::new(1).await;
    let blocker = harness.sh("sleep 30").await;
    let queued = harness.sh("echo resumed").await;
    wait_for_status(&harness.manager, &blocker, JobStatus::Running, Duration::from_secs(5)).await;

    harness.manager.shutdown().await;
    assert_eq!(
        harness.manager.status(&blocker).await.unwrap().status(),
        JobStatus::Interrupted
    );
    assert_eq!(
        harness.manager.status(&queued).await.unwrap().status(),
        JobStatus::Pending
    );

    let restarted = harness.reopen(1).await;
    assert_eq!(restarted.recovery().pending, vec![queued.clone()]);
    let record = wait_terminal(&restarted, &queued, Duration::from_secs(5)).await;
    assert_eq!(record.status(), JobStatus::Completed);
    let log = restarted.log(&queued, 0).await.unwrap().lines;
    assert!(log.iter().any(|line| line == "resumed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_records_survive_restart_unchanged() {
    let harness = Harness::new(1).await;
    let id = harness
        .manager
        .submit(
            "sh",
            sh_args("echo persisted"),
            Some("keeper"),
            SubmitOptions::default()
                .with_core_count(2)
                .with_timeout(Duration::from_millis(2500)),
        )
        .await
        .unwrap();
    let before = wait_terminal(&harness.manager, &id, Duration::from_secs(5)).await;
    harness.manager.shutdown().await;

    let restarted = harness.reopen(1).await;
    let after = restarted.status(&id).await.unwrap();
    assert_eq!(after.status(), JobStatus::Completed);
    assert_eq!(after.name, "keeper");
    assert_eq!(after.core_count, Some(2));
    assert_eq!(after.timeout, Some(Duration::from_millis(2500)));
    assert_eq!(after.state.exit_info(), before.state.exit_info());
    assert_eq!(after.state.result_ref(), before.state.result_ref());
    assert_eq!(after.state.finished_at(), before.state.finished_at());

    let next = restarted
        .submit("sh", sh_args("true"), None, SubmitOptions::default())
        .await
        .unwrap();
    let order: Vec<JobId> = restarted
        .list(&JobFilter::all())
        .await
        .into_iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(order, vec![id, next]);
}

#[tokio::test(flavor = "multi_thread")]
async fn long_timeouts_survive_restart_exactly() {
    let harness = Harness::new(1).await;
    let timeout = MAX_TIMEOUT - Duration::new(0, 876_543_211);
    let id = harness
        .manager
        .submit(
            "sh",
            sh_args("echo patient"),
            None,
            SubmitOptions::default().with_timeout(timeout),
        )
        .await
        .unwrap();
    let before = wait_terminal(&harness.manager, &id, Duration::from_secs(5)).await;
    assert_eq!(before.timeout, Some(MAX_TIMEOUT - Duration::from_millis(876)));
    harness.manager.shutdown().await;

    let restarted = harness.reopen(1).await;
    assert!(restarted.recovery().skipped.is_empty());
    assert_eq!(restarted.status(&id).await.unwrap(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_directories_are_skipped() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("jobs");

    let good = {
        let (store, _) = JobStore::open(&root).await.unwrap();
        let record = store.create(sh_job("true")).await.unwrap();
        store
            .update(&record.id, |current| Some(current.to_cancelled(None)))
            .await
            .unwrap();
        record.id
    };

    std::fs::create_dir_all(root.join("garbled")).unwrap();
    std::fs::write(root.join("garbled").join("metadata.json"), b"{ not json").unwrap();
    std::fs::create_dir_all(root.join("empty")).unwrap();
    std::fs::create_dir_all(root.join(".staging").join("half-built")).unwrap();
    std::fs::write(root.join(good.as_str()).join("metadata.json.tmp"), b"partial").unwrap();

    let manager = JobManager::open(config(&dir, 1)).await.unwrap();
    let report = manager.recovery();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.skipped.len(), 2);
    assert!(!root.join(".staging").exists());
    assert!(!root.join(good.as_str()).join("metadata.json.tmp").exists());

    let listed = manager.list(&JobFilter::all()).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, good);
    assert_eq!(listed[0].status(), JobStatus::Cancelled);
}
