//! Integration tests for the deferred job store and its worker.

use chrono::{Duration as ChronoDuration, Utc};
use searchfabric::catalog::{Catalog, CatalogCache, CatalogOptions};
use searchfabric::jobs::{JobStore, JobWorker, DELETE_CATALOG, DELETE_FILE};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[test]
fn re_adding_a_job_moves_it_instead_of_duplicating() {
    let dir = TempDir::new().unwrap();
    let store = JobStore::open(dir.path().join("settings.db")).unwrap();
    let now = Utc::now();

    store
        .add_job(DELETE_FILE, "/tmp/x", now + ChronoDuration::hours(2))
        .unwrap();
    store
        .add_job(DELETE_FILE, "/tmp/x", now - ChronoDuration::seconds(1))
        .unwrap();
    store
        .add_job(DELETE_CATALOG, "/tmp/x", now + ChronoDuration::hours(1))
        .unwrap();

    assert_eq!(store.count().unwrap(), 2);
    let due = store.query_all_jobs(now).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].cmd, DELETE_FILE);
}

#[tokio::test]
async fn scheduled_file_is_deleted_by_the_worker() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("x");
    std::fs::write(&target, b"temporary").unwrap();

    let store = Arc::new(JobStore::open(dir.path().join("settings.db")).unwrap());
    let shutdown = CancellationToken::new();
    let (queue, worker) = JobWorker::new(store.clone(), None, Duration::ZERO, shutdown.clone());
    let task = worker.spawn();

    queue
        .delete_after(DELETE_FILE, &target, Duration::from_millis(100))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let gone = wait_until(Duration::from_secs(3), || {
        !target.exists() && store.count().unwrap_or(1) == 0
    })
    .await;
    assert!(gone, "file should be deleted and the job removed");

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn catalog_deletion_removes_data_directory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cat.db");
    let cat = Catalog::open(&path, &CatalogOptions::default()).unwrap();
    let slot = cat.add_file_part("a.txt", -1, 3, None).unwrap();
    std::fs::write(&slot.data_path, b"abc\n").unwrap();
    let data_dir = cat.data_dir();
    cat.close();
    drop(cat);

    let store = Arc::new(JobStore::open(dir.path().join("settings.db")).unwrap());
    let cache = CatalogCache::new(CatalogOptions::default());
    let (queue, worker) =
        JobWorker::new(store.clone(), Some(cache), Duration::ZERO, CancellationToken::new());
    queue
        .add(DELETE_CATALOG, &path.to_string_lossy(), Utc::now())
        .unwrap();
    worker.run_cycle(Utc::now()).await;

    assert!(!path.exists());
    assert!(!data_dir.exists());
    assert_eq!(store.count().unwrap(), 0);
}

#[tokio::test]
async fn shutdown_stops_an_idle_worker() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JobStore::open(dir.path().join("settings.db")).unwrap());
    let shutdown = CancellationToken::new();
    let (_queue, worker) =
        JobWorker::new(store, None, Duration::from_secs(60), shutdown.clone());
    let task = worker.spawn();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("worker should stop")
        .unwrap();
}
