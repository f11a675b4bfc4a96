//! Background job execution.

use super::{Job, JobStore, DELETE_CATALOG, DELETE_FILE};
use crate::catalog::CatalogCache;
use crate::files::delete_all;
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WAKE_CHANNEL_SIZE: usize = 256;
const MAX_SLEEP: Duration = Duration::from_secs(3600);
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Handle used to schedule jobs; wakes the worker on every add.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<JobStore>,
    wake: mpsc::Sender<()>,
}

impl JobQueue {
    pub fn add(&self, cmd: &str, args: &str, when: DateTime<Utc>) -> Result<i64> {
        debug!(cmd, args, %when, "adding new job");
        let id = self.store.add_job(cmd, args, when)?;
        // a full channel already guarantees a wake-up
        let _ = self.wake.try_send(());
        Ok(id)
    }

    /// Schedule deletion of `path` after `lifetime`.
    pub fn delete_after(&self, cmd: &str, path: &Path, lifetime: Duration) -> Result<i64> {
        let when = Utc::now()
            + ChronoDuration::from_std(lifetime).unwrap_or_else(|_| ChronoDuration::hours(1));
        self.add(cmd, &path.to_string_lossy(), when)
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }
}

/// Single task that executes due jobs.
pub struct JobWorker {
    store: Arc<JobStore>,
    wake: mpsc::Receiver<()>,
    cache: Option<CatalogCache>,
    startup_delay: Duration,
    shutdown: CancellationToken,
}

impl JobWorker {
    pub fn new(
        store: Arc<JobStore>,
        cache: Option<CatalogCache>,
        startup_delay: Duration,
        shutdown: CancellationToken,
    ) -> (JobQueue, Self) {
        let (tx, rx) = mpsc::channel(WAKE_CHANNEL_SIZE);
        let queue = JobQueue {
            store: store.clone(),
            wake: tx,
        };
        let worker = Self {
            store,
            wake: rx,
            cache,
            startup_delay,
            shutdown,
        };
        (queue, worker)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.startup_delay) => {}
            _ = self.shutdown.cancelled() => return,
        }

        loop {
            let now = Utc::now();
            self.run_cycle(now).await;

            let sleep = match self.store.get_next_job_time() {
                Ok(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
                Err(e) => {
                    warn!(error = %e, "failed to get next job time");
                    MAX_SLEEP
                }
            };
            let sleep = sleep.clamp(MIN_SLEEP, MAX_SLEEP);
            debug!(?sleep, "sleep a while before next iteration");

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                Some(()) = self.wake.recv() => {
                    // coalesce notifications that piled up meanwhile
                    while self.wake.try_recv().is_ok() {}
                }
                _ = self.shutdown.cancelled() => {
                    info!("job worker shutting down");
                    return;
                }
            }
        }
    }

    /// Execute every job due within a second of `now`, then delete the
    /// completed ones.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        let jobs = match self.store.query_all_jobs(now + ChronoDuration::seconds(1)) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to get pending jobs");
                return;
            }
        };

        let mut done = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.do_job(&job).await {
                done.push(job.id);
            }
        }
        if !done.is_empty() {
            debug!(jobs = ?done, "jobs are completed, deleting");
            if let Err(e) = self.store.delete_jobs(&done) {
                warn!(error = %e, "failed to delete completed jobs");
            }
        }
    }

    async fn do_job(&self, job: &Job) -> bool {
        match job.cmd.to_ascii_lowercase().as_str() {
            DELETE_FILE | DELETE_CATALOG => {
                let res = delete_all(Path::new("/"), &[job.args.clone()], self.cache.as_ref()).await;
                let failed: Vec<_> = res.iter().filter(|(_, status)| *status != "OK").collect();
                if failed.is_empty() {
                    debug!(job = %job, result = ?res, "job done");
                    true
                } else {
                    warn!(job = %job, failed = ?failed, "job failed, will retry");
                    false
                }
            }
            _ => {
                warn!(job = %job, "unknown command, ignored");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn unknown_commands_are_dropped() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("s.db")).unwrap());
        let (queue, worker) =
            JobWorker::new(store.clone(), None, Duration::ZERO, CancellationToken::new());
        queue.add("reboot", "now", Utc::now()).unwrap();
        worker.run_cycle(Utc::now()).await;
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn future_jobs_stay_queued() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("keep.txt");
        std::fs::write(&target, b"x").unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("s.db")).unwrap());
        let (queue, worker) =
            JobWorker::new(store.clone(), None, Duration::ZERO, CancellationToken::new());
        queue
            .delete_after(DELETE_FILE, &target, Duration::from_secs(600))
            .unwrap();
        worker.run_cycle(Utc::now()).await;
        assert!(target.exists());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_deletions_are_retried() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("gone.txt");
        std::fs::write(&target, b"x").unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("s.db")).unwrap());
        let (queue, worker) =
            JobWorker::new(store.clone(), None, Duration::ZERO, CancellationToken::new());
        queue
            .add(DELETE_FILE, &target.to_string_lossy(), Utc::now())
            .unwrap();
        let broken = format!("{}/[unclosed", dir.path().display());
        queue.add(DELETE_FILE, &broken, Utc::now()).unwrap();

        worker.run_cycle(Utc::now()).await;
        assert!(!target.exists());
        let left = store.query_all_jobs(Utc::now() + ChronoDuration::seconds(1)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].args, broken);
    }
}
