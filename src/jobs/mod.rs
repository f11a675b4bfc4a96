//! Deferred jobs: a durable queue of time-scheduled maintenance commands.
//!
//! Jobs live in a small SQLite database (the server settings file). A
//! single [`JobWorker`] executes due jobs and sleeps until the next one,
//! waking early when a new job is added.

mod worker;

pub use worker::{JobQueue, JobWorker};

use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DELETE_FILE: &str = "delete-file";
pub const DELETE_CATALOG: &str = "delete-catalog";

const SCHEME_VERSION: i32 = 1;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const SCHEME_V1: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    cmd STRING NOT NULL,
    args STRING,
    whenToRun STRING,  -- UTC
    CONSTRAINT cmd_args UNIQUE (cmd, args)
);
PRAGMA user_version = 1;
"#;

/// One scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub cmd: String,
    pub args: String,
    pub when: String,
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} [{} {}] at {}", self.id, self.cmd, self.args, self.when)
    }
}

/// Persistent job table.
pub struct JobStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let store = Self {
            path,
            conn: Mutex::new(conn),
        };
        store.update_scheme()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update_scheme(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version >= SCHEME_VERSION {
            return Ok(());
        }
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        tx.execute_batch(SCHEME_V1)?;
        tx.commit()?;
        Ok(())
    }

    /// Schedule a job, replacing the time of an existing (cmd, args) pair.
    pub fn add_job(&self, cmd: &str, args: &str, when: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        tx.execute(
            "INSERT OR REPLACE INTO jobs (cmd, args, whenToRun) VALUES (?1, ?2, ?3)",
            params![cmd, args, format_time(when)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn delete_jobs(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let set = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM jobs WHERE id IN ({set})");
        let conn = self.conn.lock();
        conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        Ok(())
    }

    /// Jobs due at `now` or earlier.
    pub fn query_all_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, cmd, args, whenToRun FROM jobs
             WHERE datetime(whenToRun) <= datetime(?1) ORDER BY whenToRun",
        )?;
        let rows = stmt.query_map(params![format_time(now)], |r| {
            Ok(Job {
                id: r.get(0)?,
                cmd: r.get(1)?,
                args: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                when: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Earliest scheduled time, or an hour from now if the table is empty.
    pub fn get_next_job_time(&self) -> Result<DateTime<Utc>> {
        let conn = self.conn.lock();
        let when: Option<String> =
            conn.query_row("SELECT MIN(datetime(whenToRun)) FROM jobs", [], |r| r.get(0))?;
        match when {
            None => Ok(Utc::now() + ChronoDuration::hours(1)),
            Some(s) => parse_time(&s),
        }
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn clear_all(&self) -> Result<()> {
        self.conn.lock().execute("DELETE FROM jobs", [])?;
        Ok(())
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| Error::Internal(format!("bad job time {:?}: {}", s, e)))?;
    Ok(naive.and_utc())
}
