//! Share modes and reader/writer name locks.
//!
//! Searches take read locks on their inputs, uploads take write locks on
//! their targets. Many readers or many writers may hold a name at once,
//! but never both.

use super::clean_path;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Longest accepted `wait-<dur>` timeout.
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How to behave when a name is locked by the other side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShareMode {
    /// Do not lock at all.
    Ignore,
    /// Leave busy files out.
    SkipBusy,
    /// Wait up to the duration; zero means fail immediately.
    Wait(Duration),
    #[default]
    NoWait,
}

impl ShareMode {
    pub fn parse(s: &str) -> Result<Self> {
        let sm = s.trim().to_ascii_lowercase();
        match sm.as_str() {
            "ignore" | "force-ignore" => return Ok(Self::Ignore),
            "skip" | "skip-busy" => return Ok(Self::SkipBusy),
            "" => return Ok(Self::NoWait),
            _ => {}
        }
        let raw = sm
            .strip_prefix("wait-up-to-")
            .or_else(|| sm.strip_prefix("wait-"))
            .unwrap_or(&sm);
        let d = humantime::parse_duration(raw)
            .map_err(|e| Error::BadRequest(format!("bad timeout: {e}")))?;
        if d > MAX_WAIT_TIMEOUT {
            return Err(Error::BadRequest(format!(
                "bad timeout: cannot be > {:?}, found {:?}",
                MAX_WAIT_TIMEOUT, d
            )));
        }
        Ok(Self::Wait(d))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, Self::Ignore)
    }

    pub fn is_skip_busy(&self) -> bool {
        matches!(self, Self::SkipBusy)
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Wait(d) => *d,
            _ => Duration::ZERO,
        }
    }
}

/// Name under which a file is locked: its normalized full path. Readers
/// and writers must both go through here.
pub fn lock_name(path: &Path) -> String {
    clean_path(path).to_string_lossy().into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct Refs {
    readers: usize,
    writers: usize,
}

/// Process-wide lock table. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct SafeLocks {
    items: Arc<Mutex<HashMap<String, Refs>>>,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct SafeGuard {
    locks: SafeLocks,
    name: String,
    side: Side,
}

impl SafeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a read lock. `Ok(None)` means no lock was taken (ignore mode).
    pub async fn lock_read(&self, name: &str, mode: ShareMode) -> Result<Option<SafeGuard>> {
        self.lock(name, mode, Side::Read).await
    }

    /// Acquire a write lock. `Ok(None)` means no lock was taken (ignore mode).
    pub async fn lock_write(&self, name: &str, mode: ShareMode) -> Result<Option<SafeGuard>> {
        self.lock(name, mode, Side::Write).await
    }

    async fn lock(&self, name: &str, mode: ShareMode, side: Side) -> Result<Option<SafeGuard>> {
        if mode.is_ignore() {
            return Ok(None);
        }
        let deadline = Instant::now() + mode.timeout();
        loop {
            if self.try_lock(name, side) {
                return Ok(Some(SafeGuard {
                    locks: self.clone(),
                    name: name.to_string(),
                    side,
                }));
            }
            if Instant::now() >= deadline {
                warn!(name, ?side, "name is busy");
                return Err(Error::Conflict(format!("{} file is busy", name)));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn try_lock(&self, name: &str, side: Side) -> bool {
        let mut items = self.items.lock();
        let refs = items.entry(name.to_string()).or_default();
        match side {
            Side::Read if refs.writers == 0 => refs.readers += 1,
            Side::Write if refs.readers == 0 => refs.writers += 1,
            _ => return false,
        }
        debug!(name, readers = refs.readers, writers = refs.writers, "lock acquired");
        true
    }

    fn unlock(&self, name: &str, side: Side) {
        let mut items = self.items.lock();
        let Some(refs) = items.get_mut(name) else {
            return;
        };
        match side {
            Side::Read => refs.readers = refs.readers.saturating_sub(1),
            Side::Write => refs.writers = refs.writers.saturating_sub(1),
        }
        if refs.readers + refs.writers == 0 {
            items.remove(name);
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.items.lock().contains_key(name)
    }
}

impl Drop for SafeGuard {
    fn drop(&mut self) {
        self.locks.unlock(&self.name, self.side);
    }
}
