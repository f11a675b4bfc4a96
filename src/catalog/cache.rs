//! Process-wide cache of open catalogs.
//!
//! Each catalog path maps to one open [`Catalog`] with a reference count.
//! Handles decrement the count when dropped; when it reaches zero a drop
//! timer starts, and the catalog is closed once the timer fires unless it
//! was re-opened in the meantime.

use super::{is_catalog, Catalog, CatalogOptions};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

struct Entry {
    catalog: Arc<Catalog>,
    refs: usize,
    /// Bumped on every release so stale drop timers are ignored.
    generation: u64,
}

struct Inner {
    entries: Mutex<HashMap<PathBuf, Entry>>,
    options: CatalogOptions,
}

/// Shared catalog cache. Cloning is cheap.
#[derive(Clone)]
pub struct CatalogCache {
    inner: Arc<Inner>,
}

/// Reference to a cached catalog; released on drop.
pub struct CatalogHandle {
    catalog: Arc<Catalog>,
    cache: CatalogCache,
}

impl CatalogCache {
    pub fn new(options: CatalogOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                options,
            }),
        }
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.inner.options
    }

    /// Open (creating if needed) the catalog at `path`.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<CatalogHandle> {
        self.acquire(path.as_ref(), false)
    }

    /// Open an existing catalog; fails with "not a catalog" otherwise.
    pub fn open_read_only(&self, path: impl AsRef<Path>) -> Result<CatalogHandle> {
        self.acquire(path.as_ref(), true)
    }

    fn acquire(&self, path: &Path, read_only: bool) -> Result<CatalogHandle> {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            if !entry.catalog.is_closed() {
                entry.refs += 1;
                return Ok(CatalogHandle {
                    catalog: entry.catalog.clone(),
                    cache: self.clone(),
                });
            }
            entries.remove(path);
        }

        if read_only && !is_catalog(path) {
            return Err(Error::BadRequest(format!(
                "{} is not a catalog",
                path.display()
            )));
        }
        let catalog = Arc::new(Catalog::open(path, &self.inner.options)?);
        entries.insert(
            path.to_path_buf(),
            Entry {
                catalog: catalog.clone(),
                refs: 1,
                generation: 0,
            },
        );
        debug!(path = %path.display(), "catalog cached");
        Ok(CatalogHandle {
            catalog,
            cache: self.clone(),
        })
    }

    fn release(&self, catalog: &Arc<Catalog>) {
        let path = catalog.path().to_path_buf();
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(&path) else {
            return;
        };
        if !Arc::ptr_eq(&entry.catalog, catalog) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        entry.generation += 1;
        let generation = entry.generation;

        let timeout = self.inner.options.drop_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) if !timeout.is_zero() => {
                let cache = self.clone();
                rt.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    cache.expire(&path, generation);
                });
            }
            _ => {
                if let Some(entry) = entries.remove(&path) {
                    entry.catalog.close();
                }
            }
        }
    }

    fn expire(&self, path: &Path, generation: u64) {
        let mut entries = self.inner.entries.lock();
        let stale = matches!(entries.get(path), Some(e) if e.refs == 0 && e.generation == generation);
        if stale {
            if let Some(entry) = entries.remove(path) {
                entry.catalog.close();
                debug!(path = %path.display(), "catalog dropped from cache");
            }
        }
    }

    /// Forget every cached catalog under `prefix` (the catalog itself if it
    /// is a file path). Open handles keep working until released.
    pub fn drop_prefix(&self, prefix: &Path) {
        let mut entries = self.inner.entries.lock();
        entries.retain(|path, entry| {
            if path.starts_with(prefix) {
                if entry.refs == 0 {
                    entry.catalog.close();
                }
                false
            } else {
                true
            }
        });
    }

    /// Paths currently cached.
    pub fn cached(&self) -> Vec<PathBuf> {
        let mut out: Vec<_> = self.inner.entries.lock().keys().cloned().collect();
        out.sort();
        out
    }
}

impl CatalogHandle {
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
}

impl Deref for CatalogHandle {
    type Target = Catalog;

    fn deref(&self) -> &Catalog {
        &self.catalog
    }
}

impl std::fmt::Debug for CatalogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogHandle").finish_non_exhaustive()
    }
}

impl Drop for CatalogHandle {
    fn drop(&mut self) {
        self.cache.release(&self.catalog);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache(timeout: Duration) -> CatalogCache {
        CatalogCache::new(CatalogOptions {
            drop_timeout: timeout,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn reopen_within_timeout_reuses_catalog() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cat.db");
        let cache = cache(Duration::from_millis(200));

        let first = cache.open(&path).unwrap();
        let ptr = first.catalog().clone();
        drop(first);

        let again = cache.open(&path).unwrap();
        assert!(Arc::ptr_eq(again.catalog(), &ptr));
        drop(again);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(cache.cached().is_empty());
        assert!(ptr.is_closed());

        let fresh = cache.open(&path).unwrap();
        assert!(!Arc::ptr_eq(fresh.catalog(), &ptr));
    }

    #[tokio::test]
    async fn held_handle_is_never_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cat.db");
        let cache = cache(Duration::from_millis(20));

        let a = cache.open(&path).unwrap();
        let b = cache.open(&path).unwrap();
        drop(b);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!a.is_closed());
        assert_eq!(cache.cached(), vec![path]);
    }

    #[test]
    fn read_only_requires_existing_catalog() {
        let dir = TempDir::new().unwrap();
        let cache = cache(Duration::ZERO);
        let err = cache.open_read_only(dir.path().join("none.db")).unwrap_err();
        assert!(err.to_string().contains("not a catalog"));

        drop(cache.open(dir.path().join("real.db")).unwrap());
        assert!(cache.cached().is_empty(), "zero timeout closes immediately");
        assert!(cache.open_read_only(dir.path().join("real.db")).is_ok());
    }
}
