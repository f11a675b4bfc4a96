//! Catalogs: many small virtual files packed into a few large data files.
//!
//! A catalog is a SQLite database at a user-visible path plus a hidden data
//! directory `.<name>.catalog/` next to it. The database maps file parts
//! (`name`, offset, length) to positions inside data files. Data files are
//! concatenations of parts separated by a fixed per-file delimiter.
//!
//! All operations serialize on a per-catalog mutex; writes additionally run
//! in exclusive transactions so several processes can share a catalog.

mod cache;
mod data;
mod index;
mod parts;
mod view;

pub use cache::{CatalogCache, CatalogHandle};
pub use index::{unwind_all, IndexFile, IndexItem};
pub use parts::{FilePartSlot, PartInfo};
pub use view::FileView;

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SCHEME_VERSION: i32 = 1;

const SCHEME_V1: &str = r#"
CREATE TABLE IF NOT EXISTS data (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    file STRING UNIQUE NOT NULL,  -- relative to the catalog directory
    len INTEGER DEFAULT (0),      -- accounted length, next part position
    opt INTEGER DEFAULT (0),      -- 1 for imported search results (never packed into)
    s_w INTEGER DEFAULT (0),      -- surrounding width
    delim BLOB                    -- set once
);
CREATE TABLE IF NOT EXISTS parts (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    name STRING NOT NULL,
    pos INTEGER NOT NULL,
    len INTEGER NOT NULL,
    opt INTEGER DEFAULT (0),      -- fuzziness << 24 for imported results
    d_id INTEGER NOT NULL REFERENCES data (id) ON DELETE CASCADE,
    d_pos INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS parts_name ON parts (name);

CREATE TRIGGER IF NOT EXISTS part_insert
    AFTER INSERT ON parts
    FOR EACH ROW WHEN (0 < NEW.len)
BEGIN
    UPDATE data SET
        len = len + NEW.len + ifnull(length(data.delim),0)
    WHERE data.id = NEW.d_id;
END;
CREATE TRIGGER IF NOT EXISTS part_update
    BEFORE UPDATE ON parts
    FOR EACH ROW WHEN (OLD.len <= 0) AND (0 < NEW.len)
BEGIN
    UPDATE data SET
        len = len + NEW.len + ifnull(length(data.delim),0)
    WHERE data.id = NEW.d_id;
END;

PRAGMA user_version = 1;
"#;

/// Options applied to every catalog opened through a cache.
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Data file size limit in bytes, 0 disables the limit.
    pub data_size_limit: u64,
    pub default_delimiter: String,
    pub drop_timeout: Duration,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            data_size_limit: 64 * 1024 * 1024,
            default_delimiter: "\n\u{c}\n".to_string(),
            drop_timeout: Duration::from_secs(10),
        }
    }
}

/// An open catalog.
pub struct Catalog {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    data_size_limit: u64,
    default_delimiter: String,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").field("path", &self.path).finish()
    }
}

impl Catalog {
    /// Open (creating if needed) a catalog without the cache.
    pub fn open(path: impl AsRef<Path>, options: &CatalogOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let cat = Self {
            path,
            conn: Mutex::new(Some(conn)),
            data_size_limit: options.data_size_limit,
            default_delimiter: options.default_delimiter.clone(),
        };
        cat.update_scheme()?;
        debug!(path = %cat.path.display(), "open catalog");
        Ok(cat)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_size_limit(&self) -> u64 {
        self.data_size_limit
    }

    /// Run `f` with the connection under the catalog lock.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("catalog {} is closed", self.path.display())))?;
        f(conn)
    }

    fn update_scheme(&self) -> Result<()> {
        self.with_conn(|conn| {
            let version: i32 = conn.query_row("PRAGMA user_version;", [], |r| r.get(0))?;
            if version >= SCHEME_VERSION {
                return Ok(());
            }
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            tx.execute_batch(SCHEME_V1)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Close the underlying database. Later operations fail.
    pub fn close(&self) {
        if self.conn.lock().take().is_some() {
            debug!(path = %self.path.display(), "close catalog");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Remove all parts and data rows. Data files are left on disk.
    pub fn clear_all(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("DELETE FROM parts; DELETE FROM data;")?;
            Ok(())
        })
    }
}

/// Check whether `path` is a catalog database (has a `parts` table).
pub fn is_catalog(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        _ => return false,
    }
    let Ok(conn) = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) else {
        return false;
    };
    conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='parts'",
        [],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .unwrap_or(false)
}

/// Hidden data directory of the catalog at `path`.
pub fn data_dir_of(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.catalog", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_scheme_and_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/foo.txt");
        let cat = Catalog::open(&path, &CatalogOptions::default()).unwrap();
        assert!(is_catalog(&path));
        assert_eq!(data_dir_of(&path), dir.path().join("sub/.foo.txt.catalog"));
        cat.close();
        assert!(cat.is_closed());
        assert!(cat.get_total_data_size().is_err());
    }

    #[test]
    fn regular_file_is_not_a_catalog() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert!(!is_catalog(&path));
        assert!(!is_catalog(dir.path().join("missing.db")));
    }
}
