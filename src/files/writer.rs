//! Writing uploaded content: standalone files and catalog parts.

use super::{lock_name, randomize_path, SafeLocks, ShareMode};
use crate::catalog::CatalogCache;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

#[derive(Debug)]
struct WriterState {
    refs: usize,
    /// Known file length, `None` until first append.
    length: Arc<Mutex<Option<u64>>>,
}

/// Process-wide map of files being appended to.
#[derive(Debug, Clone, Default)]
pub struct FileWriters {
    inner: Arc<DashMap<PathBuf, WriterState>>,
}

/// Reservation on a file in [`FileWriters`]; released on drop.
#[derive(Debug)]
pub struct FileWriter {
    writers: FileWriters,
    path: PathBuf,
    length: Arc<Mutex<Option<u64>>>,
}

impl FileWriters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, path: &Path) -> FileWriter {
        let mut state = self
            .inner
            .entry(path.to_path_buf())
            .or_insert_with(|| WriterState {
                refs: 0,
                length: Arc::new(Mutex::new(None)),
            });
        state.refs += 1;
        FileWriter {
            writers: self.clone(),
            path: path.to_path_buf(),
            length: state.length.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.len()
    }

    fn release(&self, path: &Path) {
        if let Some(mut state) = self.inner.get_mut(path) {
            state.refs = state.refs.saturating_sub(1);
        }
        self.inner.remove_if(path, |_, state| state.refs == 0);
    }
}

impl FileWriter {
    /// Reserve `length` bytes at the end of the file; returns their offset.
    pub fn append(&self, length: u64) -> Result<u64> {
        let mut known = self.length.lock();
        let current = match *known {
            Some(n) => n,
            None => match std::fs::metadata(&self.path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            },
        };
        *known = Some(current + length);
        Ok(current)
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.writers.release(&self.path);
    }
}

/// Upload target for a standalone file.
#[derive(Debug, Clone, Default)]
pub struct FileUpload {
    /// Path relative to home, may contain `{{random}}`.
    pub file: String,
    /// Write position; `None` appends.
    pub offset: Option<u64>,
    pub share_mode: ShareMode,
}

/// Outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    /// Path relative to home (randomized and de-duplicated).
    pub path: String,
    pub offset: u64,
    pub length: u64,
}

/// Write `content` into a standalone file under `home`.
///
/// Names generated from `{{random}}` never overwrite an existing file: a
/// `-N` suffix is added before the extension instead.
pub async fn create_file(
    home: &Path,
    upload: &FileUpload,
    content: &[u8],
    writers: &FileWriters,
    locks: &SafeLocks,
) -> Result<Written> {
    let base = randomize_path(&upload.file);
    let randomized = base != upload.file;
    let mut rel = base.clone();

    let full = home.join(&rel);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut k = 0;
    let (mut out, full) = loop {
        let full = home.join(&rel);
        let mut opts = OpenOptions::new();
        opts.write(true);
        if randomized {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
        match opts.open(&full).await {
            Ok(f) => break (f, full),
            Err(e) if randomized && e.kind() == std::io::ErrorKind::AlreadyExists => {
                k += 1;
                rel = with_suffix(&base, k);
            }
            Err(e) => return Err(e.into()),
        }
    };

    let _guard = locks.lock_write(&lock_name(&full), upload.share_mode).await?;

    let writer = writers.acquire(&full);
    let offset = match upload.offset {
        Some(off) => off,
        None => writer.append(content.len() as u64)?,
    };
    out.seek(SeekFrom::Start(offset)).await?;
    out.write_all(content).await?;
    out.flush().await?;

    debug!(path = %full.display(), offset, length = content.len(), "file written");
    Ok(Written {
        path: rel,
        offset,
        length: content.len() as u64,
    })
}

fn with_suffix(base: &str, k: usize) -> String {
    let path = Path::new(base);
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy();
            let stem = base.strip_suffix(&format!(".{}", ext)).unwrap_or(base);
            format!("{}-{}.{}", stem, k, ext)
        }
        None => format!("{}-{}", base, k),
    }
}

/// Upload target for a file inside a catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogUpload {
    /// Catalog path relative to home, may contain `{{random}}`.
    pub catalog: String,
    /// Virtual file name, may contain `{{random}}`.
    pub file: String,
    pub offset: Option<u64>,
    pub delimiter: Option<String>,
    pub share_mode: ShareMode,
}

/// Append `content` as a part of a catalog file; data and delimiter are
/// written with a single write at the reserved position.
pub async fn update_catalog(
    home: &Path,
    upload: &CatalogUpload,
    content: &[u8],
    cache: &CatalogCache,
    locks: &SafeLocks,
) -> Result<Written> {
    let catalog_rel = randomize_path(&upload.catalog);
    let file_name = randomize_path(&upload.file);
    let catalog_path = home.join(&catalog_rel);
    // searches lock the catalog itself, the data file guards the bytes
    let _catalog_guard = locks
        .lock_write(&lock_name(&catalog_path), upload.share_mode)
        .await?;

    let slot = {
        let cat = cache.open(&catalog_path)?;
        let offset = upload.offset.map(|o| o as i64).unwrap_or(-1);
        let length = content.len() as u64;
        let delim = upload.delimiter.clone();
        // sqlite work is blocking
        tokio::task::spawn_blocking(move || {
            cat.add_file_part(&file_name, offset, length, delim.as_deref())
        })
        .await
        .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))??
    };

    let _data_guard = locks
        .lock_write(&lock_name(&slot.data_path), upload.share_mode)
        .await?;

    let mut data = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&slot.data_path)
        .await
        .map_err(|e| Error::Internal(format!("failed to open data file: {e}")))?;
    data.seek(SeekFrom::Start(slot.data_pos)).await?;
    let mut buf = Vec::with_capacity(content.len() + slot.delimiter.len());
    buf.extend_from_slice(content);
    buf.extend_from_slice(slot.delimiter.as_bytes());
    data.write_all(&buf).await?;
    data.flush().await?;

    debug!(
        catalog = %catalog_path.display(),
        data = %slot.data_path.display(),
        pos = slot.data_pos,
        "catalog part written"
    );
    Ok(Written {
        path: catalog_rel,
        offset: slot.offset,
        length: content.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogOptions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_reserve_disjoint_ranges() {
        let dir = TempDir::new().unwrap();
        let writers = FileWriters::new();
        let locks = SafeLocks::new();
        let upload = FileUpload {
            file: "logs/a.txt".into(),
            ..Default::default()
        };

        let first = create_file(dir.path(), &upload, b"hello ", &writers, &locks)
            .await
            .unwrap();
        let second = create_file(dir.path(), &upload, b"world", &writers, &locks)
            .await
            .unwrap();
        assert_eq!((first.offset, second.offset), (0, 6));
        let body = std::fs::read(dir.path().join("logs/a.txt")).unwrap();
        assert_eq!(body, b"hello world");
        assert_eq!(writers.active(), 0);
    }

    #[tokio::test]
    async fn upload_to_a_file_being_searched_is_busy() {
        let dir = TempDir::new().unwrap();
        let writers = FileWriters::new();
        let locks = SafeLocks::new();
        let _search = locks
            .lock_read(&lock_name(&dir.path().join("a.txt")), ShareMode::NoWait)
            .await
            .unwrap();

        let upload = FileUpload {
            file: "a.txt".into(),
            ..Default::default()
        };
        let err = create_file(dir.path(), &upload, b"x", &writers, &locks)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);

        let cache = CatalogCache::new(CatalogOptions::default());
        let _cat_search = locks
            .lock_read(&lock_name(&dir.path().join("cat.db")), ShareMode::NoWait)
            .await
            .unwrap();
        let part = CatalogUpload {
            catalog: "cat.db".into(),
            file: "one.txt".into(),
            ..Default::default()
        };
        let err = update_catalog(dir.path(), &part, b"abc", &cache, &locks)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn suffix_goes_before_extension() {
        assert_eq!(with_suffix("dir/x.txt", 2), "dir/x-2.txt");
        assert_eq!(with_suffix("noext", 1), "noext-1");
    }

    #[tokio::test]
    async fn catalog_upload_writes_data_and_delimiter() {
        let dir = TempDir::new().unwrap();
        let cache = CatalogCache::new(CatalogOptions::default());
        let locks = SafeLocks::new();
        let upload = CatalogUpload {
            catalog: "cat.db".into(),
            file: "one.txt".into(),
            delimiter: Some("\n".into()),
            ..Default::default()
        };
        let w = update_catalog(dir.path(), &upload, b"abc", &cache, &locks)
            .await
            .unwrap();
        assert_eq!((w.path.as_str(), w.offset, w.length), ("cat.db", 0, 3));

        let cat = cache.open(dir.path().join("cat.db")).unwrap();
        let files = cat.get_data_files(None, true).unwrap();
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"abc\n");
    }
}
