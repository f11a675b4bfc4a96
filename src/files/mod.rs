//! Filesystem helpers shared by the API, engines and the job worker.
//!
//! Every user path is resolved under `<mount>/<home>` and checked so that
//! after normalization it does not escape that root.

mod share;
mod writer;

pub use share::{lock_name, SafeGuard, SafeLocks, ShareMode, MAX_WAIT_TIMEOUT};
pub use writer::{
    create_file, update_catalog, CatalogUpload, FileUpload, FileWriter, FileWriters, Written,
};

use crate::catalog::{data_dir_of, is_catalog, Catalog, CatalogCache, CatalogOptions};
use crate::search::DirInfo;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Lexically normalize a path: drop `.` and resolve `..` without touching
/// the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Check that `path` normalizes to `home` or something below it.
pub fn is_relative_to_home(home: &Path, path: &Path) -> bool {
    clean_path(path).starts_with(clean_path(home))
}

/// Resolve a user path under `home`, rejecting escapes.
pub fn check_relative_to_home(home: &Path, path: &str) -> Result<PathBuf> {
    let full = clean_path(&home.join(path.trim_start_matches('/')));
    if !is_relative_to_home(home, &full) {
        return Err(Error::BadRequest(format!(
            "path {:?} is not relative to home",
            path
        )));
    }
    Ok(full)
}

/// Replace every `{{random}}` with a hex unix-nano token.
pub fn randomize_path(path: &str) -> String {
    if !path.contains("{{random}}") {
        return path.to_string();
    }
    let mut out = String::with_capacity(path.len() + 16);
    let mut rest = path;
    while let Some(pos) = rest.find("{{random}}") {
        out.push_str(&rest[..pos]);
        let token = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        out.push_str(&format!("{:016x}", token));
        rest = &rest[pos + "{{random}}".len()..];
    }
    out.push_str(rest);
    out
}

/// List `dir` (relative to `home`). Hidden entries start with a dot.
///
/// A catalog is listed as a directory of its virtual files.
pub async fn list_dir(home: &Path, dir: &str, hidden: bool) -> Result<DirInfo> {
    let full = check_relative_to_home(home, dir)?;
    if tokio::fs::metadata(&full).await.is_ok_and(|m| m.is_file()) {
        return list_catalog(full, dir).await;
    }
    let mut rd = tokio::fs::read_dir(&full).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("failed to read directory content: {e}"))
        } else {
            Error::Io(e)
        }
    })?;

    let shown = if dir.is_empty() { "/" } else { dir };
    let mut info = DirInfo::new(shown);
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !hidden && name.starts_with('.') {
            continue;
        }
        let ft = entry.file_type().await?;
        if ft.is_dir() {
            info.dirs.push(name);
        } else if is_catalog(entry.path()) {
            info.catalogs.push(name);
        } else {
            info.files.push(name);
        }
    }
    info.normalize();
    Ok(info)
}

async fn list_catalog(full: PathBuf, dir: &str) -> Result<DirInfo> {
    let mut info = DirInfo::new(dir);
    let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        if !is_catalog(&full) {
            return Err(Error::BadRequest(format!("{} is not a catalog", full.display())));
        }
        let cat = Catalog::open(&full, &CatalogOptions::default())?;
        let parts = cat.get_all_parts();
        cat.close();
        Ok(parts?.into_keys().collect())
    })
    .await
    .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))??;
    info.files = names;
    info.normalize();
    Ok(info)
}

/// Remove one path: a catalog (with its data directory), a directory tree
/// or a file.
async fn remove_path(path: &Path, cache: Option<&CatalogCache>) -> Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
        if let Some(cache) = cache {
            cache.drop_prefix(path);
        }
        return Ok(());
    }
    if is_catalog(path) {
        if let Some(cache) = cache {
            cache.drop_prefix(path);
        }
        let data_dir = data_dir_of(path);
        if tokio::fs::metadata(&data_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&data_dir).await?;
        }
    }
    tokio::fs::remove_file(path).await?;
    Ok(())
}

/// Glob-expand `items` under `root` and delete every match.
///
/// Returns a map from each matched path (relative to `root`) to `"OK"` or
/// an error message. A pattern that matches nothing reports nothing.
pub async fn delete_all(
    root: &Path,
    items: &[String],
    cache: Option<&CatalogCache>,
) -> BTreeMap<String, String> {
    let mut res = BTreeMap::new();
    for item in items {
        let full = match check_relative_to_home(root, item) {
            Ok(p) => p,
            Err(e) => {
                res.insert(item.clone(), e.to_string());
                continue;
            }
        };
        let pattern = full.to_string_lossy().into_owned();
        let matches = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                res.insert(item.clone(), Error::from(e).to_string());
                continue;
            }
        };
        for entry in matches {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "glob entry failed");
                    continue;
                }
            };
            let rel = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path.to_string_lossy().into_owned());
            let status = match remove_path(&path, cache).await {
                Ok(()) => "OK".to_string(),
                Err(e) if e.is_not_found() => continue,
                Err(e) => e.to_string(),
            };
            debug!(path = %path.display(), status = %status, "delete");
            res.insert(rel, status);
        }
    }
    res
}

/// Rename a standalone file; the extension must not change.
pub async fn rename_file(home: &Path, old: &str, new: &str) -> Result<()> {
    if Path::new(old).extension() != Path::new(new).extension() {
        return Err(Error::BadRequest(
            "changing the file extention is not allowed".to_string(),
        ));
    }
    let from = check_relative_to_home(home, old)?;
    let to = check_relative_to_home(home, new)?;
    let meta = tokio::fs::metadata(&from).await.map_err(not_found(old))?;
    if meta.is_dir() {
        return Err(Error::BadRequest(format!("{:?} is not a file", old)));
    }
    move_path(&from, &to, new).await
}

/// Rename a directory.
pub async fn rename_dir(home: &Path, old: &str, new: &str, cache: Option<&CatalogCache>) -> Result<()> {
    let from = check_relative_to_home(home, old)?;
    let to = check_relative_to_home(home, new)?;
    let meta = tokio::fs::metadata(&from).await.map_err(not_found(old))?;
    if !meta.is_dir() {
        return Err(Error::BadRequest(format!("{:?} is not a directory", old)));
    }
    move_path(&from, &to, new).await?;
    if let Some(cache) = cache {
        cache.drop_prefix(&from);
    }
    Ok(())
}

async fn move_path(from: &Path, to: &Path, new: &str) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if tokio::fs::metadata(to).await.is_ok() {
        return Err(Error::Conflict(format!("{:?} already exists", new)));
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(from, to).await?;
    Ok(())
}

fn not_found(name: &str) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("{:?} not found", name))
        } else {
            Error::Io(e)
        }
    }
}
