//! Data files: lookup, size accounting and catalog relocation.

use super::{data_dir_of, Catalog};
use crate::{Error, Result};
use regex::Regex;
use rusqlite::{params, TransactionBehavior};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

impl Catalog {
    /// Directory that data file paths are relative to.
    pub(crate) fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub(crate) fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Hidden directory holding this catalog's data files.
    pub fn data_dir(&self) -> PathBuf {
        data_dir_of(&self.path)
    }

    /// Absolute paths of data files that hold at least one part.
    ///
    /// `filter` keeps only data files with a part whose name matches the
    /// expression. With `require_newline` every data delimiter must contain
    /// `\r` or `\n`.
    pub fn get_data_files(&self, filter: Option<&str>, require_newline: bool) -> Result<Vec<PathBuf>> {
        let filter = filter
            .filter(|f| !f.is_empty())
            .map(Regex::new)
            .transpose()?;
        let base_dir = self.base_dir();

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.file, d.delim, p.name FROM data AS d
                 JOIN parts AS p ON p.d_id = d.id
                 ORDER BY d.id, p.d_pos",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<Vec<u8>>>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?;

            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for row in rows {
                let (file, delim, name) = row?;
                if seen.contains(&file) {
                    continue;
                }
                if let Some(re) = &filter {
                    if !re.is_match(&name) {
                        continue;
                    }
                }
                if require_newline {
                    let delim = delim.unwrap_or_default();
                    if !delim.iter().any(|b| *b == b'\n' || *b == b'\r') {
                        return Err(Error::BadRequest(
                            "data delimiter doesn't contain new line".to_string(),
                        ));
                    }
                }
                out.push(base_dir.join(&file));
                seen.insert(file);
            }
            Ok(out)
        })
    }

    /// Sum of accounted data file lengths (parts plus delimiters).
    pub fn get_total_data_size(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let total: i64 =
                conn.query_row("SELECT ifnull(SUM(len), 0) FROM data", [], |r| r.get(0))?;
            Ok(total.max(0) as u64)
        })
    }

    /// Move the catalog and its data directory to `new_path` and close it.
    ///
    /// Data file references are rewritten and committed before anything is
    /// moved on disk. If a move fails the files are put back and the
    /// references restored, so the catalog stays usable where it was.
    pub fn rename_and_close(&self, new_path: &Path) -> Result<()> {
        if new_path.exists() {
            return Err(Error::Conflict(format!(
                "{} already exists",
                new_path.display()
            )));
        }
        let old_dir = self.data_dir();
        let new_dir = data_dir_of(new_path);
        let old_prefix = format!(".{}.catalog/", self.file_name());
        let new_prefix = format!(
            ".{}.catalog/",
            new_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let new_base = new_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let same_parent = new_base == self.base_dir();

        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("catalog {} is closed", self.path.display())))?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let files: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, file FROM data")?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        // (id, previous file) for every rewritten reference
        let mut changed = Vec::new();
        for (id, file) in files {
            let moved = match file.strip_prefix(&old_prefix) {
                Some(rest) => format!("{}{}", new_prefix, rest),
                // data stored elsewhere keeps its absolute location
                None if !same_parent && Path::new(&file).is_relative() => {
                    self.base_dir().join(&file).to_string_lossy().into_owned()
                }
                None => continue,
            };
            tx.execute(
                "UPDATE data SET file = ?1 WHERE id = ?2",
                params![moved, id],
            )?;
            changed.push((id, file));
        }
        tx.commit()?;

        let moved = (|| -> std::io::Result<()> {
            if let Some(parent) = new_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&self.path, new_path)?;
            if old_dir.exists() {
                if let Err(e) = std::fs::rename(&old_dir, &new_dir) {
                    std::fs::rename(new_path, &self.path)?;
                    return Err(e);
                }
            }
            Ok(())
        })();

        if let Err(e) = moved {
            warn!(error = %e, catalog = %self.path.display(), "failed to move catalog, restoring");
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            for (id, file) in &changed {
                tx.execute("UPDATE data SET file = ?1 WHERE id = ?2", params![file, id])?;
            }
            tx.commit()?;
            return Err(e.into());
        }

        guard.take();
        debug!(from = %self.path.display(), to = %new_path.display(), "catalog moved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::CatalogOptions;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn data_files_filtered_by_part_name() {
        let dir = TempDir::new().unwrap();
        let opts = CatalogOptions {
            data_size_limit: 10,
            default_delimiter: "\n".into(),
            ..Default::default()
        };
        let cat = Catalog::open(dir.path().join("cat.db"), &opts).unwrap();
        cat.add_file_part("a.txt", -1, 5, None).unwrap();
        cat.add_file_part("b.bin", -1, 8, None).unwrap();

        assert_eq!(cat.get_data_files(None, true).unwrap().len(), 2);
        let only_txt = cat.get_data_files(Some(r"\.txt$"), false).unwrap();
        assert_eq!(only_txt.len(), 1);
        assert!(only_txt[0].starts_with(cat.data_dir()));
    }

    #[test]
    fn newline_delimiter_is_required_when_asked() {
        let dir = TempDir::new().unwrap();
        let cat = Catalog::open(dir.path().join("cat.db"), &CatalogOptions::default()).unwrap();
        cat.add_file_part("a", -1, 5, Some("|")).unwrap();
        assert!(cat.get_data_files(None, false).is_ok());
        let err = cat.get_data_files(None, true).unwrap_err();
        assert!(err.to_string().contains("new line"));
    }

    #[test]
    fn rename_moves_database_and_data_dir() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.db");
        let new = dir.path().join("moved/new.db");
        let cat = Catalog::open(&old, &CatalogOptions::default()).unwrap();
        let slot = cat.add_file_part("a", -1, 3, None).unwrap();
        std::fs::write(&slot.data_path, b"abc").unwrap();

        cat.rename_and_close(&new).unwrap();
        assert!(cat.is_closed());
        assert!(!old.exists());
        assert!(data_dir_of(&new).exists());

        let moved = Catalog::open(&new, &CatalogOptions::default()).unwrap();
        let mut buf = Vec::new();
        use std::io::Read;
        moved.get_file("a").unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn failed_move_keeps_catalog_in_place() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.db");
        let new = dir.path().join("new.db");
        let cat = Catalog::open(&old, &CatalogOptions::default()).unwrap();
        let slot = cat.add_file_part("a", -1, 3, None).unwrap();
        std::fs::write(&slot.data_path, b"abc").unwrap();

        // a non-empty directory in the way makes the data move fail
        std::fs::create_dir_all(data_dir_of(&new)).unwrap();
        std::fs::write(data_dir_of(&new).join("other"), b"x").unwrap();

        assert!(cat.rename_and_close(&new).is_err());
        assert!(!cat.is_closed());
        assert!(old.exists());
        assert!(!new.exists());

        let mut buf = Vec::new();
        use std::io::Read;
        cat.get_file("a").unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abc");
        assert!(cat.get_data_files(None, false).unwrap()[0].starts_with(cat.data_dir()));
    }
}
