//! File parts: registering, listing and renaming.

use super::{Catalog, FileView};
use crate::{Error, Result};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Where a new file part has to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePartSlot {
    /// Absolute path of the data file.
    pub data_path: PathBuf,
    /// Write position inside the data file.
    pub data_pos: u64,
    /// Delimiter to write after the part, empty if the part already exists.
    pub delimiter: String,
    /// Effective part offset (resolved when the offset was automatic).
    pub offset: u64,
}

/// Summary of one file stored in a catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartInfo {
    /// Virtual file size, i.e. the end of the last part.
    pub length: u64,
    pub parts: u64,
}

/// One part as stored in the `parts` table.
#[derive(Debug, Clone)]
pub(crate) struct PartRow {
    pub offset: u64,
    pub length: u64,
    pub data_file: PathBuf,
    pub data_pos: u64,
}

impl Catalog {
    /// Register a part `[offset, offset+length)` of file `name`.
    ///
    /// A negative `offset` appends to the end of the file. If the new range
    /// lies inside an existing part the existing slot is returned and nothing
    /// is registered; any other overlap is a conflict.
    pub fn add_file_part(
        &self,
        name: &str,
        offset: i64,
        length: u64,
        delimiter: Option<&str>,
    ) -> Result<FilePartSlot> {
        let limit = match self.data_size_limit {
            0 => i64::MAX,
            n => n as i64,
        };
        let default_delim = self.default_delimiter.clone();
        let base_dir = self.base_dir();
        let cat_name = self.file_name();

        let slot = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

            if offset >= 0 {
                let beg = offset;
                let end = offset + length as i64;
                let existing = tx
                    .query_row(
                        "SELECT p.pos, p.len, p.d_pos, d.file FROM parts AS p
                         JOIN data AS d ON p.d_id = d.id
                         WHERE p.name IS ?1 AND p.pos < ?3 AND ?2 < p.pos + p.len
                         ORDER BY p.pos LIMIT 1",
                        params![name, beg, end.max(beg + 1)],
                        |r| {
                            Ok((
                                r.get::<_, i64>(0)?,
                                r.get::<_, i64>(1)?,
                                r.get::<_, i64>(2)?,
                                r.get::<_, String>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                if let Some((p_pos, p_len, d_pos, d_file)) = existing {
                    let p_end = p_pos + p_len;
                    if p_pos <= beg && end <= p_end {
                        return Ok(FilePartSlot {
                            data_path: base_dir.join(d_file),
                            data_pos: (d_pos + (beg - p_pos)) as u64,
                            delimiter: String::new(),
                            offset: beg as u64,
                        });
                    }
                    return Err(Error::Conflict(format!(
                        "part will override existing part [{}..{})",
                        p_pos, p_end
                    )));
                }
            }

            let wanted = delimiter.map(str::as_bytes);
            let found = tx
                .query_row(
                    "SELECT id, file, len, delim FROM data
                     WHERE opt = 0 AND len + ?1 + ifnull(length(delim),0) <= ?2
                     ORDER BY id LIMIT 1",
                    params![length as i64, limit],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, i64>(2)?,
                            r.get::<_, Option<Vec<u8>>>(3)?,
                        ))
                    },
                )
                .optional()?;

            let (d_id, d_file, d_pos, delim) = match found {
                Some((id, file, len, old)) => {
                    let delim = match (old, wanted) {
                        (Some(old), Some(new)) if old != new => {
                            return Err(Error::Conflict(format!(
                                "delimiter cannot be changed (old:#{}, new:#{})",
                                hex(&old),
                                hex(new)
                            )));
                        }
                        (Some(old), _) => old,
                        (None, Some(new)) => {
                            tx.execute(
                                "UPDATE data SET delim = ?1 WHERE id = ?2",
                                params![new, id],
                            )?;
                            new.to_vec()
                        }
                        (None, None) => Vec::new(),
                    };
                    (id, file, len, delim)
                }
                None => {
                    let delim = wanted.unwrap_or(default_delim.as_bytes()).to_vec();
                    let file = new_data_file_name(&tx, &cat_name)?;
                    tx.execute(
                        "INSERT INTO data (file, len, delim) VALUES (?1, 0, ?2)",
                        params![file, delim],
                    )?;
                    (tx.last_insert_rowid(), file, 0, delim)
                }
            };

            let offset = if offset < 0 {
                tx.query_row(
                    "SELECT ifnull(SUM(len), 0) FROM parts WHERE name IS ?1",
                    params![name],
                    |r| r.get::<_, i64>(0),
                )?
            } else {
                offset
            };

            tx.execute(
                "INSERT INTO parts (name, pos, len, d_id, d_pos) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, offset, length as i64, d_id, d_pos],
            )?;
            tx.commit()?;

            Ok(FilePartSlot {
                data_path: base_dir.join(d_file),
                data_pos: d_pos as u64,
                delimiter: String::from_utf8_lossy(&delim).into_owned(),
                offset: offset as u64,
            })
        })?;

        if let Some(parent) = slot.data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(
            catalog = %self.path.display(),
            file = name,
            offset = slot.offset,
            length,
            data = %slot.data_path.display(),
            data_pos = slot.data_pos,
            "add file part"
        );
        Ok(slot)
    }

    /// All files stored in the catalog with their sizes.
    pub fn get_all_parts(&self) -> Result<BTreeMap<String, PartInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, MAX(pos + len), COUNT(*) FROM parts GROUP BY name ORDER BY name",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    PartInfo {
                        length: r.get::<_, i64>(1)?.max(0) as u64,
                        parts: r.get::<_, i64>(2)? as u64,
                    },
                ))
            })?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (name, info) = row?;
                out.insert(name, info);
            }
            Ok(out)
        })
    }

    pub(crate) fn get_parts(&self, name: &str) -> Result<Vec<PartRow>> {
        let base_dir = self.base_dir();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.pos, p.len, d.file, p.d_pos FROM parts AS p
                 JOIN data AS d ON p.d_id = d.id
                 WHERE p.name IS ?1 AND p.len > 0
                 ORDER BY p.pos",
            )?;
            let rows = stmt.query_map(params![name], |r| {
                Ok(PartRow {
                    offset: r.get::<_, i64>(0)? as u64,
                    length: r.get::<_, i64>(1)? as u64,
                    data_file: base_dir.join(r.get::<_, String>(2)?),
                    data_pos: r.get::<_, i64>(3)? as u64,
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
    }

    /// Read-only view of a virtual file. Fails if the file has no parts.
    pub fn get_file(&self, name: &str) -> Result<FileView> {
        let parts = self.get_parts(name)?;
        if parts.is_empty() {
            return Err(Error::NotFound(format!(
                "file {:?} not found in catalog",
                name
            )));
        }
        Ok(FileView::new(parts))
    }

    /// Rename every part of `old` to `new`. A trailing `/` renames a
    /// directory prefix. Returns the number of renamed parts.
    pub fn rename_file_parts(&self, old: &str, new: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            let changed = if old.ends_with('/') {
                let pattern = format!("{}%", escape_like(old));
                let clash: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM parts WHERE name LIKE ?1 ESCAPE '\\'",
                    params![format!("{}%", escape_like(new))],
                    |r| r.get(0),
                )?;
                if clash > 0 {
                    return Err(Error::Conflict(format!("{:?} already exists", new)));
                }
                tx.execute(
                    "UPDATE parts SET name = ?2 || substr(name, ?3)
                     WHERE name LIKE ?1 ESCAPE '\\'",
                    params![pattern, new, old.chars().count() as i64 + 1],
                )?
            } else {
                let clash: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM parts WHERE name IS ?1",
                    params![new],
                    |r| r.get(0),
                )?;
                if clash > 0 {
                    return Err(Error::Conflict(format!("{:?} already exists", new)));
                }
                tx.execute(
                    "UPDATE parts SET name = ?2 WHERE name IS ?1",
                    params![old, new],
                )?
            };
            if changed == 0 {
                return Err(Error::NotFound(format!("{:?} not found in catalog", old)));
            }
            tx.commit()?;
            Ok(changed)
        })
    }
}

fn new_data_file_name(tx: &rusqlite::Transaction<'_>, cat_name: &str) -> Result<String> {
    let mut stamp = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default() as u64;
    loop {
        let file = format!(".{}.catalog/.data-{:016x}.{}", cat_name, stamp, cat_name);
        let taken: i64 = tx.query_row(
            "SELECT COUNT(*) FROM data WHERE file = ?1",
            params![file],
            |r| r.get(0),
        )?;
        if taken == 0 {
            return Ok(file);
        }
        stamp += 1;
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::super::CatalogOptions;
    use super::*;
    use tempfile::TempDir;

    fn small_catalog(dir: &TempDir, limit: u64) -> Catalog {
        let opts = CatalogOptions {
            data_size_limit: limit,
            default_delimiter: "\n".into(),
            ..Default::default()
        };
        Catalog::open(dir.path().join("foo.txt"), &opts).unwrap()
    }

    #[test]
    fn parts_are_packed_until_limit() {
        let dir = TempDir::new().unwrap();
        let cat = small_catalog(&dir, 100);

        let a = cat.add_file_part("a.txt", -1, 40, None).unwrap();
        let b = cat.add_file_part("b.txt", -1, 40, None).unwrap();
        let c = cat.add_file_part("c.txt", -1, 40, None).unwrap();

        assert_eq!(a.data_pos, 0);
        assert_eq!(a.delimiter, "\n");
        assert_eq!(b.data_path, a.data_path);
        assert_eq!(b.data_pos, 41);
        assert_ne!(c.data_path, a.data_path);
        assert_eq!(c.data_pos, 0);
        assert_eq!(cat.get_total_data_size().unwrap(), 41 * 3);
    }

    #[test]
    fn automatic_offset_appends() {
        let dir = TempDir::new().unwrap();
        let cat = small_catalog(&dir, 0);
        assert_eq!(cat.add_file_part("x", -1, 10, None).unwrap().offset, 0);
        assert_eq!(cat.add_file_part("x", -1, 5, None).unwrap().offset, 10);
        let parts = cat.get_all_parts().unwrap();
        assert_eq!(parts["x"], PartInfo { length: 15, parts: 2 });
    }

    #[test]
    fn overlapping_part_conflicts_contained_part_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cat = small_catalog(&dir, 0);
        let first = cat.add_file_part("x", 0, 100, None).unwrap();

        let inner = cat.add_file_part("x", 10, 20, None).unwrap();
        assert_eq!(inner.data_path, first.data_path);
        assert_eq!(inner.data_pos, first.data_pos + 10);
        assert!(inner.delimiter.is_empty());

        let err = cat.add_file_part("x", 50, 100, None).unwrap_err();
        assert_eq!(err.status_code(), 409);
        let err = cat.add_file_part("x", 0, 200, None).unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(cat.get_all_parts().unwrap()["x"].parts, 1);
    }

    #[test]
    fn delimiter_cannot_change() {
        let dir = TempDir::new().unwrap();
        let cat = small_catalog(&dir, 0);
        cat.add_file_part("a", -1, 3, Some("\r\n")).unwrap();
        let err = cat.add_file_part("b", -1, 3, Some("\n")).unwrap_err();
        assert!(err.to_string().contains("delimiter cannot be changed"));
        let same = cat.add_file_part("b", -1, 3, None).unwrap();
        assert_eq!(same.delimiter, "\r\n");
    }

    #[test]
    fn rename_parts_and_directories() {
        let dir = TempDir::new().unwrap();
        let cat = small_catalog(&dir, 0);
        cat.add_file_part("dir/a", -1, 1, None).unwrap();
        cat.add_file_part("dir/b", -1, 1, None).unwrap();
        cat.add_file_part("c", -1, 1, None).unwrap();

        assert_eq!(cat.rename_file_parts("c", "d").unwrap(), 1);
        assert_eq!(cat.rename_file_parts("dir/", "new/").unwrap(), 2);
        assert!(cat.rename_file_parts("d", "new/a").is_err());
        assert!(cat.rename_file_parts("missing", "z").unwrap_err().is_not_found());

        let names: Vec<_> = cat.get_all_parts().unwrap().into_keys().collect();
        assert_eq!(names, vec!["d", "new/a", "new/b"]);
    }
}
