//! Mapping data file positions back to virtual file parts.
//!
//! A search over catalog data files reports hits as positions inside the
//! data files. An [`IndexFile`] lists the parts packed into one data file
//! so each hit can be "unwound" to the virtual file and offset it came from.

use super::Catalog;
use crate::search::Index;
use crate::{Error, Result};
use rusqlite::{params, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// One part packed into a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexItem {
    pub file: String,
    pub offset: u64,
    pub length: u64,
    pub data_pos: u64,
    pub fuzziness: i32,
}

/// Parts of one data file ordered by data position.
#[derive(Debug, Clone, Default)]
pub struct IndexFile {
    pub delimiter: String,
    /// Surrounding width the data file was produced with, `-1` for lines.
    pub width: i32,
    pub items: Vec<IndexItem>,
}

impl IndexFile {
    pub fn new(delimiter: impl Into<String>, width: i32) -> Self {
        Self {
            delimiter: delimiter.into(),
            width,
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, item: IndexItem) {
        self.items.push(item);
    }

    /// First item whose data range ends after `pos`.
    pub fn find(&self, pos: u64) -> usize {
        self.items
            .partition_point(|it| it.data_pos + it.length <= pos)
    }

    /// Map `index` (a hit inside this data file found with surrounding
    /// `width`) to the part it belongs to.
    ///
    /// The surrounding is clipped to the part boundaries. Returns the new
    /// index and the number of bytes cut from the front of the record data.
    pub fn unwind(&self, index: &Index, width: i32) -> Result<(Index, u64)> {
        let reference = if width < 0 {
            index.offset + index.length / 2
        } else if index.offset == 0 {
            index.length.saturating_sub(width as u64 + 1)
        } else {
            index.offset + width as u64
        };

        let Some(base) = self.items.get(self.find(reference)) else {
            return Err(Error::Internal(format!(
                "no base found for index:[{}..{})",
                index.offset,
                index.offset + index.length
            )));
        };

        let base_beg = base.data_pos;
        let base_end = base.data_pos + base.length;
        let mut beg = index.offset;
        let end = index.offset + index.length;
        let mut length = index.length;

        if end <= base_beg || base_end <= beg {
            return Err(Error::Internal(format!(
                "bad base:[{}..{}) for index:[{}..{})",
                base_beg, base_end, beg, end
            )));
        }

        let mut shift = 0;
        if base_beg <= beg {
            beg = beg - base_beg + base.offset;
        } else {
            shift = base_beg - beg;
            beg = base.offset;
            length -= shift;
        }
        if end > base_end {
            length -= end - base_end;
        }

        let mut out = Index::new(base.file.clone(), beg, length, index.fuzziness);
        out.host = index.host.clone();
        Ok((out, shift))
    }
}

/// Unwind through nested catalogs until the index no longer points into a
/// known data file. Returns the final index and the total front shift.
pub fn unwind_all(
    files: &HashMap<String, IndexFile>,
    index: Index,
    width: i32,
) -> Result<(Index, u64)> {
    let mut index = index;
    let mut width = width;
    let mut shift = 0;
    // bounded to avoid cycles in malformed catalogs
    for _ in 0..64 {
        let Some(f) = files.get(&index.file) else {
            return Ok((index, shift));
        };
        let (next, s) = f.unwind(&index, width)?;
        shift += s;
        width = f.width;
        index = next;
    }
    Err(Error::Internal(format!(
        "too deep catalog nesting for {}",
        index.file
    )))
}

impl Catalog {
    /// Index files of every data file, keyed by absolute data path.
    pub fn get_search_index_file(&self) -> Result<HashMap<PathBuf, IndexFile>> {
        let base_dir = self.base_dir();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.file, d.delim, d.s_w, p.name, p.pos, p.len, p.d_pos, p.opt
                 FROM parts AS p JOIN data AS d ON p.d_id = d.id
                 ORDER BY d.id, p.d_pos",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<Vec<u8>>>(1)?,
                    r.get::<_, i64>(2)?,
                    IndexItem {
                        file: r.get(3)?,
                        offset: r.get::<_, i64>(4)? as u64,
                        length: r.get::<_, i64>(5)? as u64,
                        data_pos: r.get::<_, i64>(6)? as u64,
                        fuzziness: (r.get::<_, i64>(7)? >> 24) as i32,
                    },
                ))
            })?;

            let mut out: HashMap<PathBuf, IndexFile> = HashMap::new();
            for row in rows {
                let (file, delim, width, item) = row?;
                out.entry(base_dir.join(file))
                    .or_insert_with(|| {
                        IndexFile::new(
                            String::from_utf8_lossy(&delim.unwrap_or_default()),
                            width as i32,
                        )
                    })
                    .push(item);
            }
            Ok(out)
        })
    }

    /// Import the DATA and INDEX outputs of a search as catalog content.
    ///
    /// Every INDEX line becomes a part; records follow each other in the
    /// data file separated by `delimiter`. Hits inside files known to
    /// `unwind` are mapped back to their original file, and the surrounding
    /// is clipped from the part. The data file is never packed into.
    pub async fn add_search_results(
        &self,
        data_path: &Path,
        index_path: &Path,
        delimiter: &str,
        width: i32,
        unwind: &HashMap<String, IndexFile>,
    ) -> Result<()> {
        let file = tokio::fs::File::open(index_path).await.map_err(|e| {
            Error::Internal(format!("failed to open index file: {e}"))
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut indexes = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let idx = Index::parse_line(&line)
                .ok_or_else(|| Error::Internal(format!("failed to parse index: {line:?}")))?;
            indexes.push(idx);
        }

        let delim_len = delimiter.len() as u64;
        let expected: u64 = indexes.iter().map(|idx| idx.length + delim_len).sum();
        if let Ok(meta) = tokio::fs::metadata(data_path).await {
            if meta.len() != expected {
                return Err(Error::Internal(format!(
                    "inconsistent data file {:?} size: expected:{}, actual:{}",
                    data_path,
                    expected,
                    meta.len()
                )));
            }
        }

        let data_file = data_path.to_string_lossy().into_owned();
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            tx.execute(
                "INSERT INTO data (file, len, opt, delim, s_w) VALUES (?1, 0, 1, ?2, ?3)",
                params![data_file, delimiter.as_bytes(), width],
            )?;
            let d_id = tx.last_insert_rowid();
            let mut d_pos = 0i64;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO parts (name, pos, len, opt, d_id, d_pos)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for idx in &indexes {
                    let (part, shift) = unwind_all(unwind, idx.clone(), width)?;
                    let opt = (idx.fuzziness.max(0) as i64) << 24;
                    stmt.execute(params![
                        part.file,
                        part.offset as i64,
                        part.length as i64,
                        opt,
                        d_id,
                        d_pos + shift as i64
                    ])?;
                    d_pos += (idx.length + delim_len) as i64;
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(
            catalog = %self.path.display(),
            data = %data_path.display(),
            parts = indexes.len(),
            "search results added"
        );
        Ok(())
    }
}
