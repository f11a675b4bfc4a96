//! Read-only view of a virtual catalog file.

use super::parts::PartRow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Presents the parts of a virtual file as one contiguous stream.
///
/// Gaps between parts read as zero bytes; reading stops at the end of the
/// last part.
#[derive(Debug)]
pub struct FileView {
    parts: Vec<PartRow>,
    pos: u64,
    files: HashMap<PathBuf, File>,
}

impl FileView {
    pub(crate) fn new(mut parts: Vec<PartRow>) -> Self {
        parts.sort_by_key(|p| p.offset);
        Self {
            parts,
            pos: 0,
            files: HashMap::new(),
        }
    }

    /// Virtual file size.
    pub fn len(&self) -> u64 {
        self.parts
            .iter()
            .map(|p| p.offset + p.length)
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First part that ends after `pos`.
    fn find_part(&self, pos: u64) -> usize {
        self.parts.partition_point(|p| p.offset + p.length <= pos)
    }

    fn data_file(&mut self, path: &PathBuf) -> io::Result<&mut File> {
        if !self.files.contains_key(path) {
            let f = File::open(path)?;
            self.files.insert(path.clone(), f);
        }
        self.files
            .get_mut(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "data file"))
    }
}

impl Read for FileView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.find_part(self.pos);
        let Some(part) = self.parts.get(n).cloned() else {
            return Ok(0);
        };

        if self.pos < part.offset {
            let zeros = ((part.offset - self.pos) as usize).min(buf.len());
            buf[..zeros].fill(0);
            self.pos += zeros as u64;
            return Ok(zeros);
        }

        let within = self.pos - part.offset;
        let want = ((part.length - within) as usize).min(buf.len());
        let file = self.data_file(&part.data_file)?;
        file.seek(SeekFrom::Start(part.data_pos + within))?;
        let got = file.read(&mut buf[..want])?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("data file {} is truncated", part.data_file.display()),
            ));
        }
        self.pos += got as u64;
        Ok(got)
    }
}

impl Seek for FileView {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let target = match from {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.len() as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Catalog, CatalogOptions};
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_at(path: &PathBuf, pos: u64, data: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .unwrap();
        f.seek(SeekFrom::Start(pos)).unwrap();
        f.write_all(data).unwrap();
    }

    #[test]
    fn reads_parts_with_gaps_zero_filled() {
        let dir = TempDir::new().unwrap();
        let cat = Catalog::open(dir.path().join("cat"), &CatalogOptions::default()).unwrap();

        let b = cat.add_file_part("f", 5, 3, None).unwrap();
        write_at(&b.data_path, b.data_pos, b"xyz");
        let a = cat.add_file_part("f", 0, 2, None).unwrap();
        write_at(&a.data_path, a.data_pos, b"ab");

        let mut view = cat.get_file("f").unwrap();
        assert_eq!(view.len(), 8);
        let mut out = Vec::new();
        view.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ab\0\0\0xyz");

        view.seek(SeekFrom::End(-2)).unwrap();
        let mut tail = String::new();
        view.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "yz");

        view.seek(SeekFrom::Start(1)).unwrap();
        view.seek(SeekFrom::Current(5)).unwrap();
        let mut one = [0u8; 1];
        view.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"y");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cat = Catalog::open(dir.path().join("cat"), &CatalogOptions::default()).unwrap();
        assert!(cat.get_file("nope").unwrap_err().is_not_found());
    }
}
