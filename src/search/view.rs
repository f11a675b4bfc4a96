//! VIEW files: fixed-size position tables that map the N-th search result
//! to its byte ranges inside the INDEX and DATA files.
//!
//! Layout (big-endian): a header of eight `u64` words
//! `[signature, count, index length, data length, 0, 0, 0, 0]` followed by
//! `count` items of four `i64` words `[index beg, index end, data beg, data end]`.

use crate::{Error, Result};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};

/// "ryftview"
pub const SIGNATURE: u64 = 0x7279_6674_7669_6577;
pub const HEADER_SIZE: u64 = 8 * 8;
pub const ITEM_SIZE: u64 = 4 * 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewHeader {
    pub count: u64,
    pub index_length: u64,
    pub data_length: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewItem {
    pub index_beg: i64,
    pub index_end: i64,
    pub data_beg: i64,
    pub data_end: i64,
}

pub struct ViewWriter {
    file: BufWriter<File>,
    count: u64,
}

impl ViewWriter {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path).await?;
        let mut file = BufWriter::new(file);
        // placeholder, rewritten by finish()
        write_header(&mut file, &ViewHeader::default()).await?;
        Ok(Self { file, count: 0 })
    }

    pub async fn put(&mut self, item: ViewItem) -> Result<()> {
        self.file.write_i64(item.index_beg).await?;
        self.file.write_i64(item.index_end).await?;
        self.file.write_i64(item.data_beg).await?;
        self.file.write_i64(item.data_end).await?;
        self.count += 1;
        Ok(())
    }

    pub async fn finish(mut self, index_length: u64, data_length: u64) -> Result<()> {
        self.file.flush().await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        let header = ViewHeader {
            count: self.count,
            index_length,
            data_length,
        };
        write_header(&mut self.file, &header).await?;
        self.file.flush().await?;
        Ok(())
    }
}

async fn write_header(file: &mut BufWriter<File>, header: &ViewHeader) -> Result<()> {
    file.write_u64(SIGNATURE).await?;
    file.write_u64(header.count).await?;
    file.write_u64(header.index_length).await?;
    file.write_u64(header.data_length).await?;
    for _ in 0..4 {
        file.write_u64(0).await?;
    }
    Ok(())
}

pub struct ViewReader {
    file: File,
    header: ViewHeader,
}

impl ViewReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path).await?;
        if file.read_u64().await? != SIGNATURE {
            return Err(Error::BadRequest("bad VIEW file signature".to_string()));
        }
        let header = ViewHeader {
            count: file.read_u64().await?,
            index_length: file.read_u64().await?,
            data_length: file.read_u64().await?,
        };
        Ok(Self { file, header })
    }

    pub fn header(&self) -> &ViewHeader {
        &self.header
    }

    /// Read the item at `pos`.
    pub async fn get(&mut self, pos: u64) -> Result<ViewItem> {
        if pos >= self.header.count {
            return Err(Error::NotFound(format!(
                "VIEW position {} is out of range (count {})",
                pos, self.header.count
            )));
        }
        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + pos * ITEM_SIZE))
            .await?;
        Ok(ViewItem {
            index_beg: self.file.read_i64().await?,
            index_end: self.file.read_i64().await?,
            data_beg: self.file.read_i64().await?,
            data_end: self.file.read_i64().await?,
        })
    }
}
