//! Tagged MsgPack stream exchanged between nodes.
//!
//! Every item is one tag byte followed by a MsgPack object, except
//! [`TAG_EOF`] which ends the stream and carries nothing. Records travel in
//! the raw format: `{"_index": {...}, "data": "<base64>"}`.

use super::{Index, Record, Stat};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, ErrorKind};

pub const TAG_EOF: u8 = 0;
pub const TAG_RECORD: u8 = 1;
pub const TAG_ERROR: u8 = 2;
pub const TAG_STAT: u8 = 3;

/// Record in the raw format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "_index")]
    pub index: Index,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl RawRecord {
    pub fn from_record(rec: &Record, with_data: bool) -> Self {
        Self {
            index: rec.index.clone(),
            data: with_data.then(|| BASE64.encode(&rec.data)),
        }
    }

    pub fn into_record(self) -> Result<Record> {
        let data = match self.data {
            Some(text) => BASE64
                .decode(text.as_bytes())
                .map_err(|e| Error::Serialization(format!("bad record data: {e}")))?,
            None => Vec::new(),
        };
        Ok(Record::new(self.index, data))
    }
}

/// One decoded stream item.
#[derive(Debug)]
pub enum Item {
    Eof,
    Record(Record),
    Error(String),
    Stat(Stat),
}

/// Serialize one tagged item.
pub fn encode<T: Serialize + ?Sized>(tag: u8, value: &T) -> Result<Vec<u8>> {
    let mut out = vec![tag];
    out.extend(rmp_serde::to_vec_named(value)?);
    Ok(out)
}

pub fn encode_eof() -> Vec<u8> {
    vec![TAG_EOF]
}

/// Incremental decoder fed with network chunks.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not decoded yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete item, `None` if more bytes are needed.
    pub fn next_item(&mut self) -> Result<Option<Item>> {
        let Some(&tag) = self.buf.first() else {
            return Ok(None);
        };
        let item = match tag {
            TAG_EOF => {
                self.buf.drain(..1);
                return Ok(Some(Item::Eof));
            }
            TAG_RECORD => self
                .decode::<RawRecord>()?
                .map(RawRecord::into_record)
                .transpose()?
                .map(Item::Record),
            TAG_ERROR => self.decode::<String>()?.map(Item::Error),
            TAG_STAT => self.decode::<Stat>()?.map(Item::Stat),
            other => {
                return Err(Error::Stream(format!(
                    "unknown data tag received: {other}"
                )))
            }
        };
        Ok(item)
    }

    fn decode<T: serde::de::DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut cursor = Cursor::new(&self.buf[1..]);
        match rmp_serde::from_read::<_, T>(&mut cursor) {
            Ok(value) => {
                let used = 1 + cursor.position() as usize;
                self.buf.drain(..used);
                Ok(Some(value))
            }
            Err(e) if is_incomplete(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error as E;
    match err {
        E::InvalidMarkerRead(e) | E::InvalidDataRead(e) => e.kind() == ErrorKind::UnexpectedEof,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_items_split_across_chunks() {
        let mut rec = Record::new(Index::new("a.txt", 10, 5, 1), b"hello".to_vec());
        rec.index.host = "n1".into();
        let mut stat = Stat::new("n1");
        stat.matches = 1;

        let mut stream = Vec::new();
        stream.extend(encode(TAG_RECORD, &RawRecord::from_record(&rec, true)).unwrap());
        stream.extend(encode(TAG_ERROR, "oops").unwrap());
        stream.extend(encode(TAG_STAT, &stat).unwrap());
        stream.extend(encode_eof());

        let mut dec = StreamDecoder::new();
        let mut items = Vec::new();
        for chunk in stream.chunks(3) {
            dec.push(chunk);
            while let Some(item) = dec.next_item().unwrap() {
                items.push(item);
            }
        }
        assert_eq!(dec.pending(), 0);
        assert_eq!(items.len(), 4);
        match &items[0] {
            Item::Record(r) => assert_eq!(r, &rec),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&items[1], Item::Error(m) if m == "oops"));
        assert!(matches!(&items[2], Item::Stat(s) if s.matches == 1));
        assert!(matches!(items[3], Item::Eof));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut dec = StreamDecoder::new();
        dec.push(&[7, 0x90]);
        let err = dec.next_item().unwrap_err();
        assert!(err.to_string().contains("unknown data tag received"));
    }
}
