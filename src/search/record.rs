//! Search records and their index coordinates.

use serde::{Deserialize, Serialize};

/// Location of a match inside a (possibly virtual) file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub file: String,
    pub offset: u64,
    pub length: u64,
    pub fuzziness: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

impl Index {
    pub fn new(file: impl Into<String>, offset: u64, length: u64, fuzziness: i32) -> Self {
        Self {
            file: file.into(),
            offset,
            length,
            fuzziness,
            host: String::new(),
        }
    }

    /// Parse one line of a native index file: `file,offset,length,fuzziness`.
    ///
    /// The file name may itself contain commas, so the numeric fields are
    /// taken from the right.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.rsplitn(4, ',');
        let fuzziness = parts.next()?.trim().parse().ok()?;
        let length = parts.next()?.trim().parse().ok()?;
        let offset = parts.next()?.trim().parse().ok()?;
        let file = parts.next()?;
        Some(Self::new(file, offset, length, fuzziness))
    }

    /// Render as one line of a native index file (without newline).
    pub fn to_line(&self) -> String {
        format!("{},{},{},{}", self.file, self.offset, self.length, self.fuzziness)
    }
}

/// Single search hit: where it is and (optionally) its bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub index: Index,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(index: Index, data: Vec<u8>) -> Self {
        Self { index, data }
    }
}
