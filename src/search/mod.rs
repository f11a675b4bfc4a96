//! Search engines and the streaming result pipeline.
//!
//! Every backend implements [`Engine`]. A search returns a [`SearchResult`]
//! whose record, error and done channels are fed by tasks the engine spawns:
//!
//! - [`local::LocalEngine`] wraps the native scanner tool.
//! - [`http::HttpEngine`] forwards to a remote peer over the tagged MsgPack stream.
//! - [`mux::MuxEngine`] fans one config out to many engines and merges results.
//! - [`fake::FakeEngine`] is a scripted/scanning backend for development and tests.
//! - [`decoder::DecoderEngine`] splits boolean queries into simple searches
//!   chained through temporary catalogs before they reach the local backend.
//!
//! [`aggs`] computes and merges aggregations over matched records.

pub mod aggs;
pub mod config;
pub mod decoder;
pub mod fake;
pub mod http;
pub mod local;
pub mod mux;
pub mod query;
pub mod record;
pub mod result;
pub mod stat;
pub mod transform;
pub mod view;
pub mod wire;

pub use config::{BackendSelection, SearchConfig};
pub use record::{Index, Record};
pub use result::{Event, ResultSender, SearchResult};
pub use stat::Stat;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Directory listing as reported by `GET /files`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirInfo {
    pub dir: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dirs: Vec<String>,
    #[serde(default)]
    pub catalogs: Vec<String>,
}

impl DirInfo {
    pub fn new(dir: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Union with another listing of the same directory.
    pub fn merge(&mut self, other: DirInfo) {
        self.files.extend(other.files);
        self.dirs.extend(other.dirs);
        self.catalogs.extend(other.catalogs);
        self.normalize();
    }

    /// Sort and deduplicate all sets.
    pub fn normalize(&mut self) {
        for set in [&mut self.files, &mut self.dirs, &mut self.catalogs] {
            set.sort();
            set.dedup();
        }
    }
}

/// Search backend.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Start a search. Records, errors and the final stat arrive on the result.
    async fn search(&self, cfg: &SearchConfig) -> Result<SearchResult>;

    /// Read a range of results from the outputs of a previous search.
    async fn show(&self, cfg: &SearchConfig) -> Result<SearchResult>;

    /// List a directory relative to the user home.
    async fn files(&self, path: &str, hidden: bool) -> Result<DirInfo>;

    /// Backend options for diagnostics.
    fn options(&self) -> Map<String, Value>;

    /// Node URL for remote engines.
    fn location(&self) -> Option<String> {
        None
    }
}
