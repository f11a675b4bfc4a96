//! Per-request search configuration.

use crate::files::{is_relative_to_home, ShareMode};
use crate::postproc::PostExecJob;
use crate::search::transform::Transform;
use crate::{Error, Result};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Backend tool selection and extra options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSelection {
    /// Tool name, autoselected when empty.
    pub tool: String,
    pub mode: String,
    /// Appended to the tool arguments as is.
    pub opts: Vec<String>,
}

/// Immutable configuration of one search, count or show request.
#[derive(Clone)]
pub struct SearchConfig {
    pub query: String,
    /// Input set: regular files or catalogs, relative to the user home.
    pub files: Vec<String>,
    /// `fhs`, `feds`, `es`, `ds`, `ts`, `ns`, `cs`, `ipv4`, `ipv6`, `pcap` or empty.
    pub mode: String,
    /// Surrounding width, `-1` for whole line.
    pub width: i32,
    pub dist: u32,
    pub case: bool,
    pub reduce: bool,
    pub nodes: u32,
    pub backend: BackendSelection,

    pub keep_data_as: String,
    pub keep_index_as: String,
    pub keep_view_as: String,
    pub delimiter: String,
    pub lifetime: Option<Duration>,

    /// First record to report (show paging).
    pub offset: u64,
    /// Maximum records to report, `None` for no limit. `Some(0)` is count-only.
    pub limit: Option<u64>,

    /// Hint for record data format: `xml`, `csv`, `json`, ...
    pub data_format: String,
    pub transforms: Vec<Arc<dyn Transform>>,
    /// Textual form of `transforms`, forwarded to remote nodes.
    pub transform_rules: Vec<String>,
    pub post_exec: Option<PostExecJob>,
    /// Requested aggregations, as sent in the `aggs` parameter.
    pub aggregations: Option<Value>,

    /// If false no processing is done at all (count).
    pub report_index: bool,
    /// If false only indexes are read (format=null).
    pub report_data: bool,
    pub share_mode: ShareMode,
    /// Input patterns matching nothing are ignored instead of failing.
    pub skip_missing: bool,
    pub performance: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            query: String::new(),
            files: Vec::new(),
            mode: String::new(),
            width: 0,
            dist: 0,
            case: true,
            reduce: true,
            nodes: 0,
            backend: BackendSelection::default(),
            keep_data_as: String::new(),
            keep_index_as: String::new(),
            keep_view_as: String::new(),
            delimiter: String::new(),
            lifetime: None,
            offset: 0,
            limit: None,
            data_format: String::new(),
            transforms: Vec::new(),
            transform_rules: Vec::new(),
            post_exec: None,
            aggregations: None,
            report_index: true,
            report_data: true,
            share_mode: ShareMode::default(),
            skip_missing: false,
            performance: false,
        }
    }
}

impl SearchConfig {
    pub fn new(query: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            query: query.into(),
            files,
            ..Default::default()
        }
    }

    /// Enforce the count-only rule: a zero limit reports neither index nor data.
    pub fn normalized(mut self) -> Self {
        if self.limit == Some(0) {
            self.report_index = false;
            self.report_data = false;
        }
        if !self.report_index {
            self.report_data = false;
        }
        self
    }

    pub fn is_count_only(&self) -> bool {
        !self.report_index
    }

    /// Check that all input and output names stay under `home`.
    pub fn check_relative_to_home(&self, home: &Path) -> Result<()> {
        for file in &self.files {
            if !is_relative_to_home(home, &home.join(file.trim_start_matches('/'))) {
                return Err(Error::BadRequest(format!(
                    "path {:?} is not relative to home",
                    file
                )));
            }
        }
        for (what, name) in [
            ("index", &self.keep_index_as),
            ("data", &self.keep_data_as),
            ("view", &self.keep_view_as),
        ] {
            if !name.is_empty()
                && !is_relative_to_home(home, &home.join(name.trim_start_matches('/')))
            {
                return Err(Error::BadRequest(format!(
                    "{} {:?} is not relative to home",
                    what, name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut props = Vec::new();
        if !self.query.is_empty() {
            props.push(format!("query:{}", self.query));
        }
        if !self.files.is_empty() {
            props.push(format!("files:{:?}", self.files));
        }
        if !self.mode.is_empty() {
            props.push(format!("mode:{:?}", self.mode));
        }
        if self.width != 0 {
            props.push(format!("width:{}", self.width));
        }
        if self.dist != 0 {
            props.push(format!("dist:{}", self.dist));
        }
        props.push(format!("cs:{}", self.case));
        if self.offset != 0 {
            props.push(format!("offset:{}", self.offset));
        }
        if let Some(limit) = self.limit {
            props.push(format!("limit:{}", limit));
        }
        for (k, v) in [
            ("data", &self.keep_data_as),
            ("index", &self.keep_index_as),
            ("view", &self.keep_view_as),
        ] {
            if !v.is_empty() {
                props.push(format!("{}:{:?}", k, v));
            }
        }
        if !self.delimiter.is_empty() {
            props.push(format!("delim:{:?}", self.delimiter));
        }
        if let Some(lifetime) = self.lifetime {
            props.push(format!("lifetime:{:?}", lifetime));
        }
        if !self.transforms.is_empty() {
            props.push(format!("transforms:{:?}", self.transforms));
        }
        if let Some(aggs) = &self.aggregations {
            props.push(format!("aggs:{}", aggs));
        }
        if !self.backend.tool.is_empty() {
            props.push(format!("backend:{:?}", self.backend.tool));
        }
        let mut flags = String::new();
        if self.report_index {
            flags.push('I');
        }
        if self.report_data {
            flags.push('D');
        }
        if self.performance {
            flags.push('P');
        }
        if !flags.is_empty() {
            props.push(flags);
        }
        write!(f, "Config{{{}}}", props.join(", "))
    }
}
