//! Fake engine for development and tests.
//!
//! Two modes:
//! - scripted: reports a fixed number of records and errors, optionally
//!   slowly, or fails to start;
//! - scan: exact substring search over the files and catalogs under the
//!   user home, writing INDEX/DATA outputs the same way the scanner tool does.

use super::stat::EXTRA_AGGREGATIONS;
use super::{DirInfo, Engine, Index, Record, ResultSender, SearchConfig, SearchResult, Stat};
use crate::catalog::{is_catalog, unwind_all, Catalog, CatalogOptions, IndexFile};
use crate::files::{check_relative_to_home, list_dir};
use crate::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

/// What a scripted engine reports.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    pub records: u64,
    pub errors: u64,
    /// Delay before each reported item.
    pub latency: Duration,
    /// Fail `search`/`show` right away with this message.
    pub start_error: Option<String>,
    /// Reported matches, `records` when unset.
    pub matches: Option<u64>,
    pub session_data: Option<Value>,
    /// Intermediate aggregations reported in the stat.
    pub aggregations: Option<Value>,
}

/// Where a scanning engine looks for files.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub mount_point: PathBuf,
    pub home_dir: String,
    pub host: String,
}

impl ScanOptions {
    fn home(&self) -> PathBuf {
        self.mount_point.join(self.home_dir.trim_start_matches('/'))
    }
}

#[derive(Debug, Clone)]
enum Mode {
    Scripted(FakeScript),
    Scan(ScanOptions),
}

#[derive(Debug, Clone)]
pub struct FakeEngine {
    host: String,
    location: Option<String>,
    mode: Mode,
}

impl FakeEngine {
    pub fn scripted(host: impl Into<String>, script: FakeScript) -> Self {
        Self {
            host: host.into(),
            location: None,
            mode: Mode::Scripted(script),
        }
    }

    pub fn scan(opts: ScanOptions) -> Self {
        Self {
            host: opts.host.clone(),
            location: None,
            mode: Mode::Scan(opts),
        }
    }

    /// Pretend to be a remote node.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

fn scripted_record(host: &str, n: u64) -> Record {
    let data = format!("data-{n:x}").into_bytes();
    let mut index = Index::new(format!("file-{n}.txt"), n, data.len() as u64, 0);
    index.host = host.to_string();
    Record::new(index, data)
}

async fn run_script(
    host: String,
    script: FakeScript,
    window: std::ops::Range<u64>,
    report: bool,
    tx: ResultSender,
) {
    let cancelled = tx.cancel_token();
    let mut errors = script.errors;
    let mut total_bytes = 0;
    let mut n = window.start;

    while n < window.end || errors > 0 {
        if !script.latency.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(script.latency) => {}
                _ = cancelled.cancelled() => break,
            }
        }
        if cancelled.is_cancelled() {
            break;
        }
        // alternate while both remain
        let send_record = n < window.end && (errors == 0 || (n - window.start) % 2 == 0);
        if send_record {
            let rec = scripted_record(&host, n);
            total_bytes += rec.data.len() as u64;
            n += 1;
            if report && !tx.report_record(rec).await {
                break;
            }
        } else {
            let err = Error::Engine(format!("error-{errors}"));
            errors -= 1;
            if !tx.report_error(err).await {
                break;
            }
        }
    }

    let mut stat = Stat::new(host);
    stat.matches = script.matches.unwrap_or(script.records);
    stat.total_bytes = total_bytes;
    stat.duration = 1 + n;
    stat.fabric_duration = stat.duration / 2;
    if let Some(Value::Object(data)) = script.session_data {
        for (k, v) in data {
            stat.add_session_data(&k, v);
        }
    }
    if let Some(aggs) = script.aggregations {
        stat.extra.insert(EXTRA_AGGREGATIONS.to_string(), aggs);
    }
    tx.finish(Some(stat));
}

/// Text to look for: the first quoted literal of a structured query or the
/// whole query.
fn search_text(query: &str) -> Option<String> {
    static QUOTED: OnceLock<Option<Regex>> = OnceLock::new();
    let re = QUOTED.get_or_init(|| {
        Regex::new(r#"\((?:RAW_TEXT|RECORD[.\w]*) (?:CONTAINS|NOT_CONTAINS|EQUALS|NOT_EQUALS) (?:EXACT\(|HAMMING\(|EDIT_DISTANCE\()?"([^"]*)""#)
            .ok()
    });
    let text = match re.as_ref().and_then(|re| re.captures(query)) {
        Some(c) => c[1].to_string(),
        None if query.starts_with('(') => return None,
        None => query.trim_matches('"').to_string(),
    };
    (!text.is_empty()).then_some(text)
}

struct Writers {
    index: Option<BufWriter<tokio::fs::File>>,
    data: Option<BufWriter<tokio::fs::File>>,
}

async fn create_output(home: &Path, name: &str) -> Result<Option<BufWriter<tokio::fs::File>>> {
    if name.is_empty() {
        return Ok(None);
    }
    let path = check_relative_to_home(home, name)?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(Some(BufWriter::new(tokio::fs::File::create(path).await?)))
}

async fn run_scan(opts: ScanOptions, cfg: SearchConfig, text: String, tx: ResultSender) {
    let started = Instant::now();
    let mut stat = Stat::new(&opts.host);
    if let Err(e) = scan(&opts, &cfg, &text, &tx, &mut stat).await {
        tx.report_error(e).await;
    }
    stat.duration = started.elapsed().as_millis() as u64;
    stat.fabric_duration = stat.duration / 2;
    tx.finish(Some(stat));
}

/// Data files of a catalog and their index files.
async fn catalog_files(path: &Path) -> Result<(Vec<PathBuf>, HashMap<String, IndexFile>)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let cat = Catalog::open(&path, &CatalogOptions::default())?;
        let files = cat.get_data_files(None, false)?;
        let index = cat
            .get_search_index_file()?
            .into_iter()
            .map(|(data, file)| (data.to_string_lossy().into_owned(), file))
            .collect();
        cat.close();
        Ok::<_, Error>((files, index))
    })
    .await
    .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))?
}

struct Scanner<'a> {
    opts: &'a ScanOptions,
    cfg: &'a SearchConfig,
    home: PathBuf,
    needle: &'a [u8],
    out: Writers,
    /// Catalog data files, keyed by the name written to INDEX.
    unwind: HashMap<String, IndexFile>,
    reported: u64,
}

impl Scanner<'_> {
    /// Scan one file; returns false once the consumer is gone.
    async fn file(&mut self, path: &Path, name: String, tx: &ResultSender, stat: &mut Stat) -> Result<bool> {
        let data = tokio::fs::read(path).await?;
        if data.is_empty() {
            return Ok(true);
        }
        debug!(file = %name, length = data.len(), "scanning file");
        stat.total_bytes += data.len() as u64;
        let width = self.cfg.width.max(0) as usize;

        let mut start = 0;
        while let Some(found) = find(&data[start..], self.needle) {
            let at = start + found;
            start = at + 1;
            stat.matches += 1;

            let beg = at.saturating_sub(width);
            let end = (at + self.needle.len() + width).min(data.len());
            let mut index = Index::new(name.clone(), beg as u64, (end - beg) as u64, 0);
            index.host = self.opts.host.clone();

            if let Some(w) = self.out.index.as_mut() {
                w.write_all(format!("{}\n", index.to_line()).as_bytes()).await?;
            }
            if let Some(w) = self.out.data.as_mut() {
                w.write_all(&data[beg..end]).await?;
                w.write_all(self.cfg.delimiter.as_bytes()).await?;
            }
            let in_limit = self.cfg.limit.map_or(true, |l| self.reported < l);
            if !self.cfg.report_index || !in_limit {
                continue;
            }
            let mut bytes = &data[beg..end];
            if self.unwind.contains_key(&index.file) {
                let (unwound, shift) = unwind_all(&self.unwind, index, self.cfg.width)?;
                let b = (shift as usize).min(bytes.len());
                let e = (b + unwound.length as usize).min(bytes.len());
                bytes = &bytes[b..e];
                index = unwound;
                if let Ok(rel) = Path::new(&index.file).strip_prefix(&self.home) {
                    index.file = rel.to_string_lossy().into_owned();
                }
            }
            let bytes = if self.cfg.report_data {
                bytes.to_vec()
            } else {
                Vec::new()
            };
            self.reported += 1;
            if !tx.report_record(Record::new(index, bytes)).await {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

async fn scan(
    opts: &ScanOptions,
    cfg: &SearchConfig,
    text: &str,
    tx: &ResultSender,
    stat: &mut Stat,
) -> Result<()> {
    let home = opts.home();
    let mut scanner = Scanner {
        opts,
        cfg,
        home: home.clone(),
        needle: text.as_bytes(),
        out: Writers {
            index: create_output(&home, &cfg.keep_index_as).await?,
            data: create_output(&home, &cfg.keep_data_as).await?,
        },
        unwind: HashMap::new(),
        reported: 0,
    };

    'files: for pattern in &cfg.files {
        let mask = check_relative_to_home(&home, pattern)?;
        for entry in glob::glob(&mask.to_string_lossy())? {
            if tx.is_cancelled() {
                break 'files;
            }
            let path = entry.map_err(|e| Error::Engine(format!("failed to glob: {e}")))?;
            if !path.is_file() {
                continue;
            }
            // catalog hits are written raw and unwound when reported
            let targets = if is_catalog(&path) {
                let (files, index) = catalog_files(&path).await?;
                scanner.unwind.extend(index);
                files
                    .into_iter()
                    .map(|f| {
                        let name = f.to_string_lossy().into_owned();
                        (f, name)
                    })
                    .collect()
            } else {
                let name = path
                    .strip_prefix(&home)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| path.to_string_lossy().into_owned());
                vec![(path, name)]
            };
            for (file, name) in targets {
                if !scanner.file(&file, name, tx, stat).await? {
                    break 'files;
                }
            }
        }
    }

    for w in [scanner.out.index.as_mut(), scanner.out.data.as_mut()].into_iter().flatten() {
        w.flush().await?;
    }
    if !cfg.keep_index_as.is_empty() {
        stat.add_session_data("index", json!(cfg.keep_index_as));
        stat.add_session_data("data", json!(cfg.keep_data_as));
        stat.add_session_data("delim", json!(cfg.delimiter));
        stat.add_session_data("width", json!(cfg.width));
        stat.add_session_data("matches", json!(stat.matches));
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Show over the outputs of a previous scan.
async fn run_show(opts: ScanOptions, cfg: SearchConfig, tx: ResultSender) {
    if let Err(e) = show_saved(&opts, &cfg, &tx).await {
        tx.report_error(e).await;
    }
    tx.finish(Some(Stat::new(opts.host)));
}

async fn show_saved(opts: &ScanOptions, cfg: &SearchConfig, tx: &ResultSender) -> Result<()> {
    let home = opts.home();
    let index = tokio::fs::File::open(check_relative_to_home(&home, &cfg.keep_index_as)?).await?;
    let data = if cfg.keep_data_as.is_empty() || !cfg.report_data {
        Vec::new()
    } else {
        tokio::fs::read(check_relative_to_home(&home, &cfg.keep_data_as)?).await?
    };

    let mut lines = BufReader::new(index).lines();
    let mut pos = 0u64;
    let mut data_pos = 0usize;
    while let Some(line) = lines.next_line().await? {
        let Some(mut index) = Index::parse_line(&line) else {
            continue;
        };
        let len = index.length as usize;
        let beg = data_pos.min(data.len());
        let end = (data_pos + len).min(data.len());
        data_pos += len + cfg.delimiter.len();

        if pos < cfg.offset {
            pos += 1;
            continue;
        }
        if cfg.limit.map_or(false, |l| pos >= cfg.offset + l) {
            break;
        }
        pos += 1;
        if index.host.is_empty() {
            index.host = opts.host.clone();
        }
        if !tx.report_record(Record::new(index, data[beg..end].to_vec())).await {
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl Engine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        info!(host = %self.host, cfg = ?cfg, "start fake search");
        match &self.mode {
            Mode::Scripted(script) => {
                if let Some(msg) = &script.start_error {
                    return Err(Error::Engine(msg.clone()));
                }
                let (tx, result) = SearchResult::channel();
                tokio::spawn(run_script(
                    self.host.clone(),
                    script.clone(),
                    0..script.records,
                    cfg.report_index,
                    tx,
                ));
                Ok(result)
            }
            Mode::Scan(opts) => {
                let text = search_text(&cfg.query)
                    .ok_or_else(|| Error::BadRequest("nothing to search".to_string()))?;
                let (tx, result) = SearchResult::channel();
                tokio::spawn(run_scan(opts.clone(), cfg.clone(), text, tx));
                Ok(result)
            }
        }
    }

    async fn show(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        match &self.mode {
            Mode::Scripted(script) => {
                if let Some(msg) = &script.start_error {
                    return Err(Error::Engine(msg.clone()));
                }
                let beg = cfg.offset.min(script.records);
                let end = match cfg.limit {
                    Some(l) => beg.saturating_add(l).min(script.records),
                    None => script.records,
                };
                let script = FakeScript {
                    errors: 0,
                    ..script.clone()
                };
                let (tx, result) = SearchResult::channel();
                tokio::spawn(run_script(self.host.clone(), script, beg..end, true, tx));
                Ok(result)
            }
            Mode::Scan(opts) => {
                if cfg.keep_index_as.is_empty() {
                    return Err(Error::BadRequest("no INDEX file provided".to_string()));
                }
                let (tx, result) = SearchResult::channel();
                tokio::spawn(run_show(opts.clone(), cfg.clone(), tx));
                Ok(result)
            }
        }
    }

    async fn files(&self, path: &str, hidden: bool) -> Result<DirInfo> {
        match &self.mode {
            Mode::Scripted(_) => {
                let mut info = DirInfo::new(path);
                info.files.push(format!("{}.txt", self.host));
                Ok(info)
            }
            Mode::Scan(opts) => list_dir(&opts.home(), path, hidden).await,
        }
    }

    fn options(&self) -> Map<String, Value> {
        let mut opts = Map::new();
        opts.insert("host".into(), json!(self.host));
        match &self.mode {
            Mode::Scripted(s) => {
                opts.insert("records".into(), json!(s.records));
                opts.insert("errors".into(), json!(s.errors));
                opts.insert("latency".into(), json!(humantime::format_duration(s.latency).to_string()));
            }
            Mode::Scan(o) => {
                opts.insert("mount-point".into(), json!(o.mount_point));
                opts.insert("home-dir".into(), json!(o.home_dir));
            }
        }
        opts
    }

    fn location(&self) -> Option<String> {
        self.location.clone()
    }
}
