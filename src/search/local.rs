//! Local engine: drives the native scanner tool.
//!
//! A search expands the input patterns (catalogs become their data files),
//! runs the tool with INDEX and DATA outputs, parses the statistics it
//! prints as YAML and then streams the records by walking the INDEX file
//! and picking the matching bytes from the DATA file. Hits inside catalog
//! data files are unwound back to the virtual file they belong to.

use super::aggs::Aggregations;
use super::stat::EXTRA_AGGREGATIONS;
use super::view::{ViewItem, ViewReader, ViewWriter};
use super::{
    transform, DirInfo, Engine, Index, Record, ResultSender, SearchConfig, SearchResult, Stat,
};
use crate::catalog::{is_catalog, unwind_all, CatalogCache, CatalogHandle, IndexFile};
use crate::config::BackendOptions;
use crate::files::{check_relative_to_home, list_dir, lock_name, SafeGuard, SafeLocks};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Settings of the local engine for one user home.
#[derive(Debug, Clone)]
pub struct LocalOptions {
    pub mount_point: PathBuf,
    pub home_dir: String,
    /// Directory under the mount point for temporary outputs.
    pub instance_name: String,
    pub tool_path: String,
    pub index_host: String,
    pub keep_files: bool,
}

impl LocalOptions {
    pub fn from_backend(opts: &BackendOptions, index_host: impl Into<String>) -> Self {
        Self {
            mount_point: opts.mount_point.clone(),
            home_dir: opts.home_dir.clone(),
            instance_name: opts.instance_name.clone(),
            tool_path: opts.tool_path.clone(),
            index_host: index_host.into(),
            keep_files: opts.keep_files,
        }
    }

    /// Same settings for another user home.
    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home_dir = home.into();
        self
    }

    pub fn home(&self) -> PathBuf {
        self.mount_point.join(self.home_dir.trim_start_matches('/'))
    }
}

pub struct LocalEngine {
    opts: LocalOptions,
    catalogs: CatalogCache,
    locks: SafeLocks,
}

impl LocalEngine {
    pub fn new(opts: LocalOptions, catalogs: CatalogCache, locks: SafeLocks) -> Self {
        Self {
            opts,
            catalogs,
            locks,
        }
    }

    pub fn home(&self) -> PathBuf {
        self.opts.home()
    }

    /// Resolve input patterns to the files handed to the tool.
    async fn expand_inputs(&self, cfg: &SearchConfig) -> Result<Inputs> {
        let home = self.home();
        let mut inputs = Inputs::default();
        for pattern in &cfg.files {
            let full = check_relative_to_home(&home, pattern)?;
            let mut matched = 0;
            for entry in glob::glob(&full.to_string_lossy())? {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "glob entry failed");
                        continue;
                    }
                };
                if !path.is_file() {
                    continue;
                }
                matched += 1;

                match self.locks.lock_read(&lock_name(&path), cfg.share_mode).await {
                    Ok(guard) => inputs.guards.extend(guard),
                    Err(e) if cfg.share_mode.is_skip_busy() => {
                        debug!(file = %relative_name(&home, &path), error = %e, "busy file skipped");
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                if is_catalog(&path) {
                    self.expand_catalog(&path, &mut inputs).await?;
                } else {
                    inputs.files.push(path);
                }
            }
            if matched == 0 && !cfg.skip_missing {
                return Err(Error::NotFound(format!(
                    "{pattern:?}: no such file or directory"
                )));
            }
        }
        Ok(inputs)
    }

    async fn expand_catalog(&self, path: &Path, inputs: &mut Inputs) -> Result<()> {
        let cache = self.catalogs.clone();
        let path = path.to_path_buf();
        let (handle, files, index) = tokio::task::spawn_blocking(move || {
            let handle = cache.open_read_only(&path)?;
            let files = handle.catalog().get_data_files(None, false)?;
            let index = handle.catalog().get_search_index_file()?;
            Ok::<_, Error>((handle, files, index))
        })
        .await
        .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))??;

        debug!(catalog = %handle.catalog().path().display(), data_files = files.len(),
            "catalog expanded");
        inputs.files.extend(files);
        for (data, file) in index {
            inputs
                .unwind
                .insert(data.to_string_lossy().into_owned(), file);
        }
        inputs.catalogs.push(handle);
        Ok(())
    }

    /// Output paths for a search: user supplied names live in the home,
    /// temporary ones in the instance directory.
    fn outputs(&self, cfg: &SearchConfig) -> Result<Outputs> {
        let home = self.home();
        let instance = self.opts.mount_point.join(&self.opts.instance_name);
        let token = format!(
            "{:016x}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let mut out = Outputs::default();

        if !cfg.keep_index_as.is_empty() {
            out.index = Some(check_relative_to_home(&home, &cfg.keep_index_as)?);
        } else if cfg.report_index || !cfg.keep_view_as.is_empty() || cfg.aggregations.is_some() {
            let p = instance.join(format!(".temp-idx-{token}.txt"));
            out.temp.push(p.clone());
            out.index = Some(p);
        }
        if !cfg.keep_data_as.is_empty() {
            out.data = Some(check_relative_to_home(&home, &cfg.keep_data_as)?);
        } else if cfg.report_data || cfg.aggregations.is_some() {
            let p = instance.join(format!(".temp-dat-{token}.bin"));
            out.temp.push(p.clone());
            out.data = Some(p);
        }
        if !cfg.keep_view_as.is_empty() {
            out.view = Some(check_relative_to_home(&home, &cfg.keep_view_as)?);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct Inputs {
    files: Vec<PathBuf>,
    unwind: HashMap<String, IndexFile>,
    // held until the tool finishes
    guards: Vec<SafeGuard>,
    catalogs: Vec<CatalogHandle>,
}

#[derive(Debug, Default)]
struct Outputs {
    index: Option<PathBuf>,
    data: Option<PathBuf>,
    view: Option<PathBuf>,
    temp: Vec<PathBuf>,
}

fn relative_name(home: &Path, path: &Path) -> String {
    path.strip_prefix(home)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string_lossy().into_owned())
}

/// Tool arguments for a search.
pub fn tool_args(cfg: &SearchConfig, files: &[PathBuf], index: Option<&Path>, data: Option<&Path>) -> Vec<String> {
    let mut args = Vec::new();
    let mode = if !cfg.mode.is_empty() {
        cfg.mode.clone()
    } else if cfg.dist > 0 {
        "fhs".to_string()
    } else {
        "es".to_string()
    };
    args.extend(["-p".to_string(), mode]);
    args.extend(["-q".to_string(), prepare_query(&cfg.query)]);
    for file in files {
        args.extend(["-f".to_string(), file.to_string_lossy().into_owned()]);
    }
    if let Some(data) = data {
        args.extend(["-od".to_string(), data.to_string_lossy().into_owned()]);
    }
    if let Some(index) = index {
        args.extend(["-oi".to_string(), index.to_string_lossy().into_owned()]);
    }
    if cfg.width < 0 {
        args.push("--line".to_string());
    } else if cfg.width > 0 {
        args.extend(["-w".to_string(), cfg.width.to_string()]);
    }
    if cfg.dist > 0 {
        args.extend(["-d".to_string(), cfg.dist.to_string()]);
    }
    if !cfg.case {
        args.push("-i".to_string());
    }
    if cfg.nodes > 0 {
        args.extend(["-n".to_string(), cfg.nodes.to_string()]);
    }
    if !cfg.delimiter.is_empty() {
        args.extend(["-e".to_string(), cfg.delimiter.clone()]);
    }
    args.push("-v".to_string());
    args.extend(cfg.backend.opts.iter().cloned());
    args
}

/// Plain text becomes a `RAW_TEXT CONTAINS` expression; structured queries
/// are passed as is.
fn prepare_query(query: &str) -> String {
    if query.contains("RAW_TEXT") || query.contains("RECORD") {
        query.to_string()
    } else {
        format!("(RAW_TEXT CONTAINS \"{}\")", query.replace('"', "\\\""))
    }
}

/// Parse the statistics printed by the tool.
pub fn parse_stat(output: &[u8], host: &str) -> Result<Stat> {
    let v: serde_yaml::Value = serde_yaml::from_slice(output)
        .map_err(|e| Error::Engine(format!("failed to parse tool output: {e}")))?;
    let number = |name: &str| -> Result<u64> {
        match v.get(name) {
            Some(serde_yaml::Value::Number(n)) => n.as_u64(),
            Some(serde_yaml::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| Error::Engine(format!("failed to parse {name:?} stat")))
    };

    let mut stat = Stat::new(host);
    stat.matches = number("Matches")?;
    stat.total_bytes = number("Total Bytes")?;
    stat.duration = number("Duration")?;
    stat.fabric_duration = number("Fabric Duration").unwrap_or(0);
    stat.fabric_data_rate = match v.get("Fabric Data Rate") {
        Some(serde_yaml::Value::String(s)) => parse_data_rate(s)?,
        Some(serde_yaml::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    };
    if stat.duration > 0 {
        let mb = stat.total_bytes as f64 / (1024.0 * 1024.0);
        stat.data_rate = mb / (stat.duration as f64 / 1000.0);
    }
    Ok(stat)
}

/// `"1.5 GB/sec"` to MB/sec.
pub fn parse_data_rate(raw: &str) -> Result<f64> {
    let s = raw.trim();
    let (num, scale) = if let Some(n) = s.strip_suffix("KB/sec") {
        (n, 1.0 / 1024.0)
    } else if let Some(n) = s.strip_suffix("MB/sec") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix("GB/sec") {
        (n, 1024.0)
    } else {
        (s, 1.0)
    };
    let rate: f64 = num
        .trim()
        .parse()
        .map_err(|e| Error::Engine(format!("failed to parse data rate {raw:?}: {e}")))?;
    if rate.is_finite() {
        Ok(rate * scale)
    } else {
        Ok(0.0)
    }
}

/// Reads records from an INDEX/DATA pair and optionally writes the VIEW.
struct ResultsReader<'a> {
    home: PathBuf,
    host: String,
    index_path: PathBuf,
    data_path: Option<PathBuf>,
    view_path: Option<PathBuf>,
    delimiter: String,
    offset: u64,
    limit: Option<u64>,
    /// Nothing is reported when false, only the VIEW is written.
    report: bool,
    width: i32,
    unwind: &'a HashMap<String, IndexFile>,
    transforms: &'a [Arc<dyn transform::Transform>],
}

impl ResultsReader<'_> {
    fn in_window(&self, pos: u64) -> bool {
        self.report
            && pos >= self.offset
            && self.limit.map_or(true, |l| pos < self.offset.saturating_add(l))
    }

    async fn run(&self, tx: &ResultSender) -> Result<()> {
        let index = File::open(&self.index_path)
            .await
            .map_err(|e| Error::Engine(format!("failed to open INDEX file: {e}")))?;
        let mut lines = BufReader::new(index);
        let mut data = match &self.data_path {
            Some(p) if self.report => Some(
                File::open(p)
                    .await
                    .map_err(|e| Error::Engine(format!("failed to open DATA file: {e}")))?,
            ),
            _ => None,
        };
        let mut view = match &self.view_path {
            Some(p) => Some(ViewWriter::create(p).await?),
            None => None,
        };

        let delim_len = self.delimiter.len() as u64;
        let mut index_pos = 0u64;
        let mut data_pos = 0u64;
        let mut pos = 0u64;
        let mut line = String::new();
        loop {
            line.clear();
            let n = lines.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            if line.trim().is_empty() {
                index_pos += n as u64;
                continue;
            }
            let index = Index::parse_line(&line)
                .ok_or_else(|| Error::Engine(format!("failed to parse INDEX: {:?}", line.trim())))?;

            if let Some(view) = view.as_mut() {
                view.put(ViewItem {
                    index_beg: index_pos as i64,
                    index_end: (index_pos + n as u64) as i64,
                    data_beg: data_pos as i64,
                    data_end: (data_pos + index.length) as i64,
                })
                .await?;
            }

            if self.in_window(pos) {
                let bytes = match data.as_mut() {
                    Some(f) => read_at(f, data_pos, index.length).await?,
                    None => Vec::new(),
                };
                if !self.report_record(tx, index.clone(), bytes).await? {
                    debug!(pos, "records reading cancelled");
                    return Ok(());
                }
            } else if view.is_none() && self.report && pos >= self.offset {
                // past the window and nothing else to write
                break;
            }

            index_pos += n as u64;
            data_pos += index.length + delim_len;
            pos += 1;
        }

        if let Some(view) = view {
            view.finish(index_pos, data_pos).await?;
        }
        Ok(())
    }

    /// Show through a VIEW file: seek straight to the window.
    async fn run_with_view(&self, tx: &ResultSender, view_path: &Path) -> Result<()> {
        let mut view = ViewReader::open(view_path).await?;
        let count = view.header().count;
        let end = match self.limit {
            Some(l) => count.min(self.offset.saturating_add(l)),
            None => count,
        };
        let mut index_file = File::open(&self.index_path)
            .await
            .map_err(|e| Error::Engine(format!("failed to open INDEX file: {e}")))?;
        let mut data = match &self.data_path {
            Some(p) if self.report => Some(File::open(p).await.map_err(|e| {
                Error::Engine(format!("failed to open DATA file: {e}"))
            })?),
            _ => None,
        };

        for pos in self.offset..end {
            let item = view.get(pos).await?;
            let raw = read_at(
                &mut index_file,
                item.index_beg as u64,
                (item.index_end - item.index_beg) as u64,
            )
            .await?;
            let text = String::from_utf8_lossy(&raw);
            let index = Index::parse_line(&text)
                .ok_or_else(|| Error::Engine(format!("failed to parse INDEX: {:?}", text.trim())))?;
            let bytes = match data.as_mut() {
                Some(f) => read_at(f, item.data_beg as u64, (item.data_end - item.data_beg) as u64).await?,
                None => Vec::new(),
            };
            if !self.report_record(tx, index, bytes).await? {
                break;
            }
        }
        Ok(())
    }

    /// Unwind, transform and report one record. Returns false once the
    /// consumer is gone.
    async fn report_record(&self, tx: &ResultSender, index: Index, data: Vec<u8>) -> Result<bool> {
        let (mut index, data) = if self.unwind.contains_key(&index.file) {
            let (unwound, shift) = unwind_all(self.unwind, index, self.width)?;
            let beg = (shift as usize).min(data.len());
            let end = (beg + unwound.length as usize).min(data.len());
            (unwound, data[beg..end].to_vec())
        } else {
            (index, data)
        };
        index.file = relative_name(&self.home, Path::new(&index.file));
        if index.host.is_empty() {
            index.host = self.host.clone();
        }

        let data = if self.transforms.is_empty() || data.is_empty() {
            data
        } else {
            match transform::apply_all(self.transforms, data).await {
                Ok(Some(d)) => d,
                Ok(None) => return Ok(true),
                Err(e) => return Ok(tx.report_error(e).await),
            }
        };
        Ok(tx.report_record(Record::new(index, data)).await)
    }
}

async fn read_at(file: &mut File, pos: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(pos)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| Error::Engine(format!("failed to read DATA at {pos}: {e}")))?;
    Ok(buf)
}

struct SearchTask {
    opts: LocalOptions,
    cfg: SearchConfig,
    inputs: Inputs,
    outputs: Outputs,
    prepare: Duration,
}

impl SearchTask {
    async fn run(self, tx: ResultSender) {
        let stat = match self.execute(&tx).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!(error = %e, "local search failed");
                tx.report_error(e).await;
                None
            }
        };
        self.cleanup().await;
        tx.finish(stat);
    }

    async fn execute(&self, tx: &ResultSender) -> Result<Option<Stat>> {
        if self.inputs.files.is_empty() {
            debug!("no input files, nothing to search");
            return Ok(Some(Stat::new(&self.opts.index_host)));
        }
        for path in [&self.outputs.index, &self.outputs.data].into_iter().flatten() {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }

        let args = tool_args(
            &self.cfg,
            &self.inputs.files,
            self.outputs.index.as_deref(),
            self.outputs.data.as_deref(),
        );
        info!(tool = %self.opts.tool_path, ?args, "executing tool");
        let tool_started = Instant::now();
        let mut child = Command::new(&self.opts.tool_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("failed to start tool: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let read_out = tokio::spawn(read_all(stdout));
        let read_err = tokio::spawn(read_all(stderr));

        let cancelled = tx.cancel_token();
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancelled.cancelled() => {
                warn!("cancelling by client");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "killing tool failed");
                }
                return Ok(None);
            }
        };
        let out = read_out.await.unwrap_or_default();
        let err_out = read_err.await.unwrap_or_default();
        let tool_took = tool_started.elapsed();

        if !status.success() {
            return Err(Error::Engine(format!(
                "tool failed with {status}\n{}{}",
                String::from_utf8_lossy(&out),
                String::from_utf8_lossy(&err_out)
            )));
        }
        let mut stat = parse_stat(&out, &self.opts.index_host)?;
        info!(matches = stat.matches, total_bytes = stat.total_bytes, "parsed statistics");

        let read_started = Instant::now();
        if let Some(index_path) = &self.outputs.index {
            let reader = ResultsReader {
                home: self.opts.home(),
                host: self.opts.index_host.clone(),
                index_path: index_path.clone(),
                data_path: self.outputs.data.clone().filter(|_| self.cfg.report_data),
                view_path: self.outputs.view.clone(),
                delimiter: self.cfg.delimiter.clone(),
                offset: self.cfg.offset,
                limit: self.cfg.limit,
                report: self.cfg.report_index,
                width: self.cfg.width,
                unwind: &self.inputs.unwind,
                transforms: &self.cfg.transforms,
            };
            reader.run(tx).await?;
        }
        if let Some(opts) = &self.cfg.aggregations {
            let aggs = self.aggregate(opts).await?;
            stat.extra.insert(EXTRA_AGGREGATIONS.to_string(), aggs);
        }

        let home = self.opts.home();
        let kept = |name: &str| (!name.is_empty()).then(|| name.to_string());
        if self.outputs.index.is_some() && !self.cfg.keep_index_as.is_empty() {
            stat.add_session_data("index", json!(kept(&self.cfg.keep_index_as)));
            stat.add_session_data("data", json!(kept(&self.cfg.keep_data_as)));
            stat.add_session_data("view", json!(kept(&self.cfg.keep_view_as)));
            stat.add_session_data("delim", json!(self.cfg.delimiter));
            stat.add_session_data("width", json!(self.cfg.width));
            stat.add_session_data("matches", json!(stat.matches));
        }
        debug!(home = %home.display(), "search done");

        if self.cfg.performance {
            stat.add_perf_stat(
                "local",
                json!({
                    "prepare": humantime::format_duration(self.prepare).to_string(),
                    "tool-exec": humantime::format_duration(tool_took).to_string(),
                    "read-data": humantime::format_duration(read_started.elapsed()).to_string(),
                }),
            );
        }
        Ok(Some(stat))
    }

    /// Feed every record of the outputs to the requested aggregations.
    async fn aggregate(&self, opts: &Value) -> Result<Value> {
        let Some(mut aggs) = Aggregations::parse(opts)? else {
            return Ok(Value::Object(Map::new()));
        };
        let (Some(index_path), Some(data_path)) = (&self.outputs.index, &self.outputs.data) else {
            return Err(Error::Internal("no INDEX/DATA to aggregate".to_string()));
        };
        let mut lines = BufReader::new(File::open(index_path).await?).lines();
        let mut data = BufReader::new(File::open(data_path).await?);
        let delim = self.cfg.delimiter.len();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let index = Index::parse_line(&line)
                .ok_or_else(|| Error::Engine(format!("failed to parse INDEX: {:?}", line.trim())))?;
            let mut buf = vec![0u8; index.length as usize + delim];
            data.read_exact(&mut buf)
                .await
                .map_err(|e| Error::Engine(format!("failed to read DATA: {e}")))?;
            buf.truncate(index.length as usize);
            let record = if self.inputs.unwind.contains_key(&index.file) {
                let (unwound, shift) = unwind_all(&self.inputs.unwind, index, self.cfg.width)?;
                let beg = (shift as usize).min(buf.len());
                let end = (beg + unwound.length as usize).min(buf.len());
                buf[beg..end].to_vec()
            } else {
                buf
            };
            aggs.add_data(&record)?;
        }
        debug!(path = %index_path.display(), "aggregations computed");
        Ok(aggs.to_intermediate())
    }

    async fn cleanup(&self) {
        if self.opts.keep_files {
            return;
        }
        for path in &self.outputs.temp {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove temporary file");
                }
            }
        }
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "failed to read tool output");
        }
    }
    buf
}

#[async_trait]
impl Engine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn search(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        let started = Instant::now();
        if cfg.report_data && !cfg.report_index {
            return Err(Error::BadRequest(
                "failed to report DATA without INDEX".to_string(),
            ));
        }
        let home = self.home();
        cfg.check_relative_to_home(&home)?;
        info!(cfg = ?cfg, "start local search");

        let inputs = self.expand_inputs(cfg).await?;
        let outputs = self.outputs(cfg)?;
        let (tx, result) = SearchResult::channel();
        let task = SearchTask {
            opts: self.opts.clone(),
            cfg: cfg.clone(),
            inputs,
            outputs,
            prepare: started.elapsed(),
        };
        tokio::spawn(task.run(tx));
        Ok(result)
    }

    async fn show(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        let home = self.home();
        if cfg.keep_index_as.is_empty() {
            return Err(Error::BadRequest("no INDEX file provided".to_string()));
        }
        let index_path = check_relative_to_home(&home, &cfg.keep_index_as)?;
        let data_path = if cfg.keep_data_as.is_empty() {
            None
        } else {
            Some(check_relative_to_home(&home, &cfg.keep_data_as)?)
        };
        let view_path = if cfg.keep_view_as.is_empty() {
            None
        } else {
            Some(check_relative_to_home(&home, &cfg.keep_view_as)?)
        };
        info!(cfg = ?cfg, "start local show");

        let (tx, result) = SearchResult::channel();
        let opts = self.opts.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let unwind = HashMap::new();
            let reader = ResultsReader {
                home: opts.home(),
                host: opts.index_host.clone(),
                index_path,
                data_path: data_path.filter(|_| cfg.report_data),
                view_path: None,
                delimiter: cfg.delimiter.clone(),
                offset: cfg.offset,
                limit: cfg.limit,
                report: true,
                width: cfg.width,
                unwind: &unwind,
                transforms: &cfg.transforms,
            };
            let res = match view_path.filter(|p| p.exists()) {
                Some(view) => reader.run_with_view(&tx, &view).await,
                None => reader.run(&tx).await,
            };
            if let Err(e) = res {
                warn!(error = %e, "local show failed");
                tx.report_error(e).await;
            }
            tx.finish(Some(Stat::new(opts.index_host)));
        });
        Ok(result)
    }

    async fn files(&self, path: &str, hidden: bool) -> Result<DirInfo> {
        info!(home = %self.home().display(), path, "start /files");
        list_dir(&self.home(), path, hidden).await
    }

    fn options(&self) -> Map<String, Value> {
        let mut opts = Map::new();
        opts.insert("mount-point".into(), json!(self.opts.mount_point));
        opts.insert("home-dir".into(), json!(self.opts.home_dir));
        opts.insert("instance-name".into(), json!(self.opts.instance_name));
        opts.insert("tool-path".into(), json!(self.opts.tool_path));
        opts.insert("index-host".into(), json!(self.opts.index_host));
        opts.insert("keep-files".into(), json!(self.opts.keep_files));
        opts
    }
}
