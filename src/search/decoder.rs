//! Decoder engine: evaluates boolean queries over a simple backend.
//!
//! The backend only understands one scanner expression per run. A query
//! such as `(RAW_TEXT CONTAINS "a") AND (RECORD.x CONTAINS FHS("b", D=1))`
//! is parsed, neighbouring structured comparisons are merged back by the
//! optimizer, and the rest is evaluated step by step:
//!
//! - `A AND B` searches `A` into temporary INDEX/DATA files, imports those
//!   into a work catalog and searches `B` over that catalog only;
//! - `A OR B` runs both and concatenates the results;
//! - `XOR` is rejected.
//!
//! Only the last step of a chain reports records. Those are windowed by
//! the requested offset/limit and written to the requested outputs here,
//! since the backend of that step only ever sees temporary inputs.

use super::query::{self, BooleanOp, Query, SimpleQuery};
use super::stat::EXTRA_AGGREGATIONS;
use super::view::{ViewItem, ViewWriter};
use super::{aggs, DirInfo, Engine, Event, Record, ResultSender, SearchConfig, SearchResult, Stat};
use crate::catalog::{is_catalog, CatalogCache, IndexFile};
use crate::files::{check_relative_to_home, clean_path, delete_all};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// User home; work files live under `home/instance_name`.
    pub home: PathBuf,
    pub instance_name: String,
    /// Keep intermediate files and work catalogs.
    pub keep_files: bool,
    /// Boolean operators per merged expression, `None` for no limit.
    pub optimizer_limit: Option<usize>,
}

pub struct DecoderEngine {
    backend: Arc<dyn Engine>,
    opts: DecoderOptions,
    catalogs: CatalogCache,
}

impl DecoderEngine {
    pub fn new(backend: Arc<dyn Engine>, opts: DecoderOptions, catalogs: CatalogCache) -> Self {
        Self {
            backend,
            opts,
            catalogs,
        }
    }
}

#[async_trait]
impl Engine for DecoderEngine {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn search(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        let query = query::parse(&cfg.query)?.optimize(self.opts.optimizer_limit);
        debug!(query = %query, "decoded query");
        match query {
            Query::Search(simple) => {
                let mut cfg = cfg.clone();
                simple.apply(&mut cfg);
                self.backend.search(&cfg).await
            }
            Query::Boolean(..) => {
                if contains_xor(&query) {
                    return Err(Error::BadRequest("XOR is not implemented yet".to_string()));
                }
                if cfg.report_data && !cfg.report_index {
                    return Err(Error::BadRequest(
                        "failed to report DATA without INDEX".to_string(),
                    ));
                }
                cfg.check_relative_to_home(&self.opts.home)?;
                info!(query = %query, "start boolean search");
                let (tx, result) = SearchResult::channel();
                let task = Chain {
                    backend: self.backend.clone(),
                    opts: self.opts.clone(),
                    catalogs: self.catalogs.clone(),
                    token: format!(
                        "{:016x}",
                        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
                    ),
                    counter: AtomicUsize::new(0),
                    work: Mutex::new(Vec::new()),
                };
                tokio::spawn(task.run(query, cfg.clone(), tx));
                Ok(result)
            }
        }
    }

    async fn show(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        self.backend.show(cfg).await
    }

    async fn files(&self, path: &str, hidden: bool) -> Result<DirInfo> {
        self.backend.files(path, hidden).await
    }

    fn options(&self) -> Map<String, Value> {
        let mut opts = self.backend.options();
        opts.insert("keep-files".into(), json!(self.opts.keep_files));
        opts.insert("optimizer-limit".into(), json!(self.opts.optimizer_limit));
        opts
    }

    fn location(&self) -> Option<String> {
        self.backend.location()
    }
}

fn contains_xor(q: &Query) -> bool {
    match q {
        Query::Search(_) => false,
        Query::Boolean(BooleanOp::Xor, _, _) => true,
        Query::Boolean(_, a, b) => contains_xor(a) || contains_xor(b),
    }
}

/// What a step feeds into the next one.
#[derive(Debug, Default)]
struct Outcome {
    stat: Stat,
    /// INDEX/DATA pairs written by intermediate steps, home relative.
    outputs: Vec<StepOutput>,
}

#[derive(Debug, Clone)]
struct StepOutput {
    index: String,
    data: String,
    delimiter: String,
    width: i32,
    /// Catalog data files the step searched, for unwinding.
    unwind: Arc<HashMap<String, IndexFile>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Results go to the client.
    Final,
    /// Results only feed the next step.
    Intermediate,
}

/// One evaluation of a boolean query.
struct Chain {
    backend: Arc<dyn Engine>,
    opts: DecoderOptions,
    catalogs: CatalogCache,
    token: String,
    counter: AtomicUsize,
    /// Temporary files and work catalogs, home relative.
    work: Mutex<Vec<String>>,
}

impl Chain {
    async fn run(self, query: Query, cfg: SearchConfig, tx: ResultSender) {
        let stat = match self.execute(&query, &cfg, &tx).await {
            Ok(stat) => Some(stat),
            Err(e) => {
                warn!(error = %e, "boolean search failed");
                tx.report_error(e).await;
                None
            }
        };
        self.cleanup().await;
        tx.finish(stat);
    }

    async fn execute(&self, query: &Query, cfg: &SearchConfig, tx: &ResultSender) -> Result<Stat> {
        let mut sink = Sink::default();
        sink.open(&self.opts.home, cfg).await?;
        let sink = tokio::sync::Mutex::new(sink);

        let out = self
            .eval(query, cfg.files.clone(), cfg, Role::Final, &sink, tx)
            .await?;
        let mut stat = out.stat;
        sink.into_inner().close(cfg, &mut stat).await?;
        Ok(stat)
    }

    fn eval<'a>(
        &'a self,
        query: &'a Query,
        files: Vec<String>,
        cfg: &'a SearchConfig,
        role: Role,
        sink: &'a tokio::sync::Mutex<Sink>,
        tx: &'a ResultSender,
    ) -> BoxFuture<'a, Result<Outcome>> {
        async move {
            if tx.is_cancelled() {
                return Err(cancelled());
            }
            match query {
                Query::Search(simple) => match role {
                    Role::Final => self.final_step(simple, files, cfg, sink, tx).await,
                    Role::Intermediate => self.intermediate_step(simple, files, cfg, tx).await,
                },
                Query::Boolean(BooleanOp::And, a, b) => {
                    let first = self.eval(a, files, cfg, Role::Intermediate, sink, tx).await?;
                    if first.stat.matches == 0 {
                        debug!(query = %a, "nothing found, skipping the rest of AND");
                        let mut out = Outcome {
                            stat: first.stat,
                            outputs: Vec::new(),
                        };
                        out.stat.matches = 0;
                        return Ok(out);
                    }
                    let catalog = self.import(&first.outputs).await?;
                    let second = self.eval(b, vec![catalog], cfg, role, sink, tx).await?;
                    let matches = second.stat.matches;
                    let mut stat = combine(first.stat, second.stat);
                    stat.matches = matches;
                    Ok(Outcome {
                        stat,
                        outputs: second.outputs,
                    })
                }
                Query::Boolean(BooleanOp::Or, a, b) => {
                    let first = self.eval(a, files.clone(), cfg, role, sink, tx).await?;
                    let second = self.eval(b, files, cfg, role, sink, tx).await?;
                    let mut outputs = first.outputs;
                    outputs.extend(second.outputs);
                    Ok(Outcome {
                        stat: combine(first.stat, second.stat),
                        outputs,
                    })
                }
                Query::Boolean(BooleanOp::Xor, _, _) => {
                    Err(Error::BadRequest("XOR is not implemented yet".to_string()))
                }
            }
        }
        .boxed()
    }

    fn next_name(&self, kind: &str, ext: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!(
            "{}/.temp-{kind}-{}-{n}{ext}",
            self.opts.instance_name.trim_matches('/'),
            self.token
        );
        self.work.lock().push(name.clone());
        name
    }

    fn step_config(&self, simple: &SimpleQuery, files: Vec<String>, cfg: &SearchConfig) -> SearchConfig {
        let mut step = cfg.clone();
        simple.apply(&mut step);
        step.files = files;
        step.keep_data_as.clear();
        step.keep_index_as.clear();
        step.keep_view_as.clear();
        step.lifetime = None;
        step.post_exec = None;
        step.offset = 0;
        step.limit = None;
        step
    }

    async fn intermediate_step(
        &self,
        simple: &SimpleQuery,
        files: Vec<String>,
        cfg: &SearchConfig,
        tx: &ResultSender,
    ) -> Result<Outcome> {
        let mut step = self.step_config(simple, files, cfg);
        step.keep_index_as = self.next_name("idx", ".txt");
        step.keep_data_as = self.next_name("dat", ".bin");
        step.delimiter = self.catalogs.options().default_delimiter.clone();
        if simple.structured {
            step.width = 0;
        }
        step.limit = Some(0);
        step.report_index = false;
        step.report_data = false;
        step.transforms.clear();
        step.transform_rules.clear();
        step.aggregations = None;

        let unwind = Arc::new(self.unwind_map(&step.files).await?);
        debug!(query = %step.query, index = %step.keep_index_as, "intermediate step");
        let res = self.backend.search(&step).await?;
        let stat = forward_errors(res, tx).await?;
        Ok(Outcome {
            stat,
            outputs: vec![StepOutput {
                index: step.keep_index_as,
                data: step.keep_data_as,
                delimiter: step.delimiter,
                width: step.width,
                unwind,
            }],
        })
    }

    async fn final_step(
        &self,
        simple: &SimpleQuery,
        files: Vec<String>,
        cfg: &SearchConfig,
        sink: &tokio::sync::Mutex<Sink>,
        tx: &ResultSender,
    ) -> Result<Outcome> {
        let mut step = self.step_config(simple, files, cfg);
        step.report_index = cfg.report_index || !cfg.keep_index_as.is_empty();
        step.report_data =
            step.report_index && (cfg.report_data || !cfg.keep_data_as.is_empty());
        debug!(query = %step.query, "final step");

        let mut res = self.backend.search(&step).await?;
        let mut sink = sink.lock().await;
        while let Some(ev) = next_event(&mut res, tx).await? {
            match ev {
                Event::Record(rec) => {
                    if let Some(rec) = sink.put(cfg, rec).await? {
                        if !tx.report_record(rec).await {
                            res.cancel();
                            return Err(cancelled());
                        }
                    }
                }
                Event::Error(e) => {
                    if !tx.report_error(e).await {
                        res.cancel();
                        return Err(cancelled());
                    }
                }
            }
        }
        Ok(Outcome {
            stat: finished(res)?,
            outputs: Vec::new(),
        })
    }

    /// Import intermediate outputs into a fresh work catalog.
    async fn import(&self, outputs: &[StepOutput]) -> Result<String> {
        let name = self.next_name("res", ".db");
        let path = check_relative_to_home(&self.opts.home, &name)?;
        let handle = self.catalogs.open(&path)?;
        for out in outputs {
            let data = clean_path(&self.opts.home.join(&out.data));
            let index = self.opts.home.join(&out.index);
            if !index.exists() {
                continue;
            }
            handle
                .catalog()
                .add_search_results(&data, &index, &out.delimiter, out.width, &out.unwind)
                .await?;
        }
        debug!(catalog = %name, steps = outputs.len(), "intermediate results imported");
        Ok(name)
    }

    /// Index files of the catalogs among `files`, keyed by data path.
    async fn unwind_map(&self, files: &[String]) -> Result<HashMap<String, IndexFile>> {
        let home = self.opts.home.clone();
        let cache = self.catalogs.clone();
        let files = files.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut map = HashMap::new();
            for pattern in &files {
                let mask = check_relative_to_home(&home, pattern)?;
                for path in glob::glob(&mask.to_string_lossy())?.flatten() {
                    if !is_catalog(&path) {
                        continue;
                    }
                    let handle = cache.open_read_only(&path)?;
                    for (data, file) in handle.catalog().get_search_index_file()? {
                        map.insert(data.to_string_lossy().into_owned(), file);
                    }
                }
            }
            Ok::<_, Error>(map)
        })
        .await
        .map_err(|e| Error::Internal(format!("catalog task failed: {e}")))?
    }

    async fn cleanup(&self) {
        if self.opts.keep_files {
            return;
        }
        let work = std::mem::take(&mut *self.work.lock());
        if work.is_empty() {
            return;
        }
        for (name, status) in delete_all(&self.opts.home, &work, Some(&self.catalogs)).await {
            if status != "OK" {
                warn!(file = %name, error = %status, "failed to remove work file");
            }
        }
    }
}

fn cancelled() -> Error {
    Error::Engine("search cancelled".to_string())
}

/// Next event of a step, giving up once the client cancels.
async fn next_event(res: &mut SearchResult, tx: &ResultSender) -> Result<Option<Event>> {
    let token = tx.cancel_token();
    tokio::select! {
        ev = res.next_event() => Ok(ev),
        _ = token.cancelled() => {
            res.cancel();
            Err(cancelled())
        }
    }
}

fn finished(mut res: SearchResult) -> Result<Stat> {
    res.take_stat()
        .ok_or_else(|| Error::Engine("step finished without statistics".to_string()))
}

/// Run an intermediate step to completion, passing its errors on.
async fn forward_errors(mut res: SearchResult, tx: &ResultSender) -> Result<Stat> {
    while let Some(ev) = next_event(&mut res, tx).await? {
        if let Event::Error(e) = ev {
            if !tx.report_error(e).await {
                res.cancel();
                return Err(cancelled());
            }
        }
    }
    finished(res)
}

/// Statistics of two consecutive steps: counters and durations add up.
fn combine(a: Stat, b: Stat) -> Stat {
    let mut out = Stat::new(if a.host.is_empty() { b.host.clone() } else { a.host.clone() });
    out.matches = a.matches + b.matches;
    out.total_bytes = a.total_bytes + b.total_bytes;
    out.duration = a.duration + b.duration;
    out.fabric_duration = a.fabric_duration + b.fabric_duration;
    let mb = out.total_bytes as f64 / (1024.0 * 1024.0);
    if out.duration > 0 {
        out.data_rate = mb / (out.duration as f64 / 1000.0);
    }
    if out.fabric_duration > 0 {
        out.fabric_data_rate = mb / (out.fabric_duration as f64 / 1000.0);
    }

    let mut merged: Option<Value> = None;
    for s in [&a, &b] {
        if let Some(x) = s.extra.get(EXTRA_AGGREGATIONS) {
            match merged.as_mut() {
                Some(m) => aggs::merge_intermediate(m, x),
                None => merged = Some(x.clone()),
            }
        }
    }
    if let Some(m) = merged {
        out.extra.insert(EXTRA_AGGREGATIONS.to_string(), m);
    }
    out.details = vec![a, b];
    out
}

/// Requested outputs of a boolean search and the client window.
#[derive(Default)]
struct Sink {
    index: Option<BufWriter<tokio::fs::File>>,
    data: Option<BufWriter<tokio::fs::File>>,
    view: Option<ViewWriter>,
    index_pos: u64,
    data_pos: u64,
    pos: u64,
}

impl Sink {
    async fn open(&mut self, home: &Path, cfg: &SearchConfig) -> Result<()> {
        async fn create(home: &Path, name: &str) -> Result<Option<tokio::fs::File>> {
            if name.is_empty() {
                return Ok(None);
            }
            let path = check_relative_to_home(home, name)?;
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            Ok(Some(tokio::fs::File::create(path).await?))
        }
        self.index = create(home, &cfg.keep_index_as).await?.map(BufWriter::new);
        self.data = create(home, &cfg.keep_data_as).await?.map(BufWriter::new);
        if !cfg.keep_view_as.is_empty() {
            let path = check_relative_to_home(home, &cfg.keep_view_as)?;
            self.view = Some(ViewWriter::create(path).await?);
        }
        Ok(())
    }

    /// Write `rec` to the outputs; returns it when inside the window.
    async fn put(&mut self, cfg: &SearchConfig, mut rec: Record) -> Result<Option<Record>> {
        let line = format!("{}\n", rec.index.to_line());
        if let Some(w) = self.index.as_mut() {
            w.write_all(line.as_bytes()).await?;
        }
        if let Some(w) = self.data.as_mut() {
            w.write_all(&rec.data).await?;
            w.write_all(cfg.delimiter.as_bytes()).await?;
        }
        if let Some(v) = self.view.as_mut() {
            v.put(ViewItem {
                index_beg: self.index_pos as i64,
                index_end: (self.index_pos + line.len() as u64) as i64,
                data_beg: self.data_pos as i64,
                data_end: (self.data_pos + rec.data.len() as u64) as i64,
            })
            .await?;
        }
        self.index_pos += line.len() as u64;
        self.data_pos += (rec.data.len() + cfg.delimiter.len()) as u64;

        let pos = self.pos;
        self.pos += 1;
        let in_window = cfg.report_index
            && pos >= cfg.offset
            && cfg.limit.map_or(true, |l| pos < cfg.offset.saturating_add(l));
        if !in_window {
            return Ok(None);
        }
        if !cfg.report_data {
            rec.data.clear();
        }
        Ok(Some(rec))
    }

    async fn close(self, cfg: &SearchConfig, stat: &mut Stat) -> Result<()> {
        for w in [self.index, self.data].into_iter().flatten() {
            let mut w = w;
            w.flush().await?;
        }
        if let Some(v) = self.view {
            v.finish(self.index_pos, self.data_pos).await?;
        }
        if !cfg.keep_index_as.is_empty() {
            let kept = |name: &str| (!name.is_empty()).then(|| name.to_string());
            stat.add_session_data("index", json!(cfg.keep_index_as));
            stat.add_session_data("data", json!(kept(&cfg.keep_data_as)));
            stat.add_session_data("view", json!(kept(&cfg.keep_view_as)));
            stat.add_session_data("delim", json!(cfg.delimiter));
            stat.add_session_data("width", json!(cfg.width));
            stat.add_session_data("matches", json!(stat.matches));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogOptions;
    use crate::search::fake::{FakeEngine, ScanOptions};
    use tempfile::TempDir;

    fn engine(dir: &TempDir, keep_files: bool) -> DecoderEngine {
        std::fs::create_dir_all(dir.path().join("u")).unwrap();
        let backend = FakeEngine::scan(ScanOptions {
            mount_point: dir.path().to_path_buf(),
            home_dir: "u".into(),
            host: "n1".into(),
        });
        DecoderEngine::new(
            Arc::new(backend),
            DecoderOptions {
                home: dir.path().join("u"),
                instance_name: ".work".into(),
                keep_files,
                optimizer_limit: None,
            },
            CatalogCache::new(CatalogOptions {
                drop_timeout: std::time::Duration::ZERO,
                ..Default::default()
            }),
        )
    }

    async fn drain(mut res: SearchResult) -> (Vec<Record>, Vec<Error>, Stat) {
        let mut records = Vec::new();
        let mut errors = Vec::new();
        while let Some(ev) = res.next_event().await {
            match ev {
                Event::Record(r) => records.push(r),
                Event::Error(e) => errors.push(e),
            }
        }
        (records, errors, res.take_stat().unwrap_or_default())
    }

    fn lines(dir: &TempDir) -> SearchConfig {
        std::fs::write(
            dir.path().join("u/a.txt"),
            "apple pie\nbanana split\napple banana shake\ncherry\nbanana apple\n",
        )
        .unwrap();
        let mut cfg = SearchConfig::new("", vec!["a.txt".into()]);
        cfg.width = -1;
        cfg
    }

    fn texts(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| String::from_utf8_lossy(&r.data).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn and_searches_the_first_results_only() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);
        let mut cfg = lines(&dir);
        cfg.width = 8;
        cfg.query = r#"(RAW_TEXT CONTAINS "apple") AND (RAW_TEXT CONTAINS "banana")"#.into();

        let (records, errors, stat) = drain(engine.search(&cfg).await.unwrap()).await;
        assert!(errors.is_empty(), "{errors:?}");
        // three "apple" hits, two of them have "banana" within 8 bytes
        assert_eq!(stat.matches, 2);
        assert_eq!(records.len(), 2);
        for r in &records {
            assert_eq!(r.index.file, "a.txt");
            assert!(String::from_utf8_lossy(&r.data).contains("banana"));
        }
        assert_eq!(stat.details.len(), 2);
        assert_eq!(stat.details[0].matches, 3);

        let work = dir.path().join("u/.work");
        let left: Vec<_> = std::fs::read_dir(&work)
            .map(|d| d.flatten().map(|e| e.file_name()).collect())
            .unwrap_or_default();
        assert!(left.is_empty(), "{left:?}");
    }

    #[tokio::test]
    async fn and_with_no_first_matches_skips_the_second_step() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);
        let mut cfg = lines(&dir);
        cfg.query = r#"(RAW_TEXT CONTAINS "durian") AND (RAW_TEXT CONTAINS "apple")"#.into();

        let (records, errors, stat) = drain(engine.search(&cfg).await.unwrap()).await;
        assert!(records.is_empty());
        assert!(errors.is_empty());
        assert_eq!(stat.matches, 0);
    }

    #[tokio::test]
    async fn or_concatenates_and_windows_results() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);
        let mut cfg = lines(&dir);
        cfg.width = 0;
        cfg.query = r#"(RAW_TEXT CONTAINS "cherry") OR (RAW_TEXT CONTAINS "apple")"#.into();
        cfg.keep_index_as = "out/i.txt".into();
        cfg.keep_data_as = "out/d.bin".into();
        cfg.delimiter = "\n".into();
        cfg.limit = Some(2);

        let (records, errors, stat) = drain(engine.search(&cfg).await.unwrap()).await;
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(stat.matches, 4);
        assert_eq!(texts(&records), vec!["cherry", "apple"]);

        // every match lands in the kept outputs, not just the window
        let index = std::fs::read_to_string(dir.path().join("u/out/i.txt")).unwrap();
        assert_eq!(index.lines().count(), 4);
        let data = std::fs::read_to_string(dir.path().join("u/out/d.bin")).unwrap();
        assert_eq!(data, "cherry\napple\napple\napple\n");
        let session = stat.session_data().unwrap();
        assert_eq!(session["index"], "out/i.txt");
        assert_eq!(session["matches"], 4);
    }

    #[tokio::test]
    async fn kept_outputs_show_back() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);
        let mut cfg = lines(&dir);
        cfg.width = 0;
        cfg.query = r#"(RAW_TEXT CONTAINS "banana") AND (RAW_TEXT CONTAINS "ban")"#.into();
        cfg.keep_index_as = "i.txt".into();
        cfg.keep_data_as = "d.bin".into();
        cfg.delimiter = "\n".into();
        cfg.report_index = false;
        cfg.report_data = false;

        let (records, _, stat) = drain(engine.search(&cfg).await.unwrap()).await;
        assert!(records.is_empty());
        assert_eq!(stat.matches, 3);

        let mut show = SearchConfig::default();
        show.keep_index_as = "i.txt".into();
        show.keep_data_as = "d.bin".into();
        show.delimiter = "\n".into();
        show.offset = 1;
        let (shown, _, _) = drain(engine.show(&show).await.unwrap()).await;
        assert_eq!(texts(&shown), vec!["ban", "ban"]);
        assert!(shown.iter().all(|r| r.index.file == "a.txt"));
    }

    #[tokio::test]
    async fn keep_files_leaves_work_catalogs() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, true);
        let mut cfg = lines(&dir);
        cfg.width = 4;
        cfg.query = r#"(RAW_TEXT CONTAINS "apple") AND (RAW_TEXT CONTAINS "pie")"#.into();

        let (records, _, _) = drain(engine.search(&cfg).await.unwrap()).await;
        assert_eq!(records.len(), 1);
        assert!(texts(&records)[0].ends_with("pie"));
        let work: Vec<String> = std::fs::read_dir(dir.path().join("u/.work"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(work.iter().any(|n| n.starts_with(".temp-res-") && n.ends_with(".db")));
        assert!(work.iter().any(|n| n.starts_with(".temp-idx-")));
    }

    #[tokio::test]
    async fn simple_and_bad_queries() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false);
        let mut cfg = lines(&dir);
        cfg.width = 0;
        cfg.query = "cherry".into();
        let (records, _, _) = drain(engine.search(&cfg).await.unwrap()).await;
        assert_eq!(texts(&records), vec!["cherry"]);

        cfg.query = r#"(RAW_TEXT CONTAINS "a") XOR (RAW_TEXT CONTAINS "b")"#.into();
        let err = engine.search(&cfg).await.err().unwrap();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("XOR"));

        cfg.query = r#"(RAW_TEXT CONTAINS "a") AND"#.into();
        assert_eq!(engine.search(&cfg).await.err().unwrap().status_code(), 400);
        assert_eq!(engine.name(), "fake");
        assert_eq!(engine.options()["keep-files"], json!(false));
    }

    #[test]
    fn combined_stats_add_up() {
        let mut a = Stat::new("n1");
        a.matches = 3;
        a.total_bytes = 1024 * 1024;
        a.duration = 500;
        let mut b = Stat::new("n1");
        b.matches = 1;
        b.total_bytes = 1024 * 1024;
        b.duration = 500;
        let s = combine(a, b);
        assert_eq!(s.matches, 4);
        assert_eq!(s.duration, 1000);
        assert!((s.data_rate - 2.0).abs() < 1e-9);
        assert_eq!(s.details.len(), 2);
    }
}
