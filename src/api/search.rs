//! `/search`, `/count`, `/pcap/*` and `/search/show`.
//!
//! A handler binds the parameters, asks the dispatcher for an engine and
//! starts the search. It then reads ahead until the first record, so a
//! search that fails with a single error and nothing else is reported with
//! an error status instead of an empty success. After that the response
//! headers go out and a drain task streams the rest of the result through
//! the encoder. The drain stops and cancels the search when the client goes
//! away.

use super::encoder::{negotiate, Encoder, Mime};
use super::error::{panic_message, ApiError};
use super::format::{Format, FormatOptions};
use super::params::{Params, SearchParams, ShowParams};
use super::{ApiState, Caller};
use crate::cluster::BusyGuard;
use crate::jobs::DELETE_FILE;
use crate::postproc::{JobSink, PostExecJob};
use crate::search::mux::MuxEngine;
use crate::search::{aggs, Engine, Event, SearchConfig, SearchResult, Stat};
use crate::session::Session;
use crate::user_config;
use crate::Result;
use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Chunks buffered between the drain and the response body.
const BODY_CHANNEL_SIZE: usize = 16;

/// Lifetime of post-processing files when nothing else is configured.
const DEFAULT_JOB_FILE_LIFETIME: Duration = Duration::from_secs(3600);

const EXTRA_SESSION: &str = "session";
const EXTRA_REQUEST: &str = "request";
const EXTRA_POST_EXEC: &str = "post-exec";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Search,
    Count,
    PcapSearch,
    PcapCount,
}

impl Kind {
    fn is_count(self) -> bool {
        matches!(self, Self::Count | Self::PcapCount)
    }

    fn is_pcap(self) -> bool {
        matches!(self, Self::PcapSearch | Self::PcapCount)
    }
}

pub(super) async fn search(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    handle_search(state, caller, query, headers, Kind::Search).await
}

pub(super) async fn count(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    handle_search(state, caller, query, headers, Kind::Count).await
}

pub(super) async fn pcap_search(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    handle_search(state, caller, query, headers, Kind::PcapSearch).await
}

pub(super) async fn pcap_count(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    handle_search(state, caller, query, headers, Kind::PcapCount).await
}

pub(super) async fn show(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    match start_show(state, caller, query, &headers).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "show failed");
            e.into_response()
        }
    }
}

async fn handle_search(
    state: ApiState,
    caller: Caller,
    query: Option<String>,
    headers: HeaderMap,
    kind: Kind,
) -> Response {
    match start_search(state, caller, query, &headers, kind).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, ?kind, "search failed");
            e.into_response()
        }
    }
}

fn accept(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::ACCEPT).and_then(|v| v.to_str().ok())
}

fn error_prefix(state: &ApiState, enabled: bool) -> String {
    if enabled {
        format!("[{}]: ", state.config.host_name)
    } else {
        String::new()
    }
}

fn bad_params(e: crate::Error) -> ApiError {
    ApiError::context("failed to parse request parameters", e)
}

async fn start_search(
    state: ApiState,
    caller: Caller,
    query: Option<String>,
    headers: &HeaderMap,
    kind: Kind,
) -> std::result::Result<Response, ApiError> {
    let started = Instant::now();
    let mut params = SearchParams::bind(&Params::parse(query.as_deref())).map_err(bad_params)?;

    if kind.is_count() {
        params.format = "null".to_string();
        params.limit = Some(0);
        params.stats = true;
    }
    if kind.is_pcap() {
        params.mode = "pcap".to_string();
        if !params.transforms.is_empty() {
            return Err(ApiError::bad_request(
                "transformations are not supported for PCAP search",
            ));
        }
        if !matches!(params.format.as_str(), "raw" | "json" | "null") {
            return Err(ApiError::bad_request(format!(
                "{:?} format is not supported for PCAP search",
                params.format
            )));
        }
    }

    let mime = negotiate(accept(headers));
    let format = Format::new(
        &params.format,
        &FormatOptions {
            fields: params.fields.clone(),
            separator: params.csv_separator.clone(),
            columns: params.csv_columns.clone(),
            as_array: false,
        },
    )
    .map_err(|e| ApiError::context("failed to get transcoder", e))?;

    let mut cfg = params
        .to_config(&state.config.post_proc_scripts)
        .map_err(bad_params)?;
    let home = state.home_of(&caller.user).to_string();
    let home_path = state.home_path(&caller.user)?;
    cfg.check_relative_to_home(&home_path)?;

    if cfg.data_format.is_empty() {
        match user_config::load(state.mount(), &home, &state.config.default_user_config).await {
            Ok(uc) => {
                if let Some(f) = uc.data_format_for(&cfg.files) {
                    cfg.data_format = f.to_string();
                }
            }
            Err(e) => warn!(error = %e, "failed to load user configuration"),
        }
    }

    let post_exec = match params.post_exec() {
        Some(mut job) => {
            if !state.post_processors.contains_key(&job.job_type) {
                return Err(ApiError::bad_request(format!(
                    "{:?} is unknown post-processing job type",
                    job.job_type
                )));
            }
            let dir = &state.config.catalogs.temp_dir;
            job.data_path = dir.join(format!("job-{}.csv", job.id));
            job.index_path = dir.join(format!("job-{}.txt", job.id));
            Some(job)
        }
        None => None,
    };
    cfg.post_exec = post_exec.clone();
    let sink = match &post_exec {
        Some(job) => Some(
            JobSink::create(job)
                .await
                .map_err(|e| ApiError::context("failed to create post-processing files", e))?,
        ),
        None => None,
    };

    let engine = state
        .dispatcher
        .build_engine(
            params.local,
            &cfg.files,
            caller.auth(),
            &home,
            &caller.user.cluster_tag,
        )
        .await
        .map_err(|e| ApiError::context("failed to get search engine", e))?;
    info!(
        engine = engine.name(),
        query = %cfg.query,
        files = ?cfg.files,
        user = %caller.user.username,
        "start search"
    );

    let busy = state.busyness.start_search();
    let prepare = started.elapsed();
    let res = engine
        .search(&cfg)
        .await
        .map_err(|e| ApiError::context("failed to start search", e))?;
    let engine_time = started.elapsed().saturating_sub(prepare);

    let outputs = [&cfg.keep_data_as, &cfg.keep_index_as, &cfg.keep_view_as]
        .into_iter()
        .filter(|name| !name.is_empty())
        .map(|name| home_path.join(name.trim_start_matches('/')))
        .collect();
    let request = if state.config.extra_request {
        serde_json::to_value(&params).ok()
    } else {
        None
    };

    let plan = DrainPlan {
        error_prefix: error_prefix(&state, params.internal_error_prefix),
        state,
        format,
        mime,
        stream: params.stream,
        stats: params.stats,
        performance: params.performance.then_some(("rest-search", prepare, engine_time)),
        issue_session: !params.internal_no_session_id,
        aggregations: cfg
            .aggregations
            .clone()
            .filter(|_| !params.internal_no_session_id),
        request,
        lifetime: cfg.lifetime,
        outputs,
        post_exec: post_exec.zip(sink),
        started,
        busy: Some(busy),
    };
    respond(res, plan).await
}

async fn start_show(
    state: ApiState,
    caller: Caller,
    query: Option<String>,
    headers: &HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let started = Instant::now();
    let params = ShowParams::bind(&Params::parse(query.as_deref())).map_err(bad_params)?;
    let mime = negotiate(accept(headers));
    let format = Format::new(
        &params.format,
        &FormatOptions {
            fields: params.fields.clone(),
            separator: params.csv_separator.clone(),
            columns: params.csv_columns.clone(),
            as_array: false,
        },
    )
    .map_err(|e| ApiError::context("failed to get transcoder", e))?;

    let home = state.home_of(&caller.user).to_string();
    let home_path = state.home_path(&caller.user)?;

    let res = if params.session.is_empty() {
        let cfg = params.to_config().map_err(bad_params)?;
        cfg.check_relative_to_home(&home_path)?;
        debug!(data = %cfg.keep_data_as, index = %cfg.keep_index_as, "show without session");
        state
            .dispatcher
            .local_engine(&home)?
            .show(&cfg)
            .await
            .map_err(|e| ApiError::context("failed to start show", e))?
    } else {
        let session = state
            .sessions
            .parse(&params.session)
            .map_err(|e| ApiError::context("failed to parse session token", e))?;
        let info = session.info()?;
        let matches: Vec<u64> = info.iter().map(|n| n.matches).collect();
        let slices = plan_show(&matches, params.offset, params.count);
        debug!(nodes = info.len(), ?slices, "show plan");

        let mut pairs: Vec<(Arc<dyn Engine>, SearchConfig)> = Vec::with_capacity(slices.len());
        for slice in slices {
            let node = &info[slice.node];
            let local = node.location.is_empty() || state.dispatcher.is_local_url(&node.location);

            let mut cfg = SearchConfig::default();
            cfg.keep_data_as = node.data.clone().unwrap_or_default();
            cfg.keep_index_as = node.index.clone().unwrap_or_default();
            cfg.keep_view_as = node.view.clone().unwrap_or_default();
            cfg.delimiter = node.delim.clone().unwrap_or_default();
            cfg.width = node.width.unwrap_or(0);
            cfg.offset = slice.offset;
            cfg.limit = Some(slice.limit);
            cfg.report_index = true;
            cfg.report_data = !format.is_null();
            cfg.data_format = params.internal_format.clone();
            cfg.performance = params.performance;

            let engine = if local {
                cfg.check_relative_to_home(&home_path)?;
                state.dispatcher.local_engine(&home)?
            } else {
                state
                    .dispatcher
                    .remote_engine(&node.location, caller.auth())?
            };
            pairs.push((engine, cfg));
        }
        MuxEngine::start(state.dispatcher.host_name(), pairs, None, true)
            .await
            .map_err(|e| ApiError::context("failed to start show", e))?
    };
    let prepare = started.elapsed();

    let plan = DrainPlan {
        error_prefix: error_prefix(&state, params.internal_error_prefix),
        state,
        format,
        mime,
        stream: params.stream,
        stats: params.stats,
        performance: params.performance.then_some(("rest-show", prepare, Duration::ZERO)),
        issue_session: false,
        aggregations: None,
        request: None,
        lifetime: None,
        outputs: Vec::new(),
        post_exec: None,
        started,
        busy: None,
    };
    respond(res, plan).await
}

/// Part of a show request served by one session node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShowSlice {
    /// Position of the node in the session.
    pub node: usize,
    /// First record, relative to the node.
    pub offset: u64,
    pub limit: u64,
}

/// Split the global window `[offset, offset + count)` over nodes holding
/// `matches[i]` records each, in session order. A missing or zero count
/// reads to the end.
pub fn plan_show(matches: &[u64], offset: u64, count: Option<u64>) -> Vec<ShowSlice> {
    let window_end = count.filter(|&c| c > 0).map(|c| offset.saturating_add(c));
    let mut out = Vec::new();
    let mut beg = 0u64;
    for (node, &n) in matches.iter().enumerate() {
        let end = beg.saturating_add(n);
        let skip = n == 0 || end <= offset || window_end.is_some_and(|w| beg >= w);
        if !skip {
            let from = offset.saturating_sub(beg);
            let to = match window_end {
                Some(w) => n.min(w - beg),
                None => n,
            };
            out.push(ShowSlice {
                node,
                offset: from,
                limit: to - from,
            });
        }
        beg = end;
    }
    out
}

/// Everything the drain needs besides the result.
struct DrainPlan {
    state: ApiState,
    format: Format,
    mime: Mime,
    stream: bool,
    stats: bool,
    error_prefix: String,
    /// Perf stat name, prepare and engine start durations.
    performance: Option<(&'static str, Duration, Duration)>,
    issue_session: bool,
    /// Aggregations to finalize; nodes answering a peer leave them intermediate.
    aggregations: Option<Value>,
    request: Option<Value>,
    lifetime: Option<Duration>,
    /// Kept search outputs, deleted after `lifetime`.
    outputs: Vec<PathBuf>,
    post_exec: Option<(PostExecJob, JobSink)>,
    started: Instant,
    busy: Option<BusyGuard>,
}

/// Read ahead to the first record, then hand the rest to a drain task.
async fn respond(
    mut res: SearchResult,
    plan: DrainPlan,
) -> std::result::Result<Response, ApiError> {
    let mut pending = Vec::new();
    while let Some(ev) = res.next_event().await {
        let is_record = matches!(ev, Event::Record(_));
        pending.push(ev);
        if is_record {
            break;
        }
    }
    let single_error = res.is_done()
        && res.stat().is_none()
        && pending.len() == 1
        && matches!(pending[0], Event::Error(_));
    if single_error {
        if let Some(Event::Error(e)) = pending.pop() {
            let mut err = ApiError::from(e);
            err.message = format!("{}{}", plan.error_prefix, err.message);
            return Err(err);
        }
    }

    let encoder = Encoder::new(plan.mime, plan.stream);
    let content_type = encoder.content_type();
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_SIZE);
    let drain = Drain {
        plan,
        encoder: Arc::new(Mutex::new(encoder)),
        tx,
    };
    tokio::spawn(drain.run(res, pending));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

struct Drain {
    plan: DrainPlan,
    encoder: Arc<Mutex<Encoder>>,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl Drain {
    async fn run(mut self, res: SearchResult, pending: Vec<Event>) {
        let encoder = self.encoder.clone();
        let tx = self.tx.clone();
        let prefix = self.plan.error_prefix.clone();

        let outcome = AssertUnwindSafe(self.drain(res, pending)).catch_unwind().await;
        if let Err(panic) = outcome {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "search drain panicked");
            let chunk = {
                let mut enc = encoder.lock();
                let mut out = Vec::new();
                if let Ok(b) = enc.error(&format!("{prefix}internal server error: {message}")) {
                    out.extend_from_slice(&b);
                }
                if let Ok(b) = enc.finish(None) {
                    out.extend_from_slice(&b);
                }
                Bytes::from(out)
            };
            let _ = tx.send(Ok(chunk)).await;
        }
    }

    async fn drain(&mut self, mut res: SearchResult, pending: Vec<Event>) {
        let transfer = Instant::now();
        for ev in pending {
            if !self.handle(ev).await {
                self.abandon(res);
                return;
            }
        }

        loop {
            let ev = tokio::select! {
                _ = self.tx.closed() => {
                    self.abandon(res);
                    return;
                }
                ev = res.next_event() => ev,
            };
            match ev {
                Some(ev) => {
                    if !self.handle(ev).await {
                        self.abandon(res);
                        return;
                    }
                }
                None => break,
            }
        }

        debug!(
            records = res.records_reported(),
            errors = res.errors_reported(),
            "search done"
        );
        let stat = res.take_stat();
        self.complete(stat, transfer.elapsed()).await;
        self.plan.busy.take();
    }

    /// The client went away: stop the backend and let every file the
    /// search produced expire as if it had completed.
    fn abandon(&mut self, res: SearchResult) {
        info!("client disconnected, cancelling search");
        res.cancel_in_background();
        self.schedule_output_deletion();
        if let Some((job, _)) = self.plan.post_exec.take() {
            self.schedule_job_files_deletion(&job);
        }
        self.plan.busy.take();
    }

    fn schedule_output_deletion(&self) {
        if let Some(lifetime) = self.plan.lifetime {
            for path in &self.plan.outputs {
                if let Err(e) = self.plan.state.jobs.delete_after(DELETE_FILE, path, lifetime) {
                    warn!(path = %path.display(), error = %e, "failed to schedule output deletion");
                }
            }
        }
    }

    fn schedule_job_files_deletion(&self, job: &PostExecJob) {
        let state = &self.plan.state;
        let lifetime = self
            .plan
            .lifetime
            .or_else(|| {
                state
                    .config
                    .final_processors
                    .get(&job.job_type)
                    .and_then(|c| c.file_lifetime)
            })
            .unwrap_or(DEFAULT_JOB_FILE_LIFETIME);
        for path in [&job.data_path, &job.index_path] {
            if let Err(e) = state.jobs.delete_after(DELETE_FILE, path, lifetime) {
                warn!(path = %path.display(), error = %e, "failed to schedule job file deletion");
            }
        }
    }

    /// Returns false once the client is gone.
    async fn handle(&mut self, ev: Event) -> bool {
        match ev {
            Event::Record(rec) => match self.plan.format.record(&rec) {
                Ok(Some(value)) => {
                    if let Some((_, sink)) = self.plan.post_exec.as_mut() {
                        if let Err(e) = sink.append(&value, &rec.index).await {
                            let msg = format!("failed to write post-processing data: {e}");
                            if !self.send_error(&msg).await {
                                return false;
                            }
                        }
                    }
                    let chunk = self.encoder.lock().record(&value);
                    self.send(chunk).await
                }
                Ok(None) => true,
                Err(e) => self.send_error(&e.to_string()).await,
            },
            Event::Error(e) => {
                debug!(error = %e, "search error");
                self.send_error(&e.to_string()).await
            }
        }
    }

    async fn send(&self, chunk: Result<Bytes>) -> bool {
        match chunk {
            Ok(b) if b.is_empty() => true,
            Ok(b) => self.tx.send(Ok(b)).await.is_ok(),
            Err(e) => {
                error!(error = %e, "failed to encode response item");
                true
            }
        }
    }

    async fn send_error(&self, message: &str) -> bool {
        let message = format!("{}{}", self.plan.error_prefix, message);
        let chunk = self.encoder.lock().error(&message);
        self.send(chunk).await
    }

    async fn complete(&mut self, mut stat: Option<Stat>, transfer: Duration) {
        if let Some((job, sink)) = self.plan.post_exec.take() {
            self.post_process(job, sink, &mut stat).await;
        }

        if let Some(stat) = stat.as_mut() {
            if let Some((name, prepare, engine)) = self.plan.performance {
                let fmt = |d: Duration| humantime::format_duration(d).to_string();
                stat.add_perf_stat(
                    name,
                    json!({
                        "prepare": fmt(prepare),
                        "engine": fmt(engine),
                        "transfer": fmt(transfer),
                        "total": fmt(self.plan.started.elapsed()),
                    }),
                );
            }
            if let Some(opts) = self.plan.aggregations.clone() {
                if let Err(e) = aggs::finalize(&opts, stat) {
                    self.send_error(&format!("failed to finalize aggregations: {e}"))
                        .await;
                }
            }
            if self.plan.issue_session {
                let info = stat.collect_session_data();
                if !info.is_empty() {
                    let mut session = Session::new();
                    session.set_info(info);
                    match self.plan.state.sessions.issue(&session) {
                        Ok(token) => {
                            stat.extra
                                .insert(EXTRA_SESSION.to_string(), Value::String(token));
                        }
                        Err(e) => {
                            self.send_error(&format!("failed to issue session token: {e}"))
                                .await;
                        }
                    }
                }
                stat.clear_session_data(true);
            }
            if let Some(request) = self.plan.request.take() {
                stat.extra.insert(EXTRA_REQUEST.to_string(), request);
            }
        }

        self.schedule_output_deletion();

        // aggregations travel in the stat
        let stat_value = if self.plan.stats || self.plan.aggregations.is_some() {
            stat.as_ref()
                .and_then(|s| match self.plan.format.stat(s) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        error!(error = %e, "failed to format statistics");
                        None
                    }
                })
        } else {
            None
        };
        let chunk = self.encoder.lock().finish(stat_value.as_ref());
        self.send(chunk).await;
    }

    async fn post_process(&mut self, job: PostExecJob, sink: JobSink, stat: &mut Option<Stat>) {
        match sink.finish().await {
            Ok(rows) => debug!(job = %job.id, rows, "post-processing data ready"),
            Err(e) => {
                self.send_error(&format!("failed to finish post-processing data: {e}"))
                    .await;
            }
        }

        let state = self.plan.state.clone();
        if let Some(processor) = state.post_processors.get(&job.job_type) {
            match processor.run(&job).await {
                Ok(lines) => {
                    let host = state.config.host_name.clone();
                    stat.get_or_insert_with(|| Stat::new(host)).extra.insert(
                        EXTRA_POST_EXEC.to_string(),
                        Value::Array(lines.into_iter().map(Value::String).collect()),
                    );
                }
                Err(e) => {
                    self.send_error(&format!("post-processing failed: {e}")).await;
                }
            }
        }

        self.schedule_job_files_deletion(&job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_window_spans_two_nodes() {
        let slices = plan_show(&[60, 40], 50, Some(20));
        assert_eq!(
            slices,
            vec![
                ShowSlice {
                    node: 0,
                    offset: 50,
                    limit: 10
                },
                ShowSlice {
                    node: 1,
                    offset: 0,
                    limit: 10
                },
            ]
        );
    }

    #[test]
    fn show_window_outside_every_node_is_empty() {
        assert!(plan_show(&[10, 5], 15, Some(10)).is_empty());
        assert!(plan_show(&[], 0, Some(10)).is_empty());
    }

    #[test]
    fn show_without_count_reads_to_the_end() {
        let slices = plan_show(&[10, 0, 5], 8, None);
        assert_eq!(
            slices,
            vec![
                ShowSlice {
                    node: 0,
                    offset: 8,
                    limit: 2
                },
                ShowSlice {
                    node: 2,
                    offset: 0,
                    limit: 5
                },
            ]
        );
    }

    #[test]
    fn show_window_inside_one_node() {
        let slices = plan_show(&[100, 100], 120, Some(30));
        assert_eq!(
            slices,
            vec![ShowSlice {
                node: 1,
                offset: 20,
                limit: 30
            }]
        );
    }

    #[test]
    fn huge_show_window_saturates() {
        assert!(plan_show(&[10, 5], u64::MAX - 1, Some(u64::MAX)).is_empty());
        let slices = plan_show(&[10, 5], 12, Some(u64::MAX));
        assert_eq!(
            slices,
            vec![ShowSlice {
                node: 1,
                offset: 2,
                limit: 3
            }]
        );
        let slices = plan_show(&[u64::MAX, 5], 3, Some(u64::MAX));
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].limit, u64::MAX - 3);
    }
}
