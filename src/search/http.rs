//! Remote engine: runs a search on a peer node through its REST API.
//!
//! The request always asks the peer to search only its own data
//! (`local=true`) and to answer with the tagged MsgPack stream, which is
//! decoded back into records, errors and the stat.

use super::wire::{Item, StreamDecoder};
use super::{DirInfo, Engine, ResultSender, SearchConfig, SearchResult, Stat};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

pub struct HttpEngine {
    base: Url,
    auth: Option<String>,
    index_host: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpEngine {
    /// `auth` is the caller's `Authorization` header value, passed through.
    pub fn new(url: &str, auth: Option<String>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid service URL {url:?}: {e}")))?;
        let index_host = base.host_str().unwrap_or_default().to_string();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base,
            auth,
            index_host,
            client,
            timeout,
        })
    }

    /// Host stamped on records that arrive without one.
    pub fn with_index_host(mut self, host: impl Into<String>) -> Self {
        self.index_host = host.into();
        self
    }

    /// URL of the remote search, count or show request.
    pub fn search_url(&self, cfg: &SearchConfig, show: bool) -> Result<Url> {
        let path = if show {
            "search/show"
        } else if cfg.report_index {
            "search"
        } else {
            "count"
        };
        let mut url = self.endpoint(path)?;
        {
            let mut q = url.query_pairs_mut();
            if !show {
                q.append_pair("query", &cfg.query);
                for file in &cfg.files {
                    q.append_pair("file", file);
                }
                if !cfg.mode.is_empty() {
                    q.append_pair("mode", &cfg.mode);
                }
                q.append_pair("cs", &cfg.case.to_string());
                if !cfg.reduce {
                    q.append_pair("reduce", "false");
                }
                if cfg.width < 0 {
                    q.append_pair("surrounding", "line");
                } else if cfg.width > 0 {
                    q.append_pair("surrounding", &cfg.width.to_string());
                }
                if cfg.dist > 0 {
                    q.append_pair("fuzziness", &cfg.dist.to_string());
                }
                if cfg.nodes > 0 {
                    q.append_pair("nodes", &cfg.nodes.to_string());
                }
                if !cfg.backend.tool.is_empty() {
                    q.append_pair("backend", &cfg.backend.tool);
                }
                if !cfg.backend.mode.is_empty() {
                    q.append_pair("backend-mode", &cfg.backend.mode);
                }
                for opt in &cfg.backend.opts {
                    q.append_pair("backend-option", opt);
                }
                for rule in &cfg.transform_rules {
                    q.append_pair("transform", rule);
                }
                if let Some(aggs) = &cfg.aggregations {
                    q.append_pair("aggs", &aggs.to_string());
                }
                if let Some(lifetime) = cfg.lifetime {
                    q.append_pair("lifetime", &humantime::format_duration(lifetime).to_string());
                }
            }
            if !cfg.keep_data_as.is_empty() {
                q.append_pair("data", &cfg.keep_data_as);
            }
            if !cfg.keep_index_as.is_empty() {
                q.append_pair("index", &cfg.keep_index_as);
            }
            if !cfg.keep_view_as.is_empty() {
                q.append_pair("view", &cfg.keep_view_as);
            }
            if !cfg.delimiter.is_empty() {
                q.append_pair("delimiter", &cfg.delimiter);
            }
            if show {
                q.append_pair("offset", &cfg.offset.to_string());
                if let Some(limit) = cfg.limit {
                    q.append_pair("count", &limit.to_string());
                }
            } else if let Some(limit) = cfg.limit.filter(|l| *l > 0) {
                q.append_pair("limit", &limit.to_string());
            }
            if !cfg.data_format.is_empty() {
                q.append_pair("--internal-format", &cfg.data_format);
            }
            q.append_pair("format", if cfg.report_data { "raw" } else { "null" });
            q.append_pair("local", "true");
            q.append_pair("stats", "true");
            q.append_pair("stream", "true");
            if cfg.performance {
                q.append_pair("performance", "true");
            }
            q.append_pair("--internal-error-prefix", "true");
            q.append_pair("--internal-no-session-id", "true");
        }
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("invalid service URL {}", self.base)))?
            .pop_if_empty()
            .extend(path.split('/'));
        Ok(url)
    }

    async fn run(&self, cfg: &SearchConfig, show: bool) -> Result<SearchResult> {
        let prepare_started = Instant::now();
        let url = self.search_url(cfg, show)?;
        debug!(url = %url, "remote search");

        let mut request = self.client.get(url).header(ACCEPT, "application/msgpack");
        if let Some(auth) = &self.auth {
            request = request.header(AUTHORIZATION, auth);
        }

        let (tx, result) = SearchResult::channel();
        let task = StreamTask {
            request,
            index_host: self.index_host.clone(),
            performance: cfg.performance,
            prepare: prepare_started.elapsed(),
        };
        tokio::spawn(task.run(tx));
        Ok(result)
    }
}

struct StreamTask {
    request: reqwest::RequestBuilder,
    index_host: String,
    performance: bool,
    prepare: Duration,
}

impl StreamTask {
    async fn run(self, tx: ResultSender) {
        let cancelled = tx.cancel_token();
        let request_started = Instant::now();
        let response = tokio::select! {
            _ = cancelled.cancelled() => {
                debug!("remote search cancelled before response");
                tx.finish(None);
                return;
            }
            response = self.request.send() => response,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to send request");
                tx.report_error(Error::Engine(format!("failed to send request: {e}")))
                    .await;
                tx.finish(None);
                return;
            }
        };

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(body);
            tx.report_error(Error::Engine(format!(
                "invalid response status: {} ({})",
                status.as_u16(),
                message.trim()
            )))
            .await;
            tx.finish(None);
            return;
        }
        let request_took = request_started.elapsed();

        let transfer_started = Instant::now();
        let mut body = response.bytes_stream();
        let mut decoder = StreamDecoder::new();
        let mut stat: Option<Stat> = None;
        let mut records = 0u64;

        'stream: loop {
            loop {
                match decoder.next_item() {
                    Ok(Some(Item::Eof)) => break 'stream,
                    Ok(Some(Item::Record(mut rec))) => {
                        if rec.index.host.is_empty() {
                            rec.index.host = self.index_host.clone();
                        }
                        records += 1;
                        if !tx.report_record(rec).await {
                            debug!(records, "remote search cancelled");
                            break 'stream;
                        }
                    }
                    Ok(Some(Item::Error(msg))) => {
                        if !tx.report_error(Error::Engine(msg)).await {
                            break 'stream;
                        }
                    }
                    Ok(Some(Item::Stat(s))) => stat = Some(s),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to decode response");
                        tx.report_error(e).await;
                        break 'stream;
                    }
                }
            }

            let chunk = tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!(records, "remote search cancelled, connection dropped");
                    break 'stream;
                }
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => {
                    tx.report_error(Error::Engine(format!("failed to read response: {e}")))
                        .await;
                    break;
                }
                None => {
                    if decoder.pending() > 0 {
                        tx.report_error(Error::Engine(
                            "unexpected end of response stream".to_string(),
                        ))
                        .await;
                    }
                    break;
                }
            }
        }

        if self.performance {
            if let Some(stat) = stat.as_mut() {
                stat.add_perf_stat(
                    "http",
                    json!({
                        "prepare": humantime::format_duration(self.prepare).to_string(),
                        "request": humantime::format_duration(request_took).to_string(),
                        "transfer": humantime::format_duration(transfer_started.elapsed()).to_string(),
                    }),
                );
            }
        }
        tx.finish(stat);
    }
}

#[async_trait]
impl Engine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn search(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        self.run(cfg, false).await
    }

    async fn show(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        self.run(cfg, true).await
    }

    async fn files(&self, path: &str, hidden: bool) -> Result<DirInfo> {
        let mut url = self.endpoint("files")?;
        url.query_pairs_mut()
            .append_pair("dir", path)
            .append_pair("hidden", &hidden.to_string())
            .append_pair("local", "true");

        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(auth) = &self.auth {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Engine(format!(
                "invalid response status: {} ({})",
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(response.json().await?)
    }

    fn options(&self) -> Map<String, Value> {
        let mut opts = Map::new();
        opts.insert("server-url".to_string(), json!(self.base.as_str()));
        opts.insert("auth-token".to_string(), json!(self.auth.is_some()));
        opts.insert("index-host".to_string(), json!(self.index_host));
        opts.insert(
            "http-timeout".to_string(),
            json!(humantime::format_duration(self.timeout).to_string()),
        );
        opts
    }

    fn location(&self) -> Option<String> {
        Some(self.base.as_str().trim_end_matches('/').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params(url: &Url) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in url.query_pairs() {
            out.entry(k.into_owned()).or_default().push(v.into_owned());
        }
        out
    }

    fn engine() -> HttpEngine {
        HttpEngine::new("http://10.0.0.2:8765", None, Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn search_url_carries_internal_flags() {
        let mut cfg = SearchConfig::new("hello", vec!["a.txt".into(), "b.txt".into()]);
        cfg.width = -1;
        cfg.dist = 2;
        cfg.limit = Some(10);
        cfg.aggregations = Some(serde_json::json!({"n": {"sum": {"field": "n"}}}));
        let url = engine().search_url(&cfg, false).unwrap();
        assert_eq!(url.path(), "/search");
        let p = params(&url);
        assert_eq!(p["file"], vec!["a.txt", "b.txt"]);
        assert_eq!(p["surrounding"], vec!["line"]);
        assert_eq!(p["fuzziness"], vec!["2"]);
        assert_eq!(p["limit"], vec!["10"]);
        assert_eq!(p["format"], vec!["raw"]);
        assert_eq!(p["local"], vec!["true"]);
        assert_eq!(p["stream"], vec!["true"]);
        assert_eq!(p["--internal-no-session-id"], vec!["true"]);
        assert_eq!(p["aggs"], vec![r#"{"n":{"sum":{"field":"n"}}}"#]);
    }

    #[test]
    fn count_and_show_urls() {
        let mut cfg = SearchConfig::new("hello", vec![]);
        cfg.limit = Some(0);
        let cfg = cfg.normalized();
        let url = engine().search_url(&cfg, false).unwrap();
        assert_eq!(url.path(), "/count");
        assert_eq!(params(&url)["format"], vec!["null"]);

        let mut cfg = SearchConfig::new("", vec![]);
        cfg.keep_data_as = "out.dat".into();
        cfg.offset = 50;
        cfg.limit = Some(10);
        let url = engine().search_url(&cfg, true).unwrap();
        assert_eq!(url.path(), "/search/show");
        let p = params(&url);
        assert_eq!(p["offset"], vec!["50"]);
        assert_eq!(p["count"], vec!["10"]);
        assert!(!p.contains_key("query"));
    }

    #[test]
    fn location_and_index_host() {
        let e = engine();
        assert_eq!(e.location().as_deref(), Some("http://10.0.0.2:8765"));
        assert_eq!(e.options()["index-host"], json!("10.0.0.2"));
    }

    #[tokio::test]
    async fn unreachable_peer_reports_error() {
        let e = HttpEngine::new("http://127.0.0.1:1", None, Duration::from_secs(2)).unwrap();
        let mut res = e.search(&SearchConfig::new("q", vec![])).await.unwrap();
        let mut errors = 0;
        while let Some(ev) = res.next_event().await {
            if let crate::search::Event::Error(_) = ev {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert!(res.stat().is_none());
    }
}
