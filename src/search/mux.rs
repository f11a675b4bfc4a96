//! MUX engine: fans one search out to many backends and merges their
//! results into a single stream.
//!
//! Each child result gets its own forwarder task. The forwarders share the
//! parent's sender and a record counter used to enforce `limit`; a
//! coordinator task waits for all of them, merges the child stats and
//! only then finishes the parent result.

use super::{DirInfo, Engine, Event, ResultSender, SearchConfig, SearchResult, Stat};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct MuxEngine {
    host: String,
    backends: Vec<Arc<dyn Engine>>,
}

impl MuxEngine {
    /// `host` is reported in the merged stat and stamped on records that
    /// carry no host of their own.
    pub fn new(host: impl Into<String>, backends: Vec<Arc<dyn Engine>>) -> Self {
        Self {
            host: host.into(),
            backends,
        }
    }

    pub fn backends(&self) -> &[Arc<dyn Engine>] {
        &self.backends
    }

    /// Start every `(backend, config)` pair and merge the results.
    ///
    /// The configs may differ per backend (show paging narrows offset and
    /// limit per node). `limit` caps the number of merged records. A
    /// backend that fails to start is reported as an error on the merged
    /// result; the others keep running.
    pub async fn start(
        host: &str,
        pairs: Vec<(Arc<dyn Engine>, SearchConfig)>,
        limit: Option<u64>,
        show: bool,
    ) -> Result<SearchResult> {
        let mut children = Vec::with_capacity(pairs.len());
        let mut failures = Vec::new();
        for (engine, cfg) in pairs {
            let started = if show {
                engine.show(&cfg).await
            } else {
                engine.search(&cfg).await
            };
            let location = engine.location();
            match started {
                Ok(child) => children.push(Child { child, location }),
                Err(e) => {
                    let info = location.map(|l| format!(" ({l})")).unwrap_or_default();
                    warn!(backend = engine.name(), error = %e, "failed to start backend");
                    failures.push(Error::Engine(format!(
                        "failed to start /search backend: {e}{info}"
                    )));
                }
            }
        }
        debug!(started = children.len(), failed = failures.len(), "mux backends");

        let (tx, result) = SearchResult::channel();
        let host = host.to_string();
        tokio::spawn(coordinate(host, children, failures, limit, tx));
        Ok(result)
    }

    async fn fan_out(&self, cfg: &SearchConfig, show: bool) -> Result<SearchResult> {
        // remote children go through `start` so their session data gets a location
        if self.backends.len() == 1 && self.backends[0].location().is_none() {
            let backend = &self.backends[0];
            return if show {
                backend.show(cfg).await
            } else {
                backend.search(cfg).await
            };
        }
        let pairs = self
            .backends
            .iter()
            .map(|b| (b.clone(), cfg.clone()))
            .collect();
        Self::start(&self.host, pairs, cfg.limit, show).await
    }
}

struct Child {
    child: SearchResult,
    location: Option<String>,
}

async fn coordinate(
    host: String,
    children: Vec<Child>,
    failures: Vec<Error>,
    limit: Option<u64>,
    tx: ResultSender,
) {
    let tx = Arc::new(tx);
    let had_failures = !failures.is_empty();
    for err in failures {
        if !tx.report_error(err).await {
            break;
        }
    }

    let reported = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::with_capacity(children.len());
    for child in children {
        handles.push(tokio::spawn(forward(
            child,
            tx.clone(),
            reported.clone(),
            limit,
            host.clone(),
        )));
    }

    let mut stat = Stat::new(host);
    let mut merged = 0;
    for handle in handles {
        match handle.await {
            Ok(Some(child_stat)) => {
                stat.merge(child_stat);
                merged += 1;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "mux forwarder task failed"),
        }
    }

    // every backend failed without a stat: leave the stat unset so the
    // caller sees a failure instead of an empty success
    let stat = if merged == 0 && had_failures {
        None
    } else {
        Some(stat)
    };
    match Arc::try_unwrap(tx) {
        Ok(tx) => tx.finish(stat),
        Err(_) => error!("mux result sender is still in use"),
    }
}

/// Forward one child's records and errors to the parent.
///
/// Returns the child's final stat, stamped with its location.
async fn forward(
    child: Child,
    parent: Arc<ResultSender>,
    reported: Arc<AtomicU64>,
    limit: Option<u64>,
    host: String,
) -> Option<Stat> {
    let Child {
        mut child,
        location,
    } = child;
    let cancelled = parent.cancel_token();

    loop {
        let event = tokio::select! {
            _ = cancelled.cancelled() => {
                let (records, errors) = child.cancel();
                debug!(records, errors, "cancelled by parent, some records/errors are ignored");
                break;
            }
            event = child.next_event() => event,
        };
        match event {
            None => break,
            Some(Event::Error(err)) => {
                if !parent.report_error(err).await {
                    child.cancel();
                    break;
                }
            }
            Some(Event::Record(mut rec)) => {
                if let Some(limit) = limit {
                    if reported.fetch_add(1, Ordering::SeqCst) >= limit {
                        let (records, errors) = child.cancel();
                        debug!(limit, records, errors, "limit reached, backend cancelled");
                        break;
                    }
                }
                if rec.index.host.is_empty() {
                    rec.index.host = host.clone();
                }
                if !parent.report_record(rec).await {
                    child.cancel();
                    break;
                }
            }
        }
    }

    // the channels are closed by now, this only waits for done
    while child.next_event().await.is_some() {}

    let mut stat = child.take_stat()?;
    if let Some(location) = location {
        if stat.session_data().is_some() {
            stat.add_session_data("location", Value::String(location));
        }
    }
    Some(stat)
}

#[async_trait]
impl Engine for MuxEngine {
    fn name(&self) -> &str {
        "mux"
    }

    async fn search(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        self.fan_out(cfg, false).await
    }

    async fn show(&self, cfg: &SearchConfig) -> Result<SearchResult> {
        self.fan_out(cfg, true).await
    }

    async fn files(&self, path: &str, hidden: bool) -> Result<DirInfo> {
        if self.backends.len() == 1 {
            return self.backends[0].files(path, hidden).await;
        }
        let listings = join_all(self.backends.iter().map(|b| b.files(path, hidden))).await;

        let mut merged: Option<DirInfo> = None;
        let mut first_error = None;
        for (backend, listing) in self.backends.iter().zip(listings) {
            match listing {
                Ok(info) => match merged.as_mut() {
                    Some(m) => m.merge(info),
                    None => {
                        let mut info = info;
                        info.normalize();
                        merged = Some(info);
                    }
                },
                Err(e) => {
                    warn!(backend = backend.name(), location = ?backend.location(), error = %e,
                        "failed to list files");
                    first_error.get_or_insert(e);
                }
            }
        }
        match (merged, first_error) {
            (Some(info), _) => Ok(info),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(DirInfo::new(path)),
        }
    }

    fn options(&self) -> Map<String, Value> {
        let backends: Vec<Value> = self
            .backends
            .iter()
            .map(|b| {
                json!({
                    "name": b.name(),
                    "location": b.location(),
                    "options": b.options(),
                })
            })
            .collect();
        let mut opts = Map::new();
        opts.insert("host".to_string(), Value::String(self.host.clone()));
        opts.insert("backends".to_string(), Value::Array(backends));
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::fake::{FakeEngine, FakeScript};
    use std::time::Duration;

    fn scripted(host: &str, records: u64, errors: u64) -> Arc<dyn Engine> {
        Arc::new(FakeEngine::scripted(
            host,
            FakeScript {
                records,
                errors,
                ..Default::default()
            },
        ))
    }

    async fn drain(mut res: SearchResult) -> (Vec<crate::search::Record>, Vec<Error>, SearchResult) {
        let mut records = Vec::new();
        let mut errors = Vec::new();
        while let Some(ev) = res.next_event().await {
            match ev {
                Event::Record(r) => records.push(r),
                Event::Error(e) => errors.push(e),
            }
        }
        (records, errors, res)
    }

    #[tokio::test]
    async fn merges_records_and_stats_of_all_backends() {
        let mux = MuxEngine::new("coord", vec![scripted("a", 5, 1), scripted("b", 3, 0)]);
        let res = mux.search(&SearchConfig::new("hello", vec![])).await.unwrap();
        let (records, errors, res) = drain(res).await;

        assert_eq!(records.len(), 8);
        assert_eq!(errors.len(), 1);
        let stat = res.stat().unwrap();
        assert_eq!(stat.host, "coord");
        assert_eq!(stat.matches, 8);
        assert_eq!(stat.details.len(), 2);
    }

    #[tokio::test]
    async fn limit_caps_merged_records() {
        let mux = MuxEngine::new("coord", vec![scripted("a", 50, 0), scripted("b", 50, 0)]);
        let mut cfg = SearchConfig::new("hello", vec![]);
        cfg.limit = Some(7);
        let (records, _, res) = drain(mux.search(&cfg).await.unwrap()).await;
        assert_eq!(records.len(), 7);
        assert!(res.stat().is_some());
    }

    #[tokio::test]
    async fn start_failure_is_reported_and_others_continue() {
        let failing: Arc<dyn Engine> = Arc::new(
            FakeEngine::scripted(
                "bad",
                FakeScript {
                    start_error: Some("no tool".into()),
                    ..Default::default()
                },
            )
            .with_location("http://10.0.0.9:8765"),
        );
        let mux = MuxEngine::new("coord", vec![scripted("a", 2, 0), failing]);
        let (records, errors, res) =
            drain(mux.search(&SearchConfig::new("q", vec![])).await.unwrap()).await;

        assert_eq!(records.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "failed to start /search backend: no tool (http://10.0.0.9:8765)"
        );
        assert_eq!(res.stat().unwrap().details.len(), 1);
    }

    #[tokio::test]
    async fn records_are_stamped_with_coordinator_host() {
        let mux = MuxEngine::new("coord", vec![scripted("", 1, 0), scripted("", 1, 0)]);
        let (records, _, _) = drain(mux.search(&SearchConfig::new("q", vec![])).await.unwrap()).await;
        assert!(records.iter().all(|r| r.index.host == "coord"));
    }

    #[tokio::test]
    async fn cancel_stops_all_children() {
        let slow = |host: &str| -> Arc<dyn Engine> {
            Arc::new(FakeEngine::scripted(
                host,
                FakeScript {
                    records: 1_000_000,
                    latency: Duration::from_millis(1),
                    ..Default::default()
                },
            ))
        };
        let mux = MuxEngine::new("coord", vec![slow("a"), slow("b")]);
        let mut res = mux.search(&SearchConfig::new("q", vec![])).await.unwrap();
        for _ in 0..5 {
            res.next_event().await;
        }
        res.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while res.next_event().await.is_some() {}
        })
        .await
        .expect("mux did not finish after cancel");
        assert!(res.is_done());
    }
}
