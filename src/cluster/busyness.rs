//! Busyness: the number of in-flight searches on this node.
//!
//! Every search holds a [`BusyGuard`] while it runs. Changes are signalled
//! to a single reporter task which publishes the value to the registry KV
//! store once the counter has been quiet for `update_latency`, so a burst
//! of searches results in at most one update.

use super::registry::Registry;
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const BUSYNESS_PREFIX: &str = "busyness/";

const SIGNAL_CHANNEL_SIZE: usize = 256;

/// Shared in-flight search counter.
#[derive(Debug, Clone)]
pub struct Busyness {
    active: Arc<AtomicI64>,
    signal: mpsc::Sender<i64>,
}

/// Decrements the counter when dropped.
#[derive(Debug)]
pub struct BusyGuard {
    busyness: Busyness,
}

impl Busyness {
    /// Create the counter and the receiving end for [`BusynessReporter`].
    pub fn new() -> (Self, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
        let busyness = Self {
            active: Arc::new(AtomicI64::new(0)),
            signal: tx,
        };
        (busyness, rx)
    }

    /// Counter without a reporter, for local-only deployments.
    pub fn detached() -> Self {
        Self::new().0
    }

    pub fn start_search(&self) -> BusyGuard {
        self.changed(1);
        BusyGuard {
            busyness: self.clone(),
        }
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    fn changed(&self, delta: i64) {
        let metric = self.active.fetch_add(delta, Ordering::SeqCst) + delta;
        // the reporter reads the counter itself, a dropped signal only
        // delays the update
        let _ = self.signal.try_send(metric);
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busyness.changed(-1);
    }
}

/// Background task publishing the counter as `busyness/<node>`.
pub struct BusynessReporter {
    busyness: Busyness,
    signals: mpsc::Receiver<i64>,
    registry: Arc<dyn Registry>,
    node: String,
    latency: Duration,
    shutdown: CancellationToken,
}

impl BusynessReporter {
    pub fn new(
        busyness: Busyness,
        signals: mpsc::Receiver<i64>,
        registry: Arc<dyn Registry>,
        node: impl Into<String>,
        latency: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            busyness,
            signals,
            registry,
            node: node.into(),
            latency,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let node = self.node.clone();
            let task = tokio::spawn(self.run());
            if let Err(e) = task.await {
                error!(node = %node, error = %e, "update busyness task failed");
            }
        })
    }

    pub async fn run(mut self) {
        // forces the first report
        let mut reported: i64 = -1;
        loop {
            tokio::select! {
                Some(metric) = self.signals.recv() => {
                    debug!(metric, "metric changed");
                    continue;
                }
                _ = tokio::time::sleep(self.latency) => {
                    let metric = self.busyness.active();
                    if metric != reported {
                        reported = metric;
                        debug!(metric, "metric reporting");
                        if let Err(e) = self.publish(metric).await {
                            warn!(error = %e, "failed to update metric");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn publish(&self, metric: i64) -> Result<()> {
        let key = format!("{BUSYNESS_PREFIX}{}", self.node);
        self.registry.kv_put(&key, &metric.to_string()).await
    }
}

/// Busyness of every node that ever reported. Unparsable values count as 0.
pub async fn node_metrics(registry: &dyn Registry) -> Result<HashMap<String, u64>> {
    let pairs = registry.kv_list(BUSYNESS_PREFIX).await?;
    Ok(pairs
        .into_iter()
        .map(|(key, value)| {
            let node = key
                .strip_prefix(BUSYNESS_PREFIX)
                .unwrap_or(&key)
                .to_string();
            let metric = value.trim().parse::<i64>().unwrap_or(0).max(0) as u64;
            (node, metric)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::MemoryRegistry;

    #[test]
    fn guard_decrements_on_drop() {
        let b = Busyness::detached();
        let g1 = b.start_search();
        let g2 = b.start_search();
        assert_eq!(b.active(), 2);
        drop(g1);
        assert_eq!(b.active(), 1);
        drop(g2);
        assert_eq!(b.active(), 0);
    }

    #[tokio::test]
    async fn metrics_are_read_by_node() {
        let reg = MemoryRegistry::new();
        reg.set("busyness/a", "3");
        reg.set("busyness/b", "junk");
        let m = node_metrics(&reg).await.unwrap();
        assert_eq!(m["a"], 3);
        assert_eq!(m["b"], 0);
    }

    #[tokio::test]
    async fn reporter_publishes_after_quiet_period() {
        let reg = MemoryRegistry::new();
        let (busy, rx) = Busyness::new();
        let shutdown = CancellationToken::new();
        let reporter = BusynessReporter::new(
            busy.clone(),
            rx,
            Arc::new(reg.clone()),
            "n1",
            Duration::from_millis(50),
            shutdown.clone(),
        );
        let handle = reporter.spawn();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(reg.get("busyness/n1").as_deref(), Some("0"));

        let _g = busy.start_search();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(reg.get("busyness/n1").as_deref(), Some("1"));
        assert_eq!(reg.put_count(), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
