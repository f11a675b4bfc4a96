//! Cluster dispatcher: picks the engines that serve a request.
//!
//! discover → route → arrange → select → compose:
//!
//! 1. list the service instances from the registry;
//! 2. compute the node tags required by the requested files;
//! 3. order nodes by busyness group, local node first inside a group and
//!    the remaining ones shuffled;
//! 4. keep the ordered nodes carrying a required tag, failing when some
//!    tag is carried by none;
//! 5. wrap the selected backends into a MUX engine, unless only the local
//!    node is involved.

use super::busyness::node_metrics;
use super::registry::{Registry, ServiceInstance};
use super::routing::PartitionMap;
use crate::search::http::HttpEngine;
use crate::search::mux::MuxEngine;
use crate::search::Engine;
use crate::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix of the error returned when no node carries a required tag.
pub const ROUTING_INCOMPLETE: &str = "routing-incomplete";

/// Creates the local engine for a user home directory.
pub type LocalEngineFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Engine>> + Send + Sync>;

/// Identity of this process as seen in the registry.
#[derive(Debug, Clone)]
pub struct LocalNode {
    port: u16,
    addresses: HashSet<String>,
}

impl LocalNode {
    pub fn new<I, S>(port: u16, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            port,
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }

    /// Loopback names, the host name and the address of the outbound
    /// interface.
    pub fn detect(port: u16, host_name: &str) -> Self {
        let mut addresses: HashSet<String> = ["127.0.0.1", "::1", "localhost"]
            .into_iter()
            .map(str::to_string)
            .collect();
        if !host_name.is_empty() {
            addresses.insert(host_name.to_string());
        }
        // connecting a UDP socket sends nothing, it only selects the route
        if let Ok(sock) = UdpSocket::bind("0.0.0.0:0") {
            if sock.connect("8.8.8.8:80").is_ok() {
                if let Ok(addr) = sock.local_addr() {
                    addresses.insert(addr.ip().to_string());
                }
            }
        }
        debug!(port, ?addresses, "local node addresses");
        Self { port, addresses }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_local(&self, service: &ServiceInstance) -> bool {
        service.effective_port() == self.port && self.addresses.contains(&service.address)
    }
}

/// A service instance with its routing attributes resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub instance: ServiceInstance,
    pub url: String,
    pub is_local: bool,
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub service_name: String,
    /// Nodes whose busyness differs by no more than this share a group.
    pub tolerance: u64,
    pub local_only: bool,
    pub http_timeout: Duration,
    /// Host reported in merged stats.
    pub host_name: String,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            service_name: "search-api".to_string(),
            tolerance: 0,
            local_only: true,
            http_timeout: Duration::from_secs(3600),
            host_name: String::new(),
        }
    }
}

pub struct Dispatcher {
    registry: Option<Arc<dyn Registry>>,
    local: LocalNode,
    options: DispatcherOptions,
    local_engine: LocalEngineFactory,
}

impl Dispatcher {
    pub fn new(
        registry: Option<Arc<dyn Registry>>,
        local: LocalNode,
        options: DispatcherOptions,
        local_engine: LocalEngineFactory,
    ) -> Self {
        Self {
            registry,
            local,
            options,
            local_engine,
        }
    }

    pub fn is_local_only(&self) -> bool {
        self.options.local_only || self.registry.is_none()
    }

    pub fn registry(&self) -> Option<&Arc<dyn Registry>> {
        self.registry.as_ref()
    }

    pub fn host_name(&self) -> &str {
        &self.options.host_name
    }

    pub fn local_engine(&self, home: &str) -> Result<Arc<dyn Engine>> {
        (self.local_engine)(home)
    }

    pub fn remote_engine(&self, url: &str, auth: Option<&str>) -> Result<Arc<dyn Engine>> {
        Ok(Arc::new(HttpEngine::new(
            url,
            auth.map(str::to_string),
            self.options.http_timeout,
        )?))
    }

    /// Local engine for the local node, http engine for any other.
    pub fn engine_for_node(
        &self,
        node: &ClusterNode,
        auth: Option<&str>,
        home: &str,
    ) -> Result<Arc<dyn Engine>> {
        if node.is_local {
            self.local_engine(home)
        } else {
            self.remote_engine(&node.url, auth)
        }
    }

    pub fn is_local_url(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let instance = ServiceInstance::new("", host, parsed.port_or_known_default().unwrap_or(0));
        self.local.is_local(&instance)
    }

    /// Every instance of the service class. In local-only mode this is the
    /// local node alone.
    pub async fn members(&self) -> Result<Vec<ServiceInstance>> {
        match &self.registry {
            Some(registry) => registry.services(&self.options.service_name).await,
            None => Ok(vec![ServiceInstance::new(
                self.options.host_name.clone(),
                "127.0.0.1",
                self.local.port(),
            )]),
        }
    }

    /// Discover and arrange all nodes by busyness.
    pub async fn arranged_nodes(&self) -> Result<Vec<ClusterNode>> {
        let Some(registry) = &self.registry else {
            return Err(Error::Config("no registry configured".to_string()));
        };
        let services = registry.services(&self.options.service_name).await?;
        let metrics = match node_metrics(registry.as_ref()).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to get node metrics");
                HashMap::new()
            }
        };
        debug!(?metrics, "cluster node metrics");
        let nodes = services
            .into_iter()
            .map(|s| self.resolve(s))
            .collect::<Vec<_>>();
        Ok(arrange(
            nodes,
            &metrics,
            self.options.tolerance,
            &mut rand::thread_rng(),
        ))
    }

    /// Nodes needed to cover `files`, in preference order.
    pub async fn select_nodes(&self, files: &[String], user_tag: &str) -> Result<Vec<ClusterNode>> {
        let Some(registry) = &self.registry else {
            return Err(Error::Config("no registry configured".to_string()));
        };
        let required = if files.is_empty() {
            BTreeSet::new()
        } else {
            PartitionMap::load(registry.as_ref(), user_tag)
                .await?
                .required_tags(files)
        };
        let nodes = self.arranged_nodes().await?;
        select(nodes, required)
    }

    /// Assign each node the subset of `files` it stores. Nodes with nothing
    /// to do are left out.
    pub async fn route_files(
        &self,
        files: &[String],
        user_tag: &str,
    ) -> Result<Vec<(ClusterNode, Vec<String>)>> {
        let Some(registry) = &self.registry else {
            return Err(Error::Config("no registry configured".to_string()));
        };
        let map = PartitionMap::load(registry.as_ref(), user_tag).await?;
        let tags = map.tags_per_file(files);
        let services = registry.services(&self.options.service_name).await?;

        let mut out = Vec::new();
        for service in services {
            let assigned: Vec<String> = files
                .iter()
                .zip(&tags)
                .filter(|(_, t)| t.is_empty() || service.has_any_tag(t))
                .map(|(f, _)| f.clone())
                .collect();
            if !assigned.is_empty() {
                out.push((self.resolve(service), assigned));
            }
        }
        Ok(out)
    }

    /// Build the engine serving a search over `files`.
    ///
    /// Registry failures fall back to the local engine; uncovered tags are
    /// an error.
    pub async fn build_engine(
        &self,
        local_only: bool,
        files: &[String],
        auth: Option<&str>,
        home: &str,
        user_tag: &str,
    ) -> Result<Arc<dyn Engine>> {
        if local_only || self.is_local_only() {
            return self.local_engine(home);
        }

        let nodes = match self.select_nodes(files, user_tag).await {
            Ok(nodes) => nodes,
            Err(e) if is_routing_incomplete(&e) => return Err(e),
            Err(e) => {
                warn!(error = %e, "failed to get cluster info, using local search");
                return self.local_engine(home);
            }
        };

        let mut backends = Vec::with_capacity(nodes.len());
        let mut names = Vec::with_capacity(nodes.len());
        let mut all_local = true;
        for node in &nodes {
            backends.push(self.engine_for_node(node, auth, home)?);
            names.push(node.instance.node.clone());
            all_local &= node.is_local;
        }
        info!(nodes = ?names, "cluster search");

        if backends.is_empty() || all_local {
            debug!("use local search as fallback");
            return self.local_engine(home);
        }
        Ok(Arc::new(MuxEngine::new(
            self.options.host_name.clone(),
            backends,
        )))
    }

    fn resolve(&self, instance: ServiceInstance) -> ClusterNode {
        ClusterNode {
            url: instance.url(),
            is_local: self.local.is_local(&instance),
            instance,
        }
    }
}

pub fn is_routing_incomplete(err: &Error) -> bool {
    matches!(err, Error::Engine(msg) if msg.starts_with(ROUTING_INCOMPLETE))
}

/// Order nodes from the least to the most busy.
///
/// Nodes fall into groups of `metric / (tolerance + 1)`. Inside a group the
/// local node goes first and the others are shuffled.
pub fn arrange<R: Rng + ?Sized>(
    nodes: Vec<ClusterNode>,
    metrics: &HashMap<String, u64>,
    tolerance: u64,
    rng: &mut R,
) -> Vec<ClusterNode> {
    let mut groups: BTreeMap<u64, Vec<ClusterNode>> = BTreeMap::new();
    for node in nodes {
        let metric = metrics.get(&node.instance.node).copied().unwrap_or(0);
        let group = metric / (tolerance + 1);
        debug!(node = %node.instance.node, metric, group, "service metric details");
        groups.entry(group).or_default().push(node);
    }

    let mut out = Vec::new();
    for (_, group) in groups {
        let (mut local, mut remote): (Vec<_>, Vec<_>) =
            group.into_iter().partition(|n| n.is_local);
        // a second "local" entry is just another remote candidate
        if local.len() > 1 {
            remote.extend(local.drain(1..));
        }
        remote.shuffle(rng);
        out.extend(local);
        out.extend(remote);
    }
    out
}

/// Keep the arranged nodes that carry at least one required tag, in order.
/// An empty `required` set selects every node. Every required tag must be
/// carried by some selected node.
pub fn select(nodes: Vec<ClusterNode>, required: BTreeSet<String>) -> Result<Vec<ClusterNode>> {
    if required.is_empty() {
        return Ok(nodes);
    }
    let mut missing = required.clone();
    let mut selected = Vec::new();
    for node in nodes {
        debug!(node = %node.instance.node, tags = ?node.instance.tags, "node tags");
        if node.instance.tags.iter().any(|t| required.contains(t)) {
            missing.retain(|t| !node.instance.tags.contains(t));
            selected.push(node);
        }
    }
    if !missing.is_empty() {
        let remaining: Vec<_> = missing.into_iter().collect();
        return Err(Error::Engine(format!(
            "{ROUTING_INCOMPLETE}: no services found for tags: {remaining:?}"
        )));
    }
    Ok(selected)
}
