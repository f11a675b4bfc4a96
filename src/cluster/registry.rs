//! Service registry clients.
//!
//! A registry answers two questions: which nodes run the search service
//! class, and what is stored under a key-value prefix (partition map and
//! busyness metrics). [`ConsulRegistry`] talks to a Consul agent over HTTP,
//! [`MemoryRegistry`] keeps everything in process for tests and single-node
//! deployments.

use crate::config::DEFAULT_PORT;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One instance of a service as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub node: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(node: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            node: node.into(),
            tags: Vec::new(),
            address: address.into(),
            port,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Registered port, or the default one when the registry reports 0.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }

    /// Base URL of the node's REST API.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.effective_port())
    }

    pub fn has_any_tag(&self, wanted: &[String]) -> bool {
        self.tags.iter().any(|t| wanted.contains(t))
    }
}

/// Cluster membership and key-value store.
#[async_trait]
pub trait Registry: Send + Sync {
    /// All instances of the named service.
    async fn services(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// All `(key, value)` pairs whose key starts with `prefix`, sorted by key.
    async fn kv_list(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    async fn kv_put(&self, key: &str, value: &str) -> Result<()>;
}

/// In-process registry.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    services: Arc<RwLock<HashMap<String, Vec<ServiceInstance>>>>,
    kv: Arc<RwLock<BTreeMap<String, String>>>,
    puts: Arc<AtomicU64>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace (by node name) a service instance.
    pub fn register(&self, service: &str, instance: ServiceInstance) {
        info!(
            service,
            node = %instance.node,
            address = %instance.address,
            port = instance.port,
            "Registering service instance"
        );
        let mut services = self.services.write();
        let list = services.entry(service.to_string()).or_default();
        list.retain(|s| s.node != instance.node);
        list.push(instance);
    }

    pub fn deregister(&self, service: &str, node: &str) {
        if let Some(list) = self.services.write().get_mut(service) {
            list.retain(|s| s.node != node);
        }
    }

    /// Set a key without counting it as a write.
    pub fn set(&self, key: &str, value: &str) {
        self.kv.write().insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.kv.read().get(key).cloned()
    }

    /// Number of `kv_put` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn services(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self.services.read().get(name).cloned().unwrap_or_default())
    }

    async fn kv_list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .kv
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.set(key, value);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    node: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    service_address: String,
    #[serde(default)]
    service_port: u16,
    #[serde(default)]
    service_tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

/// Consul agent HTTP client.
pub struct ConsulRegistry {
    base: url::Url,
    client: reqwest::Client,
}

impl ConsulRegistry {
    /// `address` is `host:port` or a full URL.
    pub fn new(address: &str) -> Result<Self> {
        let raw = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let base = url::Url::parse(&raw)
            .map_err(|e| Error::Config(format!("invalid consul address {address:?}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Internal(format!("failed to build consul URL: {e}")))
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn services(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        let url = self.endpoint(&format!("/v1/catalog/service/{name}"))?;
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let list: Vec<CatalogService> = resp.json().await?;
        debug!(service = name, count = list.len(), "consul services");
        Ok(list
            .into_iter()
            .map(|s| ServiceInstance {
                node: s.node,
                tags: s.service_tags.unwrap_or_default(),
                address: if s.service_address.is_empty() {
                    s.address
                } else {
                    s.service_address
                },
                port: s.service_port,
            })
            .collect())
    }

    async fn kv_list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut url = self.endpoint(&format!("/v1/kv/{prefix}"))?;
        url.set_query(Some("recurse"));
        let resp = self.client.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let pairs: Vec<KvPair> = resp.error_for_status()?.json().await?;
        let mut out = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let value = match pair.value {
                Some(v) => {
                    let bytes = BASE64.decode(v.as_bytes()).map_err(|e| {
                        Error::Serialization(format!("bad KV value for {:?}: {e}", pair.key))
                    })?;
                    String::from_utf8_lossy(&bytes).into_owned()
                }
                None => String::new(),
            };
            out.push((pair.key, value));
        }
        out.sort();
        Ok(out)
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let url = self.endpoint(&format!("/v1/kv/{key}"))?;
        self.client
            .put(url)
            .body(value.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_port_uses_default() {
        let s = ServiceInstance::new("n1", "10.0.0.1", 0);
        assert_eq!(s.url(), "http://10.0.0.1:8765");
        let s = ServiceInstance::new("n1", "10.0.0.1", 9000);
        assert_eq!(s.url(), "http://10.0.0.1:9000");
    }

    #[tokio::test]
    async fn memory_registry_lists_by_prefix() {
        let reg = MemoryRegistry::new();
        reg.set("partitions/a*", "x");
        reg.set("partitions/b*", "y");
        reg.set("busyness/n1", "3");
        reg.kv_put("partitionsX", "z").await.unwrap();

        let pairs = reg.kv_list("partitions/").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "partitions/a*");
        assert_eq!(reg.put_count(), 1);
    }

    #[tokio::test]
    async fn register_replaces_same_node() {
        let reg = MemoryRegistry::new();
        reg.register("search-api", ServiceInstance::new("n1", "10.0.0.1", 1));
        reg.register("search-api", ServiceInstance::new("n1", "10.0.0.2", 1));
        reg.register("search-api", ServiceInstance::new("n2", "10.0.0.3", 1));
        let list = reg.services("search-api").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, "10.0.0.2");
        reg.deregister("search-api", "n2");
        assert_eq!(reg.services("search-api").await.unwrap().len(), 1);
        assert!(reg.services("other").await.unwrap().is_empty());
    }
}
