//! Server configuration and environment-driven component factory.
//!
//! [`ServerConfig`] is loaded from YAML (kebab-case keys) and every field has a
//! default, so an empty file yields a local-only development setup.
//! [`ComponentFactory`] picks the cluster registry implementation from the
//! environment.

use crate::catalog::{CatalogCache, CatalogOptions};
use crate::cluster::dispatcher::{Dispatcher, DispatcherOptions, LocalEngineFactory, LocalNode};
use crate::cluster::registry::{ConsulRegistry, MemoryRegistry, Registry, ServiceInstance};
use crate::files::SafeLocks;
use crate::search::decoder::{DecoderEngine, DecoderOptions};
use crate::search::fake::{FakeEngine, ScanOptions};
use crate::search::local::{LocalEngine, LocalOptions};
use crate::search::Engine;
use crate::user_config::UserConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default port of a search node when the registry reports port 0.
pub const DEFAULT_PORT: u16 = 8765;

/// Which engine serves local searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SearchBackendKind {
    #[default]
    Local,
    Fake,
}

/// Options handed to the local search backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BackendOptions {
    /// Filesystem root under which every user path is resolved.
    pub mount_point: PathBuf,
    /// Home directory used when the caller has none.
    pub home_dir: String,
    /// Instance name, prefix of temporary output files.
    pub instance_name: String,
    /// Native scanner executable.
    pub tool_path: String,
    /// Host stamped on records; empty means the server host name.
    pub index_host: String,
    /// Keep temporary data/index outputs and work catalogs after a search.
    pub keep_files: bool,
    /// Boolean operators merged into one scanner expression, negative for
    /// no limit.
    pub optimizer_limit: i64,
}

impl BackendOptions {
    pub fn optimizer_limit(&self) -> Option<usize> {
        usize::try_from(self.optimizer_limit).ok()
    }
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/tmp/searchfabric"),
            home_dir: "/".to_string(),
            instance_name: ".work".to_string(),
            tool_path: "ryftprim".to_string(),
            index_host: String::new(),
            keep_files: false,
            optimizer_limit: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    pub algorithm: String,
    /// Signing secret; a random one is generated at start-up when absent.
    pub secret: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            algorithm: "HS256".to_string(),
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CatalogSettings {
    #[serde(with = "data_size_serde")]
    pub max_data_file_size: u64,
    #[serde(with = "duration_serde")]
    pub cache_drop_timeout: Duration,
    pub default_data_delim: String,
    pub temp_dir: PathBuf,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            max_data_file_size: 64 * 1024 * 1024,
            cache_drop_timeout: Duration::from_secs(10),
            default_data_delim: "\n\u{c}\n".to_string(),
            temp_dir: PathBuf::from("/tmp/searchfabric-catalogs"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    #[default]
    None,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthSettings {
    pub provider: AuthKind,
    pub users_file: Option<PathBuf>,
}

/// Script usable by the `script(...)` transform.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScriptConfig {
    /// Executable followed by its fixed arguments.
    pub path: Vec<String>,
}

/// Final processor run after the drain of a search with a `job-type`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FinalProcessorConfig {
    pub exec: Vec<String>,
    pub config_file: Option<String>,
    #[serde(with = "opt_duration_serde")]
    pub file_lifetime: Option<Duration>,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    pub address: String,
    pub search_backend: SearchBackendKind,
    pub backend_options: BackendOptions,
    pub local_only: bool,
    pub keep_results: bool,
    #[serde(with = "duration_serde")]
    pub http_timeout: Duration,
    pub busyness_tolerance: u64,
    #[serde(with = "duration_serde")]
    pub busyness_update_latency: Duration,
    pub sessions: SessionConfig,
    pub catalogs: CatalogSettings,
    /// Job store database.
    pub settings_path: PathBuf,
    #[serde(with = "duration_serde")]
    pub job_worker_delay: Duration,
    pub auth: AuthSettings,
    pub post_proc_scripts: BTreeMap<String, ScriptConfig>,
    pub final_processors: BTreeMap<String, FinalProcessorConfig>,
    pub docker_images: BTreeMap<String, Vec<String>>,
    pub default_user_config: UserConfig,
    pub consul_address: Option<String>,
    pub service_name: String,
    pub host_name: String,
    /// Echo bound request parameters into `stat.extra.request`.
    pub extra_request: bool,
    pub logging: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            search_backend: SearchBackendKind::Local,
            backend_options: BackendOptions::default(),
            local_only: true,
            keep_results: false,
            http_timeout: Duration::from_secs(3600),
            busyness_tolerance: 0,
            busyness_update_latency: Duration::from_secs(1),
            sessions: SessionConfig::default(),
            catalogs: CatalogSettings::default(),
            settings_path: PathBuf::from("/tmp/searchfabric/.settings.db"),
            job_worker_delay: Duration::from_secs(1),
            auth: AuthSettings::default(),
            post_proc_scripts: BTreeMap::new(),
            final_processors: BTreeMap::new(),
            docker_images: BTreeMap::new(),
            default_user_config: UserConfig::default(),
            consul_address: None,
            service_name: "search-api".to_string(),
            host_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            extra_request: false,
            logging: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| Error::Config(format!("bad config: {e}")))
    }

    /// Port part of the listen address.
    pub fn port(&self) -> u16 {
        self.address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Host stamped on records produced by this node.
    pub fn index_host(&self) -> String {
        if self.backend_options.index_host.is_empty() {
            self.host_name.clone()
        } else {
            self.backend_options.index_host.clone()
        }
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the cluster registry from environment
    ///
    /// Environment variables:
    /// - REGISTRY_BACKEND: "memory" (default) or "consul"
    /// - CONSUL_HTTP_ADDR: Consul agent address (falls back to `consul-address`)
    pub fn create_registry(config: &ServerConfig) -> Result<Arc<dyn Registry>> {
        let backend = std::env::var("REGISTRY_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory registry (single node)");
                let registry = MemoryRegistry::new();
                registry.register(
                    &config.service_name,
                    ServiceInstance {
                        node: config.host_name.clone(),
                        address: "127.0.0.1".to_string(),
                        port: config.port(),
                        tags: Vec::new(),
                    },
                );
                Ok(Arc::new(registry))
            }
            "consul" => {
                let address = std::env::var("CONSUL_HTTP_ADDR")
                    .ok()
                    .or_else(|| config.consul_address.clone())
                    .ok_or_else(|| {
                        Error::Config(
                            "CONSUL_HTTP_ADDR required when REGISTRY_BACKEND=consul".to_string(),
                        )
                    })?;
                info!(address = %address, "Using Consul registry");
                Ok(Arc::new(ConsulRegistry::new(&address)?))
            }
            _ => Err(Error::Config(format!(
                "Unknown REGISTRY_BACKEND: {}. Use 'memory' or 'consul'",
                backend
            ))),
        }
    }
}

impl ComponentFactory {
    /// Catalog cache settings from the `catalogs` section.
    pub fn catalog_options(config: &ServerConfig) -> CatalogOptions {
        CatalogOptions {
            data_size_limit: config.catalogs.max_data_file_size,
            default_delimiter: config.catalogs.default_data_delim.clone(),
            drop_timeout: config.catalogs.cache_drop_timeout,
        }
    }

    /// Engine factory for searches served by this node, keyed by user home.
    pub fn local_engine_factory(
        config: &ServerConfig,
        catalogs: CatalogCache,
        locks: SafeLocks,
    ) -> LocalEngineFactory {
        let kind = config.search_backend;
        let backend = LocalOptions::from_backend(&config.backend_options, config.index_host());
        let optimizer_limit = config.backend_options.optimizer_limit();
        Arc::new(move |home: &str| -> Result<Arc<dyn Engine>> {
            let engine: Arc<dyn Engine> = match kind {
                SearchBackendKind::Local => Arc::new(LocalEngine::new(
                    backend.clone().with_home(home),
                    catalogs.clone(),
                    locks.clone(),
                )),
                SearchBackendKind::Fake => Arc::new(FakeEngine::scan(ScanOptions {
                    mount_point: backend.mount_point.clone(),
                    home_dir: home.to_string(),
                    host: backend.index_host.clone(),
                })),
            };
            let decoder = DecoderOptions {
                home: backend.clone().with_home(home).home(),
                instance_name: backend.instance_name.clone(),
                keep_files: backend.keep_files,
                optimizer_limit,
            };
            Ok(Arc::new(DecoderEngine::new(engine, decoder, catalogs.clone())))
        })
    }

    /// Dispatcher over `registry`; `None` keeps every search local.
    pub fn create_dispatcher(
        config: &ServerConfig,
        registry: Option<Arc<dyn Registry>>,
        local: LocalNode,
        local_engine: LocalEngineFactory,
    ) -> Dispatcher {
        let options = DispatcherOptions {
            service_name: config.service_name.clone(),
            tolerance: config.busyness_tolerance,
            local_only: config.local_only,
            http_timeout: config.http_timeout,
            host_name: config.host_name.clone(),
        };
        Dispatcher::new(registry, local, options, local_engine)
    }
}

/// Parse a data size like `64MB`, `16MiB`, `10 kb` or `1024`.
///
/// Suffixes are case-insensitive and 1024-based.
pub fn parse_data_size(raw: &str) -> Result<u64> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s
        .strip_suffix("bytes")
        .or_else(|| s.strip_suffix("ib"))
        .or_else(|| s.strip_suffix('b'))
        .unwrap_or(s.as_str())
        .trim_end();

    let (digits, scale) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1u64 << 10),
        Some('m') => (&s[..s.len() - 1], 1 << 20),
        Some('g') => (&s[..s.len() - 1], 1 << 30),
        Some('t') => (&s[..s.len() - 1], 1 << 40),
        _ => (s, 1),
    };
    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid data size: {raw}")))?;
    if value < 0.0 {
        return Err(Error::Config(format!("invalid data size: {raw}")));
    }
    Ok((value * scale as f64) as u64)
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.filter(|r| !r.trim().is_empty())
            .map(|r| humantime::parse_duration(r.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod data_size_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(*v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Text(t) => super::parse_data_size(&t).map_err(serde::de::Error::custom),
        }
    }
}
