//! Shared telemetry bootstrap for the searchfabric server.
//!
//! Builds a JSON `tracing` pipeline whose filter can be swapped at runtime
//! (see [`LogLevels`]) and installs the OpenTelemetry SDK providers used by
//! the HTTP middleware instruments.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_INSTANCE: &str = "searchfabric.instance";

/// Subsystem names accepted by `/logging/level`, with their tracing targets.
pub const SUBSYSTEMS: &[(&str, &str)] = &[
    ("core", "searchfabric::api"),
    ("core/catalogs", "searchfabric::catalog"),
    ("core/pending-jobs", "searchfabric::jobs"),
    ("core/busyness", "searchfabric::cluster::busyness"),
    ("search/local", "searchfabric::search::local"),
    ("search/http", "searchfabric::search::http"),
    ("search/mux", "searchfabric::search::mux"),
    ("search/fake", "searchfabric::search::fake"),
];

const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Parsed telemetry configuration from environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub traces_sampler: String,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim().to_string();
        if service_name.is_empty() {
            return Err(Error::Config("OTEL_SERVICE_NAME cannot be empty".to_string()));
        }

        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let enabled = parse_optional_bool("SEARCHFABRIC_TELEMETRY_ENABLED")?
            .unwrap_or(endpoint.is_some());

        let sampler_name = std::env::var("OTEL_TRACES_SAMPLER")
            .unwrap_or_else(|_| "parentbased_always_on".to_string());
        let sampler_arg = std::env::var("OTEL_TRACES_SAMPLER_ARG").ok();
        let sampler = parse_sampler(&sampler_name, sampler_arg.as_deref())?;

        let mut attrs: BTreeMap<String, String> = BTreeMap::new();
        if let Ok(raw) = std::env::var("OTEL_RESOURCE_ATTRIBUTES") {
            attrs.extend(parse_resource_attributes(&raw)?);
        }
        attrs.insert(ATTR_SERVICE_NAME.to_string(), service_name.clone());
        attrs
            .entry(ATTR_SERVICE_NAMESPACE.to_string())
            .or_insert_with(|| "searchfabric".to_string());
        if let Ok(instance) = std::env::var("SEARCHFABRIC_INSTANCE") {
            attrs.insert(ATTR_INSTANCE.to_string(), instance);
        }

        Ok(Self {
            enabled,
            service_name,
            otlp_endpoint: endpoint,
            traces_sampler: sampler_name,
            resource_attributes: attrs
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
            sampler,
        })
    }
}

/// Handle that keeps telemetry SDK providers alive for process lifetime.
pub struct Telemetry {
    config: TelemetryConfig,
    log_levels: LogLevels,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Initialize tracing + OTel SDK providers for the server.
    ///
    /// `log_level` is the default level; `overrides` are per-subsystem levels
    /// keyed by the names in [`SUBSYSTEMS`].
    pub fn init_for_component(
        default_service_name: &str,
        log_level: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let log_levels = LogLevels::new(log_level)?;
        log_levels.set_many(overrides)?;

        let (filter, handle) = reload::Layer::new(EnvFilter::new(log_levels.directives()));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
            .map_err(|e| Error::Config(format!("failed to initialize telemetry subscriber: {e}")))?;
        log_levels.attach(handle);

        let resource =
            Resource::default().merge(&Resource::new(config.resource_attributes.clone()));
        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::Config::default()
                    .with_sampler(config.sampler.clone())
                    .with_resource(resource.clone()),
            )
            .build();
        let _ = global::set_tracer_provider(tracer_provider.clone());

        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        info!(
            service_name = %config.service_name,
            telemetry_enabled = config.enabled,
            otlp_endpoint = %config.otlp_endpoint.as_deref().unwrap_or("none"),
            traces_sampler = %config.traces_sampler,
            "Telemetry bootstrap initialized"
        );

        Ok(Self {
            config,
            log_levels,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Runtime log level handle for the HTTP layer.
    pub fn log_levels(&self) -> LogLevels {
        self.log_levels.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
    }
}

struct LogLevelsInner {
    default: String,
    levels: BTreeMap<String, String>,
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

/// Per-subsystem log levels that can be changed while the server runs.
///
/// A detached instance (no subscriber attached) only records levels; the
/// HTTP layer behaves the same either way.
#[derive(Clone)]
pub struct LogLevels {
    inner: Arc<RwLock<LogLevelsInner>>,
}

impl LogLevels {
    pub fn new(default: &str) -> Result<Self> {
        let default = parse_log_level(default)?;
        let levels = SUBSYSTEMS
            .iter()
            .map(|(name, _)| (name.to_string(), default.clone()))
            .collect();
        Ok(Self {
            inner: Arc::new(RwLock::new(LogLevelsInner {
                default,
                levels,
                handle: None,
            })),
        })
    }

    fn attach(&self, handle: reload::Handle<EnvFilter, Registry>) {
        self.inner.write().handle = Some(handle);
    }

    /// Current level of every subsystem.
    pub fn get_all(&self) -> BTreeMap<String, String> {
        self.inner.read().levels.clone()
    }

    /// Set one or more subsystem levels. Nothing is changed if any pair is invalid.
    pub fn set_many(&self, updates: &BTreeMap<String, String>) -> Result<()> {
        let mut parsed = Vec::with_capacity(updates.len());
        for (name, level) in updates {
            if !SUBSYSTEMS.iter().any(|(n, _)| n == name) {
                return Err(Error::BadRequest(format!("unknown logger name: {name}")));
            }
            let level = parse_log_level(level).map_err(|_| {
                Error::BadRequest(format!("invalid log level '{level}' for {name}"))
            })?;
            parsed.push((name.clone(), level));
        }

        let mut inner = self.inner.write();
        for (name, level) in parsed {
            inner.levels.insert(name, level);
        }
        if let Some(handle) = &inner.handle {
            let filter = EnvFilter::new(build_directives(&inner.default, &inner.levels));
            handle
                .reload(filter)
                .map_err(|e| Error::Internal(format!("failed to reload log filter: {e}")))?;
        }
        Ok(())
    }

    /// `EnvFilter` directive string for the current levels.
    pub fn directives(&self) -> String {
        let inner = self.inner.read();
        build_directives(&inner.default, &inner.levels)
    }
}

fn build_directives(default: &str, levels: &BTreeMap<String, String>) -> String {
    let mut out = default.to_string();
    for (name, target) in SUBSYSTEMS {
        if let Some(level) = levels.get(*name) {
            out.push_str(&format!(",{target}={level}"));
        }
    }
    out
}

fn parse_log_level(raw: &str) -> Result<String> {
    let level = raw.trim().to_ascii_lowercase();
    let level = match level.as_str() {
        "warning" => "warn".to_string(),
        "fatal" | "panic" => "error".to_string(),
        _ => level,
    };
    if LEVELS.contains(&level.as_str()) {
        Ok(level)
    } else {
        Err(Error::Config(format!(
            "invalid log level '{raw}', expected one of [trace, debug, info, warn, error, off]"
        )))
    }
}

fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    let ratio = || -> Result<f64> {
        let raw = arg.ok_or_else(|| {
            Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
        })?;
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|e| Error::Config(format!("OTEL_TRACES_SAMPLER_ARG must be a float: {e}")))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::Config(format!(
                "OTEL_TRACES_SAMPLER_ARG must be in [0,1], got {value}"
            )));
        }
        Ok(value)
    };

    match name.trim().to_ascii_lowercase().as_str() {
        "always_on" => Ok(Sampler::AlwaysOn),
        "always_off" => Ok(Sampler::AlwaysOff),
        "traceidratio" => Ok(Sampler::TraceIdRatioBased(ratio()?)),
        "parentbased_always_on" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        "parentbased_always_off" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOff))),
        "parentbased_traceidratio" => Ok(Sampler::ParentBased(Box::new(
            Sampler::TraceIdRatioBased(ratio()?),
        ))),
        other => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER '{other}' is not supported"
        ))),
    }
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(
                "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
            ));
        }
        attrs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_build_directives_per_target() {
        let levels = LogLevels::new("info").unwrap();
        let mut update = BTreeMap::new();
        update.insert("core/catalogs".to_string(), "debug".to_string());
        levels.set_many(&update).unwrap();

        let directives = levels.directives();
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("searchfabric::catalog=debug"));
        assert_eq!(levels.get_all()["core/catalogs"], "debug");
    }

    #[test]
    fn log_levels_reject_unknown_names_atomically() {
        let levels = LogLevels::new("warn").unwrap();
        let mut update = BTreeMap::new();
        update.insert("core".to_string(), "debug".to_string());
        update.insert("nope".to_string(), "debug".to_string());

        let err = levels.set_many(&update).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(levels.get_all()["core"], "warn", "no partial update");
    }

    #[test]
    fn parse_resource_attributes_rejects_invalid_pairs() {
        let err = parse_resource_attributes("broken").unwrap_err();
        assert!(format!("{err}").contains("key=value"));
    }

    #[test]
    fn parse_sampler_requires_ratio_arg() {
        let err = parse_sampler("traceidratio", None).unwrap_err();
        assert!(format!("{err}").contains("OTEL_TRACES_SAMPLER_ARG"));
    }
}
