//! Search fabric REST node
//!
//! Serves searches over the local backend and fans them out to the other
//! nodes of the cluster.

use searchfabric::api::{self, ApiState};
use searchfabric::catalog::CatalogCache;
use searchfabric::cluster::{Busyness, BusynessReporter, LocalNode};
use searchfabric::config::{ComponentFactory, ServerConfig};
use searchfabric::files::SafeLocks;
use searchfabric::jobs::{JobStore, JobWorker};
use searchfabric::telemetry::Telemetry;
use searchfabric::Error;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Search fabric REST node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "SEARCHFABRIC_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides `address`
    #[arg(long, env = "SEARCHFABRIC_ADDRESS")]
    address: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Never fan out to other nodes
    #[arg(long, env = "SEARCHFABRIC_LOCAL_ONLY")]
    local_only: bool,

    /// Root of all user paths
    #[arg(long, env = "SEARCHFABRIC_MOUNT_POINT")]
    mount_point: Option<PathBuf>,

    /// Job store database
    #[arg(long, env = "SEARCHFABRIC_SETTINGS_PATH")]
    settings_path: Option<PathBuf>,
}

impl Args {
    fn load_config(&self) -> Result<ServerConfig, Error> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if self.local_only {
            config.local_only = true;
        }
        if let Some(mount) = &self.mount_point {
            config.backend_options.mount_point = mount.clone();
        }
        if let Some(path) = &self.settings_path {
            config.settings_path = path.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    let telemetry =
        Telemetry::init_for_component("searchfabric", &args.log_level, &config.logging)?;

    info!(address = %config.address, backend = ?config.search_backend, "Starting search node");

    let shutdown = CancellationToken::new();

    let registry = if config.local_only {
        None
    } else {
        Some(ComponentFactory::create_registry(&config)?)
    };
    let local = LocalNode::detect(config.port(), &config.host_name);

    let catalogs = CatalogCache::new(ComponentFactory::catalog_options(&config));
    let locks = SafeLocks::new();
    let local_engine =
        ComponentFactory::local_engine_factory(&config, catalogs.clone(), locks.clone());
    let dispatcher = Arc::new(ComponentFactory::create_dispatcher(
        &config,
        registry.clone(),
        local,
        local_engine,
    ));

    if let Some(parent) = config.settings_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(
        JobStore::open(&config.settings_path).context("failed to open the job store")?,
    );
    let (jobs, worker) = JobWorker::new(
        store,
        Some(catalogs.clone()),
        config.job_worker_delay,
        shutdown.clone(),
    );
    let worker_task = worker.spawn();

    let (busyness, signals) = Busyness::new();
    let reporter_task = registry.clone().map(|registry| {
        BusynessReporter::new(
            busyness.clone(),
            signals,
            registry,
            config.host_name.clone(),
            config.busyness_update_latency,
            shutdown.clone(),
        )
        .spawn()
    });

    let address = config.address.clone();
    let state = ApiState::from_config(
        config,
        dispatcher,
        catalogs,
        locks,
        jobs,
        busyness,
        telemetry.log_levels(),
    )?;
    let router = api::build_router(state);

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(address = %address, "Search node ready");

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        server_shutdown.cancel();
    });

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")));

    shutdown.cancel();
    if let Err(e) = worker_task.await {
        warn!(error = %e, "job worker task failed");
    }
    if let Some(task) = reporter_task {
        if let Err(e) = task.await {
            warn!(error = %e, "busyness reporter task failed");
        }
    }

    if let Err(e) = &served {
        error!(error = %e, "server stopped with error");
    }
    info!("Search node shutting down");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
