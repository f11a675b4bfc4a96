//! REST surface of a search node.
//!
//! - `/search`, `/count`, `/pcap/*` and `/search/show` stream results
//! - `/files` and `/rename` manage standalone files and catalogs
//! - `/cluster/members`, `/logging/level`, `/user` and `/run` are admin helpers
//!
//! Every route except `/health` goes through the Basic auth middleware,
//! which puts a [`Caller`] into the request extensions.

mod admin;
pub mod encoder;
pub mod error;
mod files;
pub mod format;
pub mod params;
mod search;
mod telemetry;

pub use error::ApiError;
pub use search::{plan_show, ShowSlice};

use crate::auth::{self, AuthProvider, FileAuth, UserInfo};
use crate::catalog::CatalogCache;
use crate::cluster::{Busyness, Dispatcher};
use crate::config::{AuthKind, ServerConfig};
use crate::files::{check_relative_to_home, FileWriters, SafeLocks};
use crate::jobs::JobQueue;
use crate::postproc::{PostProcessor, ShellCommand};
use crate::session::SessionKeys;
use crate::telemetry::LogLevels;
use crate::{Error, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<ServerConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub catalogs: CatalogCache,
    pub locks: SafeLocks,
    pub writers: FileWriters,
    pub jobs: JobQueue,
    pub sessions: SessionKeys,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub busyness: Busyness,
    pub log_levels: LogLevels,
    pub post_processors: Arc<BTreeMap<String, Arc<dyn PostProcessor>>>,
    /// Client for replicated uploads, deletes and renames.
    pub client: reqwest::Client,
}

impl ApiState {
    /// Build the state; the auth provider and the final processors come
    /// from `config`.
    pub fn from_config(
        config: ServerConfig,
        dispatcher: Arc<Dispatcher>,
        catalogs: CatalogCache,
        locks: SafeLocks,
        jobs: JobQueue,
        busyness: Busyness,
        log_levels: LogLevels,
    ) -> Result<Self> {
        let sessions = SessionKeys::new(&config.sessions)?;

        let auth: Option<Arc<dyn AuthProvider>> = match config.auth.provider {
            AuthKind::None => None,
            AuthKind::File => {
                let path = config.auth.users_file.as_ref().ok_or_else(|| {
                    Error::Config("auth provider \"file\" requires users-file".to_string())
                })?;
                Some(Arc::new(FileAuth::open(path)?))
            }
        };

        let mut post_processors: BTreeMap<String, Arc<dyn PostProcessor>> = BTreeMap::new();
        for (name, cfg) in &config.final_processors {
            post_processors.insert(name.clone(), Arc::new(ShellCommand::from_config(cfg)?));
        }

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            catalogs,
            locks,
            writers: FileWriters::new(),
            jobs,
            sessions,
            auth,
            busyness,
            log_levels,
            post_processors: Arc::new(post_processors),
            client,
        })
    }

    pub fn with_auth(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    /// Register an in-process processor for a job type.
    pub fn with_post_processor(
        mut self,
        job_type: impl Into<String>,
        processor: Arc<dyn PostProcessor>,
    ) -> Self {
        let mut all = (*self.post_processors).clone();
        all.insert(job_type.into(), processor);
        self.post_processors = Arc::new(all);
        self
    }

    pub fn mount(&self) -> &Path {
        &self.config.backend_options.mount_point
    }

    /// Home of `user`, the configured home directory when the user has none.
    pub fn home_of<'a>(&'a self, user: &'a UserInfo) -> &'a str {
        if user.home.is_empty() {
            &self.config.backend_options.home_dir
        } else {
            &user.home
        }
    }

    /// Absolute home directory of `user`.
    pub fn home_path(&self, user: &UserInfo) -> Result<PathBuf> {
        check_relative_to_home(self.mount(), self.home_of(user))
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: UserInfo,
    /// Raw `Authorization` header, forwarded to other nodes.
    pub authorization: Option<String>,
}

impl Caller {
    pub fn auth(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

async fn auth_middleware(
    State(state): State<ApiState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match auth::authenticate(state.auth.as_deref(), authorization.as_deref()).await {
        Ok(user) => {
            debug!(user = %user.username, "authenticated");
            req.extensions_mut().insert(Caller {
                user,
                authorization,
            });
            next.run(req).await
        }
        Err(e) => {
            warn!(error = %e, path = %req.uri().path(), "authentication failed");
            let mut resp = ApiError::from(e).into_response();
            resp.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"search\""),
            );
            resp
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/search", get(search::search))
        .route("/count", get(search::count))
        .route("/pcap/search", get(search::pcap_search))
        .route("/pcap/count", get(search::pcap_count))
        .route("/search/show", get(search::show))
        .route(
            "/files",
            get(files::get_files)
                .post(files::post_files)
                .delete(files::delete_files),
        )
        .route("/rename", put(files::rename))
        .route("/cluster/members", get(admin::members))
        .route("/logging/level", get(admin::logging_level).put(admin::logging_level))
        .route(
            "/user",
            get(admin::get_users)
                .post(admin::create_user)
                .put(admin::update_user)
                .delete(admin::delete_users),
        )
        .route("/run", get(admin::run))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .merge(api)
        .with_state(state)
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
        .layer(CatchPanicLayer::custom(error::panic_response))
        .layer(cors)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
