//! # searchfabric
//!
//! REST coordination layer for a distributed fuzzy-search fabric.
//!
//! Every node runs the same server. A request that arrives at any node is
//! fanned out to the nodes holding the relevant data, the partial results
//! are merged and streamed back as one response.
//!
//! ## Key Features
//!
//! - **Cluster dispatch**: nodes are picked by partition tags and ordered by
//!   busyness, with the local node preferred among equals
//! - **Streaming results**: JSON or MsgPack, tagged streams or simple bodies
//! - **Catalogs**: many small uploads packed into large data files and
//!   indexed in an embedded database
//! - **Deferred jobs**: persistent delayed deletion of temporary outputs
//!
//! ## Architecture
//!
//! - **api**: axum router, parameter binding, encoders and the drain
//! - **search**: engine trait with local, http, mux and fake backends
//! - **cluster**: registry, partition routing, dispatcher, busyness
//! - **catalog**, **files**, **jobs**: storage on the local node

pub mod api;
pub mod auth;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod files;
pub mod jobs;
pub mod postproc;
pub mod search;
pub mod session;
pub mod telemetry;
pub mod user_config;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::api::{build_router, ApiState};
    pub use crate::catalog::{Catalog, CatalogCache, CatalogOptions};
    pub use crate::cluster::{Dispatcher, MemoryRegistry, Registry, ServiceInstance};
    pub use crate::config::{ComponentFactory, ServerConfig};
    pub use crate::jobs::{JobQueue, JobStore, JobWorker};
    pub use crate::search::{Engine, Event, Record, SearchConfig, SearchResult, Stat};
    pub use crate::{Error, Result};
}
