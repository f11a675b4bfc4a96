//! Cluster coordination: membership, file-to-node routing and busyness.
//!
//! A search issued on any node may need data stored on others. The
//! [`Dispatcher`] consults the [`Registry`] to find out which nodes hold the
//! requested files and builds a local, remote or multiplexed engine
//! accordingly.

pub mod busyness;
pub mod dispatcher;
pub mod registry;
pub mod routing;

pub use busyness::{node_metrics, BusyGuard, Busyness, BusynessReporter};
pub use dispatcher::{
    arrange, is_routing_incomplete, select, ClusterNode, Dispatcher, DispatcherOptions,
    LocalEngineFactory, LocalNode,
};
pub use registry::{ConsulRegistry, MemoryRegistry, Registry, ServiceInstance};
pub use routing::{partitions_prefix, PartitionMap};
