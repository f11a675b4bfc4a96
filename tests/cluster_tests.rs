//! Integration tests for cluster coordination
//!
//! Tests partition routing, node selection, engine composition and
//! busyness reporting against an in-process registry.

use searchfabric::cluster::{
    is_routing_incomplete, partitions_prefix, Busyness, BusynessReporter, Dispatcher,
    DispatcherOptions, LocalEngineFactory, LocalNode, MemoryRegistry, Registry, ServiceInstance,
};
use searchfabric::search::fake::{FakeEngine, FakeScript};
use searchfabric::search::Engine;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SERVICE: &str = "search-api";

fn fake_factory() -> LocalEngineFactory {
    Arc::new(|_home: &str| {
        let engine: Arc<dyn Engine> =
            Arc::new(FakeEngine::scripted("local", FakeScript::default()));
        Ok(engine)
    })
}

/// Nodes A(east), B(west), C(east); A is this process.
fn three_node_cluster() -> (MemoryRegistry, Dispatcher) {
    let registry = MemoryRegistry::new();
    registry.register(
        SERVICE,
        ServiceInstance::new("A", "10.0.0.1", 8765).with_tags(["east"]),
    );
    registry.register(
        SERVICE,
        ServiceInstance::new("B", "10.0.0.2", 8765).with_tags(["west"]),
    );
    registry.register(
        SERVICE,
        ServiceInstance::new("C", "10.0.0.3", 8765).with_tags(["east"]),
    );
    registry.set(&format!("{}east/*", partitions_prefix("")), "east");
    registry.set(&format!("{}west/*", partitions_prefix("")), "west");

    let dispatcher = Dispatcher::new(
        Some(Arc::new(registry.clone())),
        LocalNode::new(8765, ["10.0.0.1"]),
        DispatcherOptions {
            service_name: SERVICE.to_string(),
            local_only: false,
            host_name: "A".to_string(),
            ..Default::default()
        },
        fake_factory(),
    );
    (registry, dispatcher)
}

fn names(nodes: &[searchfabric::cluster::ClusterNode]) -> BTreeSet<String> {
    nodes.iter().map(|n| n.instance.node.clone()).collect()
}

#[tokio::test]
async fn files_are_routed_to_nodes_carrying_their_tag() {
    let (_registry, dispatcher) = three_node_cluster();

    let nodes = dispatcher
        .select_nodes(&["east/*.txt".to_string()], "")
        .await
        .unwrap();
    assert_eq!(names(&nodes), BTreeSet::from(["A".into(), "C".into()]));
    // equal busyness: the local node leads
    assert_eq!(nodes[0].instance.node, "A");
    assert!(nodes[0].is_local);

    let engine = dispatcher
        .build_engine(false, &["east/*.txt".to_string()], None, "/", "")
        .await
        .unwrap();
    assert_eq!(engine.name(), "mux");
}

#[tokio::test]
async fn unrouted_files_use_every_node() {
    let (_registry, dispatcher) = three_node_cluster();
    let nodes = dispatcher
        .select_nodes(&["east/a.txt".to_string(), "other/b.txt".to_string()], "")
        .await
        .unwrap();
    assert_eq!(nodes.len(), 3);
}

#[tokio::test]
async fn missing_tag_reports_incomplete_routing() {
    let (registry, dispatcher) = three_node_cluster();
    registry.set(&format!("{}north/*", partitions_prefix("")), "north");

    let err = dispatcher
        .build_engine(false, &["north/x.txt".to_string()], None, "/", "")
        .await
        .err()
        .expect("routing should fail");
    assert!(is_routing_incomplete(&err));
    assert!(err.to_string().contains("north"));
}

#[tokio::test]
async fn only_local_node_selected_uses_local_engine() {
    let registry = MemoryRegistry::new();
    registry.register(
        SERVICE,
        ServiceInstance::new("A", "10.0.0.1", 8765).with_tags(["east"]),
    );
    registry.register(
        SERVICE,
        ServiceInstance::new("B", "10.0.0.2", 8765).with_tags(["west"]),
    );
    registry.set("partitions/east/*", "east");
    let dispatcher = Dispatcher::new(
        Some(Arc::new(registry)),
        LocalNode::new(8765, ["10.0.0.1"]),
        DispatcherOptions {
            service_name: SERVICE.to_string(),
            local_only: false,
            ..Default::default()
        },
        fake_factory(),
    );

    let engine = dispatcher
        .build_engine(false, &["east/1.txt".to_string()], None, "/", "")
        .await
        .unwrap();
    assert_eq!(engine.name(), "fake");
}

#[tokio::test]
async fn tenant_tag_selects_its_own_partition_map() {
    let (registry, dispatcher) = three_node_cluster();
    registry.set(&format!("{}east/*", partitions_prefix("acme")), "west");

    let nodes = dispatcher
        .select_nodes(&["east/x.txt".to_string()], "acme")
        .await
        .unwrap();
    assert_eq!(names(&nodes), BTreeSet::from(["B".into()]));
}

#[tokio::test]
async fn route_files_assigns_each_node_its_files() {
    let (_registry, dispatcher) = three_node_cluster();
    let files = vec!["east/1.txt".to_string(), "west/2.txt".to_string()];
    let routed = dispatcher.route_files(&files, "").await.unwrap();

    assert_eq!(routed.len(), 3);
    for (node, assigned) in routed {
        match node.instance.node.as_str() {
            "A" | "C" => assert_eq!(assigned, vec!["east/1.txt"]),
            "B" => assert_eq!(assigned, vec!["west/2.txt"]),
            other => panic!("unexpected node {other}"),
        }
    }
}

#[tokio::test]
async fn busy_nodes_are_moved_back() {
    let (registry, dispatcher) = three_node_cluster();
    registry.set("busyness/A", "5");
    registry.set("busyness/C", "0");

    let nodes = dispatcher
        .select_nodes(&["east/x.txt".to_string()], "")
        .await
        .unwrap();
    assert_eq!(nodes[0].instance.node, "C");
    assert_eq!(nodes[1].instance.node, "A");
}

#[tokio::test]
async fn local_only_dispatcher_ignores_the_registry() {
    let (_registry, _) = three_node_cluster();
    let dispatcher = Dispatcher::new(
        None,
        LocalNode::new(8765, ["10.0.0.1"]),
        DispatcherOptions {
            host_name: "solo".to_string(),
            ..Default::default()
        },
        fake_factory(),
    );
    assert!(dispatcher.is_local_only());
    let members = dispatcher.members().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].node, "solo");

    let engine = dispatcher
        .build_engine(false, &["east/x.txt".to_string()], None, "/", "")
        .await
        .unwrap();
    assert_eq!(engine.name(), "fake");
}

#[tokio::test]
async fn burst_of_searches_is_reported_once() {
    let registry = MemoryRegistry::new();
    let shared: Arc<dyn Registry> = Arc::new(registry.clone());
    let (busyness, signals) = Busyness::new();
    let shutdown = CancellationToken::new();
    let task = BusynessReporter::new(
        busyness.clone(),
        signals,
        shared,
        "A",
        Duration::from_millis(200),
        shutdown.clone(),
    )
    .spawn();

    let guards: Vec<_> = (0..10).map(|_| busyness.start_search()).collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(guards);
    let more: Vec<_> = (0..3).map(|_| busyness.start_search()).collect();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(registry.put_count(), 1);
    assert_eq!(registry.get("busyness/A").as_deref(), Some("3"));

    drop(more);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(registry.put_count(), 2);
    assert_eq!(registry.get("busyness/A").as_deref(), Some("0"));

    shutdown.cancel();
    task.await.unwrap();
}
