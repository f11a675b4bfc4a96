//! Integration tests for the multiplexing engine.

use searchfabric::search::fake::{FakeEngine, FakeScript};
use searchfabric::search::mux::MuxEngine;
use searchfabric::search::{Engine, Event, SearchConfig, SearchResult, Stat};
use std::sync::Arc;
use std::time::Duration;

fn scripted(host: &str, script: FakeScript) -> Arc<dyn Engine> {
    Arc::new(FakeEngine::scripted(host, script))
}

async fn drain(mut res: SearchResult) -> (usize, usize, SearchResult) {
    let (mut records, mut errors) = (0, 0);
    while let Some(ev) = res.next_event().await {
        match ev {
            Event::Record(_) => records += 1,
            Event::Error(_) => errors += 1,
        }
    }
    (records, errors, res)
}

fn alive_tasks() -> usize {
    tokio::runtime::Handle::current().metrics().num_alive_tasks()
}

#[tokio::test]
async fn count_only_search_reports_stat_without_records() {
    let mux = MuxEngine::new(
        "coord",
        vec![
            scripted("a", FakeScript { records: 30, ..Default::default() }),
            scripted("b", FakeScript { records: 12, ..Default::default() }),
        ],
    );
    let mut cfg = SearchConfig::new("hello", vec![]);
    cfg.limit = Some(0);
    let cfg = cfg.normalized();
    assert!(cfg.is_count_only());

    let (records, errors, mut res) = drain(mux.search(&cfg).await.unwrap()).await;
    assert_eq!(records, 0);
    assert_eq!(errors, 0);
    assert!(res.is_done());
    let stat = res.take_stat().expect("count must report a stat");
    assert_eq!(stat.matches, 42);
}

#[tokio::test]
async fn cancelled_search_leaves_no_tasks_behind() {
    let baseline = alive_tasks();
    let slow = FakeScript {
        records: 1_000_000,
        latency: Duration::from_millis(1),
        ..Default::default()
    };
    let mux = MuxEngine::new(
        "coord",
        vec![scripted("a", slow.clone()), scripted("b", slow.clone()), scripted("c", slow)],
    );
    let mut res = mux.search(&SearchConfig::new("q", vec![])).await.unwrap();
    for _ in 0..10 {
        res.next_event().await;
    }
    res.cancel();
    tokio::time::timeout(Duration::from_secs(5), async {
        while res.next_event().await.is_some() {}
    })
    .await
    .expect("cancelled search did not finish");
    drop(res);

    let mut settled = false;
    for _ in 0..100 {
        if alive_tasks() <= baseline {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "{} tasks still alive", alive_tasks() - baseline);
}

#[tokio::test]
async fn dropping_a_running_result_in_background_stops_children() {
    let baseline = alive_tasks();
    let slow = FakeScript {
        records: 1_000_000,
        latency: Duration::from_millis(1),
        ..Default::default()
    };
    let mux = MuxEngine::new("coord", vec![scripted("a", slow.clone()), scripted("b", slow)]);
    let mut res = mux.search(&SearchConfig::new("q", vec![])).await.unwrap();
    res.next_event().await;
    res.cancel_in_background();

    let mut settled = false;
    for _ in 0..200 {
        if alive_tasks() <= baseline {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled);
}

#[tokio::test]
async fn merged_stat_sums_counters_and_keeps_longest_duration() {
    let mux = MuxEngine::new(
        "coord",
        vec![
            scripted("a", FakeScript { records: 3, matches: Some(100), ..Default::default() }),
            scripted("b", FakeScript { records: 9, matches: Some(5), ..Default::default() }),
        ],
    );
    let (records, _, res) = drain(mux.search(&SearchConfig::new("q", vec![])).await.unwrap()).await;
    assert_eq!(records, 12);

    let stat = res.stat().unwrap();
    assert_eq!(stat.host, "coord");
    assert_eq!(stat.matches, 105);
    let longest = stat.details.iter().map(|d| d.duration).max().unwrap();
    assert_eq!(stat.duration, longest);
    let bytes: u64 = stat.details.iter().map(|d| d.total_bytes).sum();
    assert_eq!(stat.total_bytes, bytes);
}

#[test]
fn stat_merge_rules() {
    let mut total = Stat::new("coord");
    let mut a = Stat::new("a");
    a.matches = 10;
    a.total_bytes = 1000;
    a.duration = 40;
    a.fabric_duration = 30;
    a.data_rate = 1.5;
    let mut b = Stat::new("b");
    b.matches = 5;
    b.total_bytes = 500;
    b.duration = 70;
    b.fabric_duration = 10;
    b.data_rate = 2.0;

    total.merge(a);
    total.merge(b);
    assert_eq!(total.matches, 15);
    assert_eq!(total.total_bytes, 1500);
    assert_eq!(total.duration, 70);
    assert_eq!(total.fabric_duration, 30);
    assert!((total.data_rate - 3.5).abs() < f64::EPSILON);
    assert_eq!(total.details.len(), 2);
}

#[tokio::test]
async fn backends_with_errors_only_do_not_stop_siblings() {
    let mux = MuxEngine::new(
        "coord",
        vec![
            scripted("a", FakeScript { records: 4, ..Default::default() }),
            scripted("b", FakeScript { errors: 2, ..Default::default() }),
        ],
    );
    let (records, errors, res) = drain(mux.search(&SearchConfig::new("q", vec![])).await.unwrap()).await;
    assert_eq!(records, 4);
    assert_eq!(errors, 2);
    assert!(res.stat().is_some());
}

#[tokio::test]
async fn aggregations_of_two_nodes_merge_into_final_values() {
    use searchfabric::search::aggs::{finalize, Aggregations};
    use serde_json::json;

    let request = json!({
        "avg_price": {"avg": {"field": "price"}},
        "price": {"extended_stats": {"field": "price"}},
        "per_month": {"date_histogram": {"field": "sold", "interval": "month"}},
    });
    let node = |records: Vec<serde_json::Value>| {
        let mut aggs = Aggregations::parse(&request).unwrap().unwrap();
        for r in &records {
            aggs.add(r).unwrap();
        }
        FakeScript {
            records: records.len() as u64,
            aggregations: Some(aggs.to_intermediate()),
            ..Default::default()
        }
    };
    let mux = MuxEngine::new(
        "coord",
        vec![
            scripted(
                "a",
                node(vec![
                    json!({"price": 2, "sold": "2024-01-05T10:00:00Z"}),
                    json!({"price": 4, "sold": "2024-02-01T00:00:00Z"}),
                ]),
            ),
            scripted(
                "b",
                node(vec![
                    json!({"price": 6, "sold": "2024-01-31T23:59:59Z"}),
                    json!({"price": 8, "sold": "2024-03-10 12:00:00"}),
                ]),
            ),
        ],
    );

    let (_, _, mut res) = drain(mux.search(&SearchConfig::new("x", vec![])).await.unwrap()).await;
    let mut stat = res.take_stat().unwrap();
    finalize(&request, &mut stat).unwrap();

    let out = &stat.extra["aggregations"];
    assert_eq!(out["avg_price"]["value"], json!(5.0));
    assert_eq!(out["price"]["count"], json!(4));
    assert_eq!(out["price"]["min"], json!(2.0));
    assert_eq!(out["price"]["max"], json!(8.0));
    assert_eq!(out["price"]["sum_of_squares"], json!(120.0));
    assert_eq!(out["price"]["variance"], json!(5.0));
    let months: Vec<_> = out["per_month"]["buckets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| (b["key_as_string"].as_str().unwrap().to_string(), b["doc_count"].as_u64().unwrap()))
        .collect();
    assert_eq!(
        months,
        vec![
            ("2024-01-01T00:00:00.000Z".to_string(), 2),
            ("2024-02-01T00:00:00.000Z".to_string(), 1),
            ("2024-03-01T00:00:00.000Z".to_string(), 1),
        ]
    );
}
