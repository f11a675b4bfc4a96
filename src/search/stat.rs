//! Search statistics.

use super::aggs::merge_intermediate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EXTRA_PERFORMANCE: &str = "performance";
pub const EXTRA_SESSION_DATA: &str = "session-data";
pub const EXTRA_AGGREGATIONS: &str = "aggregations";

/// Processing statistics of one search, possibly merged from many nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stat {
    /// Total records matched
    pub matches: u64,
    /// Total input bytes processed
    pub total_bytes: u64,
    /// Processing duration, milliseconds
    pub duration: u64,
    /// MB/sec
    pub data_rate: f64,
    /// Fabric processing duration, milliseconds
    pub fabric_duration: u64,
    /// MB/sec
    pub fabric_data_rate: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<Stat>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Stat {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Merge statistics of another node.
    ///
    /// Counters and data rates are summed, durations take the maximum and
    /// the other stat is kept in `details`.
    pub fn merge(&mut self, other: Stat) {
        self.matches += other.matches;
        self.total_bytes += other.total_bytes;
        self.duration = self.duration.max(other.duration);
        self.fabric_duration = self.fabric_duration.max(other.fabric_duration);
        self.data_rate += other.data_rate;
        self.fabric_data_rate += other.fabric_data_rate;

        if let Some(aggs) = other.extra.get(EXTRA_AGGREGATIONS) {
            match self.extra.get_mut(EXTRA_AGGREGATIONS) {
                Some(mine) => merge_intermediate(mine, aggs),
                None => {
                    self.extra
                        .insert(EXTRA_AGGREGATIONS.to_string(), aggs.clone());
                }
            }
        }

        self.details.push(other);
    }

    /// Add a named performance metric under `extra.performance`.
    pub fn add_perf_stat(&mut self, name: &str, data: Value) {
        let perf = self
            .extra
            .entry(EXTRA_PERFORMANCE.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(perf) = perf {
            perf.insert(name.to_string(), data);
        }
    }

    /// Add a named session data field under `extra.session-data`.
    pub fn add_session_data(&mut self, name: &str, data: Value) {
        let sd = self
            .extra
            .entry(EXTRA_SESSION_DATA.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(sd) = sd {
            sd.insert(name.to_string(), data);
        }
    }

    pub fn session_data(&self) -> Option<&Value> {
        self.extra.get(EXTRA_SESSION_DATA)
    }

    pub fn session_data_mut(&mut self) -> Option<&mut Map<String, Value>> {
        match self.extra.get_mut(EXTRA_SESSION_DATA) {
            Some(Value::Object(sd)) => Some(sd),
            _ => None,
        }
    }

    /// Remove session data, optionally from every detail too.
    pub fn clear_session_data(&mut self, recursive: bool) {
        if recursive {
            for d in &mut self.details {
                d.clear_session_data(true);
            }
        }
        self.extra.remove(EXTRA_SESSION_DATA);
    }

    /// Session data of every node: the details' data if any, else our own.
    pub fn collect_session_data(&self) -> Vec<Value> {
        let from_details: Vec<Value> = self
            .details
            .iter()
            .filter_map(|d| d.session_data().cloned())
            .collect();
        if !from_details.is_empty() {
            return from_details;
        }
        self.session_data().cloned().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_sums_counters_and_maxes_durations() {
        let mut total = Stat::new("coordinator");
        let mut a = Stat::new("a");
        a.matches = 10;
        a.total_bytes = 100;
        a.duration = 5;
        a.fabric_duration = 3;
        a.data_rate = 1.5;
        let mut b = Stat::new("b");
        b.matches = 7;
        b.total_bytes = 50;
        b.duration = 9;
        b.fabric_duration = 1;
        b.data_rate = 0.5;

        total.merge(a);
        total.merge(b);

        assert_eq!(total.matches, 17);
        assert_eq!(total.total_bytes, 150);
        assert_eq!(total.duration, 9);
        assert_eq!(total.fabric_duration, 3);
        assert!((total.data_rate - 2.0).abs() < f64::EPSILON);
        assert_eq!(total.details.len(), 2);
        assert_eq!(total.host, "coordinator");
    }

    #[test]
    fn merge_combines_aggregation_engines() {
        let mut total = Stat::new("");
        let mut a = Stat::new("a");
        a.extra.insert(
            EXTRA_AGGREGATIONS.into(),
            json!({
                "stat.price": {"count": 2, "sum": 10.0, "sum2": 58.0, "min": 3.0, "max": 7.0},
                "datehist.field::ts/interval::month": {"buckets": {
                    "2024-01-01T00:00:00.000Z": {"count": 2},
                }},
            }),
        );
        let mut b = Stat::new("b");
        b.extra.insert(
            EXTRA_AGGREGATIONS.into(),
            json!({
                "stat.price": {"count": 2, "sum": 20.0, "sum2": 362.0, "min": 1.0, "max": 19.0},
                "datehist.field::ts/interval::month": {"buckets": {
                    "2024-01-01T00:00:00.000Z": {"count": 1},
                    "2024-02-01T00:00:00.000Z": {"count": 4},
                }},
            }),
        );
        let mut empty = Stat::new("c");
        empty.extra.insert(
            EXTRA_AGGREGATIONS.into(),
            json!({"stat.price": {"count": 0, "sum": 0.0, "sum2": 0.0, "min": 0.0, "max": 0.0}}),
        );
        total.merge(a);
        total.merge(b);
        total.merge(empty);

        let aggs = &total.extra[EXTRA_AGGREGATIONS];
        let price = &aggs["stat.price"];
        assert_eq!(price["sum"], json!(30.0));
        assert_eq!(price["sum2"], json!(420.0));
        assert_eq!(price["count"], json!(4));
        assert_eq!(price["min"], json!(1.0));
        assert_eq!(price["max"], json!(19.0));
        let buckets = &aggs["datehist.field::ts/interval::month"]["buckets"];
        assert_eq!(buckets["2024-01-01T00:00:00.000Z"]["count"], json!(3));
        assert_eq!(buckets["2024-02-01T00:00:00.000Z"]["count"], json!(4));
    }

    #[test]
    fn session_data_prefers_details() {
        let mut root = Stat::new("");
        root.add_session_data("data", json!("root.dat"));
        let mut child = Stat::new("n1");
        child.add_session_data("data", json!("child.dat"));
        root.details.push(child);

        let all = root.collect_session_data();
        assert_eq!(all, vec![json!({"data": "child.dat"})]);

        root.clear_session_data(true);
        assert!(root.session_data().is_none());
        assert!(root.details[0].session_data().is_none());
    }

    #[test]
    fn stat_serializes_camel_case() {
        let mut s = Stat::new("h");
        s.total_bytes = 1;
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["totalBytes"], json!(1));
        assert_eq!(v["fabricDataRate"], json!(0.0));
        assert!(v.get("details").is_none());
    }
}
