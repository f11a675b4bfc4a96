//! Aggregations over the data of matched records.
//!
//! Requests name their aggregations Elasticsearch style:
//!
//! ```json
//! {"avg_price": {"avg": {"field": "price"}},
//!  "per_day": {"date_histogram": {"field": "ts", "interval": "day"}}}
//! ```
//!
//! Functions over the same field share one engine. Nodes report the
//! intermediate engine state (`stat.<field>` counters, `datehist.<...>`
//! buckets) in `extra.aggregations`; those merge per engine kind across
//! nodes and are turned into the final values by the node that answers
//! the client.

use super::stat::{Stat, EXTRA_AGGREGATIONS};
use crate::{Error, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

fn bad_aggs(msg: String) -> Error {
    Error::BadRequest(format!("failed to prepare aggregations: {msg}"))
}

/// Running statistics of one numeric field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatAgg {
    #[serde(skip)]
    field: String,
    #[serde(skip)]
    missing: Option<Value>,
    pub count: u64,
    pub sum: f64,
    pub sum2: f64,
    pub min: f64,
    pub max: f64,
}

impl StatAgg {
    fn name(&self) -> String {
        match &self.missing {
            Some(m) => format!("stat.{}/{}", self.field, m),
            None => format!("stat.{}", self.field),
        }
    }

    fn add(&mut self, record: &Value) -> Result<()> {
        let Some(value) = access(record, &self.field).or(self.missing.as_ref()) else {
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        let v = as_f64(value).ok_or_else(|| {
            Error::Engine(format!("{:?}: {} is not a number", self.field, value))
        })?;
        self.add_value(v);
        Ok(())
    }

    fn add_value(&mut self, v: f64) {
        if self.count == 0 || v < self.min {
            self.min = v;
        }
        if self.count == 0 || v > self.max {
            self.max = v;
        }
        self.sum += v;
        self.sum2 += v * v;
        self.count += 1;
    }

    fn merge(&mut self, other: &StatAgg) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 || other.min < self.min {
            self.min = other.min;
        }
        if self.count == 0 || other.max > self.max {
            self.max = other.max;
        }
        self.sum += other.sum;
        self.sum2 += other.sum2;
        self.count += other.count;
    }

    fn avg(&self) -> Value {
        if self.count == 0 {
            Value::Null
        } else {
            json!(self.sum / self.count as f64)
        }
    }

    fn extreme(&self, v: f64) -> Value {
        if self.count == 0 {
            Value::Null
        } else {
            json!(v)
        }
    }
}

/// Bucket width of a date histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Year,
    Quarter,
    Month,
    Week,
    Fixed(ChronoDuration),
}

impl Interval {
    fn parse(s: &str) -> Result<Self> {
        // "1M" is a calendar month, "1m" a minute
        Ok(match s.trim() {
            "year" | "1y" => Interval::Year,
            "quarter" | "1q" => Interval::Quarter,
            "month" | "1M" => Interval::Month,
            "week" | "1w" => Interval::Week,
            "day" | "1d" => Interval::Fixed(ChronoDuration::days(1)),
            "hour" | "1h" => Interval::Fixed(ChronoDuration::hours(1)),
            "minute" | "1m" => Interval::Fixed(ChronoDuration::minutes(1)),
            "second" | "1s" => Interval::Fixed(ChronoDuration::seconds(1)),
            other => {
                let d = humantime::parse_duration(other)
                    .map_err(|e| bad_aggs(format!("bad interval {s:?}: {e}")))?;
                let d = ChronoDuration::from_std(d)
                    .map_err(|e| bad_aggs(format!("bad interval {s:?}: {e}")))?;
                if d <= ChronoDuration::zero() {
                    return Err(bad_aggs(format!("bad interval {s:?}")));
                }
                Interval::Fixed(d)
            }
        })
    }

    fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let at = |y: i32, m: u32, d: u32| {
            Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap_or(t)
        };
        match self {
            Interval::Year => at(t.year(), 1, 1),
            Interval::Quarter => at(t.year(), (t.month0() / 3) * 3 + 1, 1),
            Interval::Month => at(t.year(), t.month(), 1),
            Interval::Week => {
                let monday = t.date_naive() - ChronoDuration::days(t.weekday().num_days_from_monday() as i64);
                at(monday.year(), monday.month(), monday.day())
            }
            Interval::Fixed(d) => {
                let step = d.num_milliseconds().max(1);
                let ms = t.timestamp_millis();
                Utc.timestamp_millis_opt(ms - ms.rem_euclid(step))
                    .single()
                    .unwrap_or(t)
            }
        }
    }

    fn label(&self) -> String {
        match self {
            Interval::Year => "year".to_string(),
            Interval::Quarter => "quarter".to_string(),
            Interval::Month => "month".to_string(),
            Interval::Week => "week".to_string(),
            Interval::Fixed(d) => format!("{}ms", d.num_milliseconds()),
        }
    }
}

/// Document counts per date bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct DateHist {
    field: String,
    missing: Option<Value>,
    interval: Interval,
    offset: ChronoDuration,
    buckets: BTreeMap<DateTime<Utc>, u64>,
}

impl DateHist {
    fn name(&self) -> String {
        let mut name = format!(
            "datehist.field::{}/interval::{}",
            self.field,
            self.interval.label()
        );
        if let Some(m) = &self.missing {
            name.push_str(&format!("/missing::{m}"));
        }
        if self.offset != ChronoDuration::zero() {
            name.push_str(&format!("/offset::{}ms", self.offset.num_milliseconds()));
        }
        name
    }

    fn add(&mut self, record: &Value) -> Result<()> {
        let Some(value) = access(record, &self.field).or(self.missing.as_ref()) else {
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        let t = parse_datetime(value).ok_or_else(|| {
            Error::Engine(format!("failed to parse datetime field {:?}: {}", self.field, value))
        })?;
        let key = self.interval.truncate(t - self.offset) + self.offset;
        *self.buckets.entry(key).or_default() += 1;
        Ok(())
    }

    fn to_intermediate(&self) -> Value {
        let buckets: Map<String, Value> = self
            .buckets
            .iter()
            .map(|(k, n)| (k.to_rfc3339_opts(SecondsFormat::Millis, true), json!({"count": n})))
            .collect();
        json!({"buckets": buckets})
    }

    fn merge(&mut self, data: &Value) -> Result<()> {
        let Some(buckets) = data.get("buckets").and_then(Value::as_object) else {
            return Ok(());
        };
        for (k, b) in buckets {
            let key = DateTime::parse_from_rfc3339(k)
                .map_err(|e| Error::Engine(format!("bad bucket key {k:?}: {e}")))?
                .with_timezone(&Utc);
            let n = b.get("count").and_then(Value::as_u64).unwrap_or(0);
            *self.buckets.entry(key).or_default() += n;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AggEngine {
    Stat(StatAgg),
    DateHist(DateHist),
}

impl AggEngine {
    fn name(&self) -> String {
        match self {
            AggEngine::Stat(s) => s.name(),
            AggEngine::DateHist(h) => h.name(),
        }
    }

    fn add(&mut self, record: &Value) -> Result<()> {
        match self {
            AggEngine::Stat(s) => s.add(record),
            AggEngine::DateHist(h) => h.add(record),
        }
    }

    fn to_intermediate(&self) -> Value {
        match self {
            AggEngine::Stat(s) => serde_json::to_value(s).unwrap_or(Value::Null),
            AggEngine::DateHist(h) => h.to_intermediate(),
        }
    }

    fn merge(&mut self, data: &Value) -> Result<()> {
        match self {
            AggEngine::Stat(s) => {
                let other: StatAgg = serde_json::from_value(data.clone())
                    .map_err(|e| Error::Engine(format!("bad intermediate {}: {e}", s.name())))?;
                s.merge(&other);
                Ok(())
            }
            AggEngine::DateHist(h) => h.merge(data),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    Stats,
    ExtendedStats { sigma: f64 },
    DateHistogram { keyed: bool, min_doc_count: u64 },
}

#[derive(Debug, Clone, PartialEq)]
struct Function {
    kind: FunctionKind,
    engine: usize,
}

/// Parsed aggregation request with its engines.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregations {
    functions: BTreeMap<String, Function>,
    engines: Vec<AggEngine>,
}

impl Aggregations {
    /// Build the engines for `opts`; `None` when nothing is requested.
    pub fn parse(opts: &Value) -> Result<Option<Self>> {
        let Some(map) = opts.as_object() else {
            return Err(bad_aggs("not a JSON object".to_string()));
        };
        let mut aggs = Aggregations {
            functions: BTreeMap::new(),
            engines: Vec::new(),
        };
        for (name, agg) in map {
            let body = agg.as_object().filter(|o| o.len() == 1).ok_or_else(|| {
                bad_aggs(format!("{name:?} contains invalid aggregation object"))
            })?;
            let Some((kind, params)) = body.iter().next() else {
                continue;
            };
            let function = aggs.function(kind, params)?;
            aggs.functions.insert(name.clone(), function);
        }
        Ok((!aggs.functions.is_empty()).then_some(aggs))
    }

    fn function(&mut self, kind: &str, params: &Value) -> Result<Function> {
        let field = params
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| bad_aggs(format!("{kind}: no \"field\" option found")))?
            .to_string();
        let missing = params.get("missing").cloned();

        let kind = match kind {
            "avg" => FunctionKind::Avg,
            "sum" => FunctionKind::Sum,
            "min" => FunctionKind::Min,
            "max" => FunctionKind::Max,
            "value_count" | "count" => FunctionKind::Count,
            "stats" => FunctionKind::Stats,
            "extended_stats" => FunctionKind::ExtendedStats {
                sigma: params.get("sigma").and_then(Value::as_f64).unwrap_or(2.0),
            },
            "date_histogram" => {
                let interval = params
                    .get("interval")
                    .or_else(|| params.get("calendar_interval"))
                    .or_else(|| params.get("fixed_interval"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad_aggs("date_histogram: no \"interval\" option found".into()))?;
                let offset = match params.get("offset").and_then(Value::as_str) {
                    Some(s) => parse_offset(s)?,
                    None => ChronoDuration::zero(),
                };
                let hist = DateHist {
                    field,
                    missing,
                    interval: Interval::parse(interval)?,
                    offset,
                    buckets: BTreeMap::new(),
                };
                let engine = self.engine(AggEngine::DateHist(hist));
                return Ok(Function {
                    kind: FunctionKind::DateHistogram {
                        keyed: params.get("keyed").and_then(Value::as_bool).unwrap_or(false),
                        min_doc_count: params.get("min_doc_count").and_then(Value::as_u64).unwrap_or(0),
                    },
                    engine,
                });
            }
            other => return Err(bad_aggs(format!("{other:?} is unknown aggregation type"))),
        };
        let engine = self.engine(AggEngine::Stat(StatAgg {
            field,
            missing,
            ..Default::default()
        }));
        Ok(Function { kind, engine })
    }

    /// Index of an engine with the same name, adding `engine` if new.
    fn engine(&mut self, engine: AggEngine) -> usize {
        let name = engine.name();
        match self.engines.iter().position(|e| e.name() == name) {
            Some(i) => i,
            None => {
                self.engines.push(engine);
                self.engines.len() - 1
            }
        }
    }

    pub fn add(&mut self, record: &Value) -> Result<()> {
        for engine in &mut self.engines {
            engine.add(record)?;
        }
        Ok(())
    }

    /// Add one record given as raw JSON data.
    pub fn add_data(&mut self, data: &[u8]) -> Result<()> {
        let record: Value = serde_json::from_slice(data)
            .map_err(|e| Error::Engine(format!("failed to parse record data as JSON: {e}")))?;
        self.add(&record)
    }

    /// Merge intermediate state reported by a node.
    pub fn merge(&mut self, intermediate: &Value) -> Result<()> {
        for engine in &mut self.engines {
            if let Some(data) = intermediate.get(engine.name()) {
                engine.merge(data)?;
            }
        }
        Ok(())
    }

    /// Engine state keyed by engine name.
    pub fn to_intermediate(&self) -> Value {
        let map: Map<String, Value> = self
            .engines
            .iter()
            .map(|e| (e.name(), e.to_intermediate()))
            .collect();
        Value::Object(map)
    }

    /// Final values keyed by the requested names.
    pub fn to_final(&self) -> Value {
        let map: Map<String, Value> = self
            .functions
            .iter()
            .map(|(name, f)| (name.clone(), self.function_value(f)))
            .collect();
        Value::Object(map)
    }

    fn function_value(&self, f: &Function) -> Value {
        let Some(engine) = self.engines.get(f.engine) else {
            return Value::Null;
        };
        match (engine, f.kind) {
            (AggEngine::Stat(s), FunctionKind::Avg) => json!({"value": s.avg()}),
            (AggEngine::Stat(s), FunctionKind::Sum) => json!({"value": s.sum}),
            (AggEngine::Stat(s), FunctionKind::Min) => json!({"value": s.extreme(s.min)}),
            (AggEngine::Stat(s), FunctionKind::Max) => json!({"value": s.extreme(s.max)}),
            (AggEngine::Stat(s), FunctionKind::Count) => json!({"value": s.count}),
            (AggEngine::Stat(s), FunctionKind::Stats) => json!({
                "avg": s.avg(),
                "sum": s.sum,
                "min": s.extreme(s.min),
                "max": s.extreme(s.max),
                "count": s.count,
            }),
            (AggEngine::Stat(s), FunctionKind::ExtendedStats { sigma }) => {
                let mut out = json!({
                    "avg": s.avg(),
                    "sum": s.sum,
                    "min": s.extreme(s.min),
                    "max": s.extreme(s.max),
                    "count": s.count,
                    "sum_of_squares": s.sum2,
                });
                if s.count > 0 {
                    let avg = s.sum / s.count as f64;
                    let variance = (s.sum2 / s.count as f64 - avg * avg).max(0.0);
                    let stdev = variance.sqrt();
                    out["variance"] = json!(variance);
                    out["std_deviation"] = json!(stdev);
                    out["std_deviation_bounds"] = json!({
                        "upper": avg + sigma * stdev,
                        "lower": avg - sigma * stdev,
                    });
                }
                out
            }
            (AggEngine::DateHist(h), FunctionKind::DateHistogram { keyed, min_doc_count }) => {
                let buckets = h
                    .buckets
                    .iter()
                    .filter(|(_, n)| **n >= min_doc_count)
                    .map(|(k, n)| {
                        let label = k.to_rfc3339_opts(SecondsFormat::Millis, true);
                        let bucket = json!({
                            "key_as_string": label,
                            "key": k.timestamp_millis(),
                            "doc_count": n,
                        });
                        (label, bucket)
                    });
                if keyed {
                    json!({"buckets": buckets.collect::<Map<String, Value>>()})
                } else {
                    json!({"buckets": buckets.map(|(_, b)| b).collect::<Vec<_>>()})
                }
            }
            _ => Value::Null,
        }
    }
}

/// Merge two intermediate aggregation maps in place, per engine kind.
pub fn merge_intermediate(mine: &mut Value, other: &Value) {
    let (Value::Object(mine), Value::Object(other)) = (mine, other) else {
        return;
    };
    for (name, theirs) in other {
        let Some(ours) = mine.get_mut(name) else {
            mine.insert(name.clone(), theirs.clone());
            continue;
        };
        if name.starts_with("stat.") {
            let parsed = (
                serde_json::from_value::<StatAgg>(ours.clone()),
                serde_json::from_value::<StatAgg>(theirs.clone()),
            );
            if let (Ok(mut a), Ok(b)) = parsed {
                a.merge(&b);
                if let Ok(v) = serde_json::to_value(&a) {
                    *ours = v;
                }
            }
        } else if name.starts_with("datehist.") {
            let Some(theirs) = theirs.get("buckets").and_then(Value::as_object) else {
                continue;
            };
            if !matches!(ours.get("buckets"), Some(Value::Object(_))) {
                *ours = json!({"buckets": theirs});
                continue;
            }
            let Some(Value::Object(buckets)) = ours.get_mut("buckets") else {
                continue;
            };
            for (key, b) in theirs {
                let n = b.get("count").and_then(Value::as_u64).unwrap_or(0);
                let have = buckets
                    .get(key)
                    .and_then(|x| x.get("count"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                buckets.insert(key.clone(), json!({"count": have + n}));
            }
        }
    }
}

/// Replace the intermediate aggregations of `stat` by the final values
/// of the request `opts`.
pub fn finalize(opts: &Value, stat: &mut Stat) -> Result<()> {
    let Some(mut aggs) = Aggregations::parse(opts)? else {
        return Ok(());
    };
    if let Some(intermediate) = stat.extra.get(EXTRA_AGGREGATIONS) {
        aggs.merge(intermediate)?;
    }
    stat.extra
        .insert(EXTRA_AGGREGATIONS.to_string(), aggs.to_final());
    Ok(())
}

/// Value at a dotted path; array elements are addressed by number.
fn access<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = record;
    for key in path.split('.').filter(|k| !k.is_empty()) {
        cur = match cur {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` or epoch milliseconds.
fn parse_datetime(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"] {
                if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(t.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc())
        }
        _ => None,
    }
}

fn parse_offset(s: &str) -> Result<ChronoDuration> {
    let (neg, raw) = match s.trim().strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.trim().trim_start_matches('+')),
    };
    let d = humantime::parse_duration(raw)
        .map_err(|e| bad_aggs(format!("bad offset {s:?}: {e}")))?;
    let d = ChronoDuration::from_std(d).map_err(|e| bad_aggs(format!("bad offset {s:?}: {e}")))?;
    Ok(if neg { -d } else { d })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<Value> {
        vec![
            json!({"price": 10, "ts": "2024-03-01T10:00:00Z"}),
            json!({"price": "30", "ts": "2024-03-01T23:59:59Z"}),
            json!({"price": 20, "ts": "2024-03-02 08:00:00"}),
            json!({"name": "no price"}),
        ]
    }

    fn request() -> Value {
        json!({
            "avg_price": {"avg": {"field": "price"}},
            "max_price": {"max": {"field": "price"}},
            "price": {"stats": {"field": "price"}},
            "per_day": {"date_histogram": {"field": "ts", "interval": "day"}},
        })
    }

    #[test]
    fn functions_on_one_field_share_an_engine() {
        let aggs = Aggregations::parse(&request()).unwrap().unwrap();
        assert_eq!(aggs.engines.len(), 2);
        assert!(Aggregations::parse(&json!({})).unwrap().is_none());
    }

    #[test]
    fn bad_requests_are_rejected() {
        for bad in [
            json!([1]),
            json!({"x": {"avg": {}}}),
            json!({"x": {"median": {"field": "a"}}}),
            json!({"x": {"avg": {"field": "a"}, "sum": {"field": "a"}}}),
            json!({"x": {"date_histogram": {"field": "ts"}}}),
            json!({"x": {"date_histogram": {"field": "ts", "interval": "often"}}}),
        ] {
            let err = Aggregations::parse(&bad).unwrap_err();
            assert_eq!(err.status_code(), 400, "{bad}");
        }
    }

    #[test]
    fn stats_and_histogram_over_records() {
        let mut aggs = Aggregations::parse(&request()).unwrap().unwrap();
        for r in records() {
            aggs.add(&r).unwrap();
        }
        let out = aggs.to_final();
        assert_eq!(out["avg_price"]["value"], json!(20.0));
        assert_eq!(out["max_price"]["value"], json!(30.0));
        assert_eq!(out["price"]["count"], json!(3));
        assert_eq!(out["price"]["min"], json!(10.0));
        let buckets = out["per_day"]["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key_as_string"], "2024-03-01T00:00:00.000Z");
        assert_eq!(buckets[0]["doc_count"], 2);
        assert_eq!(buckets[1]["doc_count"], 1);
    }

    #[test]
    fn non_numeric_values_fail() {
        let mut aggs = Aggregations::parse(&json!({"s": {"sum": {"field": "name"}}}))
            .unwrap()
            .unwrap();
        assert!(aggs.add(&json!({"name": "bob"})).is_err());
        assert!(aggs.add_data(b"not json").is_err());
    }

    #[test]
    fn intermediate_state_merges_per_engine_kind() {
        let all = records();
        let (left, right) = all.split_at(2);
        let node = |part: &[Value]| {
            let mut aggs = Aggregations::parse(&request()).unwrap().unwrap();
            for r in part {
                aggs.add(r).unwrap();
            }
            aggs.to_intermediate()
        };
        let mut merged = node(left);
        merge_intermediate(&mut merged, &node(right));

        let mut stat = Stat::new("");
        stat.extra.insert(EXTRA_AGGREGATIONS.into(), merged);
        finalize(&request(), &mut stat).unwrap();
        let out = &stat.extra[EXTRA_AGGREGATIONS];
        assert_eq!(out["price"]["sum"], json!(60.0));
        assert_eq!(out["price"]["count"], json!(3));
        assert_eq!(out["price"]["max"], json!(30.0));
        let buckets = out["per_day"]["buckets"].as_array().unwrap();
        assert_eq!(
            buckets.iter().map(|b| b["doc_count"].clone()).collect::<Vec<_>>(),
            vec![json!(2), json!(1)]
        );
    }

    #[test]
    fn calendar_intervals_truncate() {
        let t = Utc.with_ymd_and_hms(2024, 5, 16, 13, 45, 10).single().unwrap();
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap();
        assert_eq!(Interval::Year.truncate(t), at(2024, 1, 1));
        assert_eq!(Interval::Quarter.truncate(t), at(2024, 4, 1));
        assert_eq!(Interval::Month.truncate(t), at(2024, 5, 1));
        assert_eq!(Interval::Week.truncate(t), at(2024, 5, 13));
        assert_eq!(
            Interval::parse("90m").unwrap().truncate(t),
            Utc.with_ymd_and_hms(2024, 5, 16, 13, 30, 0).single().unwrap()
        );
        assert_eq!(Interval::parse("1M").unwrap(), Interval::Month);
        assert_eq!(
            Interval::parse("1m").unwrap(),
            Interval::Fixed(ChronoDuration::minutes(1))
        );
    }

    #[test]
    fn empty_stats_have_null_extremes() {
        let aggs = Aggregations::parse(&json!({"p": {"stats": {"field": "price"}}}))
            .unwrap()
            .unwrap();
        let out = aggs.to_final();
        assert_eq!(out["p"]["count"], json!(0));
        assert!(out["p"]["avg"].is_null());
        assert!(out["p"]["min"].is_null());
    }
}
