//! Record formats: how a matched record is rendered in a response.
//!
//! Statistics are always rendered in the raw shape.

use crate::search::wire::RawRecord;
use crate::search::{Record, Stat};
use crate::{Error, Result};
use serde_json::{json, Map, Value};

/// Options shared by the structured formats.
#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    pub fields: Vec<String>,
    /// CSV field separator, `,` when empty.
    pub separator: String,
    /// CSV column names.
    pub columns: Vec<String>,
    /// Report CSV rows as arrays even when columns are known.
    pub as_array: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    Raw,
    Utf8,
    Json {
        fields: Vec<String>,
    },
    Xml {
        fields: Vec<String>,
    },
    Csv {
        separator: u8,
        columns: Vec<String>,
        /// Column indexes to keep, all when empty.
        fields: Vec<usize>,
        as_array: bool,
    },
    Null,
}

impl Format {
    pub fn new(name: &str, opts: &FormatOptions) -> Result<Self> {
        match name {
            "" | "raw" => Ok(Self::Raw),
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "json" => Ok(Self::Json {
                fields: opts.fields.clone(),
            }),
            "xml" => Ok(Self::Xml {
                fields: opts.fields.clone(),
            }),
            "csv" => {
                let separator = match opts.separator.as_bytes() {
                    [] => b',',
                    [b] => *b,
                    _ => {
                        return Err(Error::BadRequest(
                            "failed to parse \"separator\" option: separator is too long"
                                .to_string(),
                        ))
                    }
                };
                if opts.columns.iter().any(String::is_empty) {
                    return Err(Error::BadRequest(
                        "failed to parse \"columns\" option: empty column name".to_string(),
                    ));
                }
                let fields = opts
                    .fields
                    .iter()
                    .filter_map(|f| opts.columns.iter().position(|c| c == f))
                    .collect();
                Ok(Self::Csv {
                    separator,
                    columns: opts.columns.clone(),
                    fields,
                    as_array: opts.as_array,
                })
            }
            "null" => Ok(Self::Null),
            other => Err(Error::BadRequest(format!("{other:?} is unsupported format"))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Render a record; `None` for the null format.
    pub fn record(&self, rec: &Record) -> Result<Option<Value>> {
        let index = || serde_json::to_value(&rec.index).unwrap_or(Value::Null);
        let value = match self {
            Self::Null => return Ok(None),
            Self::Raw => serde_json::to_value(RawRecord::from_record(rec, true))?,
            Self::Utf8 => json!({
                "_index": index(),
                "data": String::from_utf8_lossy(&rec.data),
            }),
            Self::Json { fields } => {
                let parsed: Value = serde_json::from_slice(&rec.data).map_err(|e| {
                    Error::Stream(format!("failed to parse JSON data: {e}"))
                })?;
                match parsed {
                    Value::Object(obj) => {
                        let mut out = filter_fields(obj, fields);
                        out.insert("_index".to_string(), index());
                        Value::Object(out)
                    }
                    other => json!({"_index": index(), "data": other}),
                }
            }
            Self::Xml { fields } => {
                let text = String::from_utf8_lossy(&rec.data);
                if fields.is_empty() {
                    json!({"_index": index(), "data": text})
                } else {
                    let mut out = Map::new();
                    for field in fields {
                        if let Some(v) = xml_element(&text, field) {
                            out.insert(field.clone(), Value::String(v.to_string()));
                        }
                    }
                    out.insert("_index".to_string(), index());
                    Value::Object(out)
                }
            }
            Self::Csv {
                separator,
                columns,
                fields,
                as_array,
            } => {
                let row = parse_csv_row(&rec.data, *separator)?;
                let picked: Vec<(usize, String)> = if fields.is_empty() {
                    row.into_iter().enumerate().collect()
                } else {
                    fields
                        .iter()
                        .filter_map(|&i| row.get(i).map(|v| (i, v.clone())))
                        .collect()
                };
                if columns.is_empty() || *as_array {
                    let values: Vec<Value> = picked.into_iter().map(|(_, v)| Value::String(v)).collect();
                    json!({"_index": index(), "data": values})
                } else {
                    let mut out = Map::new();
                    for (i, v) in picked {
                        let name = columns.get(i).cloned().unwrap_or_else(|| i.to_string());
                        out.insert(name, Value::String(v));
                    }
                    out.insert("_index".to_string(), index());
                    Value::Object(out)
                }
            }
        };
        Ok(Some(value))
    }

    pub fn stat(&self, stat: &Stat) -> Result<Value> {
        Ok(serde_json::to_value(stat)?)
    }
}

fn filter_fields(obj: Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    if fields.is_empty() {
        return obj;
    }
    obj.into_iter()
        .filter(|(k, _)| fields.iter().any(|f| f == k))
        .collect()
}

/// Text of the first `<tag>...</tag>` element.
fn xml_element<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let beg = text.find(&open)? + open.len();
    let end = text[beg..].find(&close)? + beg;
    Some(text[beg..end].trim())
}

fn parse_csv_row(data: &[u8], separator: u8) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(separator)
        .from_reader(data);
    match reader.records().next() {
        Some(Ok(row)) => Ok(row.iter().map(str::to_string).collect()),
        Some(Err(e)) => Err(Error::Stream(format!("failed to parse CSV data: {e}"))),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::Index;

    fn rec(data: &str) -> Record {
        Record::new(Index::new("a.txt", 10, data.len() as u64, 1), data.as_bytes().to_vec())
    }

    #[test]
    fn raw_and_utf8() {
        let raw = Format::Raw.record(&rec("hi")).unwrap().unwrap();
        assert_eq!(raw["data"], "aGk=");
        assert_eq!(raw["_index"]["file"], "a.txt");
        let text = Format::Utf8.record(&rec("hi")).unwrap().unwrap();
        assert_eq!(text["data"], "hi");
        assert!(Format::Null.record(&rec("hi")).unwrap().is_none());
    }

    #[test]
    fn json_filters_fields() {
        let f = Format::new(
            "json",
            &FormatOptions {
                fields: vec!["a".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let v = f.record(&rec(r#"{"a": 1, "b": 2}"#)).unwrap().unwrap();
        assert_eq!(v["a"], 1);
        assert!(v.get("b").is_none());
        assert_eq!(v["_index"]["offset"], 10);
        assert_eq!(f.record(&rec("not json")).unwrap_err().status_code(), 500);
    }

    #[test]
    fn xml_extracts_elements() {
        let f = Format::new(
            "xml",
            &FormatOptions {
                fields: vec!["id".into(), "name".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let v = f
            .record(&rec("<rec><id>7</id><name> Bob </name></rec>"))
            .unwrap()
            .unwrap();
        assert_eq!(v["id"], "7");
        assert_eq!(v["name"], "Bob");
    }

    #[test]
    fn csv_columns_and_fields() {
        let opts = FormatOptions {
            fields: vec!["c".into(), "a".into()],
            separator: ";".into(),
            columns: vec!["a".into(), "b".into(), "c".into()],
            as_array: false,
        };
        let f = Format::new("csv", &opts).unwrap();
        let v = f.record(&rec("1;\"x;y\";3")).unwrap().unwrap();
        assert_eq!(v["a"], "1");
        assert_eq!(v["c"], "3");
        assert!(v.get("b").is_none());

        let plain = Format::new("csv", &FormatOptions::default()).unwrap();
        let v = plain.record(&rec("1,2")).unwrap().unwrap();
        assert_eq!(v["data"], json!(["1", "2"]));

        let long = FormatOptions {
            separator: "ab".into(),
            ..Default::default()
        };
        assert!(Format::new("csv", &long).is_err());
    }

    #[test]
    fn unknown_format_is_bad_request() {
        let err = Format::new("yaml", &FormatOptions::default()).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
