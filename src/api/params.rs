//! Query string binding.
//!
//! Repeated keys (`file=a&file=b`) are kept in order, so the raw query is
//! parsed with `url::form_urlencoded` instead of a serde extractor.

use crate::config::ScriptConfig;
use crate::files::{randomize_path, ShareMode};
use crate::postproc::PostExecJob;
use crate::search::aggs::Aggregations;
use crate::search::transform::parse_transforms;
use crate::search::{BackendSelection, SearchConfig};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Decoded query pairs.
#[derive(Debug, Clone, Default)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn parse(raw: Option<&str>) -> Self {
        let pairs = raw
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Last value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// Every value of `key`, in order.
    pub fn all(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Boolean flag: a bare key means true.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "" | "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(Error::BadRequest(format!("{key}: {v:?} is not a boolean"))),
            },
        }
    }

    pub fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None | Some("") => Ok(None),
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| Error::BadRequest(format!("{key}: failed to parse {v:?}: {e}"))),
        }
    }

    pub fn duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.get(key) {
            None | Some("") => Ok(None),
            Some(v) => humantime::parse_duration(v.trim())
                .map(Some)
                .map_err(|e| Error::BadRequest(format!("{key}: failed to parse {v:?}: {e}"))),
        }
    }

    /// Comma separated list, empty items dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.all(key)
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Surrounding width: empty is 0, `line` is -1, otherwise a `u16`.
pub fn parse_width(raw: &str) -> Result<i32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    if raw.eq_ignore_ascii_case("line") {
        return Ok(-1);
    }
    raw.parse::<u16>()
        .map(i32::from)
        .map_err(|e| Error::BadRequest(format!("failed to parse surrounding width {raw:?}: {e}")))
}

/// Unescape `\xNN`, `\uNNNN`, `\n`, `\r`, `\t`, `\f`, `\0`, `\\` and `\"`.
/// Control characters given literally are kept as is.
pub fn unescape_delimiter(raw: &str) -> Result<String> {
    let bad = || Error::BadRequest(format!("failed to unescape delimiter: {raw:?}"));
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next().ok_or_else(bad)? {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'f' => out.push('\u{c}'),
            '0' => out.push('\0'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            'x' => out.push(hex_char(&mut chars, 2).ok_or_else(bad)?),
            'u' => out.push(hex_char(&mut chars, 4).ok_or_else(bad)?),
            _ => return Err(bad()),
        }
    }
    Ok(out)
}

fn hex_char(chars: &mut std::str::Chars<'_>, digits: usize) -> Option<char> {
    let mut code = 0u32;
    for _ in 0..digits {
        code = code * 16 + chars.next()?.to_digit(16)?;
    }
    char::from_u32(code)
}

/// Bound `/search`, `/count` and `/pcap/*` parameters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SearchParams {
    pub query: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignore_missing_files: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub surrounding: String,
    pub fuzziness: u32,
    pub cs: bool,
    pub reduce: bool,
    pub nodes: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub backend: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub backend_mode: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backend_options: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub view: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub delimiter: String,
    #[serde(skip_serializing_if = "Option::is_none", with = "humantime_opt")]
    pub lifetime: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<String>,
    /// Aggregations as a JSON object.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub aggs: String,
    pub format: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub stats: bool,
    pub stream: bool,
    pub local: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub share_mode: String,
    pub performance: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub job_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub job_fields: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub job_params: Vec<String>,

    #[serde(skip)]
    pub csv_separator: String,
    #[serde(skip)]
    pub csv_columns: Vec<String>,
    #[serde(skip)]
    pub internal_error_prefix: bool,
    #[serde(skip)]
    pub internal_no_session_id: bool,
    #[serde(skip)]
    pub internal_format: String,
}

impl SearchParams {
    pub fn bind(p: &Params) -> Result<Self> {
        let mut files = p.all("file");
        // older clients
        files.extend(p.all("files"));
        files.extend(p.all("catalog"));
        files.retain(|f| !f.is_empty());

        let out = Self {
            query: p.string("query"),
            files,
            ignore_missing_files: p.flag("ignore-missing-files", false)?,
            mode: p.string("mode"),
            surrounding: p.string("surrounding"),
            fuzziness: p.number("fuzziness")?.unwrap_or(0),
            cs: p.flag("cs", true)?,
            reduce: p.flag("reduce", true)?,
            nodes: p.number("nodes")?.unwrap_or(0),
            backend: p.string("backend"),
            backend_mode: p.string("backend-mode"),
            backend_options: p.all("backend-option"),
            data: p.string("data"),
            index: p.string("index"),
            view: p.string("view"),
            delimiter: unescape_delimiter(&p.string("delimiter"))?,
            lifetime: p.duration("lifetime")?,
            limit: p.number("limit")?,
            transforms: p.all("transform"),
            aggs: p.string("aggs"),
            format: p.get("format").unwrap_or("raw").to_ascii_lowercase(),
            fields: p.list("fields"),
            stats: p.flag("stats", false)?,
            stream: p.flag("stream", false)?,
            local: p.flag("local", false)?,
            share_mode: p.string("share-mode"),
            performance: p.flag("performance", false)?,
            job_id: p.string("job-id"),
            job_type: p.string("job-type"),
            job_fields: p.list("job-field"),
            job_params: p.all("job-param"),
            csv_separator: p.string("separator"),
            csv_columns: p.list("columns"),
            internal_error_prefix: p.flag("--internal-error-prefix", false)?,
            internal_no_session_id: p.flag("--internal-no-session-id", false)?,
            internal_format: p.string("--internal-format"),
        };
        Ok(out)
    }

    /// Turn the parameters into an engine configuration.
    pub fn to_config(&self, scripts: &BTreeMap<String, ScriptConfig>) -> Result<SearchConfig> {
        if self.query.trim().is_empty() {
            return Err(Error::BadRequest("no query provided".to_string()));
        }
        if self.files.is_empty() {
            return Err(Error::BadRequest("no any file or catalog provided".to_string()));
        }

        let mut cfg = SearchConfig::new(self.query.clone(), self.files.clone());
        cfg.mode = self.mode.clone();
        cfg.width = parse_width(&self.surrounding)?;
        cfg.dist = self.fuzziness;
        cfg.case = self.cs;
        cfg.reduce = self.reduce;
        cfg.nodes = self.nodes;
        cfg.backend = BackendSelection {
            tool: self.backend.clone(),
            mode: self.backend_mode.clone(),
            opts: self.backend_options.clone(),
        };
        cfg.keep_data_as = randomize_path(&self.data);
        cfg.keep_index_as = randomize_path(&self.index);
        cfg.keep_view_as = randomize_path(&self.view);
        cfg.delimiter = self.delimiter.clone();
        cfg.lifetime = self.lifetime;
        cfg.limit = self.limit;
        cfg.data_format = self.internal_format.clone();
        cfg.transforms = parse_transforms(&self.transforms, scripts)?;
        cfg.transform_rules = self.transforms.clone();
        cfg.aggregations = self.aggregations()?;
        cfg.report_index = true;
        cfg.report_data = self.format != "null";
        cfg.share_mode = ShareMode::parse(&self.share_mode)?;
        cfg.skip_missing = self.ignore_missing_files;
        cfg.performance = self.performance;
        Ok(cfg.normalized())
    }

    fn aggregations(&self) -> Result<Option<serde_json::Value>> {
        if self.aggs.trim().is_empty() {
            return Ok(None);
        }
        let opts: serde_json::Value = serde_json::from_str(&self.aggs).map_err(|e| {
            Error::BadRequest(format!("failed to prepare aggregations: {e}"))
        })?;
        Ok(Aggregations::parse(&opts)?.map(|_| opts))
    }

    /// Post-processing request, if a job type is given.
    pub fn post_exec(&self) -> Option<PostExecJob> {
        if self.job_type.is_empty() {
            return None;
        }
        let id = if self.job_id.is_empty() {
            randomize_path("{{random}}")
        } else {
            self.job_id.clone()
        };
        let params = self
            .job_params
            .iter()
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (p.clone(), String::new()),
            })
            .collect();
        Some(PostExecJob {
            id,
            job_type: self.job_type.clone(),
            params,
            fields: self.job_fields.clone(),
            ..Default::default()
        })
    }
}

/// Bound `/search/show` parameters.
#[derive(Debug, Clone, Default)]
pub struct ShowParams {
    pub session: String,
    pub data: String,
    pub index: String,
    pub view: String,
    pub delimiter: String,
    pub surrounding: String,
    pub offset: u64,
    pub count: Option<u64>,
    pub format: String,
    pub fields: Vec<String>,
    pub stream: bool,
    pub stats: bool,
    pub local: bool,
    pub performance: bool,
    pub csv_separator: String,
    pub csv_columns: Vec<String>,
    pub internal_error_prefix: bool,
    pub internal_format: String,
}

impl ShowParams {
    pub fn bind(p: &Params) -> Result<Self> {
        Ok(Self {
            session: p.string("session"),
            data: p.string("data"),
            index: p.string("index"),
            view: p.string("view"),
            delimiter: unescape_delimiter(&p.string("delimiter"))?,
            surrounding: p.string("surrounding"),
            offset: p.number("offset")?.unwrap_or(0),
            count: p.number("count")?,
            format: p.get("format").unwrap_or("raw").to_ascii_lowercase(),
            fields: p.list("fields"),
            stream: p.flag("stream", false)?,
            stats: p.flag("stats", false)?,
            local: p.flag("local", false)?,
            performance: p.flag("performance", false)?,
            csv_separator: p.string("separator"),
            csv_columns: p.list("columns"),
            internal_error_prefix: p.flag("--internal-error-prefix", false)?,
            internal_format: p.string("--internal-format"),
        })
    }

    /// Show configuration over explicit output files.
    pub fn to_config(&self) -> Result<SearchConfig> {
        let mut cfg = SearchConfig::default();
        cfg.keep_data_as = self.data.clone();
        cfg.keep_index_as = self.index.clone();
        cfg.keep_view_as = self.view.clone();
        cfg.delimiter = self.delimiter.clone();
        cfg.width = parse_width(&self.surrounding)?;
        cfg.offset = self.offset;
        cfg.limit = self.count;
        cfg.report_data = self.format != "null";
        cfg.data_format = self.internal_format.clone();
        cfg.performance = self.performance;
        Ok(cfg)
    }
}

mod humantime_opt {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_keys_keep_order() {
        let p = Params::parse(Some("file=b.txt&file=a.txt&query=hello%20world&local"));
        assert_eq!(p.all("file"), vec!["b.txt", "a.txt"]);
        assert_eq!(p.get("query"), Some("hello world"));
        assert!(p.flag("local", false).unwrap());
        assert!(p.flag("stream", false).is_ok_and(|v| !v));
        assert!(Params::parse(Some("stats=maybe")).flag("stats", false).is_err());
    }

    #[test]
    fn width_accepts_line_and_u16() {
        assert_eq!(parse_width("").unwrap(), 0);
        assert_eq!(parse_width("line").unwrap(), -1);
        assert_eq!(parse_width("65535").unwrap(), 65535);
        assert_eq!(parse_width("65536").unwrap_err().status_code(), 400);
        assert!(parse_width("-1").is_err());
    }

    #[test]
    fn delimiter_escapes() {
        assert_eq!(unescape_delimiter("").unwrap(), "");
        assert_eq!(unescape_delimiter("\t").unwrap(), "\t");
        assert_eq!(unescape_delimiter(r"\r\n").unwrap(), "\r\n");
        assert_eq!(unescape_delimiter(r"\x0D\x0A").unwrap(), "\r\n");
        assert_eq!(unescape_delimiter(r"\u000D-\u000A").unwrap(), "\r-\n");
        assert_eq!(unescape_delimiter("\r-\n").unwrap(), "\r-\n");
        assert_eq!(unescape_delimiter(r"\f").unwrap(), "\u{c}");
        assert!(unescape_delimiter(r"\x0").is_err());
        assert!(unescape_delimiter(r"\q").is_err());
    }

    #[test]
    fn search_params_build_config() {
        let p = Params::parse(Some(
            "query=hello&file=*.txt&catalog=c.db&surrounding=line&fuzziness=2&cs=false\
             &format=null&data=out-{{random}}.bin&lifetime=1h&limit=10&share-mode=skip",
        ));
        let params = SearchParams::bind(&p).unwrap();
        let cfg = params.to_config(&BTreeMap::new()).unwrap();
        assert_eq!(cfg.files, vec!["*.txt", "c.db"]);
        assert_eq!((cfg.width, cfg.dist, cfg.case), (-1, 2, false));
        assert!(cfg.report_index && !cfg.report_data);
        assert!(!cfg.keep_data_as.contains("{{random}}"));
        assert_eq!(cfg.lifetime, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.limit, Some(10));
        assert!(cfg.share_mode.is_skip_busy());
    }

    #[test]
    fn missing_query_or_files_is_bad_request() {
        let no_query = SearchParams::bind(&Params::parse(Some("file=a.txt"))).unwrap();
        assert_eq!(no_query.to_config(&BTreeMap::new()).unwrap_err().status_code(), 400);
        let no_files = SearchParams::bind(&Params::parse(Some("query=x"))).unwrap();
        assert!(no_files
            .to_config(&BTreeMap::new())
            .unwrap_err()
            .to_string()
            .contains("no any file"));
    }

    #[test]
    fn zero_limit_is_count_only() {
        let p = SearchParams::bind(&Params::parse(Some("query=x&file=a&limit=0"))).unwrap();
        assert!(p.to_config(&BTreeMap::new()).unwrap().is_count_only());
    }

    #[test]
    fn aggs_are_validated() {
        let p = SearchParams::bind(&Params::parse(Some(
            "query=x&file=a&aggs=%7B%22p%22%3A%7B%22avg%22%3A%7B%22field%22%3A%22price%22%7D%7D%7D",
        )))
        .unwrap();
        let cfg = p.to_config(&BTreeMap::new()).unwrap();
        assert_eq!(
            cfg.aggregations,
            Some(serde_json::json!({"p": {"avg": {"field": "price"}}}))
        );

        for bad in ["aggs=%7Bnot", "aggs=%7B%22p%22%3A%7B%22median%22%3A%7B%7D%7D%7D"] {
            let p = SearchParams::bind(&Params::parse(Some(&format!("query=x&file=a&{bad}")))).unwrap();
            let err = p.to_config(&BTreeMap::new()).unwrap_err();
            assert_eq!(err.status_code(), 400);
            assert!(err.to_string().contains("aggregations"), "{err}");
        }
    }

    #[test]
    fn job_params_split_on_equals() {
        let p = SearchParams::bind(&Params::parse(Some(
            "job-type=blgeo&job-id=42&job-param=--radius%3D5&job-param=--pip&job-field=a,b",
        )))
        .unwrap();
        let job = p.post_exec().unwrap();
        assert_eq!(job.id, "42");
        assert_eq!(job.params.get("--radius").map(String::as_str), Some("5"));
        assert_eq!(job.params.get("--pip").map(String::as_str), Some(""));
        assert_eq!(job.fields, vec!["a", "b"]);
    }
}
