//! Record post-processing transformations: `match`, `replace` and `script`.

use crate::config::ScriptConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Transformation applied to record data before it is reported.
#[async_trait]
pub trait Transform: Send + Sync + fmt::Debug {
    /// Returns the new data, or `None` if the record should be skipped.
    async fn process(&self, input: Vec<u8>) -> Result<Option<Vec<u8>>>;
}

/// Apply every transformation in order. `None` means skipped.
pub async fn apply_all(transforms: &[Arc<dyn Transform>], data: Vec<u8>) -> Result<Option<Vec<u8>>> {
    let mut data = data;
    for tx in transforms {
        match tx.process(data).await? {
            Some(out) => data = out,
            None => return Ok(None),
        }
    }
    Ok(Some(data))
}

/// Keep records whose data matches the expression.
pub struct RegexMatch {
    re: Regex,
}

impl RegexMatch {
    pub fn new(expr: &str) -> Result<Self> {
        let re = Regex::new(expr).map_err(|e| {
            Error::BadRequest(format!("failed to compile regexp-match expression: {e}"))
        })?;
        Ok(Self { re })
    }
}

impl fmt::Debug for RegexMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "match({:?})", self.re.as_str())
    }
}

#[async_trait]
impl Transform for RegexMatch {
    async fn process(&self, input: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Ok(self.re.is_match(&input).then_some(input))
    }
}

/// Rewrite record data, `$1`-style templates are supported.
pub struct RegexReplace {
    re: Regex,
    template: Vec<u8>,
}

impl RegexReplace {
    pub fn new(expr: &str, template: &str) -> Result<Self> {
        let re = Regex::new(expr).map_err(|e| {
            Error::BadRequest(format!("failed to compile regexp-replace expression: {e}"))
        })?;
        Ok(Self {
            re,
            template: template.as_bytes().to_vec(),
        })
    }
}

impl fmt::Debug for RegexReplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replace({:?},{:?})",
            self.re.as_str(),
            String::from_utf8_lossy(&self.template)
        )
    }
}

#[async_trait]
impl Transform for RegexReplace {
    async fn process(&self, input: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Ok(Some(
            self.re.replace_all(&input, self.template.as_slice()).into_owned(),
        ))
    }
}

/// Pipe record data through an external script.
///
/// A non-zero exit status skips the record.
#[derive(Debug)]
pub struct ScriptCall {
    path: Vec<String>,
    work_dir: PathBuf,
}

impl ScriptCall {
    pub fn new(path_and_args: Vec<String>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let Some(exec) = path_and_args.first() else {
            return Err(Error::BadRequest("no script path provided".to_string()));
        };
        if let Err(e) = std::fs::metadata(exec) {
            return Err(Error::BadRequest(format!("no valid script found: {e}")));
        }
        Ok(Self {
            path: path_and_args,
            work_dir: work_dir.into(),
        })
    }
}

#[async_trait]
impl Transform for ScriptCall {
    async fn process(&self, input: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut child = Command::new(&self.path[0])
            .args(&self.path[1..])
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Ok(None);
        }
        let mut out = output.stdout;
        out.extend_from_slice(&output.stderr);
        Ok(Some(out))
    }
}

fn rule_patterns() -> Result<[regex::Regex; 3]> {
    Ok([
        regex::Regex::new(r#"^\s*match\s*\(\s*"(.*)"\s*\)\s*$"#)?,
        regex::Regex::new(r#"^\s*replace\s*\(\s*"(.*)"\s*,\s*"(.*)"\s*\)\s*$"#)?,
        regex::Regex::new(r#"^\s*script\s*\((.*)\)\s*$"#)?,
    ])
}

/// Parse `transform` request parameters.
pub fn parse_transforms(
    rules: &[String],
    scripts: &BTreeMap<String, ScriptConfig>,
) -> Result<Vec<Arc<dyn Transform>>> {
    if rules.is_empty() {
        return Ok(Vec::new());
    }
    let [match_rule, replace_rule, script_rule] = rule_patterns()?;
    let mut out: Vec<Arc<dyn Transform>> = Vec::with_capacity(rules.len());
    for rule in rules {
        if let Some(m) = match_rule.captures(rule) {
            out.push(Arc::new(RegexMatch::new(&m[1])?));
        } else if let Some(m) = replace_rule.captures(rule) {
            out.push(Arc::new(RegexReplace::new(&m[1], &m[2])?));
        } else if let Some(m) = script_rule.captures(rule) {
            let (name, args) = parse_name_and_args(&m[1])?;
            let Some(script) = scripts.get(&name) else {
                return Err(Error::BadRequest(format!(
                    "{name:?} is unknown script transformation"
                )));
            };
            let mut path = script.path.clone();
            path.extend(args);
            out.push(Arc::new(ScriptCall::new(path, std::env::temp_dir())?));
        } else {
            return Err(Error::BadRequest(format!("{rule:?} is unknown transformation")));
        }
    }
    Ok(out)
}

/// Script name and arguments, CSV encoded: `name,"arg 1",arg2`.
fn parse_name_and_args(raw: &str) -> Result<(String, Vec<String>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());
    let Some(row) = reader.records().next() else {
        return Err(Error::BadRequest("no script name provided".to_string()));
    };
    let row = row.map_err(|e| Error::BadRequest(format!("failed to parse script parameters: {e}")))?;
    let mut fields = row.iter().map(str::to_string);
    let name = fields.next().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::BadRequest("no script name provided".to_string()));
    }
    Ok((name, fields.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn match_and_replace_chain() {
        let rules = vec![
            r#"match("hel+o")"#.to_string(),
            r#"replace("l+", "L")"#.to_string(),
        ];
        let txs = parse_transforms(&rules, &BTreeMap::new()).unwrap();
        assert_eq!(txs.len(), 2);

        let out = apply_all(&txs, b"hello world".to_vec()).await.unwrap();
        assert_eq!(out.as_deref(), Some(&b"heLo worLd"[..]));

        let skipped = apply_all(&txs, b"bye".to_vec()).await.unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn unknown_script_is_bad_request() {
        let err = parse_transforms(&["script(nope, 1)".to_string()], &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn script_args_are_csv() {
        let (name, args) = parse_name_and_args(r#"jq,".a, .b",-c"#).unwrap();
        assert_eq!(name, "jq");
        assert_eq!(args, vec![".a, .b".to_string(), "-c".to_string()]);
    }

    #[test]
    fn unknown_rule_rejected() {
        let err = parse_transforms(&["upper()".to_string()], &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("unknown transformation"));
    }
}
