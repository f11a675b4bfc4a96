//! Post-processing of search results.
//!
//! While a search with a `job-type` is drained, every record is appended
//! to a CSV side file ([`JobSink`]) with a matching index line. After the
//! drain a [`PostProcessor`] runs over those files and its output lines are
//! attached to the final stat.

use crate::config::FinalProcessorConfig;
use crate::search::Index;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tracing::{debug, info};

/// A post-processing request bound from the search parameters.
#[derive(Debug, Clone, Default)]
pub struct PostExecJob {
    pub id: String,
    pub job_type: String,
    /// Extra `--flag value` pairs; an empty value passes the flag alone.
    pub params: BTreeMap<String, String>,
    /// CSV columns, the JSON record keys when empty.
    pub fields: Vec<String>,
    pub data_path: PathBuf,
    pub index_path: PathBuf,
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Run over the job files. Returns output lines.
    async fn run(&self, job: &PostExecJob) -> Result<Vec<String>>;
}

/// Configured executable.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    exec: Vec<String>,
    config_file: Option<String>,
}

impl ShellCommand {
    pub fn from_config(cfg: &FinalProcessorConfig) -> Result<Self> {
        if cfg.exec.is_empty() {
            return Err(Error::Config("final processor has no exec".to_string()));
        }
        Ok(Self {
            exec: cfg.exec.clone(),
            config_file: cfg.config_file.clone(),
        })
    }

    /// Full argument list for `job`.
    pub fn args(&self, job: &PostExecJob) -> Vec<String> {
        let mut args: Vec<String> = self.exec[1..].to_vec();
        for (k, v) in &job.params {
            args.push(k.clone());
            if !v.is_empty() {
                args.push(v.clone());
            }
        }
        if let Some(cfg) = &self.config_file {
            if !job.params.contains_key("--cfg") && Path::new(cfg).exists() {
                args.extend(["--cfg".to_string(), cfg.clone()]);
            }
        }
        args.extend([
            "--index".to_string(),
            job.index_path.to_string_lossy().into_owned(),
            "--data".to_string(),
            job.data_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}

#[async_trait]
impl PostProcessor for ShellCommand {
    async fn run(&self, job: &PostExecJob) -> Result<Vec<String>> {
        let args = self.args(job);
        info!(exec = %self.exec[0], ?args, job = %job.id, "running post-processing");
        let out = Command::new(&self.exec[0])
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Engine(format!("failed to start post-processing: {e}")))?;
        if !out.status.success() {
            return Err(Error::Engine(format!(
                "post-processing failed with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

type ProcessFn = dyn Fn(&PostExecJob) -> Result<Vec<String>> + Send + Sync;

/// In-process processor.
#[derive(Clone)]
pub struct FnProcessor(Arc<ProcessFn>);

impl FnProcessor {
    pub fn new(f: impl Fn(&PostExecJob) -> Result<Vec<String>> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl PostProcessor for FnProcessor {
    async fn run(&self, job: &PostExecJob) -> Result<Vec<String>> {
        (self.0)(job)
    }
}

/// CSV side file plus its index, written during the drain.
pub struct JobSink {
    fields: Vec<String>,
    data: BufWriter<File>,
    index: BufWriter<File>,
    offset: u64,
    rows: u64,
}

impl JobSink {
    pub async fn create(job: &PostExecJob) -> Result<Self> {
        for path in [&job.data_path, &job.index_path] {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        Ok(Self {
            fields: job.fields.clone(),
            data: BufWriter::new(File::create(&job.data_path).await?),
            index: BufWriter::new(File::create(&job.index_path).await?),
            offset: 0,
            rows: 0,
        })
    }

    /// Append one formatted record.
    pub async fn append(&mut self, record: &Value, index: &Index) -> Result<()> {
        let row = csv_row(record, &self.fields)?;
        self.data.write_all(&row).await?;
        let line = Index::new(
            index.file.clone(),
            self.offset,
            row.len() as u64,
            index.fuzziness,
        )
        .to_line();
        self.index.write_all(format!("{line}\n").as_bytes()).await?;
        self.offset += row.len() as u64;
        self.rows += 1;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<u64> {
        self.data.flush().await?;
        self.index.flush().await?;
        debug!(rows = self.rows, bytes = self.offset, "job files written");
        Ok(self.rows)
    }
}

/// One CSV line from a JSON record.
pub fn csv_row(record: &Value, fields: &[String]) -> Result<Vec<u8>> {
    let cell = |v: Option<&Value>| match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let cells: Vec<String> = match record {
        Value::Object(map) if fields.is_empty() => map
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(_, v)| cell(Some(v)))
            .collect(),
        Value::Object(map) => fields.iter().map(|f| cell(map.get(f))).collect(),
        other => vec![cell(Some(other))],
    };
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(&cells)
        .map_err(|e| Error::Serialization(format!("failed to write CSV row: {e}")))?;
    w.into_inner()
        .map_err(|e| Error::Serialization(format!("failed to write CSV row: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn rows_follow_fields() {
        let rec = json!({"a": "x,y", "b": 2, "_index": {}});
        assert_eq!(csv_row(&rec, &["b".into(), "a".into()]).unwrap(), b"2,\"x,y\"\n");
        assert_eq!(csv_row(&rec, &[]).unwrap(), b"\"x,y\",2\n");
    }

    #[tokio::test]
    async fn sink_tracks_cumulative_offsets() {
        let dir = TempDir::new().unwrap();
        let job = PostExecJob {
            id: "1".into(),
            job_type: "test".into(),
            data_path: dir.path().join("job.csv"),
            index_path: dir.path().join("job.txt"),
            ..Default::default()
        };
        let mut sink = JobSink::create(&job).await.unwrap();
        sink.append(&json!({"v": "hello"}), &Index::new("a.txt", 5, 5, 1))
            .await
            .unwrap();
        sink.append(&json!({"v": "hi"}), &Index::new("b.txt", 0, 2, 0))
            .await
            .unwrap();
        assert_eq!(sink.finish().await.unwrap(), 2);

        let index = std::fs::read_to_string(&job.index_path).unwrap();
        assert_eq!(index, "a.txt,0,6,1\nb.txt,6,3,0\n");

        let lines = FnProcessor::new(|job| Ok(vec![format!("done {}", job.id)]))
            .run(&job)
            .await
            .unwrap();
        assert_eq!(lines, vec!["done 1"]);
    }

    #[test]
    fn shell_args_include_params_and_files() {
        let cmd = ShellCommand::from_config(&FinalProcessorConfig {
            exec: vec!["/bin/proc".into(), "-x".into()],
            ..Default::default()
        })
        .unwrap();
        let job = PostExecJob {
            params: [("--mode".to_string(), "fast".to_string()), ("--pip".to_string(), String::new())]
                .into_iter()
                .collect(),
            data_path: "/d.csv".into(),
            index_path: "/i.txt".into(),
            ..Default::default()
        };
        assert_eq!(
            cmd.args(&job),
            vec!["-x", "--mode", "fast", "--pip", "--index", "/i.txt", "--data", "/d.csv"]
        );
    }
}
