//! Per-user settings stored in the home directory.
//!
//! `<mount>/<home>/.user.yaml` is read first, then `.user.json`; when
//! neither exists the server default applies.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub const YAML_FILE: &str = ".user.yaml";
pub const JSON_FILE: &str = ".user.json";

/// Input globs that select a structured data format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordQueries {
    pub enabled: bool,
    pub skip: Vec<String>,
    pub json: Vec<String>,
    pub xml: Vec<String>,
    pub csv: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UserConfig {
    pub record_queries: RecordQueries,
}

impl UserConfig {
    /// Data format implied by the input files: every file must match one
    /// of the format's globs. Any file matching `skip` disables detection.
    pub fn data_format_for(&self, files: &[String]) -> Option<&'static str> {
        let rq = &self.record_queries;
        if !rq.enabled || files.is_empty() || files.iter().any(|f| matches_any(&rq.skip, f)) {
            return None;
        }
        [("json", &rq.json), ("xml", &rq.xml), ("csv", &rq.csv)]
            .into_iter()
            .find(|(_, globs)| files.iter().all(|f| matches_any(globs, f)))
            .map(|(format, _)| format)
    }
}

fn matches_any(globs: &[String], file: &str) -> bool {
    let name = Path::new(file)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    globs.iter().any(|g| match glob::Pattern::new(g) {
        Ok(p) => p.matches(file) || p.matches(&name),
        Err(_) => false,
    })
}

/// Load the user configuration for `home`.
pub async fn load(mount: &Path, home: &str, defaults: &UserConfig) -> Result<UserConfig> {
    let dir = mount.join(home.trim_start_matches('/'));

    let yaml = dir.join(YAML_FILE);
    match tokio::fs::read(&yaml).await {
        Ok(data) => {
            debug!(path = %yaml.display(), "user config");
            return serde_yaml::from_slice(&data).map_err(|e| {
                Error::Config(format!("failed to parse {}: {e}", yaml.display()))
            });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let json = dir.join(JSON_FILE);
    match tokio::fs::read(&json).await {
        Ok(data) => {
            debug!(path = %json.display(), "user config");
            serde_json::from_slice(&data)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", json.display())))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(defaults.clone()),
        Err(e) => Err(e.into()),
    }
}
