//! File-to-node routing through the partition map.
//!
//! The registry KV store holds, under `<tag>/partitions/`, one key per glob
//! with a comma separated list of node tags as value. A file routed to a
//! set of tags must be served by nodes carrying those tags; a file that
//! matches no glob may live anywhere, so every node is used.

use super::registry::Registry;
use crate::Result;
use glob::{MatchOptions, Pattern};
use std::collections::BTreeSet;
use tracing::{debug, warn};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// KV prefix of the partition map for a tenant tag.
pub fn partitions_prefix(user_tag: &str) -> String {
    let tag = user_tag.trim_matches('/');
    if tag.is_empty() {
        "partitions/".to_string()
    } else {
        format!("{tag}/partitions/")
    }
}

/// Ordered glob → node tags rules.
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    rules: Vec<(Pattern, Vec<String>)>,
}

impl PartitionMap {
    /// Build from KV pairs listed under `prefix`. Invalid globs and empty
    /// tag lists are skipped.
    pub fn from_pairs(prefix: &str, pairs: &[(String, String)]) -> Self {
        let mut rules = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let mask = key.strip_prefix(prefix).unwrap_or(key);
            let tags: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if tags.is_empty() {
                continue;
            }
            match Pattern::new(mask) {
                Ok(p) => rules.push((p, tags)),
                Err(e) => warn!(mask, error = %e, "ignoring bad partition mask"),
            }
        }
        debug!(rules = rules.len(), "partition info");
        Self { rules }
    }

    pub async fn load(registry: &dyn Registry, user_tag: &str) -> Result<Self> {
        let prefix = partitions_prefix(user_tag);
        let pairs = registry.kv_list(&prefix).await?;
        Ok(Self::from_pairs(&prefix, &pairs))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tags of the first rule matching `file`, `None` if nothing matches.
    ///
    /// `file` may be a glob itself; it is matched as a literal string, so
    /// `east/*.txt` is covered by the `east/*` rule.
    pub fn tags_for_file(&self, file: &str) -> Option<&[String]> {
        let rel = file.trim_start_matches('/');
        self.rules
            .iter()
            .find(|(p, _)| p.matches_with(rel, MATCH_OPTIONS))
            .map(|(_, tags)| tags.as_slice())
    }

    /// Union of the tags of all files. Empty means every node is eligible,
    /// which is also the answer as soon as one file matches no rule.
    pub fn required_tags(&self, files: &[String]) -> BTreeSet<String> {
        let mut required = BTreeSet::new();
        for file in files {
            match self.tags_for_file(file) {
                Some(tags) => required.extend(tags.iter().cloned()),
                None => {
                    debug!(file = %file, "no tag found for file, will search all nodes");
                    return BTreeSet::new();
                }
            }
        }
        required
    }

    /// Tags of each file separately; an empty list means every node.
    pub fn tags_per_file(&self, files: &[String]) -> Vec<Vec<String>> {
        files
            .iter()
            .map(|f| self.tags_for_file(f).map(<[String]>::to_vec).unwrap_or_default())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> PartitionMap {
        let prefix = partitions_prefix("");
        PartitionMap::from_pairs(
            &prefix,
            &[
                ("partitions/east/*".into(), "east-tag".into()),
                ("partitions/west/*".into(), " west-tag , ,shared ".into()),
                ("partitions/empty/*".into(), " , ".into()),
            ],
        )
    }

    #[test]
    fn prefix_depends_on_user_tag() {
        assert_eq!(partitions_prefix(""), "partitions/");
        assert_eq!(partitions_prefix("acme"), "acme/partitions/");
        assert_eq!(partitions_prefix("/acme/"), "acme/partitions/");
    }

    #[test]
    fn tags_are_trimmed_and_empty_rules_dropped() {
        let m = map();
        assert_eq!(
            m.tags_for_file("/west/x.txt"),
            Some(&["west-tag".to_string(), "shared".to_string()][..])
        );
        assert!(m.tags_for_file("empty/x").is_none());
    }

    #[test]
    fn required_tags_union_and_fallback() {
        let m = map();
        let files = vec!["east/a".to_string(), "west/b".to_string()];
        let tags: Vec<_> = m.required_tags(&files).into_iter().collect();
        assert_eq!(tags, vec!["east-tag", "shared", "west-tag"]);

        let files = vec!["east/a".to_string(), "north/b".to_string()];
        assert!(m.required_tags(&files).is_empty());
    }

    #[test]
    fn glob_files_match_as_literals() {
        let m = map();
        assert!(m.tags_for_file("east/*.txt").is_some());
        assert!(m.tags_for_file("*.txt").is_none());
        let per_file = m.tags_per_file(&["east/a".into(), "x".into()]);
        assert_eq!(per_file, vec![vec!["east-tag".to_string()], vec![]]);
    }
}
