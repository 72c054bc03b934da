//! In-memory artifact store with canonical-file persistence.
//!
//! Nodes exchange values through flat string keys. Well-known keys are
//! mirrored to their canonical files under the run directory on every
//! `set`, so the on-disk state always matches what downstream nodes
//! will read after a resume.

use chrono::{DateTime, Utc};
use drover_core::paths::{write_atomic, RunPaths};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub value: String,
    pub source_node: String,
    pub ts: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ArtifactStore {
    paths: RunPaths,
    entries: BTreeMap<String, ArtifactEntry>,
}

impl ArtifactStore {
    pub fn new(paths: RunPaths) -> Self {
        Self {
            paths,
            entries: BTreeMap::new(),
        }
    }

    /// Canonical file for a well-known key, if it has one.
    pub fn canonical_path(&self, key: &str) -> Option<PathBuf> {
        let path = match key {
            "task" => self.paths.task_md(),
            "plan" => self.paths.plan_md(),
            "spec" => self.paths.spec_md(),
            "backlog" => self.paths.backlog_yaml(),
            "project_map" => self.paths.project_map_md(),
            "tooling_snapshot" => self.paths.tooling_snapshot_md(),
            "verify_commands" => self.paths.verify_commands_md(),
            "patch_diff" => self.paths.patch_diff(),
            "review" => self.paths.review_md(),
            "pr_body" => self.paths.pr_body_md(),
            "implementation_report" => self.paths.implementation_report_md(),
            "knowledge_agents_patch" | "knowledge_arch_patch" => {
                self.paths.knowledge_patch_diff()
            }
            "knowledge_update_report" => self.paths.knowledge_report_md(),
            _ => return None,
        };
        Some(path)
    }

    /// Store a value; later writes overwrite earlier ones for the same
    /// key. Well-known keys are persisted to disk atomically.
    pub fn set(&mut self, key: &str, value: impl Into<String>, source_node: &str) {
        let value = value.into();
        if let Some(path) = self.canonical_path(key) {
            if let Err(e) = write_atomic(&path, value.as_bytes()) {
                warn!(key, path = %path.display(), error = %e, "failed to persist artifact");
            }
        }
        debug!(key, source_node, bytes = value.len(), "artifact stored");
        self.entries.insert(
            key.to_string(),
            ArtifactEntry {
                value,
                source_node: source_node.to_string(),
                ts: Utc::now(),
            },
        );
    }

    /// Store without persisting, for transient per-item keys.
    pub fn set_transient(&mut self, key: &str, value: impl Into<String>, source_node: &str) {
        self.entries.insert(
            key.to_string(),
            ArtifactEntry {
                value: value.into(),
                source_node: source_node.to_string(),
                ts: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    pub fn entry(&self, key: &str) -> Option<&ArtifactEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Pull known keys from their canonical files into memory; silent
    /// when a file does not exist yet.
    pub fn prefetch(&mut self, keys: &[String]) {
        for key in keys {
            if self.entries.contains_key(key) {
                continue;
            }
            let Some(path) = self.canonical_path(key) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    debug!(key, "prefetched artifact from disk");
                    self.entries.insert(
                        key.clone(),
                        ArtifactEntry {
                            value: content,
                            source_node: "disk".to_string(),
                            ts: Utc::now(),
                        },
                    );
                }
                Err(_) => debug!(key, "no canonical file to prefetch"),
            }
        }
    }

    /// View over the listed keys for one node's inputs.
    pub fn context_for(&self, inputs: &[String]) -> BTreeMap<String, String> {
        inputs
            .iter()
            .filter_map(|key| {
                self.get(key)
                    .map(|value| (key.clone(), value.to_string()))
            })
            .collect()
    }
}
