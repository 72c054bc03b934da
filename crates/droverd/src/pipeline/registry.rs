//! Pipeline catalog: immutable built-ins plus user-supplied files.

use super::definition::{NodeDefinition, NodeType, PipelineDefinition, SCHEMA_VERSION};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_PIPELINE_ID: &str = "standard";
pub const MAX_USER_PIPELINES: usize = 50;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("pipeline not found: {0}")]
    NotFound(String),
    #[error("cannot modify built-in pipeline: {0}")]
    Builtin(String),
    #[error("pipeline limit reached ({MAX_USER_PIPELINES})")]
    LimitReached,
    #[error("failed to load pipeline from '{path}': {message}")]
    Load { path: String, message: String },
}

#[derive(Debug)]
pub struct PipelineRegistry {
    user_dir: Option<PathBuf>,
    pipelines: BTreeMap<String, PipelineDefinition>,
}

impl PipelineRegistry {
    pub fn new(user_dir: Option<PathBuf>) -> Self {
        let mut registry = Self {
            user_dir,
            pipelines: BTreeMap::new(),
        };
        for pipeline in builtin_pipelines() {
            registry.pipelines.insert(pipeline.id.clone(), pipeline);
        }
        registry.load_user_pipelines();
        registry
    }

    pub fn pipelines(&self) -> Vec<&PipelineDefinition> {
        self.pipelines.values().collect()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.pipelines.contains_key(id)
    }

    /// Look up by id, or load a pipeline file when `id` is a path.
    pub fn get(&mut self, id: &str) -> Result<PipelineDefinition, RegistryError> {
        let path = Path::new(id);
        if path.is_file() {
            let pipeline = load_pipeline_file(path).map_err(|message| RegistryError::Load {
                path: id.to_string(),
                message,
            })?;
            self.pipelines.insert(id.to_string(), pipeline.clone());
            return Ok(pipeline);
        }

        self.pipelines
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn add(&mut self, mut pipeline: PipelineDefinition) -> Result<(), RegistryError> {
        if self
            .pipelines
            .get(&pipeline.id)
            .is_some_and(|existing| existing.builtin)
        {
            return Err(RegistryError::Builtin(pipeline.id));
        }
        let user_count = self.pipelines.values().filter(|p| !p.builtin).count();
        if user_count >= MAX_USER_PIPELINES && !self.pipelines.contains_key(&pipeline.id) {
            return Err(RegistryError::LimitReached);
        }
        pipeline.builtin = false;
        self.pipelines.insert(pipeline.id.clone(), pipeline);
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<(), RegistryError> {
        match self.pipelines.get(id) {
            None => return Err(RegistryError::NotFound(id.to_string())),
            Some(p) if p.builtin => return Err(RegistryError::Builtin(id.to_string())),
            Some(_) => {}
        }
        self.pipelines.remove(id);
        if let Some(dir) = &self.user_dir {
            let path = dir.join(format!("{id}.yaml"));
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn load_user_pipelines(&mut self) {
        let Some(dir) = self.user_dir.clone() else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match load_pipeline_file(&path) {
                Ok(pipeline) => {
                    if pipeline.builtin || self.pipelines.get(&pipeline.id).is_some_and(|p| p.builtin)
                    {
                        warn!(path = %path.display(), "user pipeline shadows a builtin, skipping");
                        continue;
                    }
                    debug!(id = %pipeline.id, "loaded user pipeline");
                    self.pipelines.insert(pipeline.id.clone(), pipeline);
                }
                Err(message) => {
                    warn!(path = %path.display(), message, "failed to load user pipeline");
                }
            }
        }
    }
}

fn load_pipeline_file(path: &Path) -> Result<PipelineDefinition, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut pipeline = PipelineDefinition::from_yaml(&content).map_err(|e| e.to_string())?;
    pipeline.builtin = false;
    Ok(pipeline)
}

/// The immutable built-in catalog, constructed once at startup.
pub fn builtin_pipelines() -> Vec<PipelineDefinition> {
    vec![standard_pipeline(), fast_fix_pipeline()]
}

/// Full flow: plan, spec, decompose, per-item implement/verify map,
/// review, ship, knowledge update.
fn standard_pipeline() -> PipelineDefinition {
    let mut map_node = NodeDefinition::new("implement", NodeType::Map)
        .with_io(&["backlog", "spec", "task"], &["implementation_report"]);
    map_node.config.item_pipeline = vec![
        NodeDefinition::new("implement", NodeType::LlmApply)
            .with_io(&["spec", "current_item"], &["patch_diff"])
            .with_template("implement"),
        NodeDefinition::new("verify", NodeType::Gate).with_io(&["patch_diff"], &[]),
    ];
    map_node.config.concurrency = None; // run.parallel_items decides

    PipelineDefinition {
        id: "standard".to_string(),
        name: "Standard".to_string(),
        description: "Plan, spec, decompose, implement each item behind gates, review, ship."
            .to_string(),
        default_context: vec![
            "project_map".to_string(),
            "tooling_snapshot".to_string(),
            "verify_commands".to_string(),
        ],
        nodes: vec![
            NodeDefinition::new("plan", NodeType::LlmText)
                .with_io(&["task", "project_map"], &["plan"])
                .with_template("plan"),
            NodeDefinition::new("spec", NodeType::LlmText)
                .with_io(&["task", "plan"], &["spec"])
                .with_template("spec"),
            NodeDefinition::new("decompose", NodeType::LlmText)
                .with_io(&["task", "spec"], &["backlog"])
                .with_template("decompose"),
            map_node,
            NodeDefinition::new("review", NodeType::LlmText)
                .with_io(&["task", "patch_diff"], &["review"])
                .with_template("review"),
            NodeDefinition::new("ship", NodeType::Custom)
                .with_io(&["task", "patch_diff"], &["pr_body"])
                .with_callable("ship"),
            NodeDefinition::new("knowledge_update", NodeType::Custom)
                .with_io(&["task", "implementation_report"], &["knowledge_update_report"])
                .with_callable("knowledge_update"),
        ],
        builtin: true,
        schema_version: SCHEMA_VERSION,
    }
}

/// Minimal flow for small fixes: direct implement, verify, review.
fn fast_fix_pipeline() -> PipelineDefinition {
    PipelineDefinition {
        id: "fast_fix".to_string(),
        name: "Fast fix".to_string(),
        description: "Direct implementation with verification and review; no decomposition."
            .to_string(),
        default_context: vec!["verify_commands".to_string()],
        nodes: vec![
            NodeDefinition::new("implement_direct", NodeType::LlmApply)
                .with_io(&["task"], &["patch_diff"])
                .with_template("implement"),
            NodeDefinition::new("verify", NodeType::Gate).with_io(&["patch_diff"], &[]),
            NodeDefinition::new("review", NodeType::LlmText)
                .with_io(&["task", "patch_diff"], &["review"])
                .with_template("review"),
        ],
        builtin: true,
        schema_version: SCHEMA_VERSION,
    }
}
