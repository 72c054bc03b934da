//! Pipeline and node definitions.
//!
//! A pipeline is an ordered list of typed nodes with declared inputs
//! and outputs; the schema round-trips through YAML so users can ship
//! their own pipeline files.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid pipeline yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid pipeline: {0}")]
    Invalid(String),
}

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    LlmText,
    LlmApply,
    Map,
    Gate,
    Custom,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LlmText => "llm_text",
            Self::LlmApply => "llm_apply",
            Self::Map => "map",
            Self::Gate => "gate",
            Self::Custom => "custom",
        }
    }
}

/// Type-specific node settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Prompt template name for llm nodes.
    pub template: Option<String>,
    /// Gate names a gate node runs; empty means all enabled gates.
    pub gates: Vec<String>,
    /// Sub-pipeline a map node runs per item.
    pub item_pipeline: Vec<NodeDefinition>,
    /// Worker count for map nodes.
    pub concurrency: Option<usize>,
    /// Node-level timeout override in seconds.
    pub timeout_seconds: Option<u64>,
    /// Registered callable name for custom nodes.
    pub callable: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub config: NodeConfig,
}

impl NodeDefinition {
    pub fn new(id: &str, node_type: NodeType) -> Self {
        Self {
            id: id.to_string(),
            node_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            config: NodeConfig::default(),
        }
    }

    pub fn with_io(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| (*s).to_string()).collect();
        self.outputs = outputs.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.config.template = Some(template.to_string());
        self
    }

    pub fn with_callable(mut self, callable: &str) -> Self {
        self.config.callable = Some(callable.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Keys prefetched into the artifact store from disk on start.
    #[serde(default)]
    pub default_context: Vec<String>,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub builtin: bool,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl PipelineDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.is_empty() {
            return Err(DefinitionError::Invalid("pipeline id is empty".to_string()));
        }
        if self.nodes.is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "pipeline '{}' has no nodes",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(DefinitionError::Invalid(format!(
                    "duplicate node id '{}' in pipeline '{}'",
                    node.id, self.id
                )));
            }
            if node.node_type == NodeType::Map {
                if node.config.item_pipeline.is_empty() {
                    return Err(DefinitionError::Invalid(format!(
                        "map node '{}' has no item_pipeline",
                        node.id
                    )));
                }
                if node.config.concurrency == Some(0) {
                    return Err(DefinitionError::Invalid(format!(
                        "map node '{}' concurrency must be positive",
                        node.id
                    )));
                }
            }
            if node.node_type == NodeType::Custom && node.config.callable.is_none() {
                return Err(DefinitionError::Invalid(format!(
                    "custom node '{}' names no callable",
                    node.id
                )));
            }
        }
        Ok(())
    }

    pub fn from_yaml(content: &str) -> Result<Self, DefinitionError> {
        let pipeline: Self = serde_yaml::from_str(content)?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn to_yaml(&self) -> Result<String, DefinitionError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn node_index(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == node_id)
    }
}
