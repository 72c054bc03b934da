//! Configuration schema for the orchestrator.
//!
//! The config file itself is YAML; loading goes through serde and then
//! a `validate()` pass that enforces the cross-field rules (unique gate
//! names, model/profile exclusivity, range checks serde cannot express).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Supported executor engine types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Codex,
    Gemini,
    ClaudeCode,
    Copilot,
    Cursor,
    Fake,
}

impl EngineType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::ClaudeCode => "claude_code",
            Self::Copilot => "copilot",
            Self::Cursor => "cursor",
            Self::Fake => "fake",
        }
    }

    /// Default CLI binary name for this engine.
    pub fn default_binary(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::ClaudeCode => "claude",
            Self::Copilot => "copilot",
            Self::Cursor => "cursor-agent",
            Self::Fake => "",
        }
    }

    pub fn all() -> [Self; 6] {
        [
            Self::Codex,
            Self::Gemini,
            Self::ClaudeCode,
            Self::Copilot,
            Self::Cursor,
            Self::Fake,
        ]
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Resolved model selection for one stage invocation.
///
/// `model` and `profile` are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSelector {
    pub model: Option<String>,
    pub profile: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub web_search: Option<bool>,
}

impl ModelSelector {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.is_some() && self.profile.is_some() {
            return Err(ConfigError::Invalid(
                "cannot specify both 'model' and 'profile'".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.profile.is_none() && self.reasoning_effort.is_none()
    }
}

/// Primary engine configuration (legacy global selection lives here).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(rename = "type")]
    pub engine_type: EngineType,
    pub binary: Option<String>,
    pub extra_args: Vec<String>,
    /// Default per-stage timeout in seconds.
    pub timeout: u64,
    /// Stage-specific timeout overrides, in seconds.
    pub stage_timeouts: BTreeMap<String, u64>,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub output_format: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_type: EngineType::Codex,
            binary: None,
            extra_args: Vec::new(),
            timeout: 600,
            stage_timeouts: BTreeMap::new(),
            model: None,
            profile: None,
            reasoning_effort: None,
            output_format: None,
        }
    }
}

impl EngineConfig {
    /// Binary to invoke: explicit override or the engine-type default.
    pub fn binary_name(&self) -> String {
        self.binary
            .clone()
            .unwrap_or_else(|| self.engine_type.default_binary().to_string())
    }

    /// Timeout for a stage, honoring `stage_timeouts` overrides.
    pub fn timeout_for(&self, stage: &str) -> u64 {
        self.stage_timeouts.get(stage).copied().unwrap_or(self.timeout)
    }

    pub fn to_selector(&self) -> ModelSelector {
        ModelSelector {
            model: self.model.clone(),
            profile: self.profile.clone(),
            reasoning_effort: self.reasoning_effort,
            web_search: None,
        }
    }
}

/// Defaults for one executor type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorDefaults {
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub output_format: Option<String>,
}

/// Per-executor settings: binary override, defaults, stage profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub bin: Option<String>,
    pub default: ExecutorDefaults,
    /// Named profiles keyed by stage name (Codex).
    pub profiles: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorsConfig {
    pub codex: ExecutorConfig,
    pub gemini: ExecutorConfig,
    pub claude_code: ExecutorConfig,
    pub copilot: ExecutorConfig,
    pub cursor: ExecutorConfig,
}

impl ExecutorsConfig {
    pub fn get(&self, engine: EngineType) -> &ExecutorConfig {
        static EMPTY: std::sync::OnceLock<ExecutorConfig> = std::sync::OnceLock::new();
        match engine {
            EngineType::Codex => &self.codex,
            EngineType::Gemini => &self.gemini,
            EngineType::ClaudeCode => &self.claude_code,
            EngineType::Copilot => &self.copilot,
            EngineType::Cursor => &self.cursor,
            EngineType::Fake => EMPTY.get_or_init(ExecutorConfig::default),
        }
    }
}

/// Highest-priority per-stage override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageExecutorConfig {
    pub executor: Option<EngineType>,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl StageExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.is_some() && self.profile.is_some() {
            return Err(ConfigError::Invalid(
                "cannot specify both 'model' and 'profile' for a stage".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.model.is_some() || self.profile.is_some()
    }

    pub fn to_selector(&self) -> ModelSelector {
        ModelSelector {
            model: self.model.clone(),
            profile: self.profile.clone(),
            reasoning_effort: self.reasoning_effort,
            web_search: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub plan: StageExecutorConfig,
    pub spec: StageExecutorConfig,
    pub decompose: StageExecutorConfig,
    pub implement: StageExecutorConfig,
    pub fix: StageExecutorConfig,
    pub verify: StageExecutorConfig,
    pub review: StageExecutorConfig,
    pub ship: StageExecutorConfig,
    pub knowledge_update: StageExecutorConfig,
}

impl StagesConfig {
    pub fn get(&self, stage: &str) -> &StageExecutorConfig {
        static EMPTY: std::sync::OnceLock<StageExecutorConfig> = std::sync::OnceLock::new();
        match stage {
            "plan" => &self.plan,
            "spec" => &self.spec,
            "decompose" => &self.decompose,
            "implement" | "implement_direct" => &self.implement,
            "fix" => &self.fix,
            "verify" => &self.verify,
            "review" => &self.review,
            "ship" => &self.ship,
            "knowledge_update" => &self.knowledge_update,
            _ => EMPTY.get_or_init(StageExecutorConfig::default),
        }
    }

    fn each(&self) -> [(&'static str, &StageExecutorConfig); 9] {
        [
            ("plan", &self.plan),
            ("spec", &self.spec),
            ("decompose", &self.decompose),
            ("implement", &self.implement),
            ("fix", &self.fix),
            ("verify", &self.verify),
            ("review", &self.review),
            ("ship", &self.ship),
            ("knowledge_update", &self.knowledge_update),
        ]
    }
}

/// Conditions under which a fallback rule fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackMatch {
    pub executor: Option<EngineType>,
    pub error_contains: Vec<String>,
}

/// Selector change applied when a fallback rule fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSwitch {
    pub model: Option<String>,
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRule {
    #[serde(rename = "match")]
    pub matcher: FallbackMatch,
    pub switch_to: FallbackSwitch,
    #[serde(default = "default_fallback_retries")]
    pub max_retries: u32,
}

fn default_fallback_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub rules: Vec<FallbackRule>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

/// One quality gate: an external command whose exit code decides pass/fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub base_branch: String,
    pub remote: String,
    pub auto_commit: bool,
    pub auto_push: bool,
    pub create_pr: bool,
    pub pr_draft: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            auto_commit: true,
            auto_push: false,
            create_pr: false,
            pr_draft: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailMode {
    #[default]
    Blacklist,
    Allowlist,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub enabled: bool,
    pub mode: GuardrailMode,
    /// Patterns permitted in allowlist mode.
    pub allowed_patterns: Vec<String>,
    pub forbidden_patterns: Vec<String>,
    pub forbidden_paths: Vec<String>,
    /// Artifact files that must never be created inside the worktree.
    pub forbidden_new_files: Vec<String>,
    pub max_files_changed: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: GuardrailMode::Blacklist,
            allowed_patterns: Vec::new(),
            forbidden_patterns: vec![
                "*.env".to_string(),
                "*.env.*".to_string(),
                "*secrets*".to_string(),
                "*.pem".to_string(),
                "*.key".to_string(),
                ".git/*".to_string(),
            ],
            forbidden_paths: vec![
                ".env".to_string(),
                ".env.local".to_string(),
                ".env.production".to_string(),
                "secrets.yaml".to_string(),
                "secrets.json".to_string(),
            ],
            forbidden_new_files: vec![
                "pr_body.md".to_string(),
                "review.md".to_string(),
                "*.drover.md".to_string(),
            ],
            max_files_changed: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    Full,
    #[default]
    Fast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunBehavior {
    /// Max implement/fix attempts per work item (1..=10).
    pub max_fix_attempts: u32,
    /// Map-node worker count; 1 means strictly sequential.
    pub parallel_items: usize,
    pub stop_on_first_failure: bool,
    pub per_item_verify: VerifyMode,
    pub fast_verify_max_test_targets: usize,
    pub fast_verify_skip_if_no_targets: bool,
}

impl Default for RunBehavior {
    fn default() -> Self {
        Self {
            max_fix_attempts: 3,
            parallel_items: 1,
            stop_on_first_failure: false,
            per_item_verify: VerifyMode::Fast,
            fast_verify_max_test_targets: 6,
            fast_verify_skip_if_no_targets: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeMode {
    Off,
    Suggest,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeTrigger {
    PerItem,
    #[default]
    PerRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeMarkers {
    pub agents_start: String,
    pub agents_end: String,
    pub arch_start: String,
    pub arch_end: String,
}

impl Default for KnowledgeMarkers {
    fn default() -> Self {
        Self {
            agents_start: "<!-- DROVER:START AGENTS -->".to_string(),
            agents_end: "<!-- DROVER:END AGENTS -->".to_string(),
            arch_start: "<!-- DROVER:START ARCH -->".to_string(),
            arch_end: "<!-- DROVER:END ARCH -->".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeLimits {
    pub max_total_changed_lines: usize,
    pub max_changed_lines_per_file: usize,
    pub max_deleted_lines: usize,
}

impl Default for KnowledgeLimits {
    fn default() -> Self {
        Self {
            max_total_changed_lines: 300,
            max_changed_lines_per_file: 200,
            max_deleted_lines: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub enabled: bool,
    pub mode: KnowledgeMode,
    pub trigger: KnowledgeTrigger,
    pub branch_mode: String,
    pub allowlist: Vec<String>,
    pub markers: KnowledgeMarkers,
    pub limits: KnowledgeLimits,
    pub architecture_gatekeeping: bool,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: KnowledgeMode::Auto,
            trigger: KnowledgeTrigger::PerRun,
            branch_mode: "separate".to_string(),
            allowlist: vec!["AGENTS.md".to_string(), "ARCHITECTURE.md".to_string()],
            markers: KnowledgeMarkers::default(),
            limits: KnowledgeLimits::default(),
            architecture_gatekeeping: true,
        }
    }
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: String,
    pub engine: EngineConfig,
    /// Legacy per-stage engine overrides, keyed by stage name.
    pub stage_engines: BTreeMap<String, EngineConfig>,
    pub executors: ExecutorsConfig,
    pub stages: StagesConfig,
    pub fallback: FallbackConfig,
    pub gates: Vec<GateConfig>,
    pub git: GitConfig,
    pub guardrails: GuardrailConfig,
    pub run: RunBehavior,
    pub knowledge: KnowledgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            engine: EngineConfig::default(),
            stage_engines: BTreeMap::new(),
            executors: ExecutorsConfig::default(),
            stages: StagesConfig::default(),
            fallback: FallbackConfig::default(),
            gates: vec![
                GateConfig {
                    name: "ruff".to_string(),
                    enabled: true,
                    command: "ruff".to_string(),
                    args: vec!["check".to_string(), ".".to_string()],
                    required: true,
                },
                GateConfig {
                    name: "pytest".to_string(),
                    enabled: true,
                    command: "pytest".to_string(),
                    args: vec!["-q".to_string()],
                    required: true,
                },
            ],
            git: GitConfig::default(),
            guardrails: GuardrailConfig::default(),
            run: RunBehavior::default(),
            knowledge: KnowledgeConfig::default(),
        }
    }
}

impl Config {
    /// Cross-field validation serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for gate in &self.gates {
            if !seen.insert(gate.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "gate names must be unique: '{}'",
                    gate.name
                )));
            }
        }

        if self.engine.model.is_some() && self.engine.profile.is_some() {
            return Err(ConfigError::Invalid(
                "engine cannot specify both 'model' and 'profile'".to_string(),
            ));
        }
        for (name, stage) in self.stages.each() {
            stage.validate().map_err(|e| {
                ConfigError::Invalid(format!("stages.{name}: {e}"))
            })?;
        }

        for (i, rule) in self.fallback.rules.iter().enumerate() {
            if !(1..=5).contains(&rule.max_retries) {
                return Err(ConfigError::Invalid(format!(
                    "fallback.rules[{i}].max_retries must be within 1..=5"
                )));
            }
        }

        if !(1..=10).contains(&self.run.max_fix_attempts) {
            return Err(ConfigError::Invalid(
                "run.max_fix_attempts must be within 1..=10".to_string(),
            ));
        }
        if self.run.parallel_items == 0 {
            return Err(ConfigError::Invalid(
                "run.parallel_items must be at least 1".to_string(),
            ));
        }
        if self.engine.timeout < 30 {
            return Err(ConfigError::Invalid(
                "engine.timeout must be at least 30 seconds".to_string(),
            ));
        }
        if self.guardrails.max_files_changed == 0 {
            return Err(ConfigError::Invalid(
                "guardrails.max_files_changed must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn enabled_gates(&self) -> Vec<&GateConfig> {
        self.gates.iter().filter(|g| g.enabled).collect()
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
