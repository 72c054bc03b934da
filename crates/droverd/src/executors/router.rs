//! Per-stage executor selection, model resolution, and fallback.
//!
//! Model resolution walks a fixed precedence:
//!   1. `stages.<stage>.model|profile`
//!   2. executor stage profiles (`executors.codex.profiles[stage]`)
//!   3. executor defaults (`executors.<name>.default`)
//!   4. legacy global `engine.model|profile`
//!   5. nothing (the CLI's own default)

use super::claude_code::ClaudeCodeExecutor;
use super::codex::CodexExecutor;
use super::copilot::CopilotExecutor;
use super::cursor::CursorExecutor;
use super::fake::FakeExecutor;
use super::gemini::GeminiExecutor;
use super::{ExecResult, Executor, ResolvedInvocation};
use crate::command::CommandRunner;
use drover_core::config::{Config, EngineType, ModelSelector};
use drover_core::paths::RunPaths;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// One executor attempt, mirrored for meta.json and mid-run
/// introspection without re-parsing stages.jsonl.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub model_info: std::collections::BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub success: Option<bool>,
    pub returncode: Option<i32>,
    pub fallback_applied: bool,
}

/// All attempts for one (stage, item) pair.
#[derive(Debug, Clone, Default)]
pub struct StageExecution {
    pub stage: String,
    pub item_id: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

impl StageExecution {
    pub fn latest_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }
}

pub struct ModelRouter {
    config: Config,
    executors: std::sync::RwLock<HashMap<EngineType, Arc<dyn Executor>>>,
    executions: Mutex<HashMap<String, StageExecution>>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("engine", &self.config.engine.engine_type)
            .finish_non_exhaustive()
    }
}

impl ModelRouter {
    pub fn new(config: Config, cmd: CommandRunner) -> Self {
        let mut executors: HashMap<EngineType, Arc<dyn Executor>> = HashMap::new();

        let codex_cfg = &config.executors.codex;
        executors.insert(
            EngineType::Codex,
            Arc::new(CodexExecutor::new(
                cmd.clone(),
                codex_cfg.bin.clone().unwrap_or_else(|| "codex".to_string()),
                config.engine.extra_args.clone(),
                codex_cfg.default.model.clone(),
                None,
                codex_cfg
                    .default
                    .reasoning_effort
                    .map(|e| e.as_str().to_string()),
            )),
        );

        let gemini_cfg = &config.executors.gemini;
        executors.insert(
            EngineType::Gemini,
            Arc::new(GeminiExecutor::new(
                cmd.clone(),
                gemini_cfg.bin.clone().unwrap_or_else(|| "gemini".to_string()),
                config.engine.extra_args.clone(),
                gemini_cfg.default.model.clone(),
                gemini_cfg.default.output_format.clone(),
            )),
        );

        let claude_cfg = &config.executors.claude_code;
        executors.insert(
            EngineType::ClaudeCode,
            Arc::new(ClaudeCodeExecutor::new(
                cmd.clone(),
                claude_cfg.bin.clone().unwrap_or_else(|| "claude".to_string()),
                config.engine.extra_args.clone(),
                claude_cfg.default.model.clone(),
            )),
        );

        let copilot_cfg = &config.executors.copilot;
        executors.insert(
            EngineType::Copilot,
            Arc::new(CopilotExecutor::new(
                cmd.clone(),
                copilot_cfg.bin.clone().unwrap_or_else(|| "copilot".to_string()),
                config.engine.extra_args.clone(),
                copilot_cfg.default.model.clone(),
            )),
        );

        let cursor_cfg = &config.executors.cursor;
        executors.insert(
            EngineType::Cursor,
            Arc::new(CursorExecutor::new(
                cmd,
                cursor_cfg
                    .bin
                    .clone()
                    .unwrap_or_else(|| "cursor-agent".to_string()),
                config.engine.extra_args.clone(),
                cursor_cfg.default.model.clone(),
            )),
        );

        executors.insert(EngineType::Fake, Arc::new(FakeExecutor::new()));

        Self {
            config,
            executors: std::sync::RwLock::new(executors),
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Replace an executor instance (tests wire scripted fakes here).
    pub fn set_executor(&self, engine: EngineType, executor: Arc<dyn Executor>) {
        self.executors
            .write()
            .expect("executors lock")
            .insert(engine, executor);
    }

    pub fn primary_executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executors.read().expect("executors lock")[&self.config.engine.engine_type])
    }

    /// Engine type for a stage: the stage override, else the primary.
    pub fn executor_type_for_stage(&self, stage: &str) -> EngineType {
        self.config
            .stages
            .get(stage)
            .executor
            .unwrap_or(self.config.engine.engine_type)
    }

    pub fn executor_for_stage(&self, stage: &str) -> Arc<dyn Executor> {
        let engine = self.executor_type_for_stage(stage);
        Arc::clone(&self.executors.read().expect("executors lock")[&engine])
    }

    /// Resolve the model selector for a stage along the five-level
    /// precedence chain.
    pub fn resolve_selector(&self, stage: &str) -> ModelSelector {
        let stage_cfg = self.config.stages.get(stage);
        let engine = self.executor_type_for_stage(stage);

        // 1. Stage-level override.
        if stage_cfg.is_set() {
            return stage_cfg.to_selector();
        }

        let exec_cfg = self.config.executors.get(engine);

        // 2. Executor stage profile map.
        if let Some(profile) = exec_cfg.profiles.get(stage) {
            return ModelSelector {
                profile: Some(profile.clone()),
                ..ModelSelector::default()
            };
        }

        // 3. Executor default.
        if let Some(model) = &exec_cfg.default.model {
            return ModelSelector {
                model: Some(model.clone()),
                reasoning_effort: exec_cfg.default.reasoning_effort,
                ..ModelSelector::default()
            };
        }

        // 4. Legacy global engine selection.
        if self.config.engine.model.is_some() || self.config.engine.profile.is_some() {
            return self.config.engine.to_selector();
        }

        // 5. Let the CLI pick.
        ModelSelector::default()
    }

    /// Executor plus resolved selector for a stage.
    pub fn for_stage(&self, stage: &str) -> (Arc<dyn Executor>, ModelSelector) {
        let executor = self.executor_for_stage(stage);
        let selector = self.resolve_selector(stage);
        debug!(
            stage,
            executor = executor.name(),
            model = selector.model.as_deref().unwrap_or(""),
            profile = selector.profile.as_deref().unwrap_or(""),
            "resolved executor for stage"
        );
        (executor, selector)
    }

    /// Evaluate fallback rules against a failed result. Returns the
    /// replacement selector and whether any rule fired. Rules are
    /// evaluated in order; the first full match wins.
    pub fn apply_fallback(
        &self,
        stage: &str,
        result: &ExecResult,
        current: &ModelSelector,
    ) -> (ModelSelector, bool) {
        if !self.config.fallback.enabled || self.config.fallback.rules.is_empty() {
            return (current.clone(), false);
        }

        let engine = self.executor_type_for_stage(stage);
        let mut haystack = result.read_stderr().to_lowercase();
        haystack.push('\n');
        haystack.push_str(&result.error_message.to_lowercase());

        for rule in &self.config.fallback.rules {
            if let Some(rule_engine) = rule.matcher.executor {
                if rule_engine != engine {
                    continue;
                }
            }
            if !rule.matcher.error_contains.is_empty() {
                let matched = rule
                    .matcher
                    .error_contains
                    .iter()
                    .any(|m| haystack.contains(&m.to_lowercase()));
                if !matched {
                    continue;
                }
            }

            info!(
                stage,
                original_model = current.model.as_deref().unwrap_or(""),
                fallback_model = rule.switch_to.model.as_deref().unwrap_or(""),
                fallback_profile = rule.switch_to.profile.as_deref().unwrap_or(""),
                "applying fallback rule"
            );
            return (
                ModelSelector {
                    model: rule.switch_to.model.clone(),
                    profile: rule.switch_to.profile.clone(),
                    ..ModelSelector::default()
                },
                true,
            );
        }

        (current.clone(), false)
    }

    /// Max fallback switches allowed for a stage: the first matching
    /// rule's budget, else zero.
    pub fn fallback_budget(&self, engine: EngineType) -> u32 {
        if !self.config.fallback.enabled {
            return 0;
        }
        self.config
            .fallback
            .rules
            .iter()
            .find(|r| r.matcher.executor.is_none() || r.matcher.executor == Some(engine))
            .map_or(0, |r| r.max_retries)
    }

    fn execution_key(stage: &str, item_id: Option<&str>) -> String {
        item_id.map_or_else(|| stage.to_string(), |item| format!("{stage}_{item}"))
    }

    /// Append an attempt to the (stage, item) history.
    pub fn record_attempt(
        &self,
        stage: &str,
        item_id: Option<&str>,
        invocation: &ResolvedInvocation,
        result: Option<&ExecResult>,
        fallback_applied: bool,
    ) {
        let key = Self::execution_key(stage, item_id);
        let mut executions = self.executions.lock().expect("executions lock");
        let execution = executions.entry(key).or_insert_with(|| StageExecution {
            stage: stage.to_string(),
            item_id: item_id.map(ToString::to_string),
            attempts: Vec::new(),
        });
        execution.attempts.push(AttemptRecord {
            attempt_number: execution.attempts.len() as u32 + 1,
            model_info: invocation.model_info.clone(),
            cmd: invocation.cmd.clone(),
            success: result.map(|r| r.success),
            returncode: result.map(|r| r.returncode),
            fallback_applied,
        });
    }

    pub fn execution_history(&self) -> Vec<StageExecution> {
        self.executions
            .lock()
            .expect("executions lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn stage_execution(&self, stage: &str, item_id: Option<&str>) -> Option<StageExecution> {
        self.executions
            .lock()
            .expect("executions lock")
            .get(&Self::execution_key(stage, item_id))
            .cloned()
    }

    /// Stage timeout from engine config (stage override or default).
    pub fn timeout_for(&self, stage: &str) -> u64 {
        self.config.engine.timeout_for(stage)
    }

    /// Per-attempt artifact directory under logs/.
    pub fn attempts_dir(paths: &RunPaths, stage: &str, attempt: u32) -> PathBuf {
        let dir = paths.attempt_dir(stage, attempt);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }
}
