//! Claude Code CLI adapter.
//!
//! Headless `-p` invocations with `--output-format json`. Apply mode
//! skips permission prompts; text mode restricts the tool set to
//! read-only tools so the workspace cannot be mutated.

use super::{resolve_model_fields, ExecResult, Executor, LogPaths, ResolvedInvocation};
use crate::command::CommandRunner;
use async_trait::async_trait;
use drover_core::config::ModelSelector;
use std::path::Path;

const TEXT_MODE_TOOLS: &str = "Read,Grep,Glob,LS";

#[derive(Debug, Clone)]
pub struct ClaudeCodeExecutor {
    cmd: CommandRunner,
    binary: String,
    extra_args: Vec<String>,
    default_model: Option<String>,
}

impl ClaudeCodeExecutor {
    pub fn new(
        cmd: CommandRunner,
        binary: impl Into<String>,
        extra_args: Vec<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            cmd,
            binary: binary.into(),
            extra_args,
            default_model,
        }
    }

    fn build_invocation(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        logs: &LogPaths,
        out_path: Option<&Path>,
        selector: Option<&ModelSelector>,
    ) -> ResolvedInvocation {
        let (model, _, _) =
            resolve_model_fields(self.default_model.as_deref(), None, None, selector);

        let mut cmd = vec![self.binary.clone(), "-p".to_string()];
        cmd.extend(["--output-format".to_string(), "json".to_string()]);
        if let Some(model) = &model {
            cmd.extend(["--model".to_string(), model.clone()]);
        }

        // Prompt content is passed by reference to the file.
        cmd.push(format!("@{}", prompt_path.display()));

        if out_path.is_some() {
            cmd.extend(["--tools".to_string(), TEXT_MODE_TOOLS.to_string()]);
        } else {
            cmd.push("--dangerously-skip-permissions".to_string());
        }
        cmd.extend(["--add-dir".to_string(), cwd.display().to_string()]);
        cmd.extend(self.extra_args.iter().cloned());

        let mut invocation = ResolvedInvocation {
            cmd,
            ..ResolvedInvocation::default()
        };
        invocation
            .artifacts
            .insert("stdout".to_string(), logs.stdout.clone());
        invocation
            .artifacts
            .insert("stderr".to_string(), logs.stderr.clone());
        if let Some(out) = out_path {
            invocation
                .artifacts
                .insert("output".to_string(), out.to_path_buf());
        }
        invocation
            .model_info
            .insert("executor".to_string(), "claude_code".to_string());
        if let Some(model) = model {
            invocation.model_info.insert("model".to_string(), model);
        }
        invocation
    }

    /// `--output-format json` yields `{"result": "...", "usage": ...}`.
    fn parse_json_output(result: &mut ExecResult) -> Option<String> {
        let stdout = result.read_stdout();
        let json: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
        if let Some(obj) = json.as_object() {
            for key in ["usage", "total_cost_usd", "model"] {
                if let Some(value) = obj.get(key) {
                    result.extra.insert(key.to_string(), value.clone());
                }
            }
        }
        json.get("result")
            .and_then(|r| r.as_str())
            .map(ToString::to_string)
    }
}

#[async_trait]
impl Executor for ClaudeCodeExecutor {
    fn name(&self) -> &'static str {
        "claude_code"
    }

    async fn run_text(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        out_path: &Path,
        logs: &LogPaths,
        timeout: Option<u64>,
        selector: Option<&ModelSelector>,
    ) -> ExecResult {
        let invocation =
            self.build_invocation(cwd, prompt_path, logs, Some(out_path), selector);
        let mut result =
            super::run_invocation(&self.cmd, "claude_code", invocation, cwd, logs, timeout)
                .await;
        if result.failed() {
            return result;
        }

        let text =
            Self::parse_json_output(&mut result).unwrap_or_else(|| result.read_stdout());
        if let Err(e) = std::fs::write(out_path, text) {
            return ExecResult::error(
                result.returncode,
                logs,
                format!("failed to write output file: {e}"),
                result.invocation,
            );
        }
        result
    }

    async fn run_apply(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        logs: &LogPaths,
        timeout: Option<u64>,
        selector: Option<&ModelSelector>,
    ) -> ExecResult {
        let invocation = self.build_invocation(cwd, prompt_path, logs, None, selector);
        let mut result =
            super::run_invocation(&self.cmd, "claude_code", invocation, cwd, logs, timeout)
                .await;
        if !result.failed() {
            Self::parse_json_output(&mut result);
        }
        result
    }

    fn resolve_invocation(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        logs: &LogPaths,
        out_path: Option<&Path>,
        selector: Option<&ModelSelector>,
    ) -> ResolvedInvocation {
        self.build_invocation(cwd, prompt_path, logs, out_path, selector)
    }
}
