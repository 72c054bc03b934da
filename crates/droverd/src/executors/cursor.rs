//! Cursor agent CLI adapter.
//!
//! Headless `-p` runs with `--output-format json`. Apply mode passes
//! `--force` to permit file modification; text mode omits it.

use super::{resolve_model_fields, ExecResult, Executor, LogPaths, ResolvedInvocation};
use crate::command::CommandRunner;
use async_trait::async_trait;
use drover_core::config::ModelSelector;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CursorExecutor {
    cmd: CommandRunner,
    binary: String,
    extra_args: Vec<String>,
    default_model: Option<String>,
}

impl CursorExecutor {
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
        if out_path.is_none() {
            cmd.push("--force".to_string());
        }
        cmd.extend(["--add-dir".to_string(), cwd.display().to_string()]);
        cmd.extend(self.extra_args.iter().cloned());
        cmd.extend([
            "--prompt".to_string(),
            format!("@{}", prompt_path.display()),
        ]);

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
            .insert("executor".to_string(), "cursor".to_string());
        if let Some(model) = model {
            invocation.model_info.insert("model".to_string(), model);
        }
        invocation
    }

    fn parse_json_output(result: &mut ExecResult) -> Option<String> {
        let stdout = result.read_stdout();
        let json: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
        if let Some(obj) = json.as_object() {
            for key in ["usage", "model"] {
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
impl Executor for CursorExecutor {
    fn name(&self) -> &'static str {
        "cursor"
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
            super::run_invocation(&self.cmd, "cursor", invocation, cwd, logs, timeout).await;
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
            super::run_invocation(&self.cmd, "cursor", invocation, cwd, logs, timeout).await;
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
