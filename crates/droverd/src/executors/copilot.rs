//! Copilot CLI adapter.
//!
//! Non-interactive `--prompt @file` invocations. Apply mode allows all
//! tools and paths; text mode denies the write and shell tools.

use super::{resolve_model_fields, ExecResult, Executor, LogPaths, ResolvedInvocation};
use crate::command::CommandRunner;
use async_trait::async_trait;
use drover_core::config::ModelSelector;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CopilotExecutor {
    cmd: CommandRunner,
    binary: String,
    extra_args: Vec<String>,
    default_model: Option<String>,
}

impl CopilotExecutor {
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

        let mut cmd = vec![self.binary.clone()];
        if let Some(model) = &model {
            cmd.extend(["--model".to_string(), model.clone()]);
        }
        if out_path.is_some() {
            cmd.extend(["--deny-tool".to_string(), "write".to_string()]);
            cmd.extend(["--deny-tool".to_string(), "shell".to_string()]);
            cmd.push("--allow-all-paths".to_string());
        } else {
            cmd.push("--allow-all-tools".to_string());
            cmd.push("--allow-all-paths".to_string());
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
            .insert("executor".to_string(), "copilot".to_string());
        if let Some(model) = model {
            invocation.model_info.insert("model".to_string(), model);
        }
        invocation
    }
}

#[async_trait]
impl Executor for CopilotExecutor {
    fn name(&self) -> &'static str {
        "copilot"
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
        let result =
            super::run_invocation(&self.cmd, "copilot", invocation, cwd, logs, timeout).await;
        if result.failed() {
            return result;
        }

        // The final message goes to stdout in non-interactive mode.
        if let Err(e) = std::fs::write(out_path, result.read_stdout()) {
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
        super::run_invocation(&self.cmd, "copilot", invocation, cwd, logs, timeout).await
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
