//! Codex CLI adapter.
//!
//! Apply mode runs `--full-auto`; text mode pins `--sandbox read-only`
//! and routes the final message through `--output-last-message` so the
//! artifact lands exactly where the node expects it.

use super::{resolve_model_fields, ExecResult, Executor, LogPaths, ResolvedInvocation};
use crate::command::CommandRunner;
use async_trait::async_trait;
use drover_core::config::ModelSelector;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CodexExecutor {
    cmd: CommandRunner,
    binary: String,
    extra_args: Vec<String>,
    default_model: Option<String>,
    default_profile: Option<String>,
    default_effort: Option<String>,
}

impl CodexExecutor {
    pub fn new(
        cmd: CommandRunner,
        binary: impl Into<String>,
        extra_args: Vec<String>,
        default_model: Option<String>,
        default_profile: Option<String>,
        default_effort: Option<String>,
    ) -> Self {
        Self {
            cmd,
            binary: binary.into(),
            extra_args,
            default_model,
            default_profile,
            default_effort,
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
        let (model, profile, effort) = resolve_model_fields(
            self.default_model.as_deref(),
            self.default_profile.as_deref(),
            self.default_effort.as_deref(),
            selector,
        );

        let mut cmd = vec![
            self.binary.clone(),
            "exec".to_string(),
            "--cd".to_string(),
            cwd.display().to_string(),
        ];

        if out_path.is_some() {
            cmd.extend(["--sandbox".to_string(), "read-only".to_string()]);
        } else {
            cmd.push("--full-auto".to_string());
        }

        if selector.and_then(|s| s.web_search) == Some(true) {
            cmd.push("--search".to_string());
        }

        if let Some(model) = &model {
            cmd.extend(["-m".to_string(), model.clone()]);
        } else if let Some(profile) = &profile {
            cmd.extend(["-p".to_string(), profile.clone()]);
        }

        if let Some(effort) = &effort {
            cmd.extend([
                "--config".to_string(),
                format!("model_reasoning_effort=\"{effort}\""),
            ]);
        }

        if let Some(out) = out_path {
            cmd.extend([
                "--output-last-message".to_string(),
                out.display().to_string(),
            ]);
        }

        cmd.extend(self.extra_args.iter().cloned());
        cmd.push(format!("@{}", prompt_path.display()));

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
            .insert("executor".to_string(), "codex".to_string());
        if let Some(model) = model {
            invocation.model_info.insert("model".to_string(), model);
        }
        if let Some(profile) = profile {
            invocation.model_info.insert("profile".to_string(), profile);
        }
        if let Some(effort) = effort {
            invocation
                .model_info
                .insert("reasoning_effort".to_string(), effort);
        }
        invocation
    }

    async fn execute(
        &self,
        invocation: ResolvedInvocation,
        cwd: &Path,
        logs: &LogPaths,
        timeout: Option<u64>,
    ) -> ExecResult {
        super::run_invocation(&self.cmd, "codex", invocation, cwd, logs, timeout).await
    }
}

#[async_trait]
impl Executor for CodexExecutor {
    fn name(&self) -> &'static str {
        "codex"
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
        let result = self.execute(invocation, cwd, logs, timeout).await;

        // Fall back to stdout when the CLI did not write the out file.
        if result.success && !out_path.exists() {
            let stdout = result.read_stdout();
            if let Err(e) = std::fs::write(out_path, stdout) {
                return ExecResult::error(
                    result.returncode,
                    logs,
                    format!("failed to write output file: {e}"),
                    result.invocation,
                );
            }
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
        self.execute(invocation, cwd, logs, timeout).await
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
