//! Gemini CLI adapter.
//!
//! Runs headless with `--prompt @file`; apply mode auto-approves via
//! `--approval-mode yolo` while text mode stays on the default
//! (read-only) approval mode. JSON output is parsed into `extra`.

use super::{resolve_model_fields, ExecResult, Executor, LogPaths, ResolvedInvocation};
use crate::command::CommandRunner;
use async_trait::async_trait;
use drover_core::config::ModelSelector;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct GeminiExecutor {
    cmd: CommandRunner,
    binary: String,
    extra_args: Vec<String>,
    default_model: Option<String>,
    output_format: String,
}

impl GeminiExecutor {
    pub fn new(
        cmd: CommandRunner,
        binary: impl Into<String>,
        extra_args: Vec<String>,
        default_model: Option<String>,
        output_format: Option<String>,
    ) -> Self {
        Self {
            cmd,
            binary: binary.into(),
            extra_args,
            default_model,
            output_format: output_format.unwrap_or_else(|| "json".to_string()),
        }
    }

    fn build_invocation(
        &self,
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
        if out_path.is_none() {
            cmd.extend(["--approval-mode".to_string(), "yolo".to_string()]);
        }
        cmd.extend(["--output-format".to_string(), self.output_format.clone()]);
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
            .insert("executor".to_string(), "gemini".to_string());
        if let Some(model) = model {
            invocation.model_info.insert("model".to_string(), model);
        }
        invocation
    }

    /// With `--output-format json` the final message sits in the
    /// `response` field; usage metadata rides along.
    fn parse_json_output(result: &mut ExecResult) -> Option<String> {
        let stdout = result.read_stdout();
        let json: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
        if let Some(obj) = json.as_object() {
            for key in ["usage", "stats", "model"] {
                if let Some(value) = obj.get(key) {
                    result.extra.insert(key.to_string(), value.clone());
                }
            }
        }
        json.get("response")
            .and_then(|r| r.as_str())
            .map(ToString::to_string)
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    fn name(&self) -> &'static str {
        "gemini"
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
        let invocation = self.build_invocation(prompt_path, logs, Some(out_path), selector);
        let mut result =
            super::run_invocation(&self.cmd, "gemini", invocation, cwd, logs, timeout).await;
        if result.failed() {
            return result;
        }

        let text = Self::parse_json_output(&mut result)
            .unwrap_or_else(|| result.read_stdout());
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
        let invocation = self.build_invocation(prompt_path, logs, None, selector);
        let mut result =
            super::run_invocation(&self.cmd, "gemini", invocation, cwd, logs, timeout).await;
        if !result.failed() {
            Self::parse_json_output(&mut result);
        }
        result
    }

    fn resolve_invocation(
        &self,
        _cwd: &Path,
        prompt_path: &Path,
        logs: &LogPaths,
        out_path: Option<&Path>,
        selector: Option<&ModelSelector>,
    ) -> ResolvedInvocation {
        self.build_invocation(prompt_path, logs, out_path, selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor() -> GeminiExecutor {
        GeminiExecutor::new(
            CommandRunner::new(true),
            "gemini",
            Vec::new(),
            Some("gemini-2.5-pro".to_string()),
            None,
        )
    }

    #[test]
    fn apply_mode_auto_approves() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        let invocation =
            executor().resolve_invocation(dir.path(), Path::new("p.md"), &logs, None, None);
        let cmd = invocation.cmd.join(" ");
        assert!(cmd.contains("--approval-mode yolo"));
        assert!(cmd.contains("--model gemini-2.5-pro"));
        assert!(cmd.contains("--prompt @p.md"));
    }

    #[test]
    fn text_mode_stays_read_only() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        let out = dir.path().join("out.md");
        let invocation = executor().resolve_invocation(
            dir.path(),
            Path::new("p.md"),
            &logs,
            Some(&out),
            None,
        );
        let cmd = invocation.cmd.join(" ");
        assert!(!cmd.contains("yolo"));
        assert!(cmd.contains("--output-format json"));
    }

    #[test]
    fn selector_model_wins() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        let selector = ModelSelector {
            model: Some("gemini-2.5-flash".to_string()),
            ..ModelSelector::default()
        };
        let invocation = executor().resolve_invocation(
            dir.path(),
            Path::new("p.md"),
            &logs,
            None,
            Some(&selector),
        );
        assert!(invocation.cmd.join(" ").contains("--model gemini-2.5-flash"));
        assert_eq!(invocation.model(), Some("gemini-2.5-flash"));
    }

    #[test]
    fn json_response_is_extracted() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            &logs.stdout,
            "{\"response\": \"the plan\", \"usage\": {\"input_tokens\": 5, \"output_tokens\": 2}}",
        )
        .unwrap();
        std::fs::write(&logs.stderr, "").unwrap();

        let mut result = ExecResult::ok(0, &logs, None);
        let text = GeminiExecutor::parse_json_output(&mut result).unwrap();
        assert_eq!(text, "the plan");
        assert_eq!(result.get_token_usage().unwrap().total, 7);
    }
}
