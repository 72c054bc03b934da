//! Scripted in-process executor for tests and dry wiring.
//!
//! Text mode answers from prompt-matching rules; apply mode consumes a
//! queue of scripted actions (write files, fail, do nothing). No
//! subprocess is ever spawned.

use super::{ExecResult, Executor, LogPaths, ResolvedInvocation};
use async_trait::async_trait;
use drover_core::config::ModelSelector;
use std::path::Path;
use std::sync::Mutex;

/// One scripted apply-mode action.
#[derive(Debug, Clone)]
pub enum FakeApply {
    /// Write these (relative path, content) pairs into the workspace.
    WriteFiles(Vec<(String, String)>),
    /// Exit non-zero with the given stderr.
    Fail { returncode: i32, stderr: String },
    /// Succeed without touching anything (empty diff).
    NoChanges,
}

#[derive(Debug, Default)]
pub struct FakeExecutor {
    /// `(needle, response)`: first rule whose needle appears in the
    /// prompt wins. Rules are not consumed.
    text_rules: Mutex<Vec<(String, String)>>,
    text_default: String,
    /// Apply actions consumed front to back; empty queue means
    /// `NoChanges`.
    apply_script: Mutex<std::collections::VecDeque<FakeApply>>,
    invocations: Mutex<Vec<ResolvedInvocation>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            text_default: "fake output\n".to_string(),
            ..Self::default()
        }
    }

    pub fn with_text_rule(self, needle: &str, response: &str) -> Self {
        self.text_rules
            .lock()
            .expect("text_rules lock")
            .push((needle.to_string(), response.to_string()));
        self
    }

    pub fn with_apply(self, action: FakeApply) -> Self {
        self.apply_script
            .lock()
            .expect("apply_script lock")
            .push_back(action);
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().expect("invocations lock").len()
    }

    pub fn invocations(&self) -> Vec<ResolvedInvocation> {
        self.invocations.lock().expect("invocations lock").clone()
    }

    fn record(&self, invocation: &ResolvedInvocation) {
        self.invocations
            .lock()
            .expect("invocations lock")
            .push(invocation.clone());
    }

    fn build_invocation(
        &self,
        prompt_path: &Path,
        logs: &LogPaths,
        out_path: Option<&Path>,
        selector: Option<&ModelSelector>,
    ) -> ResolvedInvocation {
        let mut invocation = ResolvedInvocation {
            cmd: vec!["fake".to_string(), prompt_path.display().to_string()],
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
            .insert("executor".to_string(), "fake".to_string());
        if let Some(model) = selector.and_then(|s| s.model.clone()) {
            invocation.model_info.insert("model".to_string(), model);
        }
        invocation
    }

    fn touch_logs(logs: &LogPaths, stderr: &str) {
        if let Some(parent) = logs.stdout.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&logs.stdout, "");
        let _ = std::fs::write(&logs.stderr, stderr);
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run_text(
        &self,
        _cwd: &Path,
        prompt_path: &Path,
        out_path: &Path,
        logs: &LogPaths,
        _timeout: Option<u64>,
        selector: Option<&ModelSelector>,
    ) -> ExecResult {
        let invocation = self.build_invocation(prompt_path, logs, Some(out_path), selector);
        self.record(&invocation);
        Self::touch_logs(logs, "");

        let prompt = std::fs::read_to_string(prompt_path).unwrap_or_default();
        let response = {
            let rules = self.text_rules.lock().expect("text_rules lock");
            rules
                .iter()
                .find(|(needle, _)| prompt.contains(needle.as_str()))
                .map_or_else(|| self.text_default.clone(), |(_, r)| r.clone())
        };

        if let Err(e) = std::fs::write(out_path, &response) {
            return ExecResult::error(
                1,
                logs,
                format!("failed to write output: {e}"),
                Some(invocation),
            );
        }
        ExecResult::ok(0, logs, Some(invocation))
    }

    async fn run_apply(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        logs: &LogPaths,
        _timeout: Option<u64>,
        selector: Option<&ModelSelector>,
    ) -> ExecResult {
        let invocation = self.build_invocation(prompt_path, logs, None, selector);
        self.record(&invocation);

        let action = self
            .apply_script
            .lock()
            .expect("apply_script lock")
            .pop_front()
            .unwrap_or(FakeApply::NoChanges);

        match action {
            FakeApply::WriteFiles(files) => {
                Self::touch_logs(logs, "");
                for (rel, content) in files {
                    let target = cwd.join(rel);
                    if let Some(parent) = target.parent() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            return ExecResult::error(
                                1,
                                logs,
                                format!("fake write failed: {e}"),
                                Some(invocation),
                            );
                        }
                    }
                    if let Err(e) = std::fs::write(&target, content) {
                        return ExecResult::error(
                            1,
                            logs,
                            format!("fake write failed: {e}"),
                            Some(invocation),
                        );
                    }
                }
                ExecResult::ok(0, logs, Some(invocation))
            }
            FakeApply::Fail { returncode, stderr } => {
                Self::touch_logs(logs, &stderr);
                ExecResult::error(
                    returncode,
                    logs,
                    format!("fake exited with {returncode}"),
                    Some(invocation),
                )
            }
            FakeApply::NoChanges => {
                Self::touch_logs(logs, "");
                ExecResult::ok(0, logs, Some(invocation))
            }
        }
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

    #[tokio::test]
    async fn text_mode_matches_rules_in_order() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        let prompt = dir.path().join("prompt.md");
        std::fs::write(&prompt, "please write the implementation plan").unwrap();
        let out = dir.path().join("out.md");

        let fake = FakeExecutor::new()
            .with_text_rule("plan", "the plan text")
            .with_text_rule("spec", "the spec text");

        let result = fake
            .run_text(dir.path(), &prompt, &out, &logs, None, None)
            .await;
        assert!(result.success);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "the plan text");
        assert_eq!(fake.invocation_count(), 1);
    }

    #[tokio::test]
    async fn text_mode_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        let prompt = dir.path().join("prompt.md");
        std::fs::write(&prompt, "unmatched").unwrap();
        let out = dir.path().join("out.md");

        let fake = FakeExecutor::new();
        fake.run_text(dir.path(), &prompt, &out, &logs, None, None)
            .await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "fake output\n");
    }

    #[tokio::test]
    async fn apply_script_is_consumed_in_order() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(&dir.path().join("logs"));
        let prompt = dir.path().join("prompt.md");
        std::fs::write(&prompt, "implement").unwrap();

        let fake = FakeExecutor::new()
            .with_apply(FakeApply::Fail {
                returncode: 2,
                stderr: "boom".to_string(),
            })
            .with_apply(FakeApply::WriteFiles(vec![(
                "src/app.py".to_string(),
                "def add(a, b): return a + b\n".to_string(),
            )]));

        let first = fake.run_apply(dir.path(), &prompt, &logs, None, None).await;
        assert!(first.failed());
        assert!(first.read_stderr().contains("boom"));

        let second = fake.run_apply(dir.path(), &prompt, &logs, None, None).await;
        assert!(second.success);
        assert!(dir.path().join("src/app.py").exists());

        // Queue exhausted: behaves as NoChanges.
        let third = fake.run_apply(dir.path(), &prompt, &logs, None, None).await;
        assert!(third.success);
    }
}
