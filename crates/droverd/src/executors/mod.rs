//! Uniform contract over external code-generation CLI agents.
//!
//! An executor wraps one CLI. `run_text` asks the agent for text and
//! forbids workspace mutation; `run_apply` lets it edit files in the
//! working directory. `resolve_invocation` describes the subprocess
//! without executing, for logging and dry runs.

pub mod claude_code;
pub mod codex;
pub mod copilot;
pub mod cursor;
pub mod fake;
pub mod gemini;
pub mod router;

use async_trait::async_trait;
use drover_core::config::ModelSelector;
use drover_core::metrics::schema::TokenUsage;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where an invocation's stdout/stderr land.
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
        }
    }
}

/// A fully described subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInvocation {
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Artifact name to path: always stdout/stderr, plus output in text mode.
    pub artifacts: BTreeMap<String, PathBuf>,
    /// At minimum `executor`; plus model/profile/reasoning_effort when set.
    pub model_info: BTreeMap<String, String>,
}

impl ResolvedInvocation {
    pub fn model(&self) -> Option<&str> {
        self.model_info.get("model").map(String::as_str)
    }
}

/// Result of one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub returncode: i32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub success: bool,
    pub error_message: String,
    pub invocation: Option<ResolvedInvocation>,
}

const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "429",
    "too many requests",
    "capacity",
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "model_capacity_exhausted",
    "timed out",
    "timeout",
    "500 server error",
    "502",
    "503",
    "504",
    "connection reset",
    "overloaded",
];

const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "limit",
    "capacity",
    "rate limit",
    "too many requests",
    "resource exhausted",
];

const MODEL_UNAVAILABLE_MARKERS: &[&str] = &[
    "model not found",
    "not available",
    "model does not exist",
    "invalid model",
    "unknown model",
];

impl ExecResult {
    pub fn ok(returncode: i32, logs: &LogPaths, invocation: Option<ResolvedInvocation>) -> Self {
        Self {
            returncode,
            stdout_path: logs.stdout.clone(),
            stderr_path: logs.stderr.clone(),
            extra: serde_json::Map::new(),
            success: true,
            error_message: String::new(),
            invocation,
        }
    }

    pub fn error(
        returncode: i32,
        logs: &LogPaths,
        message: impl Into<String>,
        invocation: Option<ResolvedInvocation>,
    ) -> Self {
        Self {
            returncode,
            stdout_path: logs.stdout.clone(),
            stderr_path: logs.stderr.clone(),
            extra: serde_json::Map::new(),
            success: false,
            error_message: message.into(),
            invocation,
        }
    }

    pub fn failed(&self) -> bool {
        !self.success || self.returncode != 0
    }

    pub fn read_stdout(&self) -> String {
        std::fs::read_to_string(&self.stdout_path).unwrap_or_default()
    }

    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    fn error_haystack(&self) -> String {
        let mut text = self.read_stderr().to_lowercase();
        text.push('\n');
        text.push_str(&self.error_message.to_lowercase());
        text
    }

    /// Quota, capacity, or rate-pressure error.
    pub fn is_quota_error(&self) -> bool {
        if !self.failed() {
            return false;
        }
        let haystack = self.error_haystack();
        QUOTA_MARKERS.iter().any(|m| haystack.contains(m))
    }

    /// The named model is not known to the service. Permanent; handled
    /// by fallback rules rather than plain retry.
    pub fn is_model_unavailable_error(&self) -> bool {
        if !self.failed() {
            return false;
        }
        let haystack = self.error_haystack();
        MODEL_UNAVAILABLE_MARKERS.iter().any(|m| haystack.contains(m))
    }

    /// Retry-worthy error: rate limits, capacity, timeouts, 5xx.
    pub fn is_transient_error(&self) -> bool {
        if !self.failed() {
            return false;
        }
        let haystack = self.error_haystack();
        TRANSIENT_MARKERS.iter().any(|m| haystack.contains(m))
    }

    /// Parse a retry hint out of the error text. Recognizes
    /// `retry after Ns`, `wait N seconds`, and `reset(s) ... XhYmZs`.
    pub fn get_retry_after_seconds(&self) -> Option<u64> {
        let haystack = self.error_haystack();

        if let Some(secs) = scan_after(&haystack, "retry after ", &['s']) {
            return Some(secs);
        }
        if let Some(rest) = find_after(&haystack, "wait ") {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if !digits.is_empty() && rest[digits.len()..].trim_start().starts_with("second") {
                return digits.parse().ok();
            }
        }
        for marker in ["reset after ", "resets in ", "reset in "] {
            if let Some(rest) = find_after(&haystack, marker) {
                if let Some(secs) = parse_hms(rest) {
                    return Some(secs);
                }
            }
        }
        None
    }

    /// Token usage from the structured `extra` payload, JSON lines on
    /// stdout, or labeled counts in plain logs.
    pub fn get_token_usage(&self) -> Option<TokenUsage> {
        if let Some(usage) = self.extra.get("usage").and_then(parse_usage_value) {
            return Some(usage);
        }
        if let Some(tokens) = self.extra.get("tokens").and_then(parse_tokens_value) {
            return Some(tokens);
        }

        let stdout = self.read_stdout();
        for line in stdout.lines() {
            let line = line.trim();
            if !line.starts_with('{') {
                continue;
            }
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(line) {
                if let Some(usage) = json.get("usage").and_then(parse_usage_value) {
                    return Some(usage);
                }
            }
        }

        parse_labeled_tokens(&stdout)
    }

    /// Model actually used, from invocation info or the extra payload.
    pub fn get_model_used(&self) -> Option<String> {
        if let Some(model) = self.invocation.as_ref().and_then(|i| i.model()) {
            return Some(model.to_string());
        }
        self.extra
            .get("model")
            .or_else(|| self.extra.get("model_id"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
    }
}

fn find_after<'a>(haystack: &'a str, marker: &str) -> Option<&'a str> {
    haystack.find(marker).map(|i| &haystack[i + marker.len()..])
}

fn scan_after(haystack: &str, marker: &str, suffixes: &[char]) -> Option<u64> {
    let rest = find_after(haystack, marker)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let next = rest[digits.len()..].chars().next();
    if next.is_some_and(|c| suffixes.contains(&c)) || next.is_none() {
        digits.parse().ok()
    } else {
        None
    }
}

/// Parse `4h23m31s` style durations (each part optional, in order).
fn parse_hms(text: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut digits = String::new();
    let mut matched = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if !digits.is_empty() {
            let value: u64 = digits.parse().ok()?;
            match c {
                'h' => total += value * 3600,
                'm' => total += value * 60,
                's' => total += value,
                _ => break,
            }
            matched = true;
            digits.clear();
        } else {
            break;
        }
    }
    matched.then_some(total)
}

fn parse_usage_value(value: &serde_json::Value) -> Option<TokenUsage> {
    let input = value
        .get("input_tokens")
        .or_else(|| value.get("prompt_tokens"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let output = value
        .get("output_tokens")
        .or_else(|| value.get("completion_tokens"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    (input > 0 || output > 0).then_some(TokenUsage {
        input,
        output,
        total: input + output,
        tool_calls: value.get("tool_calls").and_then(serde_json::Value::as_u64),
    })
}

fn parse_tokens_value(value: &serde_json::Value) -> Option<TokenUsage> {
    let input = value.get("input").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let output = value.get("output").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let total = value
        .get("total")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(input + output);
    (input > 0 || output > 0 || total > 0).then_some(TokenUsage {
        input,
        output,
        total,
        tool_calls: None,
    })
}

/// Last-resort regex-free scan for `input tokens: N` style labels.
fn parse_labeled_tokens(text: &str) -> Option<TokenUsage> {
    let lower = text.to_lowercase();
    let grab = |labels: &[&str]| -> u64 {
        for label in labels {
            if let Some(rest) = find_after(&lower, label) {
                let rest = rest.trim_start_matches([':', ' ', '\t']);
                let digits: String = rest
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || *c == ',')
                    .filter(char::is_ascii_digit)
                    .collect();
                if let Ok(value) = digits.parse() {
                    return value;
                }
            }
        }
        0
    };

    let input = grab(&["input tokens", "input_tokens", "prompt tokens", "prompt_tokens"]);
    let output = grab(&[
        "output tokens",
        "output_tokens",
        "completion tokens",
        "completion_tokens",
    ]);
    let mut total = grab(&["total tokens", "total_tokens"]);
    if total == 0 {
        total = input + output;
    }
    (input > 0 || output > 0 || total > 0).then_some(TokenUsage {
        input,
        output,
        total,
        tool_calls: None,
    })
}

/// Contract implemented by every agent adapter.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short name: codex, gemini, claude_code, copilot, cursor, fake.
    fn name(&self) -> &'static str;

    /// Produce text: the agent reads the prompt and its final message
    /// is written to `out_path`. Must not mutate files in `cwd`.
    async fn run_text(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        out_path: &Path,
        logs: &LogPaths,
        timeout: Option<u64>,
        selector: Option<&ModelSelector>,
    ) -> ExecResult;

    /// Apply changes: the agent may freely mutate files in `cwd`.
    async fn run_apply(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        logs: &LogPaths,
        timeout: Option<u64>,
        selector: Option<&ModelSelector>,
    ) -> ExecResult;

    /// Describe the invocation without executing.
    fn resolve_invocation(
        &self,
        cwd: &Path,
        prompt_path: &Path,
        logs: &LogPaths,
        out_path: Option<&Path>,
        selector: Option<&ModelSelector>,
    ) -> ResolvedInvocation;
}

/// Run a resolved invocation and classify the outcome into an
/// `ExecResult`. Shared by every CLI adapter.
pub(crate) async fn run_invocation(
    runner: &crate::command::CommandRunner,
    name: &str,
    invocation: ResolvedInvocation,
    cwd: &Path,
    logs: &LogPaths,
    timeout: Option<u64>,
) -> ExecResult {
    use crate::command::CommandError;

    let env: Vec<(String, String)> = invocation
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match runner
        .run(
            &invocation.cmd,
            cwd,
            Some(&logs.stdout),
            Some(&logs.stderr),
            timeout,
            &env,
            None,
        )
        .await
    {
        Ok(outcome) if outcome.returncode == 0 => ExecResult::ok(0, logs, Some(invocation)),
        Ok(outcome) => {
            let stderr = std::fs::read_to_string(&logs.stderr).unwrap_or_default();
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            ExecResult::error(
                outcome.returncode,
                logs,
                format!("{name} exited with {}: {tail}", outcome.returncode),
                Some(invocation),
            )
        }
        Err(CommandError::Timeout(secs, _)) => ExecResult::error(
            -1,
            logs,
            format!("timed out after {secs}s"),
            Some(invocation),
        ),
        Err(CommandError::NotFound(bin)) => ExecResult::error(
            -1,
            logs,
            format!("executor binary not found: {bin}"),
            Some(invocation),
        ),
        Err(e) => ExecResult::error(-1, logs, e.to_string(), Some(invocation)),
    }
}

/// Shared helper: merge defaults with a stage selector. A selector
/// model clears the default profile and vice versa.
pub(crate) fn resolve_model_fields(
    default_model: Option<&str>,
    default_profile: Option<&str>,
    default_effort: Option<&str>,
    selector: Option<&ModelSelector>,
) -> (Option<String>, Option<String>, Option<String>) {
    let mut model = default_model.map(ToString::to_string);
    let mut profile = default_profile.map(ToString::to_string);
    let mut effort = default_effort.map(ToString::to_string);

    if let Some(selector) = selector {
        if let Some(m) = &selector.model {
            model = Some(m.clone());
            profile = None;
        } else if let Some(p) = &selector.profile {
            profile = Some(p.clone());
            model = None;
        }
        if let Some(e) = selector.reasoning_effort {
            effort = Some(e.as_str().to_string());
        }
    }
    (model, profile, effort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn logs_with(stderr: &str) -> (TempDir, LogPaths) {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        std::fs::write(&logs.stdout, "").unwrap();
        std::fs::write(&logs.stderr, stderr).unwrap();
        (dir, logs)
    }

    fn failed_result(logs: &LogPaths) -> ExecResult {
        ExecResult::error(1, logs, "", None)
    }

    #[test]
    fn successful_result_is_never_transient() {
        let (_dir, logs) = logs_with("Error: 429 Too Many Requests");
        let result = ExecResult::ok(0, &logs, None);
        assert!(!result.is_transient_error());
        assert!(!result.is_quota_error());
    }

    #[test]
    fn rate_limit_markers_are_transient() {
        for marker in [
            "Error: 429 Too Many Requests",
            "GaxiosError: status: \"RESOURCE_EXHAUSTED\"",
            "No capacity available, reason MODEL_CAPACITY_EXHAUSTED",
            "Request timed out after 120 seconds",
            "HTTP 503: Service Unavailable",
            "Connection reset by peer",
            "the model is overloaded",
        ] {
            let (_dir, logs) = logs_with(marker);
            assert!(failed_result(&logs).is_transient_error(), "{marker}");
        }
    }

    #[test]
    fn syntax_error_is_not_transient() {
        let (_dir, logs) = logs_with("SyntaxError: invalid syntax at line 42");
        assert!(!failed_result(&logs).is_transient_error());
    }

    #[test]
    fn model_not_found_is_unavailable_not_transient() {
        let (_dir, logs) = logs_with("Error: Model not found: bogus-model");
        let result = failed_result(&logs);
        assert!(!result.is_transient_error());
        assert!(result.is_model_unavailable_error());
    }

    #[test]
    fn error_message_field_is_also_checked() {
        let (_dir, logs) = logs_with("");
        let result = ExecResult::error(1, &logs, "Rate limit exceeded, please retry", None);
        assert!(result.is_transient_error());
        assert!(result.is_quota_error());
    }

    #[test]
    fn retry_after_absent_is_none() {
        let (_dir, logs) = logs_with("some generic error occurred");
        assert_eq!(failed_result(&logs).get_retry_after_seconds(), None);
    }

    #[test]
    fn retry_after_seconds_format() {
        let (_dir, logs) = logs_with("Rate limited. Retry after 60s");
        assert_eq!(failed_result(&logs).get_retry_after_seconds(), Some(60));
    }

    #[test]
    fn wait_seconds_format() {
        let (_dir, logs) = logs_with("Please wait 30 seconds before retrying");
        assert_eq!(failed_result(&logs).get_retry_after_seconds(), Some(30));
    }

    #[test]
    fn reset_hms_format() {
        let (_dir, logs) = logs_with("Your quota will reset after 4h23m31s");
        assert_eq!(
            failed_result(&logs).get_retry_after_seconds(),
            Some(4 * 3600 + 23 * 60 + 31)
        );
    }

    #[test]
    fn token_usage_from_extra() {
        let (_dir, logs) = logs_with("");
        let mut result = ExecResult::ok(0, &logs, None);
        result.extra.insert(
            "usage".to_string(),
            serde_json::json!({"input_tokens": 100, "output_tokens": 20}),
        );
        let usage = result.get_token_usage().unwrap();
        assert_eq!(usage.input, 100);
        assert_eq!(usage.output, 20);
        assert_eq!(usage.total, 120);
    }

    #[test]
    fn token_usage_from_stdout_json_lines() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        std::fs::write(
            &logs.stdout,
            "working...\n{\"usage\": {\"prompt_tokens\": 10, \"completion_tokens\": 5}}\n",
        )
        .unwrap();
        std::fs::write(&logs.stderr, "").unwrap();

        let usage = ExecResult::ok(0, &logs, None).get_token_usage().unwrap();
        assert_eq!(usage.total, 15);
    }

    #[test]
    fn token_usage_from_labeled_text() {
        let dir = TempDir::new().unwrap();
        let logs = LogPaths::in_dir(dir.path());
        std::fs::write(&logs.stdout, "input tokens: 1,200\noutput tokens: 300\n").unwrap();
        std::fs::write(&logs.stderr, "").unwrap();

        let usage = ExecResult::ok(0, &logs, None).get_token_usage().unwrap();
        assert_eq!(usage.input, 1200);
        assert_eq!(usage.output, 300);
        assert_eq!(usage.total, 1500);
    }

    #[test]
    fn model_used_prefers_invocation() {
        let (_dir, logs) = logs_with("");
        let mut invocation = ResolvedInvocation::default();
        invocation
            .model_info
            .insert("model".to_string(), "gpt-5.2".to_string());
        let mut result = ExecResult::ok(0, &logs, Some(invocation));
        result
            .extra
            .insert("model".to_string(), serde_json::json!("other"));
        assert_eq!(result.get_model_used().as_deref(), Some("gpt-5.2"));
    }

    #[test]
    fn selector_model_clears_default_profile() {
        let selector = ModelSelector {
            model: Some("m1".to_string()),
            ..ModelSelector::default()
        };
        let (model, profile, _) =
            resolve_model_fields(None, Some("default-profile"), None, Some(&selector));
        assert_eq!(model.as_deref(), Some("m1"));
        assert!(profile.is_none());
    }

    #[test]
    fn selector_profile_clears_default_model() {
        let selector = ModelSelector {
            profile: Some("deep".to_string()),
            ..ModelSelector::default()
        };
        let (model, profile, _) =
            resolve_model_fields(Some("default-model"), None, None, Some(&selector));
        assert!(model.is_none());
        assert_eq!(profile.as_deref(), Some("deep"));
    }
}
