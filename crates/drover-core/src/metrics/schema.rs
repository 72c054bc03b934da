//! Metric record schemas: one JSONL line per stage attempt, one
//! aggregate document per run.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Outcome of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    #[default]
    Success,
    Fail,
    Cancel,
    Timeout,
    Skip,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
            Self::Timeout => "timeout",
            Self::Skip => "skip",
        }
    }
}

/// Why a stage attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    ConfigError,
    StateError,
    WorkspaceError,
    ExecutorError,
    TransientError,
    ModelUnavailable,
    GateFailure,
    GuardrailViolation,
    EmptyDiff,
    ParseError,
    Timeout,
    MaxAttempts,
    Cancelled,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigError => "config_error",
            Self::StateError => "state_error",
            Self::WorkspaceError => "workspace_error",
            Self::ExecutorError => "executor_error",
            Self::TransientError => "transient_error",
            Self::ModelUnavailable => "model_unavailable",
            Self::GateFailure => "gate_failure",
            Self::GuardrailViolation => "guardrail_violation",
            Self::EmptyDiff => "empty_diff",
            Self::ParseError => "parse_error",
            Self::Timeout => "timeout",
            Self::MaxAttempts => "max_attempts",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Rough classification of a failure message when the caller has
    /// nothing more precise.
    pub fn categorize(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("guardrail") || lower.contains("forbidden") {
            Self::GuardrailViolation
        } else if lower.contains("gate") || lower.contains("ruff") || lower.contains("pytest") {
            Self::GateFailure
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("empty") && lower.contains("diff") {
            Self::EmptyDiff
        } else if lower.contains("parse") || lower.contains("yaml") || lower.contains("invalid") {
            Self::ParseError
        } else if lower.contains("cancel") {
            Self::Cancelled
        } else if lower.contains("executor") || lower.contains("failed") {
            Self::ExecutorError
        } else {
            Self::Unknown
        }
    }
}

/// Result of one gate execution, as recorded on a stage record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateMetrics {
    pub name: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_failed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests_total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_output: Option<String>,
}

/// Statistics parsed from a unified diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub files_list: Vec<String>,
}

impl DiffStats {
    /// Parse file counts and added/removed lines out of `git diff`
    /// patch output. Additive over concatenation of diffs with
    /// disjoint file sets.
    pub fn from_diff(diff: &str) -> Self {
        if diff.trim().is_empty() {
            return Self::default();
        }

        let mut lines_added = 0;
        let mut lines_removed = 0;
        let mut files: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

        for line in diff.lines() {
            if line.starts_with("+++") || line.starts_with("---") {
                if let Some(raw) = line.split_whitespace().nth(1) {
                    let path = raw
                        .strip_prefix("a/")
                        .or_else(|| raw.strip_prefix("b/"))
                        .unwrap_or(raw);
                    if path != "/dev/null" {
                        files.insert(path.to_string());
                    }
                }
            } else if line.starts_with('+') {
                lines_added += 1;
            } else if line.starts_with('-') {
                lines_removed += 1;
            }
        }

        Self {
            files_changed: files.len(),
            lines_added,
            lines_removed,
            files_list: files.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<u64>,
}

/// Sparse quality indicators attached to some stage records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_acceptance_criteria: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_file_shortlist: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_within_limits: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gates_passed_first_attempt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack_files_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack_signal_ratio: Option<f64>,
}

/// One line of `stages.jsonl`: a single stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetrics {
    pub run_id: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub attempt: u32,
    pub start_ts: String,
    pub end_ts: String,
    pub duration_ms: u64,
    pub status: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_stats: Option<DiffStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityMetrics>,
    pub agent_invocations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_applied: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<serde_json::Value>,
}

impl StageMetrics {
    pub fn new(run_id: &str, stage: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            item_id: None,
            attempt: 1,
            start_ts: String::new(),
            end_ts: String::new(),
            duration_ms: 0,
            status: StageOutcome::Success,
            failure_category: None,
            failure_message: None,
            executor: None,
            model: None,
            profile: None,
            reasoning_effort: None,
            inputs_fingerprint: None,
            outputs_fingerprint: None,
            artifacts: BTreeMap::new(),
            diff_stats: None,
            gates: Vec::new(),
            quality: None,
            agent_invocations: 1,
            llm_duration_ms: None,
            verify_duration_ms: None,
            tokens: None,
            fallback_applied: None,
            original_model: None,
            error_info: None,
        }
    }
}

/// Aggregate document written once at run completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_fingerprint: Option<String>,
    pub start_ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    pub final_status: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub stages_executed: usize,
    pub stages_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_green_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_pr_ms: Option<u64>,
    pub total_stage_time_ms: u64,
    pub total_llm_time_ms: u64,
    pub total_verify_time_ms: u64,
    pub fix_attempts_total: u32,
    pub items_total: usize,
    pub items_completed: usize,
    pub items_failed: usize,
    pub rework_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_diff_stats: Option<DiffStats>,
    #[serde(default)]
    pub stage_breakdown: BTreeMap<String, u64>,
}

/// SHA-256 fingerprint over the concatenation of the given parts,
/// truncated to 16 hex chars. Opaque equality token; never inverted.
pub fn compute_fingerprint<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        // Known prefix of sha256("hello world").
        assert_eq!(compute_fingerprint(["hello world"]), "b94d27b9934d3e08");
        assert_eq!(
            compute_fingerprint(["hello", " ", "world"]),
            "b94d27b9934d3e08"
        );
        assert_ne!(compute_fingerprint(["hello"]), compute_fingerprint(["world"]));
    }

    #[test]
    fn diff_stats_parses_patch() {
        let diff = "\
diff --git a/src/app.py b/src/app.py
--- a/src/app.py
+++ b/src/app.py
@@ -1,2 +1,3 @@
-def add(a, b): return a - b
+def add(a, b):
+    return a + b
";
        let stats = DiffStats::from_diff(diff);
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.lines_added, 2);
        assert_eq!(stats.lines_removed, 1);
        assert_eq!(stats.files_list, vec!["src/app.py"]);
    }

    #[test]
    fn diff_stats_empty_for_blank_input() {
        assert_eq!(DiffStats::from_diff("  \n "), DiffStats::default());
    }

    #[test]
    fn diff_stats_new_file_skips_dev_null() {
        let diff = "\
--- /dev/null
+++ b/new.txt
@@ -0,0 +1 @@
+hello
";
        let stats = DiffStats::from_diff(diff);
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.files_list, vec!["new.txt"]);
    }

    #[test]
    fn diff_stats_additive_over_disjoint_files() {
        let a = "--- a/one.rs\n+++ b/one.rs\n@@\n+x\n-y\n";
        let b = "--- a/two.rs\n+++ b/two.rs\n@@\n+p\n+q\n";
        let combined = format!("{a}{b}");

        let sa = DiffStats::from_diff(a);
        let sb = DiffStats::from_diff(b);
        let sc = DiffStats::from_diff(&combined);

        assert_eq!(sc.files_changed, sa.files_changed + sb.files_changed);
        assert_eq!(sc.lines_added, sa.lines_added + sb.lines_added);
        assert_eq!(sc.lines_removed, sa.lines_removed + sb.lines_removed);
    }

    #[test]
    fn stage_metrics_jsonl_round_trip() {
        let mut record = StageMetrics::new("run_1", "implement");
        record.item_id = Some("W001".to_string());
        record.attempt = 2;
        record.status = StageOutcome::Fail;
        record.failure_category = Some(FailureCategory::GateFailure);
        record.gates.push(GateMetrics {
            name: "pytest".to_string(),
            exit_code: 1,
            duration_ms: 900,
            passed: false,
            tests_failed: Some(2),
            tests_total: Some(10),
            error_output: None,
        });

        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let parsed: StageMetrics = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.stage, "implement");
        assert_eq!(parsed.item_id.as_deref(), Some("W001"));
        assert_eq!(parsed.gates.len(), 1);
        assert_eq!(parsed.failure_category, Some(FailureCategory::GateFailure));
    }

    #[test]
    fn optional_fields_are_omitted() {
        let record = StageMetrics::new("run_1", "plan");
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains("item_id"));
        assert!(!line.contains("failure_category"));
        assert!(!line.contains("gates"));
        assert!(!line.contains("fallback_applied"));
    }

    #[test]
    fn categorize_failure_messages() {
        assert_eq!(
            FailureCategory::categorize("Gate pytest failed"),
            FailureCategory::GateFailure
        );
        assert_eq!(
            FailureCategory::categorize("guardrail: forbidden files modified"),
            FailureCategory::GuardrailViolation
        );
        assert_eq!(
            FailureCategory::categorize("timed out after 600s"),
            FailureCategory::Timeout
        );
        assert_eq!(
            FailureCategory::categorize("empty diff produced"),
            FailureCategory::EmptyDiff
        );
        assert_eq!(
            FailureCategory::categorize("yaml parse error"),
            FailureCategory::ParseError
        );
        assert_eq!(
            FailureCategory::categorize("something odd"),
            FailureCategory::Unknown
        );
    }
}
