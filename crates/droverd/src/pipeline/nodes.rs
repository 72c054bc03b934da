//! Execution of individual pipeline nodes.
//!
//! Each node type resolves its executor and model through the router,
//! renders its prompt, runs, and reports a typed `NodeResult` that the
//! engine (or the map executor) folds into metrics and state.

use crate::executors::{ExecResult, LogPaths};
use crate::gates::{all_required_passed, Gate, GateResult};
use crate::pipeline::definition::NodeDefinition;
use crate::pipeline::engine::RunCtx;
use crate::workspace::Workspace;
use drover_core::backlog::Backlog;
use drover_core::config::ModelSelector;
use drover_core::metrics::schema::{DiffStats, FailureCategory, GateMetrics, TokenUsage};
use drover_core::prompts;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome of one node (or one map-item sub-node) execution.
#[derive(Debug, Default)]
pub struct NodeResult {
    pub success: bool,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
    pub failure_category: Option<FailureCategory>,
    /// Free-form per-node signals (review verdict, changed files).
    pub metadata: BTreeMap<String, String>,
    pub gate_results: Vec<GateMetrics>,
    pub diff_stats: Option<DiffStats>,
    pub executor: Option<String>,
    pub selector: ModelSelector,
    pub fallback_applied: bool,
    pub original_model: Option<String>,
    pub agent_invocations: u32,
    pub llm_duration_ms: Option<u64>,
    pub verify_duration_ms: Option<u64>,
    pub tokens: Option<TokenUsage>,
}

impl NodeResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            agent_invocations: 0,
            ..Self::default()
        }
    }

    pub fn fail(category: FailureCategory, error: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_category: Some(category),
            error: Some(error.into()),
            agent_invocations: 0,
            ..Self::default()
        }
    }
}

/// Render the node template with the given context and write the
/// prompt file for this attempt.
fn render_prompt(
    ctx: &RunCtx,
    node: &NodeDefinition,
    stage: &str,
    attempt: u32,
    context: &BTreeMap<String, String>,
) -> Result<std::path::PathBuf, NodeResult> {
    // Fix attempts always use the fix template so the accumulated
    // failure evidence reaches the agent.
    let template = if stage == "fix" {
        "fix"
    } else {
        node.config.template.as_deref().unwrap_or(stage)
    };
    let mut vars = context.clone();
    vars.insert("run_id".to_string(), ctx.paths.run_id.to_string());

    let text = prompts::render(template, &vars)
        .map_err(|e| NodeResult::fail(FailureCategory::ConfigError, e.to_string()))?;

    let prompt_path = if attempt <= 1 {
        ctx.paths.prompt_path(stage)
    } else {
        ctx.paths.prompt_attempt_path(stage, attempt)
    };
    drover_core::paths::write_atomic(&prompt_path, text.as_bytes())
        .map_err(|e| NodeResult::fail(FailureCategory::Unknown, e.to_string()))?;
    Ok(prompt_path)
}

/// What an LLM invocation should do with the workspace.
pub enum LlmMode<'a> {
    /// Read-only; final message written to the given file.
    Text { out_path: &'a Path },
    /// Free mutation of `cwd`.
    Apply,
}

/// Result of an LLM invocation, including any fallback switches.
#[derive(Debug)]
pub struct LlmInvocation {
    pub result: ExecResult,
    pub executor_name: String,
    pub selector: ModelSelector,
    pub fallback_applied: bool,
    pub original_model: Option<String>,
    pub invocations: u32,
    pub llm_duration_ms: u64,
}

/// Invoke the stage's executor, applying fallback rules on transient
/// or model-unavailable failures, bounded by the matching rule's
/// retry budget.
pub async fn invoke_llm(
    ctx: &RunCtx,
    stage: &str,
    item_id: Option<&str>,
    cwd: &Path,
    prompt_path: &Path,
    mode: LlmMode<'_>,
) -> LlmInvocation {
    let (executor, initial_selector) = ctx.router.for_stage(stage);
    let engine = ctx.router.executor_type_for_stage(stage);
    let budget = ctx.router.fallback_budget(engine);
    let timeout = Some(ctx.router.timeout_for(stage));

    let mut selector = initial_selector.clone();
    let mut fallback_applied = false;
    let mut invocations = 0u32;
    let mut llm_duration_ms = 0u64;
    // Keep per-item invocations in distinct log directories so
    // concurrent map workers never share a log file.
    let log_label = item_id.map_or_else(|| stage.to_string(), |item| format!("{stage}.{item}"));

    loop {
        invocations += 1;
        let log_dir = crate::executors::router::ModelRouter::attempts_dir(
            &ctx.paths,
            &log_label,
            invocations,
        );
        let logs = LogPaths::in_dir(&log_dir);

        let started = std::time::Instant::now();
        let result = match &mode {
            LlmMode::Text { out_path } => {
                executor
                    .run_text(cwd, prompt_path, out_path, &logs, timeout, Some(&selector))
                    .await
            }
            LlmMode::Apply => {
                executor
                    .run_apply(cwd, prompt_path, &logs, timeout, Some(&selector))
                    .await
            }
        };
        llm_duration_ms += started.elapsed().as_millis() as u64;

        if let Some(invocation) = &result.invocation {
            ctx.router
                .record_attempt(stage, item_id, invocation, Some(&result), fallback_applied);
        }

        let retryable =
            result.failed() && (result.is_transient_error() || result.is_model_unavailable_error());
        if retryable && invocations <= budget {
            let (next, applied) = ctx.router.apply_fallback(stage, &result, &selector);
            if applied {
                if let Some(wait) = result.get_retry_after_seconds() {
                    let capped = wait.min(30);
                    info!(stage, wait_seconds = capped, "honoring retry-after hint");
                    tokio::time::sleep(std::time::Duration::from_secs(capped)).await;
                }
                warn!(stage, attempt = invocations, "retrying with fallback selector");
                selector = next;
                fallback_applied = true;
                continue;
            }
        }

        return LlmInvocation {
            original_model: if fallback_applied {
                initial_selector.model.clone()
            } else {
                None
            },
            result,
            executor_name: executor.name().to_string(),
            selector,
            fallback_applied,
            invocations,
            llm_duration_ms,
        };
    }
}

fn fill_llm_fields(result: &mut NodeResult, invocation: &LlmInvocation) {
    result.executor = Some(invocation.executor_name.clone());
    result.selector = invocation.selector.clone();
    result.fallback_applied = invocation.fallback_applied;
    result.original_model = invocation.original_model.clone();
    result.agent_invocations = invocation.invocations;
    result.llm_duration_ms = Some(invocation.llm_duration_ms);
    result.tokens = invocation.result.get_token_usage();
}

/// Classify a failed LLM result into a node failure.
fn classify_llm_failure(result: &ExecResult) -> FailureCategory {
    if result.error_message.contains("timed out") {
        FailureCategory::Timeout
    } else if result.is_transient_error() {
        FailureCategory::TransientError
    } else if result.is_model_unavailable_error() {
        FailureCategory::ModelUnavailable
    } else {
        FailureCategory::ExecutorError
    }
}

/// `llm_text`: render, invoke in text mode, store output under the
/// node's first output key. Backlog output is parse-validated.
pub async fn run_llm_text(
    ctx: &RunCtx,
    node: &NodeDefinition,
    stage: &str,
    context: &BTreeMap<String, String>,
    cwd: &Path,
) -> NodeResult {
    let prompt_path = match render_prompt(ctx, node, stage, 1, context) {
        Ok(path) => path,
        Err(result) => return result,
    };

    let Some(output_key) = node.outputs.first() else {
        return NodeResult::fail(
            FailureCategory::ConfigError,
            format!("llm_text node '{}' declares no outputs", node.id),
        );
    };

    let out_path = ctx
        .paths
        .artifacts_dir()
        .join(format!("{output_key}.out.txt"));

    let invocation = invoke_llm(
        ctx,
        stage,
        None,
        cwd,
        &prompt_path,
        LlmMode::Text { out_path: &out_path },
    )
    .await;

    let mut result = NodeResult::ok();
    fill_llm_fields(&mut result, &invocation);

    if invocation.result.failed() {
        result.success = false;
        result.failure_category = Some(classify_llm_failure(&invocation.result));
        result.error = Some(invocation.result.error_message.clone());
        return result;
    }

    let content = match std::fs::read_to_string(&out_path) {
        Ok(content) => content,
        Err(e) => {
            return NodeResult::fail(
                FailureCategory::ExecutorError,
                format!("executor produced no output file: {e}"),
            )
        }
    };

    // Structured outputs get validated up front so a malformed backlog
    // fails the decompose node, not the map node later.
    if output_key == "backlog" {
        match Backlog::from_yaml(&content) {
            Ok(mut backlog) => {
                backlog.run_id = ctx.paths.run_id.to_string();
                match backlog.to_yaml() {
                    Ok(normalized) => {
                        result.outputs.insert(output_key.clone(), normalized);
                    }
                    Err(e) => {
                        result.success = false;
                        result.failure_category = Some(FailureCategory::ParseError);
                        result.error = Some(e.to_string());
                        return result;
                    }
                }
            }
            Err(e) => {
                result.success = false;
                result.failure_category = Some(FailureCategory::ParseError);
                result.error = Some(format!("backlog parse failed: {e}"));
                return result;
            }
        }
    } else {
        result.outputs.insert(output_key.clone(), content.clone());
    }

    if stage == "review" {
        let verdict = parse_review_verdict(&content);
        result
            .metadata
            .insert("verdict".to_string(), verdict.to_string());
    }

    debug!(node = %node.id, output = %output_key, "llm_text node complete");
    result
}

/// Extract the `verdict:` line from a review document.
pub fn parse_review_verdict(review: &str) -> &'static str {
    for line in review.lines().rev() {
        let line = line.trim().to_lowercase();
        if let Some(value) = line.strip_prefix("verdict:") {
            return match value.trim() {
                "changes_requested" => "changes_requested",
                _ => "approved",
            };
        }
    }
    "approved"
}

/// `llm_apply`: render, invoke in apply mode against the workspace,
/// capture the diff, enforce guardrails. The caller must hold the
/// workspace lock.
pub async fn run_llm_apply(
    ctx: &RunCtx,
    node: &NodeDefinition,
    stage: &str,
    attempt: u32,
    item_id: Option<&str>,
    context: &BTreeMap<String, String>,
    workspace: &mut Workspace,
) -> NodeResult {
    let prompt_path = match render_prompt(ctx, node, stage, attempt, context) {
        Ok(path) => path,
        Err(result) => return result,
    };

    let cwd = workspace.worktree_path().to_path_buf();
    let invocation =
        invoke_llm(ctx, stage, item_id, &cwd, &prompt_path, LlmMode::Apply).await;

    let mut result = NodeResult::ok();
    fill_llm_fields(&mut result, &invocation);

    if invocation.result.failed() {
        result.success = false;
        result.failure_category = Some(classify_llm_failure(&invocation.result));
        result.error = Some(invocation.result.error_message.clone());
        return result;
    }

    // Capture the accumulated diff, excluding artifact names that must
    // never live in the worktree.
    let exclude = ctx.config.guardrails.forbidden_new_files.clone();
    if let Err(e) = workspace.diff_to(&ctx.paths.patch_diff(), &exclude).await {
        result.success = false;
        result.failure_category = Some(FailureCategory::WorkspaceError);
        result.error = Some(e.to_string());
        return result;
    }

    let empty = match workspace.diff_empty().await {
        Ok(empty) => empty,
        Err(e) => {
            result.success = false;
            result.failure_category = Some(FailureCategory::WorkspaceError);
            result.error = Some(e.to_string());
            return result;
        }
    };
    if empty {
        result.success = false;
        result.failure_category = Some(FailureCategory::EmptyDiff);
        result.error = Some("no changes produced".to_string());
        return result;
    }

    let diff = std::fs::read_to_string(ctx.paths.patch_diff()).unwrap_or_default();
    result.diff_stats = Some(DiffStats::from_diff(&diff));

    let changed = match workspace.get_changed_files().await {
        Ok(files) => files,
        Err(e) => {
            result.success = false;
            result.failure_category = Some(FailureCategory::WorkspaceError);
            result.error = Some(e.to_string());
            return result;
        }
    };
    result
        .metadata
        .insert("changed_files".to_string(), changed.join("\n"));

    if let Err(e) = ctx.guardrails.check_files(&changed) {
        result.success = false;
        result.failure_category = Some(FailureCategory::GuardrailViolation);
        result.error = Some(e.to_string());
        return result;
    }
    if let Err(e) = ctx
        .guardrails
        .check_new_files(&changed, workspace.worktree_path())
    {
        result.success = false;
        result.failure_category = Some(FailureCategory::GuardrailViolation);
        result.error = Some(e.to_string());
        return result;
    }

    result.outputs.insert("patch_diff".to_string(), diff);
    debug!(node = %node.id, "llm_apply node complete");
    result
}

/// `gate`: run the configured subset (or all enabled gates); failure
/// iff a required gate fails.
pub async fn run_gate_node(
    ctx: &RunCtx,
    node: &NodeDefinition,
    cwd: &Path,
    item_id: Option<&str>,
    attempt: u32,
    extra_pytest_args: &[String],
) -> NodeResult {
    let selected: Vec<Gate> = if node.config.gates.is_empty() {
        ctx.gates.to_vec()
    } else {
        ctx.gates
            .iter()
            .filter(|g| node.config.gates.contains(&g.name))
            .cloned()
            .collect()
    };

    let started = std::time::Instant::now();
    let item_label = item_id.unwrap_or("run");
    let results: Vec<GateResult> = run_gates_with_fast_args(
        ctx,
        &selected,
        cwd,
        item_label,
        attempt,
        extra_pytest_args,
    )
    .await;
    let verify_duration_ms = started.elapsed().as_millis() as u64;

    let mut node_result = NodeResult::ok();
    node_result.agent_invocations = 0;
    node_result.verify_duration_ms = Some(verify_duration_ms);
    node_result.gate_results = results.iter().map(GateResult::to_metrics).collect();

    if !all_required_passed(&results, &selected) {
        let failed: Vec<&GateResult> = results.iter().filter(|r| !r.ok).collect();
        let first = failed.first();
        node_result.success = false;
        node_result.failure_category = Some(FailureCategory::GateFailure);
        node_result.error = Some(
            first.map_or_else(
                || "gate failure".to_string(),
                |r| format!("gate {} failed", r.name),
            ),
        );
        if let Some(first) = first {
            node_result
                .metadata
                .insert("failed_gate".to_string(), first.name.clone());
            node_result
                .metadata
                .insert("gate_log_tail".to_string(), first.log_tail(30));
        }
    }
    node_result
}

async fn run_gates_with_fast_args(
    ctx: &RunCtx,
    gates: &[Gate],
    cwd: &Path,
    item_label: &str,
    attempt: u32,
    extra_pytest_args: &[String],
) -> Vec<GateResult> {
    use drover_core::config::VerifyMode;

    let per_item = item_label != "run";
    let fast = ctx.config.run.per_item_verify == VerifyMode::Fast;
    let skip_untargeted = ctx.config.run.fast_verify_skip_if_no_targets;

    let mut results = Vec::with_capacity(gates.len());
    for gate in gates {
        let is_test_gate = gate.command.contains("pytest") || gate.name == "pytest";
        // Fast per-item verify with no targets derived from the item:
        // skip the test gate entirely when configured to.
        if is_test_gate && per_item && fast && skip_untargeted && extra_pytest_args.is_empty() {
            debug!(gate = %gate.name, item = item_label, "fast verify: no targets, skipping");
            continue;
        }
        let log_path = ctx.paths.gate_log(&gate.name, item_label, attempt);
        let extra: &[String] = if is_test_gate { extra_pytest_args } else { &[] };
        let result = crate::gates::run_gate(
            &ctx.cmd,
            gate,
            cwd,
            &log_path,
            Some(ctx.router.timeout_for("verify")),
            extra,
        )
        .await;
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_verdict_parsing() {
        assert_eq!(
            parse_review_verdict("all good\nverdict: approved\n"),
            "approved"
        );
        assert_eq!(
            parse_review_verdict("problems\nverdict: changes_requested"),
            "changes_requested"
        );
        assert_eq!(
            parse_review_verdict("Verdict: CHANGES_REQUESTED".to_lowercase().as_str()),
            "changes_requested"
        );
        // Missing verdict defaults to approved.
        assert_eq!(parse_review_verdict("looks fine"), "approved");
    }

    #[test]
    fn node_result_constructors() {
        let ok = NodeResult::ok();
        assert!(ok.success);
        let fail = NodeResult::fail(FailureCategory::EmptyDiff, "no changes");
        assert!(!fail.success);
        assert_eq!(fail.failure_category, Some(FailureCategory::EmptyDiff));
    }
}
