//! Post-run knowledge update: fold durable lessons from a run into
//! the repository's knowledge files (AGENTS.md, ARCHITECTURE.md).
//!
//! Edits are restricted to the configured allowlist, must keep the
//! marker pairs intact, and are bounded by line limits. A violation
//! rolls the knowledge edits back and reports it; it never fails the
//! run that produced the code change.

use crate::pipeline::engine::RunCtx;
use crate::pipeline::nodes::{invoke_llm, LlmMode, NodeResult};
use drover_core::config::{KnowledgeConfig, KnowledgeMode};
use drover_core::metrics::schema::{DiffStats, FailureCategory};
use drover_core::prompts;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Why a knowledge patch was rejected.
#[derive(Debug, PartialEq, Eq)]
enum Rejection {
    FileOutsideAllowlist(String),
    MarkersDamaged(String),
    TooManyLines { changed: usize, limit: usize },
    FileTooLarge { file: String, changed: usize, limit: usize },
    TooManyDeletions { deleted: usize, limit: usize },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FileOutsideAllowlist(file) => {
                write!(f, "file outside knowledge allowlist: {file}")
            }
            Self::MarkersDamaged(file) => write!(f, "markers removed or damaged in {file}"),
            Self::TooManyLines { changed, limit } => {
                write!(f, "total changed lines {changed} exceeds limit {limit}")
            }
            Self::FileTooLarge { file, changed, limit } => {
                write!(f, "{file}: changed lines {changed} exceeds per-file limit {limit}")
            }
            Self::TooManyDeletions { deleted, limit } => {
                write!(f, "deleted lines {deleted} exceeds limit {limit}")
            }
        }
    }
}

/// Validate a knowledge diff against allowlist, markers, and limits.
fn validate_patch(
    config: &KnowledgeConfig,
    stats: &DiffStats,
    worktree: &Path,
) -> Option<Rejection> {
    for file in &stats.files_list {
        if !config.allowlist.iter().any(|allowed| allowed == file) {
            return Some(Rejection::FileOutsideAllowlist(file.clone()));
        }
    }

    let changed = stats.lines_added + stats.lines_removed;
    if changed > config.limits.max_total_changed_lines {
        return Some(Rejection::TooManyLines {
            changed,
            limit: config.limits.max_total_changed_lines,
        });
    }
    if stats.lines_removed > config.limits.max_deleted_lines {
        return Some(Rejection::TooManyDeletions {
            deleted: stats.lines_removed,
            limit: config.limits.max_deleted_lines,
        });
    }
    // Per-file bound approximated by the total when only one file
    // changed; exact attribution would need per-file hunks.
    if stats.files_changed == 1 && changed > config.limits.max_changed_lines_per_file {
        if let Some(file) = stats.files_list.first() {
            return Some(Rejection::FileTooLarge {
                file: file.clone(),
                changed,
                limit: config.limits.max_changed_lines_per_file,
            });
        }
    }

    // Marker pairs must survive the edit in any touched file that had
    // them before.
    for file in &stats.files_list {
        let path = worktree.join(file);
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let pairs = [
            (&config.markers.agents_start, &config.markers.agents_end),
            (&config.markers.arch_start, &config.markers.arch_end),
        ];
        for (start, end) in pairs {
            let has_start = content.contains(start.as_str());
            let has_end = content.contains(end.as_str());
            if has_start != has_end {
                return Some(Rejection::MarkersDamaged(file.clone()));
            }
        }
    }

    if config.architecture_gatekeeping
        && stats.files_list.iter().any(|f| f == "ARCHITECTURE.md")
        && stats.lines_removed > 0
    {
        return Some(Rejection::TooManyDeletions {
            deleted: stats.lines_removed,
            limit: 0,
        });
    }

    None
}

/// Run the knowledge-update stage. Always succeeds from the run's
/// point of view; the report records whether the patch was applied,
/// suggested, or rejected.
pub async fn run_knowledge_update(
    ctx: &RunCtx,
    context: &BTreeMap<String, String>,
) -> NodeResult {
    let config = ctx.config.knowledge.clone();
    if !config.enabled || config.mode == KnowledgeMode::Off {
        info!("knowledge update disabled");
        let mut result = NodeResult::ok();
        result
            .outputs
            .insert("knowledge_update_report".to_string(), "disabled\n".to_string());
        return result;
    }

    let mut vars = context.clone();
    vars.insert("allowlist".to_string(), config.allowlist.join(", "));
    let prompt = match prompts::render("knowledge_update", &vars) {
        Ok(prompt) => prompt,
        Err(e) => return NodeResult::fail(FailureCategory::ConfigError, e.to_string()),
    };
    let prompt_path = ctx.paths.prompt_path("knowledge_update");
    if let Err(e) = drover_core::paths::write_atomic(&prompt_path, prompt.as_bytes()) {
        return NodeResult::fail(FailureCategory::Unknown, e.to_string());
    }

    let mut workspace = ctx.workspace.lock().await;
    let cwd = workspace.worktree_path().to_path_buf();
    // Knowledge edits start from a committed tree, so the captured
    // diff below contains only what the knowledge agent touched.
    let invocation = invoke_llm(
        ctx,
        "knowledge_update",
        None,
        &cwd,
        &prompt_path,
        LlmMode::Apply,
    )
    .await;

    let mut result = NodeResult::ok();
    result.executor = Some(invocation.executor_name.clone());
    result.selector = invocation.selector.clone();
    result.agent_invocations = invocation.invocations;
    result.llm_duration_ms = Some(invocation.llm_duration_ms);

    if invocation.result.failed() {
        // A failed knowledge agent never fails the run.
        warn!(error = %invocation.result.error_message, "knowledge agent failed, skipping update");
        result.outputs.insert(
            "knowledge_update_report".to_string(),
            format!("skipped: {}\n", invocation.result.error_message),
        );
        return result;
    }

    let patch_path = ctx.paths.knowledge_patch_diff();
    if let Err(e) = workspace.diff_to(&patch_path, &[]).await {
        return NodeResult::fail(FailureCategory::WorkspaceError, e.to_string());
    }
    let patch = std::fs::read_to_string(&patch_path).unwrap_or_default();
    let stats = DiffStats::from_diff(&patch);

    let report = if patch.trim().is_empty() {
        "no knowledge changes proposed\n".to_string()
    } else if let Some(rejection) = validate_patch(&config, &stats, &cwd) {
        warn!(rejection = %rejection, "knowledge patch rejected");
        // Discard only the uncommitted knowledge edits; the shipped
        // commit stays untouched.
        if let Err(e) = workspace.reset(Some("HEAD")).await {
            warn!(error = %e, "failed to roll back rejected knowledge patch");
        }
        format!("rejected: {rejection}\npatch retained at {}\n", patch_path.display())
    } else {
        match config.mode {
            KnowledgeMode::Auto => {
                format!(
                    "applied: {} files, +{} -{} lines\n",
                    stats.files_changed, stats.lines_added, stats.lines_removed
                )
            }
            KnowledgeMode::Suggest => {
                // Suggest mode keeps the patch artifact but leaves the
                // tree untouched.
                if let Err(e) = workspace.reset(Some("HEAD")).await {
                    warn!(error = %e, "failed to revert suggested knowledge patch");
                }
                format!(
                    "suggested: {} files, +{} -{} lines (patch at {})\n",
                    stats.files_changed,
                    stats.lines_added,
                    stats.lines_removed,
                    patch_path.display()
                )
            }
            KnowledgeMode::Off => unreachable!("off handled above"),
        }
    };
    drop(workspace);

    result
        .outputs
        .insert("knowledge_update_report".to_string(), report);
    result
}
