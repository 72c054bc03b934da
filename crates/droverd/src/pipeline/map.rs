//! Work-item map executor: iterates the backlog, running the item
//! sub-pipeline (implement, verify) with a bounded fix-retry loop per
//! item.
//!
//! With `concurrency > 1` items are dispatched to a worker pool.
//! Dependency order is enforced at dispatch time and the workspace is
//! the one shared mutable resource: apply, diff, guardrail, and gates
//! run as a critical section behind the workspace lock. Concurrency
//! beyond one therefore only pays off when gate time dominates agent
//! time.

use crate::pipeline::definition::{NodeDefinition, NodeType};
use crate::pipeline::engine::RunCtx;
use crate::pipeline::nodes::{self, NodeResult};
use drover_core::backlog::{Backlog, WorkItem, WorkItemStatus};
use drover_core::metrics::schema::FailureCategory;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct ItemOutcome {
    item_id: String,
    success: bool,
    attempts: u32,
    error: Option<String>,
}

/// Shared mutable state of one map execution.
struct MapShared {
    backlog: Mutex<Backlog>,
    /// Wakes idle workers when an item settles.
    progress: tokio::sync::Notify,
    /// Set when stop_on_first_failure trips or guardrails abort.
    abort: tokio_util::sync::CancellationToken,
    outcomes: Mutex<Vec<ItemOutcome>>,
}

impl MapShared {
    fn persist_backlog(&self, ctx: &RunCtx, backlog: &Backlog) {
        if let Err(e) = backlog.save(&ctx.paths.backlog_yaml()) {
            warn!(error = %e, "failed to persist backlog");
        }
    }
}

/// Run a map node over the backlog. Returns the updated backlog and
/// the aggregated node result carrying the implementation report.
pub async fn run_map(
    ctx: &RunCtx,
    node: &NodeDefinition,
    base_context: &BTreeMap<String, String>,
    backlog: Backlog,
) -> (Backlog, NodeResult) {
    let Some(apply_node) = node
        .config
        .item_pipeline
        .iter()
        .find(|n| n.node_type == NodeType::LlmApply)
        .cloned()
    else {
        return (
            backlog,
            NodeResult::fail(
                FailureCategory::ConfigError,
                "map node has no llm_apply step in its item pipeline",
            ),
        );
    };
    let gate_node = node
        .config
        .item_pipeline
        .iter()
        .find(|n| n.node_type == NodeType::Gate)
        .cloned();

    let todo = backlog.todo_count();
    let concurrency = node
        .config
        .concurrency
        .unwrap_or(ctx.config.run.parallel_items)
        .max(1)
        .min(todo.max(1));

    info!(
        items = backlog.items.len(),
        todo, concurrency, "starting work-item loop"
    );

    let shared = Arc::new(MapShared {
        backlog: Mutex::new(backlog),
        progress: tokio::sync::Notify::new(),
        abort: tokio_util::sync::CancellationToken::new(),
        outcomes: Mutex::new(Vec::new()),
    });

    if concurrency == 1 {
        run_worker(ctx, &shared, &apply_node, gate_node.as_ref(), base_context).await;
    } else {
        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let ctx = ctx.clone();
            let shared = Arc::clone(&shared);
            let apply_node = apply_node.clone();
            let gate_node = gate_node.clone();
            let base_context = base_context.clone();
            handles.push(tokio::spawn(async move {
                run_worker(&ctx, &shared, &apply_node, gate_node.as_ref(), &base_context)
                    .await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    let shared = match Arc::try_unwrap(shared) {
        Ok(shared) => shared,
        Err(_) => {
            return (
                Backlog::new(ctx.paths.run_id.to_string()),
                NodeResult::fail(FailureCategory::Unknown, "map workers leaked"),
            )
        }
    };
    let backlog = shared.backlog.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    let outcomes = shared
        .outcomes
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    {
        let mut collector = ctx.collector.lock().expect("collector lock");
        collector.set_items_count(
            backlog.items.len(),
            backlog.done_count(),
            backlog.failed_count(),
        );
    }

    let report = build_report(&outcomes, &backlog);
    let failed = backlog.failed_count();

    let mut result = if ctx.cancel.is_cancelled() {
        NodeResult::fail(FailureCategory::Cancelled, "run cancelled")
    } else if failed > 0 {
        NodeResult::fail(FailureCategory::MaxAttempts, format!("{failed} items failed"))
    } else {
        NodeResult::ok()
    };
    result
        .outputs
        .insert("implementation_report".to_string(), report);
    (backlog, result)
}

/// Pull ready items until the queue drains or an abort trips.
async fn run_worker(
    ctx: &RunCtx,
    shared: &MapShared,
    apply_node: &NodeDefinition,
    gate_node: Option<&NodeDefinition>,
    base_context: &BTreeMap<String, String>,
) {
    loop {
        if ctx.cancel.is_cancelled() || shared.abort.is_cancelled() {
            return;
        }

        // Claim a ready item: todo with every dependency done.
        let claimed: Option<WorkItem> = {
            let mut backlog = shared.backlog.lock().expect("backlog lock");
            let next_id = backlog.get_next_todo().map(|i| i.id.clone());
            match next_id {
                Some(id) => {
                    let item = backlog.get_item_mut(&id).expect("claimed item exists");
                    item.mark_in_progress();
                    let snapshot = item.clone();
                    shared.persist_backlog(ctx, &backlog);
                    Some(snapshot)
                }
                None => None,
            }
        };

        match claimed {
            Some(item) => {
                process_item(ctx, shared, apply_node, gate_node, base_context, item).await;
                shared.progress.notify_waiters();
            }
            None => {
                // Nothing ready. If something is still in flight a
                // dependency may yet unblock; otherwise we are done.
                let in_flight = {
                    let backlog = shared.backlog.lock().expect("backlog lock");
                    backlog
                        .items
                        .iter()
                        .any(|i| i.status == WorkItemStatus::InProgress)
                };
                if !in_flight {
                    return;
                }
                tokio::select! {
                    () = shared.progress.notified() => {}
                    () = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                    () = ctx.cancel.cancelled() => return,
                    () = shared.abort.cancelled() => return,
                }
            }
        }
    }
}

/// Implement/fix retry loop for one item.
async fn process_item(
    ctx: &RunCtx,
    shared: &MapShared,
    apply_node: &NodeDefinition,
    gate_node: Option<&NodeDefinition>,
    base_context: &BTreeMap<String, String>,
    mut item: WorkItem,
) {
    info!(item_id = %item.id, title = %item.title, "processing work item");

    {
        let mut state = ctx.state.lock().expect("state lock");
        let _ = state.set_current_item(&item.id);
    }

    let max_attempts = ctx.config.run.max_fix_attempts;
    // An item interrupted by a crash resumes with its attempt counter
    // and the persisted failure evidence intact.
    let mut evidence: BTreeMap<String, String> = if item.attempts > 0 {
        let state = ctx.state.lock().expect("state lock");
        state
            .state()
            .map(|s| s.last_failure_evidence.clone())
            .unwrap_or_default()
    } else {
        BTreeMap::new()
    };
    let mut success = false;
    let mut last_error: Option<String> = None;
    let mut attempts_used = item.attempts;
    let mut guardrail_tripped = false;

    loop {
        if item.attempts >= max_attempts {
            break;
        }
        if ctx.cancel.is_cancelled() || shared.abort.is_cancelled() {
            evidence.insert("cancelled".to_string(), "true".to_string());
            last_error = Some("cancelled".to_string());
            break;
        }

        item.increment_attempts();
        let attempt = item.attempts;
        attempts_used = attempt;
        sync_item(shared, ctx, &item);
        {
            let mut state = ctx.state.lock().expect("state lock");
            let _ = state.increment_iteration();
        }

        let stage = if attempt == 1 { "implement" } else { "fix" };
        info!(attempt, stage, "implementation attempt");

        let context = item_context(base_context, &item, attempt, &evidence);
        let mut recorder = {
            let mut collector = ctx.collector.lock().expect("collector lock");
            if attempt > 1 {
                collector.add_fix_attempt();
            }
            collector.begin_stage(stage, Some(&item.id), attempt)
        };
        recorder.record_artifact("patch_diff", &ctx.paths.patch_diff().display().to_string());

        // Critical section: apply, diff, guardrails, gates all mutate
        // or read the shared worktree.
        let mut workspace = ctx.workspace.lock().await;

        let apply_result = nodes::run_llm_apply(
            ctx,
            apply_node,
            stage,
            attempt,
            Some(&item.id),
            &context,
            &mut workspace,
        )
        .await;

        record_llm(&mut recorder, &apply_result);

        if !apply_result.success {
            drop(workspace);
            let category = apply_result
                .failure_category
                .unwrap_or(FailureCategory::ExecutorError);
            let message = apply_result.error.clone().unwrap_or_default();
            let record = recorder.failure(category, &message);
            ctx.writer.write_stage(&record);
            ctx.collector.lock().expect("collector lock").push(record);
            last_error = Some(message.clone());

            match category {
                FailureCategory::GuardrailViolation => {
                    // Terminal for the item; never retried.
                    guardrail_tripped = true;
                    break;
                }
                FailureCategory::EmptyDiff => {
                    evidence.clear();
                    evidence.insert("diff_empty".to_string(), "true".to_string());
                }
                _ => {
                    evidence.clear();
                    evidence.insert("executor_error".to_string(), message);
                }
            }
            set_state_evidence(ctx, &evidence);
            continue;
        }

        if apply_result.diff_stats.is_some() {
            let diff = std::fs::read_to_string(ctx.paths.patch_diff()).unwrap_or_default();
            recorder.record_diff_stats(&diff);
        }
        let record = recorder.success();
        ctx.writer.write_stage(&record);
        ctx.collector.lock().expect("collector lock").push(record);

        // Verify while still holding the workspace lock.
        let verify_result = match gate_node {
            Some(gate_node) => {
                let mut verify_recorder = {
                    let collector = ctx.collector.lock().expect("collector lock");
                    collector.begin_stage("verify", Some(&item.id), attempt)
                };
                let extra = fast_verify_args(ctx, &item);
                let cwd = workspace.worktree_path().to_path_buf();
                let result = nodes::run_gate_node(
                    ctx,
                    gate_node,
                    &cwd,
                    Some(&item.id),
                    attempt,
                    &extra,
                )
                .await;

                for gate in &result.gate_results {
                    verify_recorder.record_gate(gate.clone());
                }
                let mut record = if result.success {
                    verify_recorder.success()
                } else {
                    verify_recorder.failure(
                        FailureCategory::GateFailure,
                        result.error.as_deref().unwrap_or("gate failure"),
                    )
                };
                record.verify_duration_ms = result.verify_duration_ms;
                ctx.writer.write_stage(&record);
                ctx.collector.lock().expect("collector lock").push(record);
                result
            }
            None => NodeResult::ok(),
        };
        drop(workspace);

        if verify_result.success {
            info!(attempt, "verification passed");
            success = true;
            evidence.clear();
            set_state_evidence(ctx, &evidence);
            if attempt == 1 {
                ctx.collector
                    .lock()
                    .expect("collector lock")
                    .mark_first_green();
            }
            break;
        }

        warn!(attempt, error = verify_result.error.as_deref().unwrap_or(""), "verification failed");
        last_error = verify_result.error.clone();
        evidence.clear();
        if let Some(gate) = verify_result.metadata.get("failed_gate") {
            evidence.insert("gate".to_string(), gate.clone());
        }
        if let Some(tail) = verify_result.metadata.get("gate_log_tail") {
            evidence.insert("log".to_string(), tail.clone());
        }
        set_state_evidence(ctx, &evidence);
    }

    if success {
        item.mark_done();
    } else {
        let reason = if guardrail_tripped {
            last_error.clone().unwrap_or_else(|| "guardrail violation".to_string())
        } else {
            format!(
                "failed after {attempts_used} attempts: {}",
                last_error.as_deref().unwrap_or("unknown error")
            )
        };
        warn!(reason = %reason, "item failed");
        item.mark_failed(&reason);
    }
    sync_item(shared, ctx, &item);

    {
        let mut outcomes = shared.outcomes.lock().expect("outcomes lock");
        outcomes.push(ItemOutcome {
            item_id: item.id.clone(),
            success,
            attempts: attempts_used,
            error: if success { None } else { last_error },
        });
    }

    if !success && (guardrail_tripped || ctx.config.run.stop_on_first_failure) {
        shared.abort.cancel();
        shared.progress.notify_waiters();
    }
}

/// Copy the local item snapshot back into the shared backlog and save.
fn sync_item(shared: &MapShared, ctx: &RunCtx, item: &WorkItem) {
    let mut backlog = shared.backlog.lock().expect("backlog lock");
    if let Some(entry) = backlog.get_item_mut(&item.id) {
        *entry = item.clone();
    }
    shared.persist_backlog(ctx, &backlog);
}

fn set_state_evidence(ctx: &RunCtx, evidence: &BTreeMap<String, String>) {
    let mut state = ctx.state.lock().expect("state lock");
    let _ = state.set_failure_evidence(evidence.clone());
}

/// Per-item prompt context: the base pipeline context plus the item
/// fields and, for fix attempts, the accumulated failure evidence.
fn item_context(
    base: &BTreeMap<String, String>,
    item: &WorkItem,
    attempt: u32,
    evidence: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut context = base.clone();
    context.insert("item_id".to_string(), item.id.clone());
    context.insert("item_title".to_string(), item.title.clone());
    context.insert("item_objective".to_string(), item.objective.clone());
    context.insert(
        "item_acceptance".to_string(),
        item.acceptance
            .iter()
            .map(|a| format!("- {a}"))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    context.insert("files_hint".to_string(), item.files_hint.join("\n"));
    context.insert("attempt".to_string(), attempt.to_string());
    context.insert("current_item".to_string(), item.id.clone());
    if !evidence.is_empty() {
        context.insert(
            "evidence".to_string(),
            evidence
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n\n"),
        );
    }
    context
}

/// In fast verify mode, narrow pytest to targets derived from the
/// item's file hints.
fn fast_verify_args(ctx: &RunCtx, item: &WorkItem) -> Vec<String> {
    use drover_core::config::VerifyMode;
    if ctx.config.run.per_item_verify != VerifyMode::Fast {
        return Vec::new();
    }
    let targets: Vec<String> = item
        .files_hint
        .iter()
        .filter(|f| f.contains("test"))
        .take(ctx.config.run.fast_verify_max_test_targets)
        .cloned()
        .collect();
    targets
}

fn record_llm(recorder: &mut drover_core::metrics::collector::StageRecorder, result: &NodeResult) {
    recorder.record_model_selection(
        result.executor.as_deref().unwrap_or("unknown"),
        &result.selector,
    );
    if result.fallback_applied {
        recorder.record_fallback(result.original_model.as_deref());
    }
    if let Some(tokens) = result.tokens {
        recorder.record_tokens(tokens);
    }
    for _ in 1..result.agent_invocations {
        recorder.add_agent_invocation();
    }
}

fn build_report(outcomes: &[ItemOutcome], backlog: &Backlog) -> String {
    let total = outcomes.len();
    let succeeded = outcomes.iter().filter(|o| o.success).count();

    let mut lines = vec![
        "# Implementation report".to_string(),
        String::new(),
        format!("Total items: {total}"),
        format!("Succeeded: {succeeded}"),
        format!("Failed: {}", total - succeeded),
        String::new(),
    ];

    for outcome in outcomes {
        let title = backlog
            .get_item(&outcome.item_id)
            .map_or_else(|| outcome.item_id.clone(), |i| i.title.clone());
        let status = if outcome.success { "done" } else { "failed" };
        lines.push(format!(
            "- {} [{status}] {title} (attempts: {})",
            outcome.item_id, outcome.attempts
        ));
        if let Some(error) = &outcome.error {
            lines.push(format!("  error: {error}"));
        }
    }
    lines.join("\n")
}
