//! Ordered pipeline execution over typed nodes.
//!
//! The outer walk is strictly sequential: one node at a time, FSM
//! transition before execution, metrics and state written after every
//! attempt so a crash at any point leaves a resumable run behind.

use crate::command::CommandRunner;
use crate::executors::router::ModelRouter;
use crate::gates::Gate;
use crate::knowledge;
use crate::pipeline::definition::{NodeDefinition, NodeType, PipelineDefinition};
use crate::pipeline::map;
use crate::pipeline::nodes::{self, NodeResult};
use crate::pipeline::store::ArtifactStore;
use crate::workspace::Workspace;
use drover_core::backlog::Backlog;
use drover_core::config::Config;
use drover_core::guardrails::Guardrails;
use drover_core::metrics::collector::MetricsCollector;
use drover_core::metrics::schema::FailureCategory;
use drover_core::metrics::writer::MetricsWriter;
use drover_core::paths::RunPaths;
use drover_core::state::StateStore;
use drover_core::types::Stage;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default per-node budget when neither the node nor the engine
/// configures one: 30 minutes.
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 1800;

/// Everything a node needs, cheaply cloneable into map workers.
#[derive(Clone)]
pub struct RunCtx {
    pub config: Config,
    pub paths: RunPaths,
    pub cmd: CommandRunner,
    pub router: Arc<ModelRouter>,
    pub gates: Arc<Vec<Gate>>,
    pub guardrails: Arc<Guardrails>,
    pub workspace: Arc<tokio::sync::Mutex<Workspace>>,
    pub state: Arc<Mutex<StateStore>>,
    pub collector: Arc<Mutex<MetricsCollector>>,
    pub writer: Arc<MetricsWriter>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for RunCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCtx")
            .field("run_id", &self.paths.run_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub success: bool,
    pub completed_nodes: Vec<String>,
    pub failed_node: Option<String>,
    pub error: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub review_changes_requested: bool,
    pub total_duration_ms: u64,
}

/// Map a node id onto the run FSM.
fn stage_for_node(node_id: &str) -> Option<Stage> {
    match node_id {
        "plan" => Some(Stage::Plan),
        "spec" => Some(Stage::Spec),
        "decompose" => Some(Stage::Decompose),
        "implement" | "implement_direct" => Some(Stage::ImplementItem),
        "verify" => Some(Stage::Verify),
        "review" => Some(Stage::Review),
        "ship" => Some(Stage::Ship),
        "knowledge_update" => Some(Stage::KnowledgeUpdate),
        _ => None,
    }
}

pub struct PipelineEngine {
    ctx: RunCtx,
    store: ArtifactStore,
}

impl PipelineEngine {
    pub fn new(ctx: RunCtx) -> Self {
        let store = ArtifactStore::new(ctx.paths.clone());
        Self { ctx, store }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ArtifactStore {
        &mut self.store
    }

    /// Execute the pipeline from the first node (or `resume_from`).
    pub async fn run(
        &mut self,
        pipeline: &PipelineDefinition,
        task: &str,
        resume_from: Option<&str>,
    ) -> PipelineResult {
        let started = std::time::Instant::now();
        info!(pipeline = %pipeline.id, nodes = pipeline.nodes.len(), "starting pipeline");

        self.store.set("task", task, "input");
        self.store.prefetch(&pipeline.default_context);
        // On resume the intermediate artifacts come back off disk.
        self.store.prefetch(&[
            "plan".to_string(),
            "spec".to_string(),
            "backlog".to_string(),
            "patch_diff".to_string(),
        ]);

        let start_idx = resume_from
            .and_then(|id| pipeline.node_index(id))
            .unwrap_or(0);

        let mut result = PipelineResult {
            success: true,
            ..PipelineResult::default()
        };

        for node in &pipeline.nodes[start_idx..] {
            if self.ctx.cancel.is_cancelled() {
                self.fail_pipeline(
                    &mut result,
                    node,
                    FailureCategory::Cancelled,
                    "run cancelled",
                );
                break;
            }

            let stage = stage_for_node(&node.id);

            // Idempotent re-entry: a stage that already completed is
            // skipped without a new metrics line.
            if let Some(stage) = stage {
                let completed = {
                    let state = self.ctx.state.lock().expect("state lock");
                    state.state().is_ok_and(|s| s.stage_completed(stage))
                };
                if completed {
                    info!(node = %node.id, "stage already completed, skipping");
                    result.completed_nodes.push(node.id.clone());
                    continue;
                }
                let mut state = self.ctx.state.lock().expect("state lock");
                if let Err(e) = state.transition_to(stage) {
                    error!(error = %e, "state transition failed");
                }
            }

            info!(node = %node.id, node_type = node.node_type.as_str(), "executing node");
            let node_result = self.execute_node(node).await;

            // The map node writes its own per-attempt records.
            if node.node_type != NodeType::Map {
                self.write_node_metrics(node, &node_result);
            }

            if node_result.success {
                for (key, value) in &node_result.outputs {
                    self.store.set(key, value.clone(), &node.id);
                }
                {
                    let mut state = self.ctx.state.lock().expect("state lock");
                    if let Some(stage) = stage {
                        let _ = state.mark_stage_completed(Some(stage));
                    }
                }
                result.completed_nodes.push(node.id.clone());

                if node.id == "review"
                    && node_result.metadata.get("verdict").map(String::as_str)
                        == Some("changes_requested")
                {
                    // Review asked for changes: skip ship, end the
                    // pipeline as success-without-ship. The back-edge
                    // into implementation is a planned extension.
                    info!("review requested changes, skipping ship");
                    result.review_changes_requested = true;
                    break;
                }
            } else {
                let category = node_result
                    .failure_category
                    .unwrap_or(FailureCategory::Unknown);
                let message = node_result.error.clone().unwrap_or_default();
                error!(node = %node.id, error = %message, "node failed");
                {
                    let mut state = self.ctx.state.lock().expect("state lock");
                    let _ = state.mark_stage_failed(&message, stage);
                    let _ = state.transition_to(Stage::Failed);
                }
                result.success = false;
                result.failed_node = Some(node.id.clone());
                result.error = Some(message);
                result.failure_category = Some(category);
                break;
            }
        }

        result.total_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            success = result.success,
            completed = result.completed_nodes.len(),
            duration_ms = result.total_duration_ms,
            "pipeline finished"
        );
        result
    }

    fn fail_pipeline(
        &mut self,
        result: &mut PipelineResult,
        node: &NodeDefinition,
        category: FailureCategory,
        message: &str,
    ) {
        {
            let mut state = self.ctx.state.lock().expect("state lock");
            let _ = state.mark_stage_failed(message, stage_for_node(&node.id));
            let _ = state.transition_to(Stage::Failed);
        }
        result.success = false;
        result.failed_node = Some(node.id.clone());
        result.error = Some(message.to_string());
        result.failure_category = Some(category);
    }

    fn node_timeout(&self, node: &NodeDefinition) -> u64 {
        node.config
            .timeout_seconds
            .or_else(|| {
                self.ctx
                    .config
                    .engine
                    .stage_timeouts
                    .get(&node.id)
                    .copied()
            })
            .unwrap_or(DEFAULT_NODE_TIMEOUT_SECS)
    }

    async fn execute_node(&mut self, node: &NodeDefinition) -> NodeResult {
        // Map nodes run an entire backlog; their inner stages carry
        // their own budgets, so only an explicit timeout caps them.
        let explicit = node.config.timeout_seconds.is_some()
            || self.ctx.config.engine.stage_timeouts.contains_key(&node.id);
        if node.node_type == NodeType::Map && !explicit {
            return self.execute_node_inner(node).await;
        }

        let timeout = std::time::Duration::from_secs(self.node_timeout(node));
        let future = self.execute_node_inner(node);
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(node = %node.id, timeout_secs = timeout.as_secs(), "node timed out");
                NodeResult::fail(
                    FailureCategory::Timeout,
                    format!("node timed out after {}s", timeout.as_secs()),
                )
            }
        }
    }

    async fn execute_node_inner(&mut self, node: &NodeDefinition) -> NodeResult {
        let context = self.store.context_for(&node.inputs);
        match node.node_type {
            NodeType::LlmText => {
                let cwd = {
                    let workspace = self.ctx.workspace.lock().await;
                    workspace.worktree_path().to_path_buf()
                };
                nodes::run_llm_text(&self.ctx, node, &node.id, &context, &cwd).await
            }
            NodeType::LlmApply => {
                let mut workspace = self.ctx.workspace.lock().await;
                nodes::run_llm_apply(&self.ctx, node, &node.id, 1, None, &context, &mut workspace)
                    .await
            }
            NodeType::Gate => {
                let cwd = {
                    let workspace = self.ctx.workspace.lock().await;
                    workspace.worktree_path().to_path_buf()
                };
                nodes::run_gate_node(&self.ctx, node, &cwd, None, 1, &[]).await
            }
            NodeType::Map => self.execute_map_node(node).await,
            NodeType::Custom => self.execute_custom_node(node, &context).await,
        }
    }

    async fn execute_map_node(&mut self, node: &NodeDefinition) -> NodeResult {
        let Some(backlog_yaml) = self.store.get("backlog") else {
            return NodeResult::fail(
                FailureCategory::ParseError,
                "no backlog available for map node",
            );
        };
        let mut backlog = match Backlog::from_yaml(backlog_yaml) {
            Ok(backlog) => backlog,
            Err(e) => {
                return NodeResult::fail(
                    FailureCategory::ParseError,
                    format!("backlog parse failed: {e}"),
                )
            }
        };

        // Items left in_progress by a crashed run are re-dispatched;
        // their attempt counters carry over.
        for item in &mut backlog.items {
            if item.status == drover_core::backlog::WorkItemStatus::InProgress {
                item.status = drover_core::backlog::WorkItemStatus::Todo;
            }
        }

        {
            let mut collector = self.ctx.collector.lock().expect("collector lock");
            collector.set_items_count(backlog.items.len(), backlog.done_count(), backlog.failed_count());
        }

        let context = self.store.context_for(&node.inputs);
        let (updated, result) = map::run_map(&self.ctx, node, &context, backlog).await;

        if let Ok(yaml) = updated.to_yaml() {
            self.store.set("backlog", yaml, &node.id);
        }
        // The loop captured patch.diff on disk; surface it to the
        // downstream review/ship nodes.
        if let Ok(diff) = std::fs::read_to_string(self.ctx.paths.patch_diff()) {
            self.store.set_transient("patch_diff", diff, &node.id);
        }
        result
    }

    async fn execute_custom_node(
        &mut self,
        node: &NodeDefinition,
        context: &BTreeMap<String, String>,
    ) -> NodeResult {
        match node.config.callable.as_deref() {
            Some("ship") => self.ship(context).await,
            Some("knowledge_update") => {
                knowledge::run_knowledge_update(&self.ctx, context).await
            }
            Some(other) => NodeResult::fail(
                FailureCategory::ConfigError,
                format!("unknown custom callable: {other}"),
            ),
            None => NodeResult::fail(
                FailureCategory::ConfigError,
                format!("custom node '{}' names no callable", node.id),
            ),
        }
    }

    /// Ship: commit the worktree, optionally push, and write the PR
    /// body artifact.
    async fn ship(&mut self, context: &BTreeMap<String, String>) -> NodeResult {
        let git = self.ctx.config.git.clone();
        let branch = format!("drover/{}", self.ctx.paths.run_id);

        let mut workspace = self.ctx.workspace.lock().await;
        if git.auto_commit {
            let task_line = context
                .get("task")
                .and_then(|t| t.lines().next())
                .unwrap_or("automated change");
            let message = format!("{task_line}\n\nrun: {}", self.ctx.paths.run_id);
            if let Err(e) = workspace.commit_all(&message).await {
                return NodeResult::fail(FailureCategory::WorkspaceError, e.to_string());
            }
        }
        if git.auto_push {
            if let Err(e) = workspace.push(&git.remote, &branch).await {
                return NodeResult::fail(FailureCategory::WorkspaceError, e.to_string());
            }
        }
        drop(workspace);

        // PR body comes from the ship-stage model in text mode.
        let prompt_vars = context.clone();
        let prompt_path = self.ctx.paths.prompt_path("ship");
        let text = match drover_core::prompts::render("pr_body", &prompt_vars) {
            Ok(text) => text,
            Err(e) => return NodeResult::fail(FailureCategory::ConfigError, e.to_string()),
        };
        if let Err(e) = drover_core::paths::write_atomic(&prompt_path, text.as_bytes()) {
            return NodeResult::fail(FailureCategory::Unknown, e.to_string());
        }

        let out_path = self.ctx.paths.pr_body_md();
        let cwd = {
            let workspace = self.ctx.workspace.lock().await;
            workspace.worktree_path().to_path_buf()
        };
        let invocation = nodes::invoke_llm(
            &self.ctx,
            "ship",
            None,
            &cwd,
            &prompt_path,
            nodes::LlmMode::Text {
                out_path: &out_path,
            },
        )
        .await;

        let mut result = NodeResult::ok();
        result.executor = Some(invocation.executor_name.clone());
        result.selector = invocation.selector.clone();
        result.agent_invocations = invocation.invocations;
        result.llm_duration_ms = Some(invocation.llm_duration_ms);

        if invocation.result.failed() {
            result.success = false;
            result.failure_category = Some(FailureCategory::ExecutorError);
            result.error = Some(invocation.result.error_message.clone());
            return result;
        }

        let body = std::fs::read_to_string(&out_path).unwrap_or_default();
        result.outputs.insert("pr_body".to_string(), body);
        {
            let mut collector = self.ctx.collector.lock().expect("collector lock");
            collector.mark_pr_ready();
        }
        result
    }

    /// Record metrics for a non-map node execution.
    fn write_node_metrics(&self, node: &NodeDefinition, node_result: &NodeResult) {
        let mut recorder = {
            let collector = self.ctx.collector.lock().expect("collector lock");
            collector.begin_stage(&node.id, None, 1)
        };

        if let Some(executor) = &node_result.executor {
            recorder.record_model_selection(executor, &node_result.selector);
        }
        if node_result.fallback_applied {
            recorder.record_fallback(node_result.original_model.as_deref());
        }
        if let Some(tokens) = node_result.tokens {
            recorder.record_tokens(tokens);
        }
        for gate in &node_result.gate_results {
            recorder.record_gate(gate.clone());
        }
        for _ in 1..node_result.agent_invocations {
            recorder.add_agent_invocation();
        }
        for key in node_result.outputs.keys() {
            if let Some(path) = self.store.canonical_path(key) {
                recorder.record_artifact(key, &path.display().to_string());
            }
        }

        let mut record = if node_result.success {
            recorder.success()
        } else {
            recorder.failure(
                node_result
                    .failure_category
                    .unwrap_or(FailureCategory::Unknown),
                node_result.error.as_deref().unwrap_or(""),
            )
        };
        record.llm_duration_ms = node_result.llm_duration_ms;
        record.verify_duration_ms = node_result.verify_duration_ms;
        record.diff_stats = node_result.diff_stats.clone();

        self.ctx.writer.write_stage(&record);
        self.ctx
            .collector
            .lock()
            .expect("collector lock")
            .push(record);
    }
}
