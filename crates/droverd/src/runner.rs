//! Top-level orchestration of one run: wires paths, state, metrics,
//! router, gates, guardrails, workspace, and the pipeline engine, and
//! owns meta.json plus the final run metrics.

use crate::command::CommandRunner;
use crate::context;
use crate::executors::router::ModelRouter;
use crate::gates::Gate;
use crate::pipeline::engine::{PipelineEngine, PipelineResult, RunCtx};
use crate::pipeline::registry::{PipelineRegistry, DEFAULT_PIPELINE_ID};
use crate::workspace::Workspace;
use drover_core::config::Config;
use drover_core::guardrails::Guardrails;
use drover_core::metrics::collector::MetricsCollector;
use drover_core::metrics::schema::StageOutcome;
use drover_core::metrics::writer::{append_to_index, MetricsWriter};
use drover_core::paths::{write_atomic, RunPaths};
use drover_core::state::StateStore;
use drover_core::types::{RunId, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("paths error: {0}")]
    Paths(#[from] drover_core::paths::PathsError),
    #[error("config error: {0}")]
    Config(#[from] drover_core::config::ConfigError),
    #[error("state error: {0}")]
    State(#[from] drover_core::state::StateError),
    #[error("workspace error: {0}")]
    Workspace(#[from] crate::workspace::WorkspaceError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::registry::RegistryError),
    #[error("run is not resumable")]
    NotResumable,
    #[error("run failed: {0}")]
    RunFailed(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Model selection actually used for one stage, recorded in meta.json.
#[derive(Debug, Clone, Serialize)]
pub struct StageModelInfo {
    pub stage: String,
    pub executor: String,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub reasoning_effort: Option<String>,
    pub cmd: Vec<String>,
    pub attempt: u32,
    pub fallback_applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub engine: String,
    pub base_branch: String,
    pub branch_name: String,
    pub pipeline: String,
    pub versions: BTreeMap<String, String>,
    pub stage_statuses: BTreeMap<String, String>,
    pub stage_models: Vec<StageModelInfo>,
}

pub struct Runner {
    ctx: RunCtx,
    engine: PipelineEngine,
    registry: PipelineRegistry,
    meta: RunMeta,
    base_dir: PathBuf,
}

impl Runner {
    /// Build a runner, creating a fresh run directory (or re-attaching
    /// when `run_id` names an existing run).
    pub fn new(
        config: Config,
        base_dir: &Path,
        run_id: Option<RunId>,
        dry_run: bool,
    ) -> Result<Self> {
        config.validate()?;

        let paths = match run_id {
            Some(id) => RunPaths::from_existing(base_dir, id)?,
            None => RunPaths::create_new(base_dir)?,
        };

        let cmd = CommandRunner::new(dry_run);
        let state = StateStore::new(paths.clone());
        let collector = MetricsCollector::new(
            paths.run_id.as_ref(),
            Some(config.engine.engine_type.as_str()),
            config.engine.model.as_deref(),
            Some(&config.git.base_branch),
        );
        let writer = MetricsWriter::new(paths.clone());
        let router = ModelRouter::new(config.clone(), cmd.clone());
        let gates: Vec<Gate> = config.enabled_gates().into_iter().map(Gate::from_config).collect();
        let guardrails = Guardrails::new(config.guardrails.clone());
        let workspace = Workspace::new(&paths, cmd.clone(), base_dir);

        let meta = RunMeta {
            run_id: paths.run_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            engine: config.engine.engine_type.as_str().to_string(),
            base_branch: config.git.base_branch.clone(),
            branch_name: format!("drover/{}", paths.run_id),
            pipeline: DEFAULT_PIPELINE_ID.to_string(),
            versions: BTreeMap::new(),
            stage_statuses: BTreeMap::new(),
            stage_models: Vec::new(),
        };

        let ctx = RunCtx {
            config,
            paths,
            cmd,
            router: Arc::new(router),
            gates: Arc::new(gates),
            guardrails: Arc::new(guardrails),
            workspace: Arc::new(tokio::sync::Mutex::new(workspace)),
            state: Arc::new(Mutex::new(state)),
            collector: Arc::new(Mutex::new(collector)),
            writer: Arc::new(writer),
            cancel: CancellationToken::new(),
        };

        Ok(Self {
            engine: PipelineEngine::new(ctx.clone()),
            registry: PipelineRegistry::new(None),
            meta,
            base_dir: base_dir.to_path_buf(),
            ctx,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.ctx.paths.run_id
    }

    pub fn paths(&self) -> &RunPaths {
        &self.ctx.paths
    }

    /// Token that cancels the in-flight run (SIGINT, HTTP cancel).
    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Replace an executor for tests (scripted fake).
    pub fn set_test_executor(
        &self,
        engine: drover_core::config::EngineType,
        executor: Arc<dyn crate::executors::Executor>,
    ) {
        self.ctx.router.set_executor(engine, executor);
    }

    /// Execute a full run from scratch.
    pub async fn run(&mut self, task: &str, pipeline_id: &str) -> Result<PipelineResult> {
        let log_run_id = self.ctx.paths.run_id.clone();
        info!(run_id = %log_run_id, pipeline = pipeline_id, "starting run");
        self.meta.pipeline = pipeline_id.to_string();

        let pipeline = self.registry.get(pipeline_id)?;

        {
            let mut state = self.ctx.state.lock().expect("state lock");
            state.initialize()?;
        }
        {
            let mut collector = self.ctx.collector.lock().expect("collector lock");
            collector.set_task_fingerprint(task);
        }

        // Workspace and baseline.
        let base_branch = self.ctx.config.git.base_branch.clone();
        let baseline = {
            let mut workspace = self.ctx.workspace.lock().await;
            workspace.create(&base_branch).await?;
            let baseline = workspace.baseline_sha().await?;
            if let Err(e) = workspace.validate_base_branch(&base_branch).await {
                warn!(error = %e, "base branch validation warning");
            }
            baseline
        };
        {
            let mut state = self.ctx.state.lock().expect("state lock");
            state.set_baseline_sha(&baseline)?;
        }

        // Context pack for the planning stages.
        {
            let workspace = self.ctx.workspace.lock().await;
            context::build_context_pack(
                &self.ctx.paths,
                workspace.worktree_path(),
                &self.ctx.gates,
            );
        }

        let result = self.engine.run(&pipeline, task, None).await;
        self.finish(&result).await;

        if result.success {
            Ok(result)
        } else {
            Err(RunnerError::RunFailed(
                result.error.clone().unwrap_or_else(|| "unknown".to_string()),
            ))
        }
    }

    /// Resume an interrupted run from its persisted state.
    pub async fn resume(&mut self) -> Result<PipelineResult> {
        let log_run_id = self.ctx.paths.run_id.clone();
        info!(run_id = %log_run_id, "resuming run");

        let (resumable, baseline) = {
            let mut state = self.ctx.state.lock().expect("state lock");
            state.load()?;
            let resumable = state.is_resumable();
            let baseline = state.state()?.baseline_sha.clone();
            (resumable, baseline)
        };
        if !resumable {
            return Err(RunnerError::NotResumable);
        }

        // Recreate the workspace when it is gone, resetting to the
        // recorded baseline.
        {
            let mut workspace = self.ctx.workspace.lock().await;
            if !workspace.exists() {
                let base_branch = self.ctx.config.git.base_branch.clone();
                workspace.create(&base_branch).await?;
                if let Some(baseline) = &baseline {
                    workspace.reset(Some(baseline)).await?;
                }
            }
        }

        // A patch captured before the crash may disagree with the
        // recreated workspace; drop it and let the next apply re-diff.
        let stale_patch = self.ctx.paths.patch_diff();
        if stale_patch.exists() {
            let _ = std::fs::remove_file(&stale_patch);
        }

        let task = std::fs::read_to_string(self.ctx.paths.task_md()).unwrap_or_default();
        let pipeline_id = self.meta.pipeline.clone();
        let pipeline = self.registry.get(&pipeline_id)?;

        // The engine skips stages already marked completed, so the
        // walk restarts from the top and lands on the resume point.
        let result = self.engine.run(&pipeline, &task, None).await;
        self.finish(&result).await;

        if result.success {
            Ok(result)
        } else {
            Err(RunnerError::RunFailed(
                result.error.clone().unwrap_or_else(|| "unknown".to_string()),
            ))
        }
    }

    /// Terminal bookkeeping: final FSM state, meta.json, run metrics,
    /// global index.
    async fn finish(&mut self, result: &PipelineResult) {
        if result.success {
            let mut state = self.ctx.state.lock().expect("state lock");
            let _ = state.transition_to(Stage::Done);
            let _ = state.mark_stage_completed(None);
        }

        self.meta.end_time = Some(Utc::now());
        self.meta.versions = self.collect_versions().await;
        self.collect_stage_models();
        {
            let state = self.ctx.state.lock().expect("state lock");
            if let Ok(run_state) = state.state() {
                for (key, status) in &run_state.stage_statuses {
                    self.meta
                        .stage_statuses
                        .insert(key.clone(), status.status.as_str().to_string());
                }
            }
        }
        match serde_json::to_vec_pretty(&self.meta) {
            Ok(json) => {
                if let Err(e) = write_atomic(&self.ctx.paths.meta_json(), &json) {
                    warn!(error = %e, "failed to write meta.json");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize meta.json"),
        }

        let final_status = if result.success {
            StageOutcome::Success
        } else if result.failure_category
            == Some(drover_core::metrics::schema::FailureCategory::Cancelled)
        {
            StageOutcome::Cancel
        } else {
            StageOutcome::Fail
        };
        let final_diff = std::fs::read_to_string(self.ctx.paths.patch_diff()).ok();
        let run_metrics = {
            let collector = self.ctx.collector.lock().expect("collector lock");
            collector.build_run_metrics(
                final_status,
                result.error.as_deref(),
                final_diff.as_deref(),
            )
        };
        self.ctx.writer.write_run(&run_metrics);

        append_to_index(
            &self.base_dir,
            self.ctx.paths.run_id.as_ref(),
            &serde_json::json!({
                "run_id": self.ctx.paths.run_id.as_ref(),
                "status": final_status.as_str(),
                "duration_ms": run_metrics.total_duration_ms,
                "engine": self.meta.engine,
                "pipeline": self.meta.pipeline,
                "stages_executed": run_metrics.stages_executed,
                "fix_attempts": run_metrics.fix_attempts_total,
            }),
        );

        info!(
            run_id = %self.ctx.paths.run_id,
            status = final_status.as_str(),
            "run finished"
        );
    }

    /// Tool versions for meta.json; failures record "unknown".
    async fn collect_versions(&self) -> BTreeMap<String, String> {
        let mut versions = BTreeMap::new();
        let mut candidates: Vec<(String, Vec<String>)> = vec![(
            "git".to_string(),
            vec!["git".to_string(), "--version".to_string()],
        )];

        let binary = self.ctx.config.engine.binary_name();
        if !binary.is_empty() {
            candidates.push((
                self.ctx.config.engine.engine_type.as_str().to_string(),
                vec![binary, "--version".to_string()],
            ));
        }

        for (name, argv) in candidates {
            let version = match self
                .ctx
                .cmd
                .run_capture(&argv, &self.base_dir, Some(5))
                .await
            {
                Ok((0, stdout, _)) => stdout
                    .lines()
                    .next()
                    .unwrap_or("unknown")
                    .trim()
                    .to_string(),
                _ => "unknown".to_string(),
            };
            versions.insert(name, version);
        }
        versions
    }

    fn collect_stage_models(&mut self) {
        self.meta.stage_models.clear();
        for execution in self.ctx.router.execution_history() {
            for attempt in &execution.attempts {
                self.meta.stage_models.push(StageModelInfo {
                    stage: execution.stage.clone(),
                    executor: attempt
                        .model_info
                        .get("executor")
                        .cloned()
                        .unwrap_or_default(),
                    model: attempt.model_info.get("model").cloned(),
                    profile: attempt.model_info.get("profile").cloned(),
                    reasoning_effort: attempt.model_info.get("reasoning_effort").cloned(),
                    cmd: attempt.cmd.clone(),
                    attempt: attempt.attempt_number,
                    fallback_applied: attempt.fallback_applied,
                });
            }
        }
        self.meta
            .stage_models
            .sort_by(|a, b| a.stage.cmp(&b.stage).then(a.attempt.cmp(&b.attempt)));
    }
}
