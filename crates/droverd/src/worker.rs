//! In-process worker pool behind the HTTP facade: one task per run,
//! bounded concurrency, cancel tokens keyed by run id.

use crate::runner::Runner;
use drover_core::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 2;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("worker pool saturated")]
    Saturated,
    #[error("failed to create run: {0}")]
    Internal(String),
}

/// Request to launch a run, kept verbatim for restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub task: String,
    #[serde(default)]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub config_overrides: serde_json::Value,
}

struct ActiveRun {
    cancel: CancellationToken,
    request: StartRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Initiated,
    NotFound,
    NotActive,
}

pub struct RunWorker {
    config: Config,
    base_dir: PathBuf,
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveRun>>,
    /// Requests of finished runs, for restart.
    finished: Mutex<HashMap<String, StartRequest>>,
}

impl RunWorker {
    pub fn new(config: Config, base_dir: PathBuf, max_concurrent: usize) -> Self {
        Self {
            config,
            base_dir,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.active.lock().expect("active lock").contains_key(run_id)
    }

    pub fn request_for(&self, run_id: &str) -> Option<StartRequest> {
        if let Some(active) = self.active.lock().expect("active lock").get(run_id) {
            return Some(active.request.clone());
        }
        self.finished.lock().expect("finished lock").get(run_id).cloned()
    }

    /// Apply the request's recognized overrides to the base config.
    fn effective_config(&self, request: &StartRequest) -> Config {
        let mut config = self.config.clone();
        if let Some(base_branch) = &request.base_branch {
            config.git.base_branch.clone_from(base_branch);
        }
        if let Some(engine) = request
            .config_overrides
            .get("engine")
            .and_then(|e| e.get("type"))
            .and_then(|t| t.as_str())
        {
            if let Ok(parsed) = serde_json::from_value(serde_json::Value::String(
                engine.to_string(),
            )) {
                config.engine.engine_type = parsed;
            }
        }
        config
    }

    /// Queue a run; returns its id immediately.
    pub fn start_run(self: &Arc<Self>, request: StartRequest) -> Result<String, StartError> {
        if request.task.trim().is_empty() {
            return Err(StartError::Invalid("task must not be empty".to_string()));
        }

        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| StartError::Saturated)?;

        let config = self.effective_config(&request);
        let base_dir = request
            .repo_path
            .clone()
            .map_or_else(|| self.base_dir.clone(), PathBuf::from);

        let mut runner = Runner::new(config, &base_dir, None, false)
            .map_err(|e| StartError::Internal(e.to_string()))?;
        let run_id = runner.run_id().to_string();
        let cancel = runner.cancel_token();

        self.active.lock().expect("active lock").insert(
            run_id.clone(),
            ActiveRun {
                cancel,
                request: request.clone(),
            },
        );

        let worker = Arc::clone(self);
        let pipeline = request
            .pipeline
            .clone()
            .unwrap_or_else(|| crate::pipeline::registry::DEFAULT_PIPELINE_ID.to_string());
        let task = request.task.clone();
        let spawned_run_id = run_id.clone();

        tokio::spawn(async move {
            let _permit = permit;
            info!(run_id = %spawned_run_id, "worker starting run");
            match runner.run(&task, &pipeline).await {
                Ok(_) => info!(run_id = %spawned_run_id, "worker run succeeded"),
                Err(e) => error!(run_id = %spawned_run_id, error = %e, "worker run failed"),
            }
            let removed = worker
                .active
                .lock()
                .expect("active lock")
                .remove(&spawned_run_id);
            if let Some(active) = removed {
                worker
                    .finished
                    .lock()
                    .expect("finished lock")
                    .insert(spawned_run_id, active.request);
            }
        });

        Ok(run_id)
    }

    /// Signal cancellation; the run's subprocesses get a terminate and
    /// the FSM lands in failed with a cancelled reason.
    pub fn cancel_run(&self, run_id: &str) -> CancelOutcome {
        let active = self.active.lock().expect("active lock");
        match active.get(run_id) {
            Some(run) => {
                run.cancel.cancel();
                CancelOutcome::Initiated
            }
            None => {
                let known = self
                    .finished
                    .lock()
                    .expect("finished lock")
                    .contains_key(run_id)
                    || self
                        .base_dir
                        .join("runs")
                        .join(run_id)
                        .is_dir();
                if known {
                    CancelOutcome::NotActive
                } else {
                    CancelOutcome::NotFound
                }
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active lock").len()
    }
}
