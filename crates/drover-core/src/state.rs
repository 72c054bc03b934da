//! Run state persistence and FSM transitions.
//!
//! `state.json` is the canonical record of where a run is. It is
//! rewritten atomically after every transition so that a reader (or a
//! resumed process) always observes a complete, parseable state.

use crate::paths::{write_atomic, RunPaths};
use crate::types::{RunId, Stage, StageExecStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file not found: {0}")]
    NotFound(std::path::PathBuf),
    #[error("invalid state file: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state not initialized; call initialize() or load() first")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Execution status of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: Stage,
    #[serde(default)]
    pub status: StageExecStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StageStatus {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            status: StageExecStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Complete persisted state of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub current_stage: Stage,
    pub current_item_id: Option<String>,
    /// Fix-loop iteration counter for the current item.
    pub current_iteration: u32,
    pub baseline_sha: Option<String>,
    pub stage_statuses: BTreeMap<String, StageStatus>,
    /// Evidence handed to the fix prompt (gate name, log tail, reasons).
    pub last_failure_evidence: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: RunId) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            current_stage: Stage::Init,
            current_item_id: None,
            current_iteration: 0,
            baseline_sha: None,
            stage_statuses: BTreeMap::new(),
            last_failure_evidence: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, stage: Stage) -> Option<&StageStatus> {
        self.stage_statuses.get(stage.as_str())
    }

    /// True when the stage has already run to completion; used by the
    /// engine to make resume re-entry idempotent.
    pub fn stage_completed(&self, stage: Stage) -> bool {
        self.stage_status(stage)
            .is_some_and(|s| s.status == StageExecStatus::Completed)
    }
}

/// Owns loading, mutating, and persisting `state.json`.
#[derive(Debug)]
pub struct StateStore {
    paths: RunPaths,
    state: Option<RunState>,
}

impl StateStore {
    pub fn new(paths: RunPaths) -> Self {
        Self { paths, state: None }
    }

    pub fn state(&self) -> Result<&RunState> {
        self.state.as_ref().ok_or(StateError::NotInitialized)
    }

    fn state_mut(&mut self) -> Result<&mut RunState> {
        self.state.as_mut().ok_or(StateError::NotInitialized)
    }

    pub fn current_stage(&self) -> Result<Stage> {
        Ok(self.state()?.current_stage)
    }

    /// Create a fresh state at `init` and persist it.
    pub fn initialize(&mut self) -> Result<&RunState> {
        info!(run_id = %self.paths.run_id, "initializing run state");
        self.state = Some(RunState::new(self.paths.run_id.clone()));
        self.save()?;
        self.state()
    }

    /// Load state from disk.
    pub fn load(&mut self) -> Result<&RunState> {
        let path = self.paths.state_json();
        if !path.exists() {
            return Err(StateError::NotFound(path));
        }
        let content = std::fs::read_to_string(&path)?;
        let state: RunState = serde_json::from_str(&content)
            .map_err(|e| StateError::Invalid(e.to_string()))?;
        info!(run_id = %state.run_id, stage = %state.current_stage, "loaded run state");
        self.state = Some(state);
        self.state()
    }

    /// Persist the current state atomically.
    pub fn save(&mut self) -> Result<()> {
        let path = self.paths.state_json();
        let state = self.state_mut()?;
        state.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StateError::Invalid(e.to_string()))?;
        write_atomic(&path, &json)?;
        debug!(path = %path.display(), "saved run state");
        Ok(())
    }

    /// Move to `stage`: marks a previously running stage completed,
    /// records the new stage as running, and saves.
    pub fn transition_to(&mut self, stage: Stage) -> Result<()> {
        let now = Utc::now();
        let state = self.state_mut()?;
        let from = state.current_stage;

        let prev_key = from.as_str().to_string();
        if let Some(prev) = state.stage_statuses.get_mut(&prev_key) {
            if prev.status == StageExecStatus::Running {
                prev.status = StageExecStatus::Completed;
                prev.completed_at = Some(now);
            }
        }

        state.current_stage = stage;
        let entry = state
            .stage_statuses
            .entry(stage.as_str().to_string())
            .or_insert_with(|| StageStatus::new(stage));
        entry.status = StageExecStatus::Running;
        entry.started_at = Some(now);

        self.save()?;
        info!(from = %from, to = %stage, "stage transition");
        Ok(())
    }

    /// Mark a stage (default: current) completed.
    pub fn mark_stage_completed(&mut self, stage: Option<Stage>) -> Result<()> {
        let now = Utc::now();
        let state = self.state_mut()?;
        let target = stage.unwrap_or(state.current_stage);
        let entry = state
            .stage_statuses
            .entry(target.as_str().to_string())
            .or_insert_with(|| StageStatus::new(target));
        entry.status = StageExecStatus::Completed;
        entry.completed_at = Some(now);
        self.save()
    }

    /// Mark a stage (default: current) failed with an error message.
    pub fn mark_stage_failed(&mut self, error: &str, stage: Option<Stage>) -> Result<()> {
        let now = Utc::now();
        let state = self.state_mut()?;
        let target = stage.unwrap_or(state.current_stage);
        let entry = state
            .stage_statuses
            .entry(target.as_str().to_string())
            .or_insert_with(|| StageStatus::new(target));
        entry.status = StageExecStatus::Failed;
        entry.error = Some(error.to_string());
        entry.completed_at = Some(now);
        self.save()
    }

    /// Select the current work item and reset the iteration counter.
    pub fn set_current_item(&mut self, item_id: &str) -> Result<()> {
        let state = self.state_mut()?;
        state.current_item_id = Some(item_id.to_string());
        state.current_iteration = 0;
        self.save()?;
        debug!(item_id, "set current item");
        Ok(())
    }

    pub fn increment_iteration(&mut self) -> Result<u32> {
        let state = self.state_mut()?;
        state.current_iteration += 1;
        let iteration = state.current_iteration;
        self.save()?;
        Ok(iteration)
    }

    pub fn set_baseline_sha(&mut self, sha: &str) -> Result<()> {
        let state = self.state_mut()?;
        state.baseline_sha = Some(sha.to_string());
        self.save()?;
        debug!(sha = &sha[..sha.len().min(8)], "set baseline sha");
        Ok(())
    }

    pub fn set_failure_evidence(&mut self, evidence: BTreeMap<String, String>) -> Result<()> {
        let state = self.state_mut()?;
        state.last_failure_evidence = evidence;
        self.save()
    }

    pub fn clear_failure_evidence(&mut self) -> Result<()> {
        let state = self.state_mut()?;
        state.last_failure_evidence.clear();
        self.save()
    }

    /// A run is resumable unless it reached a terminal stage.
    pub fn is_resumable(&mut self) -> bool {
        if self.state.is_none() && self.load().is_err() {
            return false;
        }
        self.state
            .as_ref()
            .is_some_and(|s| !s.current_stage.is_terminal())
    }

    /// The stage to re-enter on resume. Re-entry is idempotent by
    /// design: a stage left `running` at process death restarts from
    /// its beginning.
    pub fn get_resume_point(&mut self) -> Result<Stage> {
        if self.state.is_none() {
            self.load()?;
        }
        self.current_stage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();
        let store = StateStore::new(paths);
        (base, store)
    }

    #[test]
    fn initialize_starts_at_init() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        assert_eq!(store.current_stage().unwrap(), Stage::Init);
        assert!(store.state().unwrap().stage_statuses.is_empty());
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let (_base, mut store) = store();
        assert!(matches!(store.load(), Err(StateError::NotFound(_))));
    }

    #[test]
    fn load_corrupt_file_is_invalid() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        std::fs::write(store.paths.state_json(), "{not json").unwrap();
        let mut fresh = StateStore::new(store.paths.clone());
        assert!(matches!(fresh.load(), Err(StateError::Invalid(_))));
    }

    #[test]
    fn save_load_round_trip_preserves_state() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        store.transition_to(Stage::Plan).unwrap();
        store.transition_to(Stage::ImplementItem).unwrap();
        store.set_current_item("W002").unwrap();
        store.increment_iteration().unwrap();
        store.set_baseline_sha("abcdef0123456789").unwrap();
        let mut evidence = BTreeMap::new();
        evidence.insert("gate".to_string(), "pytest".to_string());
        evidence.insert("log".to_string(), "2 failed".to_string());
        store.set_failure_evidence(evidence.clone()).unwrap();

        let mut reloaded = StateStore::new(store.paths.clone());
        let state = reloaded.load().unwrap();
        assert_eq!(state.current_stage, Stage::ImplementItem);
        assert_eq!(state.current_item_id.as_deref(), Some("W002"));
        assert_eq!(state.current_iteration, 1);
        assert_eq!(state.baseline_sha.as_deref(), Some("abcdef0123456789"));
        assert_eq!(state.last_failure_evidence, evidence);
        assert!(state.stage_completed(Stage::Plan));
        assert_eq!(
            state.stage_status(Stage::ImplementItem).unwrap().status,
            StageExecStatus::Running
        );
    }

    #[test]
    fn transition_completes_previous_running_stage() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        store.transition_to(Stage::Plan).unwrap();
        store.transition_to(Stage::Spec).unwrap();

        let state = store.state().unwrap();
        assert_eq!(
            state.stage_status(Stage::Plan).unwrap().status,
            StageExecStatus::Completed
        );
        assert!(state.stage_status(Stage::Plan).unwrap().completed_at.is_some());
        assert_eq!(
            state.stage_status(Stage::Spec).unwrap().status,
            StageExecStatus::Running
        );
    }

    #[test]
    fn mark_stage_failed_records_error() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        store.transition_to(Stage::Decompose).unwrap();
        store.mark_stage_failed("backlog parse error", None).unwrap();

        let status = store.state().unwrap().stage_status(Stage::Decompose).unwrap();
        assert_eq!(status.status, StageExecStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("backlog parse error"));
    }

    #[test]
    fn set_current_item_resets_iteration() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        store.set_current_item("W001").unwrap();
        assert_eq!(store.increment_iteration().unwrap(), 1);
        assert_eq!(store.increment_iteration().unwrap(), 2);
        store.set_current_item("W002").unwrap();
        assert_eq!(store.state().unwrap().current_iteration, 0);
    }

    #[test]
    fn resumable_until_terminal() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        assert!(store.is_resumable());

        store.transition_to(Stage::Done).unwrap();
        assert!(!store.is_resumable());

        let (_base2, mut failed_store) = store_with_stage(Stage::Failed);
        assert!(!failed_store.is_resumable());
    }

    fn store_with_stage(stage: Stage) -> (TempDir, StateStore) {
        let (base, mut store) = store();
        store.initialize().unwrap();
        store.transition_to(stage).unwrap();
        (base, store)
    }

    #[test]
    fn resume_point_is_current_stage() {
        let (_base, mut store) = store();
        store.initialize().unwrap();
        store.transition_to(Stage::ImplementItem).unwrap();

        let mut reloaded = StateStore::new(store.paths.clone());
        assert_eq!(reloaded.get_resume_point().unwrap(), Stage::ImplementItem);
    }

    #[test]
    fn concurrent_reader_sees_parseable_state() {
        // write_atomic renames over the target, so a reader racing with
        // save() gets either the old or the new complete document.
        let (_base, mut store) = store();
        store.initialize().unwrap();
        for stage in [Stage::Plan, Stage::Spec, Stage::Decompose] {
            store.transition_to(stage).unwrap();
            let content = std::fs::read_to_string(store.paths.state_json()).unwrap();
            let parsed: RunState = serde_json::from_str(&content).unwrap();
            assert_eq!(parsed.current_stage, stage);
        }
    }
}
