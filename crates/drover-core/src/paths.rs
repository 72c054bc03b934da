//! Canonical on-disk layout for a run.
//!
//! Everything a run produces lives under `<base>/runs/<run_id>/`; the
//! isolated worktree lives in a sibling `<base>/.worktrees/<run_id>/`
//! so that removing a run directory never races with git.

use crate::types::RunId;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("run directory not found: {0}")]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, PathsError>;

/// Typed access to every canonical file of one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub base_dir: PathBuf,
    pub run_id: RunId,
    root: PathBuf,
}

impl RunPaths {
    /// Generate a fresh run id, create the directory skeleton, and
    /// return the handle.
    pub fn create_new(base_dir: &Path) -> Result<Self> {
        Self::create_with_id(base_dir, RunId::generate())
    }

    /// Create the skeleton for a caller-supplied id.
    pub fn create_with_id(base_dir: &Path, run_id: RunId) -> Result<Self> {
        let root = base_dir.join("runs").join(run_id.as_ref());
        let paths = Self {
            base_dir: base_dir.to_path_buf(),
            run_id,
            root,
        };
        paths.ensure_layout()?;
        Ok(paths)
    }

    /// Re-attach to an existing run directory.
    pub fn from_existing(base_dir: &Path, run_id: RunId) -> Result<Self> {
        let root = base_dir.join("runs").join(run_id.as_ref());
        if !root.is_dir() {
            return Err(PathsError::NotFound(root));
        }
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            run_id,
            root,
        })
    }

    /// Create all subdirectories of the layout. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.context_dir(),
            self.artifacts_dir(),
            self.prompts_dir(),
            self.logs_dir(),
            self.metrics_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_json(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn state_json(&self) -> PathBuf {
        self.root.join("state.json")
    }

    // --- context/ ---

    pub fn context_dir(&self) -> PathBuf {
        self.root.join("context")
    }

    pub fn task_md(&self) -> PathBuf {
        self.context_dir().join("task.md")
    }

    pub fn plan_md(&self) -> PathBuf {
        self.context_dir().join("plan.md")
    }

    pub fn spec_md(&self) -> PathBuf {
        self.context_dir().join("spec.md")
    }

    pub fn backlog_yaml(&self) -> PathBuf {
        self.context_dir().join("backlog.yaml")
    }

    pub fn project_map_md(&self) -> PathBuf {
        self.context_dir().join("project_map.md")
    }

    pub fn tooling_snapshot_md(&self) -> PathBuf {
        self.context_dir().join("tooling_snapshot.md")
    }

    pub fn verify_commands_md(&self) -> PathBuf {
        self.context_dir().join("verify_commands.md")
    }

    pub fn decisions_md(&self) -> PathBuf {
        self.context_dir().join("decisions.md")
    }

    pub fn lessons_md(&self) -> PathBuf {
        self.context_dir().join("lessons.md")
    }

    // --- artifacts/ ---

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn patch_diff(&self) -> PathBuf {
        self.artifacts_dir().join("patch.diff")
    }

    pub fn review_md(&self) -> PathBuf {
        self.artifacts_dir().join("review.md")
    }

    pub fn pr_body_md(&self) -> PathBuf {
        self.artifacts_dir().join("pr_body.md")
    }

    pub fn implementation_report_md(&self) -> PathBuf {
        self.artifacts_dir().join("implementation_report.md")
    }

    pub fn knowledge_patch_diff(&self) -> PathBuf {
        self.artifacts_dir().join("knowledge.patch.diff")
    }

    pub fn knowledge_report_md(&self) -> PathBuf {
        self.artifacts_dir().join("knowledge_update_report.md")
    }

    // --- prompts/ ---

    pub fn prompts_dir(&self) -> PathBuf {
        self.root.join("prompts")
    }

    pub fn prompt_path(&self, stage: &str) -> PathBuf {
        self.prompts_dir().join(format!("{stage}.md"))
    }

    pub fn prompt_attempt_path(&self, stage: &str, attempt: u32) -> PathBuf {
        self.prompts_dir()
            .join(format!("{stage}.attempt-{attempt:02}.md"))
    }

    // --- logs/ ---

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Per-attempt log directory: `logs/<stage>.attempts/attempt-NN/`.
    pub fn attempt_dir(&self, stage: &str, attempt: u32) -> PathBuf {
        self.logs_dir()
            .join(format!("{stage}.attempts"))
            .join(format!("attempt-{attempt:02}"))
    }

    pub fn gate_log(&self, gate: &str, item_id: &str, attempt: u32) -> PathBuf {
        self.logs_dir()
            .join(format!("gate_{gate}_{item_id}_{attempt}.log"))
    }

    // --- metrics/ ---

    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("metrics")
    }

    pub fn run_json(&self) -> PathBuf {
        self.metrics_dir().join("run.json")
    }

    pub fn stages_jsonl(&self) -> PathBuf {
        self.metrics_dir().join("stages.jsonl")
    }

    // --- workspace ---

    /// Isolated worktree directory, a sibling of `runs/`.
    pub fn worktree_dir(&self) -> PathBuf {
        self.base_dir.join(".worktrees").join(self.run_id.as_ref())
    }

    /// Append-only per-host index of runs.
    pub fn runs_index(base_dir: &Path) -> PathBuf {
        base_dir.join("runs").join("index.jsonl")
    }
}

/// Atomically replace `path` with `content`: write to a temp file in
/// the same directory, fsync, then rename over the target. Readers
/// never observe a partial file.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().to_string())
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_new_builds_skeleton() {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();

        assert!(paths.root().is_dir());
        assert!(paths.context_dir().is_dir());
        assert!(paths.artifacts_dir().is_dir());
        assert!(paths.prompts_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
        assert!(paths.metrics_dir().is_dir());
    }

    #[test]
    fn from_existing_requires_directory() {
        let base = TempDir::new().unwrap();
        let missing = RunPaths::from_existing(base.path(), RunId::from_string("nope"));
        assert!(matches!(missing, Err(PathsError::NotFound(_))));

        let created = RunPaths::create_new(base.path()).unwrap();
        let reattached = RunPaths::from_existing(base.path(), created.run_id.clone()).unwrap();
        assert_eq!(reattached.root(), created.root());
    }

    #[test]
    fn typed_getters_are_under_root() {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();

        for file in [
            paths.meta_json(),
            paths.state_json(),
            paths.task_md(),
            paths.backlog_yaml(),
            paths.patch_diff(),
            paths.review_md(),
            paths.pr_body_md(),
            paths.run_json(),
            paths.stages_jsonl(),
        ] {
            assert!(file.starts_with(paths.root()), "{}", file.display());
        }
    }

    #[test]
    fn worktree_is_sibling_of_runs() {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();
        let worktree = paths.worktree_dir();
        assert!(!worktree.starts_with(paths.root()));
        assert!(worktree.starts_with(base.path().join(".worktrees")));
    }

    #[test]
    fn attempt_dir_naming() {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();
        let dir = paths.attempt_dir("implement", 3);
        assert!(dir.ends_with("implement.attempts/attempt-03"));
    }

    #[test]
    fn gate_log_naming() {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();
        let log = paths.gate_log("pytest", "W001", 2);
        assert!(log.ends_with("gate_pytest_W001_2.log"));
    }

    #[test]
    fn write_atomic_replaces_content() {
        let base = TempDir::new().unwrap();
        let target = base.path().join("state.json");

        write_atomic(&target, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":1}");

        write_atomic(&target, b"{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"a\":2}");

        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(base.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
