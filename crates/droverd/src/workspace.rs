//! Isolated git worktree for a run.
//!
//! Every run mutates files only inside its own detached worktree; the
//! primary checkout is never touched. Diff capture stages everything,
//! diffs against HEAD, then restores the pre-call staging state.

use crate::command::CommandRunner;
use drover_core::paths::RunPaths;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace {operation} failed: {message}")]
    Git { operation: String, message: String },
    #[error("workspace does not exist: {0}")]
    Missing(PathBuf),
    #[error("no baseline SHA available")]
    NoBaseline,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command error: {0}")]
    Command(#[from] crate::command::CommandError),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

fn git_err(operation: &str, message: impl Into<String>) -> WorkspaceError {
    WorkspaceError::Git {
        operation: operation.to_string(),
        message: message.into(),
    }
}

#[derive(Debug)]
pub struct Workspace {
    cmd: CommandRunner,
    repo_root: PathBuf,
    worktree_path: PathBuf,
    baseline_sha: Option<String>,
}

impl Workspace {
    pub fn new(paths: &RunPaths, cmd: CommandRunner, repo_root: &Path) -> Self {
        Self {
            cmd,
            repo_root: repo_root.to_path_buf(),
            worktree_path: paths.worktree_dir(),
            baseline_sha: None,
        }
    }

    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn exists(&self) -> bool {
        self.worktree_path.is_dir()
    }

    /// Create a detached worktree from `base_branch`, replacing any
    /// stale worktree at the same path.
    pub async fn create(&mut self, base_branch: &str) -> Result<PathBuf> {
        info!(base_branch, worktree = %self.worktree_path.display(), "creating git worktree");

        if let Some(parent) = self.worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.exists() {
            warn!("worktree already exists, removing");
            self.remove().await?;
        }

        let (code, stdout, stderr) = self
            .cmd
            .run_git(&["rev-parse", base_branch], &self.repo_root)
            .await?;
        if code != 0 {
            return Err(git_err(
                "create",
                format!("failed to resolve base branch '{base_branch}': {stderr}"),
            ));
        }
        self.baseline_sha = Some(stdout.trim().to_string());

        let worktree = self.worktree_path.display().to_string();
        let (code, _, stderr) = self
            .cmd
            .run_git(
                &["worktree", "add", "--detach", &worktree, base_branch],
                &self.repo_root,
            )
            .await?;
        if code != 0 {
            return Err(git_err("create", format!("failed to add worktree: {stderr}")));
        }

        info!(baseline = self.baseline_sha.as_deref().unwrap_or(""), "worktree created");
        Ok(self.worktree_path.clone())
    }

    /// Baseline SHA the worktree was created at; falls back to the
    /// worktree HEAD when re-attaching after resume.
    pub async fn baseline_sha(&mut self) -> Result<String> {
        if let Some(sha) = &self.baseline_sha {
            return Ok(sha.clone());
        }
        if !self.exists() {
            return Err(WorkspaceError::Missing(self.worktree_path.clone()));
        }
        let (code, stdout, stderr) = self
            .cmd
            .run_git(&["rev-parse", "HEAD"], &self.worktree_path)
            .await?;
        if code != 0 {
            return Err(git_err("baseline_sha", stderr));
        }
        let sha = stdout.trim().to_string();
        self.baseline_sha = Some(sha.clone());
        Ok(sha)
    }

    /// Remote branches containing `sha`, without the `origin/` prefix.
    async fn branches_containing(&self, sha: &str) -> Result<Vec<String>> {
        let (code, stdout, stderr) = self
            .cmd
            .run_git(&["branch", "-r", "--contains", sha], &self.repo_root)
            .await?;
        if code != 0 {
            return Err(git_err("branches_containing", stderr));
        }
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let branch = line.trim();
                if branch.is_empty() {
                    return None;
                }
                Some(
                    branch
                        .strip_prefix("origin/")
                        .unwrap_or(branch)
                        .to_string(),
                )
            })
            .collect())
    }

    /// Soft check that the baseline comes from the expected branch.
    /// Callers treat a failure as a warning, not an error.
    pub async fn validate_base_branch(&mut self, expected: &str) -> Result<bool> {
        let baseline = self.baseline_sha().await?;
        let branches = self.branches_containing(&baseline).await?;
        if branches.iter().any(|b| b == expected) {
            debug!(expected, "base branch validation passed");
            Ok(true)
        } else {
            Err(git_err(
                "validate_base_branch",
                format!(
                    "baseline {} is not on '{expected}' (found on: {})",
                    &baseline[..baseline.len().min(8)],
                    branches.join(", ")
                ),
            ))
        }
    }

    /// Hard reset to a SHA (default: baseline) and clean untracked.
    pub async fn reset(&mut self, sha: Option<&str>) -> Result<()> {
        let target = match sha {
            Some(sha) => sha.to_string(),
            None => self.baseline_sha.clone().ok_or(WorkspaceError::NoBaseline)?,
        };
        info!(sha = %target, "resetting worktree");

        let (code, _, stderr) = self
            .cmd
            .run_git(&["reset", "--hard", &target], &self.worktree_path)
            .await?;
        if code != 0 {
            return Err(git_err("reset", stderr));
        }
        self.cmd
            .run_git(&["clean", "-fd"], &self.worktree_path)
            .await?;
        Ok(())
    }

    /// Capture the full diff (staged + unstaged + untracked) into
    /// `out_path`, excluding named pathspecs. Staging state is
    /// restored afterwards.
    pub async fn diff_to(&self, out_path: &Path, exclude_patterns: &[String]) -> Result<()> {
        debug!(out = %out_path.display(), "capturing diff");
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Stage everything so untracked files show up in the diff.
        self.cmd.run_git(&["add", "-A"], &self.worktree_path).await?;

        let mut args: Vec<String> = vec![
            "diff".to_string(),
            "--cached".to_string(),
            "--patch".to_string(),
            "--no-color".to_string(),
        ];
        if !exclude_patterns.is_empty() {
            args.push("--".to_string());
            for pattern in exclude_patterns {
                args.push(format!(":(exclude){pattern}"));
            }
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let (code, stdout, stderr) = self.cmd.run_git(&arg_refs, &self.worktree_path).await?;

        // Restore staging before surfacing any error.
        self.cmd
            .run_git(&["reset", "--mixed", "HEAD"], &self.worktree_path)
            .await?;

        if code != 0 {
            return Err(git_err("diff_to", stderr));
        }
        drover_core::paths::write_atomic(out_path, stdout.as_bytes())?;
        Ok(())
    }

    /// True when the worktree has no changes at all.
    pub async fn diff_empty(&self) -> Result<bool> {
        let (code, stdout, _) = self
            .cmd
            .run_git(&["status", "--porcelain"], &self.worktree_path)
            .await?;
        if code != 0 {
            return Err(git_err("diff_empty", "git status failed"));
        }
        Ok(stdout.trim().is_empty())
    }

    /// Modified plus untracked file paths, relative to the worktree.
    pub async fn get_changed_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        let (_, stdout, _) = self
            .cmd
            .run_git(&["diff", "--name-only"], &self.worktree_path)
            .await?;
        files.extend(stdout.lines().filter(|l| !l.is_empty()).map(ToString::to_string));

        let (_, stdout, _) = self
            .cmd
            .run_git(&["status", "--porcelain"], &self.worktree_path)
            .await?;
        for line in stdout.lines() {
            if let Some(path) = line.strip_prefix("?? ") {
                files.push(path.trim().to_string());
            }
        }

        Ok(files)
    }

    /// Stage and commit everything; returns the new (or baseline, if
    /// nothing changed) SHA.
    pub async fn commit_all(&mut self, message: &str) -> Result<String> {
        info!("committing changes");
        self.cmd.run_git(&["add", "-A"], &self.worktree_path).await?;

        let (_, status, _) = self
            .cmd
            .run_git(&["status", "--porcelain"], &self.worktree_path)
            .await?;
        if status.trim().is_empty() {
            warn!("nothing to commit");
            return self.baseline_sha().await;
        }

        let (code, _, stderr) = self
            .cmd
            .run_git(&["commit", "-m", message], &self.worktree_path)
            .await?;
        if code != 0 {
            return Err(git_err("commit", stderr));
        }

        let (code, sha, stderr) = self
            .cmd
            .run_git(&["rev-parse", "HEAD"], &self.worktree_path)
            .await?;
        if code != 0 {
            return Err(git_err("commit", stderr));
        }
        Ok(sha.trim().to_string())
    }

    /// Force-push the worktree HEAD to `remote`/`branch`.
    pub async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        info!(remote, branch, "pushing to remote");
        let refspec = format!("HEAD:{branch}");
        let (code, _, stderr) = self
            .cmd
            .run_git(&["push", "--force", remote, &refspec], &self.worktree_path)
            .await?;
        if code != 0 {
            return Err(git_err("push", stderr));
        }
        Ok(())
    }

    /// Remove the worktree, falling back to a plain directory delete
    /// when git refuses.
    pub async fn remove(&mut self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }
        let worktree = self.worktree_path.display().to_string();
        let (code, _, _) = self
            .cmd
            .run_git(
                &["worktree", "remove", "--force", &worktree],
                &self.repo_root,
            )
            .await?;
        if code != 0 {
            warn!("git worktree remove failed, deleting directory");
            std::fs::remove_dir_all(&self.worktree_path)?;
        }
        Ok(())
    }
}
