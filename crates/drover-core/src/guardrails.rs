//! Allow/deny policy over the files a stage may touch.
//!
//! Patterns are globs where `**` spans any number of path segments and
//! `*` stays within one. Checks are pure: calling them twice has no
//! effect beyond the error they may return.

use crate::config::{GuardrailConfig, GuardrailMode};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("guardrail violation ({rule}): {}", files.join(", "))]
pub struct GuardrailError {
    pub rule: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Guardrails {
    config: GuardrailConfig,
}

impl Guardrails {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether a single file may be modified under the current mode.
    pub fn is_file_allowed(&self, file_path: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        match self.config.mode {
            GuardrailMode::Allowlist => {
                // An empty allowlist permits nothing.
                self.config
                    .allowed_patterns
                    .iter()
                    .any(|p| matches_pattern(file_path, p))
            }
            GuardrailMode::Blacklist => {
                if self
                    .config
                    .forbidden_patterns
                    .iter()
                    .any(|p| matches_pattern(file_path, p))
                {
                    return false;
                }
                !self.config.forbidden_paths.iter().any(|p| p == file_path)
            }
        }
    }

    /// Files in `changed_files` that are not allowed.
    pub fn violations(&self, changed_files: &[String]) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }
        changed_files
            .iter()
            .filter(|f| !self.is_file_allowed(f))
            .cloned()
            .collect()
    }

    /// Check a changed-file set against the policy.
    pub fn check_files(&self, changed_files: &[String]) -> Result<(), GuardrailError> {
        if !self.config.enabled {
            debug!("guardrails disabled");
            return Ok(());
        }

        if changed_files.len() > self.config.max_files_changed {
            return Err(GuardrailError {
                rule: "max_files_changed".to_string(),
                files: changed_files.to_vec(),
            });
        }

        let violations = self.violations(changed_files);
        if !violations.is_empty() {
            warn!(
                mode = ?self.config.mode,
                count = violations.len(),
                "guardrail violation"
            );
            return Err(GuardrailError {
                rule: "forbidden_files".to_string(),
                files: violations,
            });
        }

        debug!(file_count = changed_files.len(), "guardrails passed");
        Ok(())
    }

    /// Block artifact files from being created inside the worktree.
    /// Paths are checked relative to `worktree_root`.
    pub fn check_new_files(
        &self,
        new_files: &[String],
        worktree_root: &Path,
    ) -> Result<(), GuardrailError> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut violations = Vec::new();
        for file in new_files {
            let rel = Path::new(file)
                .strip_prefix(worktree_root)
                .map_or_else(|_| file.clone(), |p| p.to_string_lossy().to_string());
            if self
                .config
                .forbidden_new_files
                .iter()
                .any(|p| matches_pattern(&rel, p))
            {
                violations.push(rel);
            }
        }

        if !violations.is_empty() {
            warn!(count = violations.len(), "forbidden new files created in worktree");
            return Err(GuardrailError {
                rule: "forbidden_new_files".to_string(),
                files: violations,
            });
        }
        Ok(())
    }
}

/// Glob match with `**` spanning segments, `*` within one segment, and
/// a basename fallback so `*.env` catches `config/.env` style paths.
fn matches_pattern(file_path: &str, pattern: &str) -> bool {
    let path = file_path.replace('\\', "/");
    let pattern = pattern.replace('\\', "/");

    if glob_match(&path, &pattern) {
        return true;
    }

    // Basename match for patterns without a separator.
    if !pattern.contains('/') {
        if let Some(name) = path.rsplit('/').next() {
            if glob_match(name, &pattern) {
                return true;
            }
        }
        // Any single path component.
        if path.split('/').any(|part| glob_match(part, &pattern)) {
            return true;
        }
    }

    false
}

/// Segment-aware glob matcher.
fn glob_match(path: &str, pattern: &str) -> bool {
    let path_segs: Vec<&str> = path.split('/').collect();
    let pat_segs: Vec<&str> = pattern.split('/').collect();
    match_segments(&path_segs, &pat_segs)
}

fn match_segments(path: &[&str], pattern: &[&str]) -> bool {
    match (path, pattern) {
        ([], []) => true,
        (_, []) => false,
        (p, [first, rest @ ..]) => {
            if *first == "**" {
                // `**` matches zero or more whole segments.
                (0..=p.len()).any(|skip| match_segments(&p[skip..], rest))
            } else if let [seg, tail @ ..] = p {
                match_one_segment(seg, first) && match_segments(tail, rest)
            } else {
                false
            }
        }
    }
}

/// `*` and `?` within a single segment.
fn match_one_segment(segment: &str, pattern: &str) -> bool {
    let seg: Vec<char> = segment.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    match_chars(&seg, &pat)
}

fn match_chars(seg: &[char], pat: &[char]) -> bool {
    match (seg, pat) {
        ([], []) => true,
        (s, ['*', rest @ ..]) => (0..=s.len()).any(|skip| match_chars(&s[skip..], rest)),
        ([c, s_rest @ ..], [p, p_rest @ ..]) => {
            (*p == '?' || p == c) && match_chars(s_rest, p_rest)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardrailConfig;

    fn blacklist() -> Guardrails {
        Guardrails::new(GuardrailConfig::default())
    }

    fn allowlist(patterns: &[&str]) -> Guardrails {
        let config = GuardrailConfig {
            mode: GuardrailMode::Allowlist,
            allowed_patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
            ..GuardrailConfig::default()
        };
        Guardrails::new(config)
    }

    #[test]
    fn blacklist_blocks_env_and_secrets() {
        let guard = blacklist();
        assert!(!guard.is_file_allowed(".env"));
        assert!(!guard.is_file_allowed("config/.env.local"));
        assert!(!guard.is_file_allowed("deploy/secrets.yaml"));
        assert!(!guard.is_file_allowed("certs/server.pem"));
        assert!(guard.is_file_allowed("src/app.py"));
        assert!(guard.is_file_allowed("README.md"));
    }

    #[test]
    fn check_files_raises_on_forbidden() {
        let guard = blacklist();
        let files = vec!["src/app.py".to_string(), ".env".to_string()];
        let err = guard.check_files(&files).unwrap_err();
        assert_eq!(err.rule, "forbidden_files");
        assert_eq!(err.files, vec![".env"]);
    }

    #[test]
    fn check_files_is_idempotent() {
        let guard = blacklist();
        let files = vec!["src/app.py".to_string()];
        guard.check_files(&files).unwrap();
        guard.check_files(&files).unwrap();

        let bad = vec![".env".to_string()];
        assert!(guard.check_files(&bad).is_err());
        assert!(guard.check_files(&bad).is_err());
    }

    #[test]
    fn max_files_changed_enforced() {
        let config = GuardrailConfig {
            max_files_changed: 2,
            ..GuardrailConfig::default()
        };
        let guard = Guardrails::new(config);
        let files: Vec<String> = (0..3).map(|i| format!("src/f{i}.rs")).collect();
        let err = guard.check_files(&files).unwrap_err();
        assert_eq!(err.rule, "max_files_changed");
    }

    #[test]
    fn empty_allowlist_denies_everything() {
        let guard = allowlist(&[]);
        assert!(!guard.is_file_allowed("src/app.py"));
        assert!(!guard.is_file_allowed("anything"));
        assert!(guard
            .check_files(&["src/app.py".to_string()])
            .is_err());
    }

    #[test]
    fn allowlist_permits_matching_only() {
        let guard = allowlist(&["src/**/*.py", "tests/**"]);
        assert!(guard.is_file_allowed("src/app.py"));
        assert!(guard.is_file_allowed("src/pkg/deep/mod.py"));
        assert!(guard.is_file_allowed("tests/test_app.py"));
        assert!(!guard.is_file_allowed("setup.py"));
        assert!(!guard.is_file_allowed("src/app.rs"));
    }

    #[test]
    fn double_star_spans_zero_segments() {
        assert!(matches_pattern("src/app.py", "src/**/*.py"));
        assert!(matches_pattern("src/a/b/c.py", "src/**/*.py"));
        assert!(matches_pattern("src/lib.rs", "src/**"));
        assert!(!matches_pattern("other/app.py", "src/**/*.py"));
    }

    #[test]
    fn star_stays_within_segment() {
        assert!(matches_pattern("notes.env", "*.env"));
        assert!(!glob_match("dir/notes.env", "*.env"));
        // But the basename fallback still catches it.
        assert!(matches_pattern("dir/notes.env", "*.env"));
    }

    #[test]
    fn disabled_guardrails_allow_all() {
        let config = GuardrailConfig {
            enabled: false,
            ..GuardrailConfig::default()
        };
        let guard = Guardrails::new(config);
        assert!(guard.is_file_allowed(".env"));
        guard.check_files(&[".env".to_string()]).unwrap();
    }

    #[test]
    fn new_files_blocked_in_worktree() {
        let guard = blacklist();
        let root = Path::new("/work/tree");
        let files = vec!["/work/tree/pr_body.md".to_string()];
        let err = guard.check_new_files(&files, root).unwrap_err();
        assert_eq!(err.rule, "forbidden_new_files");
        assert_eq!(err.files, vec!["pr_body.md"]);

        let fine = vec!["/work/tree/src/app.py".to_string()];
        guard.check_new_files(&fine, root).unwrap();
    }
}
