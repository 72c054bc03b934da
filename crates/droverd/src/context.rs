//! Repo context pack: lightweight snapshots of the target repository
//! handed to the planning stages so the agent does not start blind.
//!
//! Three files land in `context/`: a bounded project map, a tooling
//! snapshot built from well-known manifests, and the verify command
//! list derived from the configured gates.

use crate::gates::Gate;
use drover_core::paths::{write_atomic, RunPaths};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Directories never worth mapping.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
    ".worktrees",
];

const MAX_MAP_ENTRIES: usize = 400;
const MAX_DEPTH: usize = 4;

/// Manifest files that identify the toolchain.
const MANIFESTS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust / cargo"),
    ("pyproject.toml", "python / pyproject"),
    ("setup.py", "python / setuptools"),
    ("requirements.txt", "python / pip"),
    ("package.json", "javascript / npm"),
    ("go.mod", "go / modules"),
    ("Makefile", "make"),
    ("Dockerfile", "docker"),
    ("docker-compose.yml", "docker compose"),
];

/// Write all three context files for a run. Failures are soft; the
/// pipeline can proceed without a pack.
pub fn build_context_pack(paths: &RunPaths, repo_root: &Path, gates: &[Gate]) {
    let map = project_map(repo_root);
    let _ = write_atomic(&paths.project_map_md(), map.as_bytes());

    let snapshot = tooling_snapshot(repo_root);
    let _ = write_atomic(&paths.tooling_snapshot_md(), snapshot.as_bytes());

    let commands = verify_commands(gates);
    let _ = write_atomic(&paths.verify_commands_md(), commands.as_bytes());

    debug!("context pack written");
}

/// Bounded file tree plus a per-extension histogram.
pub fn project_map(repo_root: &Path) -> String {
    let mut entries: Vec<String> = Vec::new();
    let mut histogram: BTreeMap<String, usize> = BTreeMap::new();
    walk(repo_root, repo_root, 0, &mut entries, &mut histogram);

    let truncated = entries.len() >= MAX_MAP_ENTRIES;
    let mut out = String::from("# Project map\n\n");
    for entry in &entries {
        out.push_str("- ");
        out.push_str(entry);
        out.push('\n');
    }
    if truncated {
        out.push_str("- ... (truncated)\n");
    }

    if !histogram.is_empty() {
        out.push_str("\n## File types\n\n");
        let mut counts: Vec<(&String, &usize)> = histogram.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (ext, count) in counts.into_iter().take(15) {
            out.push_str(&format!("- .{ext}: {count}\n"));
        }
    }
    out
}

fn walk(
    root: &Path,
    dir: &Path,
    depth: usize,
    entries: &mut Vec<String>,
    histogram: &mut BTreeMap<String, usize>,
) {
    if depth > MAX_DEPTH || entries.len() >= MAX_MAP_ENTRIES {
        return;
    }
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    let mut children: Vec<_> = read_dir.filter_map(|e| e.ok()).collect();
    children.sort_by_key(std::fs::DirEntry::file_name);

    for child in children {
        if entries.len() >= MAX_MAP_ENTRIES {
            return;
        }
        let name = child.file_name().to_string_lossy().to_string();
        if name.starts_with('.') && name != ".github" {
            continue;
        }
        let path = child.path();
        let rel = path
            .strip_prefix(root)
            .map_or_else(|_| name.clone(), |p| p.to_string_lossy().to_string());

        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            entries.push(format!("{rel}/"));
            walk(root, &path, depth + 1, entries, histogram);
        } else {
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                *histogram.entry(ext.to_string()).or_insert(0) += 1;
            }
            entries.push(rel);
        }
    }
}

/// Which toolchains the repository carries, by manifest presence.
pub fn tooling_snapshot(repo_root: &Path) -> String {
    let mut out = String::from("# Tooling snapshot\n\n");
    let mut found = false;
    for (manifest, description) in MANIFESTS {
        if repo_root.join(manifest).exists() {
            out.push_str(&format!("- {manifest}: {description}\n"));
            found = true;
        }
    }
    if !found {
        out.push_str("- no recognized manifests\n");
    }
    out
}

/// The gate commands a change must pass, for the implement prompt.
pub fn verify_commands(gates: &[Gate]) -> String {
    let mut out = String::from("# Verify commands\n\n");
    if gates.is_empty() {
        out.push_str("- none configured\n");
        return out;
    }
    for gate in gates {
        let required = if gate.required { "required" } else { "optional" };
        out.push_str(&format!(
            "- {} ({required}): {} {}\n",
            gate.name,
            gate.command,
            gate.args.join(" ")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn project_map_lists_files_and_skips_noise() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi").unwrap();

        let map = project_map(dir.path());
        assert!(map.contains("src/main.rs"));
        assert!(map.contains("README.md"));
        assert!(!map.contains(".git"));
        assert!(!map.contains("target/"));
        assert!(map.contains(".rs: 2"));
    }

    #[test]
    fn tooling_snapshot_detects_manifests() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:").unwrap();

        let snapshot = tooling_snapshot(dir.path());
        assert!(snapshot.contains("Cargo.toml: rust / cargo"));
        assert!(snapshot.contains("Makefile: make"));
        assert!(!snapshot.contains("go.mod"));
    }

    #[test]
    fn tooling_snapshot_empty_repo() {
        let dir = TempDir::new().unwrap();
        assert!(tooling_snapshot(dir.path()).contains("no recognized manifests"));
    }

    #[test]
    fn verify_commands_reflect_gates() {
        let gates = vec![
            Gate {
                name: "ruff".to_string(),
                command: "ruff".to_string(),
                args: vec!["check".to_string(), ".".to_string()],
                required: true,
            },
            Gate {
                name: "lint".to_string(),
                command: "cargo".to_string(),
                args: vec!["clippy".to_string()],
                required: false,
            },
        ];
        let commands = verify_commands(&gates);
        assert!(commands.contains("ruff (required): ruff check ."));
        assert!(commands.contains("lint (optional): cargo clippy"));
    }

    #[test]
    fn context_pack_writes_all_files() {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("Cargo.toml"), "[package]").unwrap();

        build_context_pack(&paths, repo.path(), &[]);
        assert!(paths.project_map_md().exists());
        assert!(paths.tooling_snapshot_md().exists());
        assert!(paths.verify_commands_md().exists());
    }
}
