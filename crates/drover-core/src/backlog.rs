//! Backlog of work items produced by the decompose stage.
//!
//! Agents return the backlog as YAML, frequently wrapped in markdown
//! fences or prose; parsing is layered so each recovery strategy fails
//! soft before the next is tried.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("backlog file not found: {0}")]
    NotFound(std::path::PathBuf),
    #[error("invalid backlog yaml: {0}")]
    Parse(String),
    #[error("invalid work item: {0}")]
    InvalidItem(String),
    #[error("duplicate work item id: {0}")]
    DuplicateId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BacklogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// A settled item needs no further work.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

/// Smallest unit of change the implementation loop iterates over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub objective: String,
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub files_hint: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: WorkItemStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub notes: String,
}

fn is_valid_item_id(id: &str) -> bool {
    id.len() == 4
        && id.starts_with('W')
        && id[1..].chars().all(|c| c.is_ascii_digit())
}

impl WorkItem {
    /// Validate the structural constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_item_id(&self.id) {
            return Err(BacklogError::InvalidItem(format!(
                "id must match W followed by three digits, got '{}'",
                self.id
            )));
        }
        if self.title.is_empty() || self.title.len() > 200 {
            return Err(BacklogError::InvalidItem(format!(
                "{}: title must be 1..=200 characters",
                self.id
            )));
        }
        if self.objective.is_empty() {
            return Err(BacklogError::InvalidItem(format!(
                "{}: objective must not be empty",
                self.id
            )));
        }
        if self.acceptance.is_empty() {
            return Err(BacklogError::InvalidItem(format!(
                "{}: at least one acceptance criterion required",
                self.id
            )));
        }
        for dep in &self.depends_on {
            if !is_valid_item_id(dep) {
                return Err(BacklogError::InvalidItem(format!(
                    "{}: invalid dependency id '{dep}'",
                    self.id
                )));
            }
        }
        Ok(())
    }

    pub fn mark_in_progress(&mut self) {
        self.status = WorkItemStatus::InProgress;
    }

    pub fn mark_done(&mut self) {
        self.status = WorkItemStatus::Done;
    }

    pub fn mark_failed(&mut self, notes: &str) {
        self.status = WorkItemStatus::Failed;
        if !notes.is_empty() {
            self.notes = notes.to_string();
        }
    }

    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }
}

/// Ordered backlog for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backlog {
    pub run_id: String,
    #[serde(default)]
    pub items: Vec<WorkItem>,
}

impl Backlog {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            items: Vec::new(),
        }
    }

    pub fn add_item(&mut self, item: WorkItem) -> Result<()> {
        item.validate()?;
        if self.items.iter().any(|existing| existing.id == item.id) {
            return Err(BacklogError::DuplicateId(item.id));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn get_item(&self, item_id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn get_item_mut(&mut self, item_id: &str) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }

    fn deps_satisfied(&self, item: &WorkItem) -> bool {
        item.depends_on.iter().all(|dep| {
            self.get_item(dep)
                .is_some_and(|d| d.status == WorkItemStatus::Done)
        })
    }

    /// First item in insertion order that is `todo` with all
    /// dependencies `done`.
    pub fn get_next_todo(&self) -> Option<&WorkItem> {
        self.items
            .iter()
            .find(|item| item.status == WorkItemStatus::Todo && self.deps_satisfied(item))
    }

    pub fn all_done(&self) -> bool {
        self.items.iter().all(|i| i.status == WorkItemStatus::Done)
    }

    /// True when no item can make further progress.
    pub fn all_settled(&self) -> bool {
        self.items.iter().all(|i| i.status.is_settled())
    }

    pub fn todo_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Todo)
            .count()
    }

    pub fn done_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Done)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == WorkItemStatus::Failed)
            .count()
    }

    /// Errors for unknown and self-referential dependencies.
    pub fn validate_dependencies(&self) -> Vec<String> {
        let ids: HashSet<&str> = self.items.iter().map(|i| i.id.as_str()).collect();
        let mut errors = Vec::new();
        for item in &self.items {
            for dep in &item.depends_on {
                if !ids.contains(dep.as_str()) {
                    errors.push(format!("item {} depends on unknown item {dep}", item.id));
                }
                if dep == &item.id {
                    errors.push(format!("item {} depends on itself", item.id));
                }
            }
        }
        errors
    }

    /// DFS cycle detection; returns human-readable cycle paths.
    pub fn detect_cycles(&self) -> Vec<String> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();

        for item in &self.items {
            if !visited.contains(&item.id) {
                let mut stack: Vec<String> = Vec::new();
                self.dfs_cycles(&item.id, &mut visited, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    fn dfs_cycles(
        &self,
        item_id: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<String>,
    ) {
        visited.insert(item_id.to_string());
        stack.push(item_id.to_string());

        if let Some(item) = self.get_item(item_id) {
            for dep in &item.depends_on {
                if let Some(pos) = stack.iter().position(|s| s == dep) {
                    let mut path: Vec<String> = stack[pos..].to_vec();
                    path.push(dep.clone());
                    cycles.push(path.join(" -> "));
                } else if !visited.contains(dep) {
                    self.dfs_cycles(dep, visited, stack, cycles);
                }
            }
        }
        stack.pop();
    }

    /// Merge items into at most `max_items` batches. Grouping is by
    /// insertion order; titles, acceptance criteria, file hints, and
    /// cross-group dependencies are merged deterministically. A backlog
    /// already within the bound is returned unchanged.
    pub fn coalesce(&self, max_items: usize) -> Self {
        if max_items == 0 || self.items.len() <= max_items {
            return self.clone();
        }

        let group_size = self.items.len().div_ceil(max_items);
        let groups: Vec<&[WorkItem]> = self.items.chunks(group_size).collect();

        let group_of: std::collections::HashMap<&str, usize> = groups
            .iter()
            .enumerate()
            .flat_map(|(idx, group)| group.iter().map(move |item| (item.id.as_str(), idx)))
            .collect();
        let group_ids: Vec<String> =
            (0..groups.len()).map(|i| format!("W{:03}", i + 1)).collect();

        fn unique(values: Vec<String>) -> Vec<String> {
            let mut seen = HashSet::new();
            values
                .into_iter()
                .filter(|v| seen.insert(v.clone()))
                .collect()
        }

        let mut merged = Vec::with_capacity(groups.len());
        for (idx, group) in groups.iter().enumerate() {
            let merged_ids: Vec<&str> = group.iter().map(|i| i.id.as_str()).collect();
            let (title, objective, notes) = if group.len() > 1 {
                (
                    format!("Batch {}: {} + {} more", idx + 1, group[0].title, group.len() - 1),
                    group
                        .iter()
                        .map(|i| i.objective.clone())
                        .collect::<Vec<_>>()
                        .join("; "),
                    format!("Merged from {}", merged_ids.join(", ")),
                )
            } else {
                (
                    group[0].title.clone(),
                    group[0].objective.clone(),
                    group[0].notes.clone(),
                )
            };

            let mut acceptance: Vec<String> = group
                .iter()
                .flat_map(|item| {
                    item.acceptance.iter().map(move |criterion| {
                        if group.len() > 1 {
                            format!("{}: {criterion}", item.id)
                        } else {
                            criterion.clone()
                        }
                    })
                })
                .collect();
            acceptance = unique(acceptance);
            if acceptance.is_empty() {
                acceptance = vec![format!("Complete {title}")];
            }

            let files_hint = unique(
                group
                    .iter()
                    .flat_map(|i| i.files_hint.iter().cloned())
                    .collect(),
            );

            let depends_on = unique(
                group
                    .iter()
                    .flat_map(|item| item.depends_on.iter())
                    .filter_map(|dep| {
                        let dep_group = *group_of.get(dep.as_str())?;
                        (dep_group != idx).then(|| group_ids[dep_group].clone())
                    })
                    .collect(),
            );

            merged.push(WorkItem {
                id: group_ids[idx].clone(),
                title,
                objective,
                acceptance,
                files_hint,
                depends_on,
                status: WorkItemStatus::Todo,
                attempts: 0,
                notes,
            });
        }

        Self {
            run_id: self.run_id.clone(),
            items: merged,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| BacklogError::Parse(e.to_string()))
    }

    /// Parse from agent output: strips a single leading markdown code
    /// fence, then validates every item and the dependency graph.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let cleaned = strip_code_fence(content);
        let backlog: Self = serde_yaml::from_str(cleaned)
            .map_err(|e| BacklogError::Parse(e.to_string()))?;

        let mut seen = HashSet::new();
        for item in &backlog.items {
            item.validate()?;
            if !seen.insert(item.id.clone()) {
                return Err(BacklogError::DuplicateId(item.id.clone()));
            }
        }
        let cycles = backlog.detect_cycles();
        if !cycles.is_empty() {
            return Err(BacklogError::Parse(format!(
                "dependency cycles: {}",
                cycles.join("; ")
            )));
        }
        Ok(backlog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BacklogError::NotFound(path.to_path_buf()));
        }
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = self.to_yaml()?;
        crate::paths::write_atomic(path, yaml.as_bytes())?;
        Ok(())
    }
}

/// Strip a single wrapping markdown code fence, if present.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return text;
    }
    let mut lines = trimmed.lines();
    let Some(_fence) = lines.next() else {
        return text;
    };
    let rest: Vec<&str> = lines.collect();
    let Some(end_idx) = rest.iter().position(|l| l.trim() == "```") else {
        return text;
    };
    let inner_start = trimmed.find('\n').map_or(trimmed.len(), |i| i + 1);
    let inner = &trimmed[inner_start..];
    // Locate the closing fence byte offset within inner.
    let mut offset = 0;
    for (i, line) in inner.lines().enumerate() {
        if i == end_idx {
            return inner[..offset].trim();
        }
        offset += line.len() + 1;
    }
    text
}

/// Recover a YAML mapping from noisy agent output. Strategies are
/// tried in order; each failure is non-fatal.
pub fn extract_yaml(text: &str) -> Option<serde_yaml::Value> {
    // 1. Direct parse.
    if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(text) {
        if value.is_mapping() {
            debug!(strategy = "direct", "yaml extraction succeeded");
            return Some(value);
        }
    }

    // 2. Strip a markdown fence.
    let stripped = strip_code_fence(text);
    if stripped != text {
        if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(stripped) {
            if value.is_mapping() {
                debug!(strategy = "fence", "yaml extraction succeeded");
                return Some(value);
            }
        }
    }

    // 3. JSON wrapper with a `response` field holding the payload.
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(response) = json.get("response").and_then(|r| r.as_str()) {
            let inner = strip_code_fence(response);
            if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(inner) {
                if value.is_mapping() {
                    debug!(strategy = "json_wrapper", "yaml extraction succeeded");
                    return Some(value);
                }
            }
        }
    }

    // 4. Scan for the first parseable mapping, starting at each line
    // that looks like a top-level key.
    for (idx, line) in text.lines().enumerate() {
        let looks_like_key = line
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && line.contains(':');
        if !looks_like_key {
            continue;
        }
        let candidate: String = text
            .lines()
            .skip(idx)
            .take_while(|l| !l.trim_start().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n");
        if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(&candidate) {
            if value.is_mapping() {
                debug!(strategy = "scan", line = idx, "yaml extraction succeeded");
                return Some(value);
            }
        }
    }

    warn!("yaml extraction failed after all strategies");
    None
}
