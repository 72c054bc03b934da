//! Core identifier and stage types shared across the orchestrator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run.
///
/// Generated ids look like `20260801_143052_9f3ab1c2`: a UTC timestamp
/// prefix keeps directory listings roughly creation-ordered, the hex
/// suffix makes concurrent creation collision-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{stamp}_{}", &suffix[..8]))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stages of the run finite-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Plan,
    Spec,
    Decompose,
    ImplementItem,
    CaptureDiff,
    Verify,
    FixLoop,
    NextItem,
    Review,
    Ship,
    KnowledgeUpdate,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Spec => "spec",
            Self::Decompose => "decompose",
            Self::ImplementItem => "implement_item",
            Self::CaptureDiff => "capture_diff",
            Self::Verify => "verify",
            Self::FixLoop => "fix_loop",
            Self::NextItem => "next_item",
            Self::Review => "review",
            Self::Ship => "ship",
            Self::KnowledgeUpdate => "knowledge_update",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Stages that only exist inside the implement loop. They remain
    /// declared so historical state files keep parsing, but the engine
    /// iterates within `implement_item` and never transitions through
    /// them.
    pub fn is_loop_internal(self) -> bool {
        matches!(
            self,
            Self::CaptureDiff | Self::Verify | Self::FixLoop | Self::NextItem
        )
    }

    /// Terminal stages cannot be resumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageExecStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageExecStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}
