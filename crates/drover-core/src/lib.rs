pub mod backlog;
pub mod config;
pub mod guardrails;
pub mod metrics;
pub mod paths;
pub mod prompts;
pub mod state;
pub mod types;

pub use backlog::{Backlog, WorkItem, WorkItemStatus};
pub use config::{Config, EngineType, ModelSelector, ReasoningEffort};
pub use guardrails::{GuardrailError, Guardrails};
pub use metrics::collector::MetricsCollector;
pub use metrics::schema::{
    compute_fingerprint, DiffStats, FailureCategory, GateMetrics, RunMetrics, StageMetrics,
    StageOutcome, TokenUsage,
};
pub use metrics::writer::MetricsWriter;
pub use paths::RunPaths;
pub use state::{RunState, StageStatus, StateError, StateStore};
pub use types::{RunId, Stage, StageExecStatus};
