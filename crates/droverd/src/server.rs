//! HTTP read/control facade over the run filesystem.
//!
//! The server reads the same artifacts the runner writes and controls
//! runs through the in-process worker pool. Bound to localhost only;
//! all responses are JSON.

use crate::worker::{CancelOutcome, RunWorker, StartError, StartRequest};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use drover_core::config::{Config, EngineType};
use drover_core::metrics::writer::read_stages_from;
use drover_core::state::RunState;
use drover_core::types::Stage;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

const SERVED_EXTENSIONS: &[&str] = &[
    "md", "json", "jsonl", "yaml", "yml", "diff", "txt", "log",
];

pub struct AppState {
    pub base_dir: PathBuf,
    pub config: Config,
    pub worker: Arc<RunWorker>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs))
        .route("/runs/start", post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/status", get(run_status))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/restart", post(restart_run))
        .route("/runs/{id}/logs/{name}", get(tail_log))
        .route("/runs/{id}/artifacts/{*relpath}", get(serve_artifact))
        .route("/config/engines", get(config_engines))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on localhost; the facade is single-user by design.
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("dashboard listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

// --- status taxonomy ---

/// Facade-level status: running, success, fail, cancelled, unknown.
fn status_for_run(run_dir: &Path, state: Option<&RunState>) -> &'static str {
    // A completed run.json is authoritative for the final status.
    if let Ok(content) = std::fs::read_to_string(run_dir.join("metrics/run.json")) {
        if let Ok(run) = serde_json::from_str::<serde_json::Value>(&content) {
            match run.get("final_status").and_then(|s| s.as_str()) {
                Some("success") => return "success",
                Some("fail") | Some("timeout") => return "fail",
                Some("cancel") => return "cancelled",
                _ => {}
            }
        }
    }
    match state.map(|s| s.current_stage) {
        Some(Stage::Done) => "success",
        Some(Stage::Failed) => "fail",
        Some(_) => "running",
        None => "unknown",
    }
}

fn load_state(run_dir: &Path) -> Option<RunState> {
    let content = std::fs::read_to_string(run_dir.join("state.json")).ok()?;
    serde_json::from_str(&content).ok()
}

// --- handlers ---

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    #[serde(default)]
    active_only: Option<bool>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: String,
    status: String,
    current_stage: Option<String>,
    current_item_id: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let runs_dir = state.base_dir.join("runs");
    let mut run_ids: Vec<String> = std::fs::read_dir(&runs_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|name| !name.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();

    // Run ids sort by creation time; newest first.
    run_ids.sort_by(|a, b| b.cmp(a));

    let mut summaries = Vec::new();
    for run_id in run_ids {
        let run_dir = runs_dir.join(&run_id);
        let run_state = load_state(&run_dir);
        let status = status_for_run(&run_dir, run_state.as_ref());
        if query.active_only == Some(true) && status != "running" {
            continue;
        }
        summaries.push(RunSummary {
            run_id,
            status: status.to_string(),
            current_stage: run_state
                .as_ref()
                .map(|s| s.current_stage.as_str().to_string()),
            current_item_id: run_state.as_ref().and_then(|s| s.current_item_id.clone()),
            created_at: run_state.as_ref().map(|s| s.created_at.to_rfc3339()),
            updated_at: run_state.as_ref().map(|s| s.updated_at.to_rfc3339()),
        });
    }

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50);
    let page: Vec<&RunSummary> = summaries.iter().skip(offset).take(limit).collect();
    Json(serde_json::json!({
        "runs": page,
        "total": summaries.len(),
    }))
    .into_response()
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let run_dir = run_dir_for(&state, &run_id)?;
    let run_state = load_state(&run_dir);
    let status = status_for_run(&run_dir, run_state.as_ref());

    // Index of servable artifacts relative to the run directory.
    let mut artifacts: Vec<String> = Vec::new();
    for sub in ["context", "artifacts", "prompts"] {
        let dir = run_dir.join(sub);
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                if entry.path().is_file() {
                    artifacts.push(format!(
                        "{sub}/{}",
                        entry.file_name().to_string_lossy()
                    ));
                }
            }
        }
    }
    artifacts.sort();

    let metrics_summary = std::fs::read_to_string(run_dir.join("metrics/run.json"))
        .ok()
        .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok());
    let stage_records = read_stages_from(&run_dir.join("metrics/stages.jsonl"));

    let last_error = run_state.as_ref().and_then(|s| {
        s.stage_statuses
            .values()
            .filter_map(|status| status.error.clone())
            .next_back()
    });
    let last_failure_evidence = run_state
        .as_ref()
        .map(|s| s.last_failure_evidence.clone())
        .unwrap_or_default();

    Ok(Json(serde_json::json!({
        "run_id": run_id,
        "status": status,
        "state": run_state,
        "artifacts": artifacts,
        "metrics_summary": metrics_summary,
        "stage_records": stage_records.len(),
        "last_error": last_error,
        "last_failure_evidence": last_failure_evidence,
    })))
}

async fn run_status(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let run_dir = run_dir_for(&state, &run_id)?;
    let run_state = load_state(&run_dir);
    let status = status_for_run(&run_dir, run_state.as_ref());

    let elapsed_ms = run_state.as_ref().map(|s| {
        let end = if s.current_stage.is_terminal() {
            s.updated_at
        } else {
            chrono::Utc::now()
        };
        (end - s.created_at).num_milliseconds().max(0)
    });

    Ok(Json(serde_json::json!({
        "run_id": run_id,
        "status": status,
        "current_stage": run_state.as_ref().map(|s| s.current_stage.as_str()),
        "elapsed_ms": elapsed_ms,
        "has_diff": run_dir.join("artifacts/patch.diff").exists(),
        "has_metrics": run_dir.join("metrics/stages.jsonl").exists(),
    })))
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    match state.worker.start_run(request) {
        Ok(run_id) => Ok(Json(serde_json::json!({
            "run_id": run_id,
            "status": "queued",
        }))),
        Err(StartError::Invalid(message)) => {
            Err(error_response(StatusCode::BAD_REQUEST, message))
        }
        Err(StartError::Saturated) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "worker pool saturated",
        )),
        Err(StartError::Internal(message)) => {
            error!(message, "failed to start run");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, message))
        }
    }
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    match state.worker.cancel_run(&run_id) {
        CancelOutcome::Initiated => Ok(Json(serde_json::json!({
            "run_id": run_id,
            "status": "cancelled",
            "message": "cancellation initiated",
        }))),
        CancelOutcome::NotFound => Err(error_response(StatusCode::NOT_FOUND, "run not found")),
        CancelOutcome::NotActive => Err(error_response(
            StatusCode::CONFLICT,
            "run is not running (it may have already finished)",
        )),
    }
}

async fn restart_run(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let _ = run_dir_for(&state, &run_id)?;
    if state.worker.is_active(&run_id) {
        return Err(error_response(
            StatusCode::CONFLICT,
            "run is still active, cannot restart",
        ));
    }

    // Restart with the original request when we have it; otherwise
    // rebuild the essentials from the run directory.
    let request = state.worker.request_for(&run_id).unwrap_or_else(|| {
        let task = std::fs::read_to_string(
            state
                .base_dir
                .join("runs")
                .join(&run_id)
                .join("context/task.md"),
        )
        .unwrap_or_default();
        StartRequest {
            task,
            repo_path: None,
            base_branch: None,
            pipeline: None,
            config_overrides: serde_json::Value::Null,
        }
    });

    match state.worker.start_run(request) {
        Ok(new_run_id) => Ok(Json(serde_json::json!({
            "status": "restarted",
            "original_run_id": run_id,
            "new_run_id": new_run_id,
        }))),
        Err(StartError::Invalid(message)) => {
            Err(error_response(StatusCode::BAD_REQUEST, message))
        }
        Err(StartError::Saturated) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "worker pool saturated",
        )),
        Err(StartError::Internal(message)) => {
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, message))
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TailQuery {
    #[serde(default)]
    cursor: Option<i64>,
    #[serde(default)]
    lines: Option<usize>,
}

async fn tail_log(
    State(state): State<Arc<AppState>>,
    AxumPath((run_id, name)): AxumPath<(String, String)>,
    Query(query): Query<TailQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let run_dir = run_dir_for(&state, &run_id)?;
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(error_response(StatusCode::NOT_FOUND, "log not found"));
    }

    // Logs live flat or one directory deep (stage dirs); try both.
    let mut candidates = vec![run_dir.join("logs").join(&name)];
    if let Ok(entries) = std::fs::read_dir(run_dir.join("logs")) {
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.path().is_dir() {
                candidates.push(entry.path().join(&name));
            }
        }
    }
    let Some(path) = candidates.into_iter().find(|p| p.is_file()) else {
        return Err(error_response(StatusCode::NOT_FOUND, "log not found"));
    };

    let content = std::fs::read_to_string(&path).unwrap_or_default();
    let all_lines: Vec<&str> = content.lines().collect();
    let page_size = query.lines.unwrap_or(100);
    let cursor = query.cursor.unwrap_or(-1);

    // cursor < 0 means "from the end".
    let start = if cursor < 0 {
        all_lines.len().saturating_sub(page_size)
    } else {
        (cursor as usize).min(all_lines.len())
    };
    let page: Vec<&str> = all_lines.iter().skip(start).take(page_size).copied().collect();
    let next_cursor = start + page.len();

    Ok(Json(serde_json::json!({
        "run_id": run_id,
        "name": name,
        "lines": page,
        "cursor": next_cursor,
        "total_lines": all_lines.len(),
    })))
}

async fn serve_artifact(
    State(state): State<Arc<AppState>>,
    AxumPath((run_id, relpath)): AxumPath<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let run_dir = run_dir_for(&state, &run_id)?;

    // Only files under the three public subdirectories are served.
    let allowed = ["context/", "artifacts/", "prompts/"];
    if !allowed.iter().any(|prefix| relpath.starts_with(prefix)) {
        return Err(error_response(StatusCode::NOT_FOUND, "artifact not found"));
    }
    if relpath.contains("..") || relpath.contains('\\') {
        return Err(error_response(StatusCode::NOT_FOUND, "artifact not found"));
    }

    let extension = Path::new(&relpath)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    if !SERVED_EXTENSIONS.contains(&extension) {
        return Err(error_response(StatusCode::NOT_FOUND, "artifact not found"));
    }

    let path = run_dir.join(&relpath);
    // Belt and braces: the resolved path must stay inside the run dir.
    let canonical = path.canonicalize().ok();
    let run_canonical = run_dir.canonicalize().ok();
    match (canonical, run_canonical) {
        (Some(file), Some(root)) if file.starts_with(&root) => {
            let content = std::fs::read_to_string(&file)
                .map_err(|_| error_response(StatusCode::NOT_FOUND, "artifact not found"))?;
            Ok(content)
        }
        _ => Err(error_response(StatusCode::NOT_FOUND, "artifact not found")),
    }
}

async fn config_engines(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engines: Vec<serde_json::Value> = EngineType::all()
        .into_iter()
        .map(|engine| {
            serde_json::json!({
                "value": engine.as_str(),
                "label": engine.as_str(),
                "is_test": engine == EngineType::Fake,
                "default_binary": engine.default_binary(),
            })
        })
        .collect();

    let stages: Vec<&str> = vec![
        "plan",
        "spec",
        "decompose",
        "implement",
        "fix",
        "verify",
        "review",
        "ship",
        "knowledge_update",
    ];

    Json(serde_json::json!({
        "engines": engines,
        "stages": stages,
        "reasoning_levels": ["low", "medium", "high"],
        "default_engine": state.config.engine.engine_type.as_str(),
    }))
}

fn run_dir_for(
    state: &AppState,
    run_id: &str,
) -> Result<PathBuf, (StatusCode, Json<ErrorBody>)> {
    if run_id.contains("..") || run_id.contains('/') || run_id.contains('\\') {
        return Err(error_response(StatusCode::NOT_FOUND, "run not found"));
    }
    let dir = state.base_dir.join("runs").join(run_id);
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(error_response(StatusCode::NOT_FOUND, "run not found"))
    }
}
