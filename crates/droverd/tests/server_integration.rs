//! HTTP facade integration tests driven through the axum router
//! without binding a socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use drover_core::config::Config;
use drover_core::paths::RunPaths;
use drover_core::state::StateStore;
use drover_core::types::{RunId, Stage};
use droverd::server::{create_router, AppState};
use droverd::worker::RunWorker;
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

fn app(base: &TempDir) -> axum::Router {
    let config = Config::default();
    let worker = Arc::new(RunWorker::new(
        config.clone(),
        base.path().to_path_buf(),
        2,
    ));
    let state = Arc::new(AppState {
        base_dir: base.path().to_path_buf(),
        config,
        worker,
    });
    create_router(state)
}

/// Seed a run directory with a state file at the given stage.
fn seed_run(base: &TempDir, run_id: &str, stage: Stage) -> RunPaths {
    let paths = RunPaths::create_with_id(base.path(), RunId::from_string(run_id)).unwrap();
    let mut store = StateStore::new(paths.clone());
    store.initialize().unwrap();
    if stage != Stage::Init {
        store.transition_to(stage).unwrap();
    }
    paths
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let base = TempDir::new().unwrap();
    let response = app(&base)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn list_runs_newest_first_with_paging() {
    let base = TempDir::new().unwrap();
    seed_run(&base, "20260801_080000_aaaa0001", Stage::Done);
    seed_run(&base, "20260801_090000_bbbb0002", Stage::ImplementItem);
    seed_run(&base, "20260801_100000_cccc0003", Stage::Failed);

    let response = app(&base)
        .oneshot(Request::get("/runs").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 3);
    let runs = json["runs"].as_array().unwrap();
    assert_eq!(runs[0]["run_id"], "20260801_100000_cccc0003");
    assert_eq!(runs[0]["status"], "fail");
    assert_eq!(runs[1]["status"], "running");
    assert_eq!(runs[2]["status"], "success");

    // active_only filters to running runs.
    let response = app(&base)
        .oneshot(
            Request::get("/runs?active_only=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    let runs = json["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["run_id"], "20260801_090000_bbbb0002");

    // limit/offset paging.
    let response = app(&base)
        .oneshot(
            Request::get("/runs?limit=1&offset=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["runs"].as_array().unwrap().len(), 1);
    assert_eq!(json["runs"][0]["run_id"], "20260801_090000_bbbb0002");
}

#[tokio::test]
async fn run_detail_includes_artifacts_and_state() {
    let base = TempDir::new().unwrap();
    let paths = seed_run(&base, "20260801_110000_dddd0004", Stage::Review);
    std::fs::write(paths.task_md(), "the task").unwrap();
    std::fs::write(paths.patch_diff(), "diff content").unwrap();

    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_110000_dddd0004")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "running");
    assert_eq!(json["state"]["current_stage"], "review");
    let artifacts: Vec<&str> = json["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert!(artifacts.contains(&"context/task.md"));
    assert!(artifacts.contains(&"artifacts/patch.diff"));
}

#[tokio::test]
async fn run_status_reports_diff_and_metrics_presence() {
    let base = TempDir::new().unwrap();
    let paths = seed_run(&base, "20260801_120000_eeee0005", Stage::Verify);
    std::fs::write(paths.patch_diff(), "x").unwrap();

    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_120000_eeee0005/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["status"], "running");
    assert_eq!(json["current_stage"], "verify");
    assert_eq!(json["has_diff"], true);
    assert_eq!(json["has_metrics"], false);
    assert!(json["elapsed_ms"].as_i64().unwrap() >= 0);
}

#[tokio::test]
async fn unknown_run_is_404() {
    let base = TempDir::new().unwrap();
    for uri in [
        "/runs/nope",
        "/runs/nope/status",
        "/runs/nope/logs/stdout.log",
        "/runs/nope/artifacts/context/task.md",
    ] {
        let response = app(&base)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn start_run_validates_task() {
    let base = TempDir::new().unwrap();
    let response = app(&base)
        .oneshot(
            Request::post("/runs/start")
                .header("content-type", "application/json")
                .body(Body::from("{\"task\": \"\"}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_semantics() {
    let base = TempDir::new().unwrap();
    seed_run(&base, "20260801_130000_ffff0006", Stage::Done);

    // Unknown run: 404.
    let response = app(&base)
        .oneshot(
            Request::post("/runs/nope/cancel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Known but finished run: 409.
    let response = app(&base)
        .oneshot(
            Request::post("/runs/20260801_130000_ffff0006/cancel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn restart_conflicts_for_unknown_run() {
    let base = TempDir::new().unwrap();
    let response = app(&base)
        .oneshot(
            Request::post("/runs/nope/restart")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn artifacts_are_served_with_whitelisted_extensions_only() {
    let base = TempDir::new().unwrap();
    let paths = seed_run(&base, "20260801_140000_abab0007", Stage::Done);
    std::fs::write(paths.task_md(), "task body").unwrap();
    std::fs::write(paths.artifacts_dir().join("binary.bin"), "nope").unwrap();

    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_140000_abab0007/artifacts/context/task.md")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"task body");

    // Non-whitelisted extension.
    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_140000_abab0007/artifacts/artifacts/binary.bin")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Outside the public subdirectories.
    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_140000_abab0007/artifacts/metrics/run.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Traversal attempts must 404.
    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_140000_abab0007/artifacts/context/..%2F..%2Fstate.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn log_tail_with_cursor() {
    let base = TempDir::new().unwrap();
    let paths = seed_run(&base, "20260801_150000_cdcd0008", Stage::ImplementItem);
    let log_path = paths.logs_dir().join("run.log");
    let content: String = (1..=10).map(|i| format!("line {i}\n")).collect();
    std::fs::write(&log_path, content).unwrap();

    // cursor=-1 tails from the end.
    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_150000_cdcd0008/logs/run.log?cursor=-1&lines=3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let lines: Vec<&str> = json["lines"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(lines, vec!["line 8", "line 9", "line 10"]);
    assert_eq!(json["cursor"], 10);
    assert_eq!(json["total_lines"], 10);

    // Explicit cursor pages forward.
    let response = app(&base)
        .oneshot(
            Request::get("/runs/20260801_150000_cdcd0008/logs/run.log?cursor=2&lines=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    let lines: Vec<&str> = json["lines"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(lines, vec!["line 3", "line 4"]);
}

#[tokio::test]
async fn config_engines_describes_catalog() {
    let base = TempDir::new().unwrap();
    let response = app(&base)
        .oneshot(Request::get("/config/engines").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["default_engine"], "codex");
    let engines = json["engines"].as_array().unwrap();
    assert_eq!(engines.len(), 6);
    assert!(engines.iter().any(|e| e["value"] == "claude_code"));
    let stages = json["stages"].as_array().unwrap();
    assert!(stages.iter().any(|s| s == "knowledge_update"));
    assert_eq!(json["reasoning_levels"].as_array().unwrap().len(), 3);
}
