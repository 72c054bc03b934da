//! End-to-end runs driven by the scripted fake executor against a
//! real git repository in a tempdir.

use drover_core::backlog::{Backlog, WorkItemStatus};
use drover_core::config::{
    Config, EngineType, FallbackMatch, FallbackRule, FallbackSwitch, GateConfig,
};
use drover_core::metrics::schema::StageOutcome;
use drover_core::metrics::writer::read_stages_from;
use drover_core::state::{RunState, StateStore};
use drover_core::types::{RunId, Stage};
use droverd::command::CommandRunner;
use droverd::executors::fake::{FakeApply, FakeExecutor};
use droverd::runner::Runner;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

async fn init_repo(dir: &Path) {
    let cmd = CommandRunner::default();
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@test.dev"],
        vec!["config", "user.name", "Test"],
    ] {
        let (code, _, stderr) = cmd.run_git(&args, dir).await.unwrap();
        assert_eq!(code, 0, "{stderr}");
    }
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(dir.join("src/app.py"), "def add(a, b):\n    return 0\n").unwrap();
    cmd.run_git(&["add", "."], dir).await.unwrap();
    let (code, _, stderr) = cmd.run_git(&["commit", "-m", "initial"], dir).await.unwrap();
    assert_eq!(code, 0, "{stderr}");
}

/// A gate that passes once src/app.py contains the correct addition.
fn check_gate() -> GateConfig {
    GateConfig {
        name: "check".to_string(),
        enabled: true,
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "grep -q 'a + b' src/app.py".to_string(),
        ],
        required: true,
    }
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.engine.engine_type = EngineType::Fake;
    config.gates = vec![check_gate()];
    config.git.auto_commit = true;
    config.git.auto_push = false;
    config.knowledge.enabled = false;
    config
}

fn backlog_yaml(run_id: &str) -> String {
    format!(
        "run_id: {run_id}\nitems:\n  - id: W001\n    title: Implement add\n    objective: Make add return the sum\n    acceptance:\n      - add returns a + b\n    files_hint: [src/app.py]\n"
    )
}

fn fake_with_text_stages() -> FakeExecutor {
    FakeExecutor::new()
        .with_text_rule("implementation plan", "1. Fix add\n")
        .with_text_rule("engineering spec", "add(a, b) must return a + b\n")
        .with_text_rule("Diff under review", "Looks correct.\n\nverdict: approved\n")
        .with_text_rule("pull request description", "Fix add to sum its arguments.\n")
}

#[tokio::test]
async fn s1_happy_path_single_item() {
    let base = TempDir::new().unwrap();
    init_repo(base.path()).await;

    let mut runner = Runner::new(base_config(), base.path(), None, false).unwrap();
    let run_id = runner.run_id().to_string();

    let fake = fake_with_text_stages()
        .with_text_rule("Respond with YAML only", &backlog_yaml(&run_id))
        .with_apply(FakeApply::WriteFiles(vec![(
            "src/app.py".to_string(),
            "def add(a, b):\n    return a + b\n".to_string(),
        )]));
    runner.set_test_executor(EngineType::Fake, Arc::new(fake));

    runner.run("add add(a,b)", "standard").await.unwrap();

    let paths = runner.paths().clone();

    // FSM landed on done.
    let state: RunState =
        serde_json::from_str(&std::fs::read_to_string(paths.state_json()).unwrap()).unwrap();
    assert_eq!(state.current_stage, Stage::Done);

    // Patch artifact is non-empty.
    let patch = std::fs::read_to_string(paths.patch_diff()).unwrap();
    assert!(patch.contains("a + b"));

    // Backlog all done.
    let backlog = Backlog::load(&paths.backlog_yaml()).unwrap();
    assert!(backlog.all_done());

    // Run metrics report success.
    let run_json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(paths.run_json()).unwrap()).unwrap();
    assert_eq!(run_json["final_status"], "success");

    // One implement attempt and one verify attempt, both successful.
    let records = read_stages_from(&paths.stages_jsonl());
    let implement: Vec<_> = records.iter().filter(|r| r.stage == "implement").collect();
    assert_eq!(implement.len(), 1);
    assert_eq!(implement[0].attempt, 1);
    assert_eq!(implement[0].status, StageOutcome::Success);
    assert_eq!(implement[0].item_id.as_deref(), Some("W001"));

    let verify: Vec<_> = records.iter().filter(|r| r.stage == "verify").collect();
    assert_eq!(verify.len(), 1);
    assert_eq!(verify[0].status, StageOutcome::Success);

    // meta.json written with stage statuses.
    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(paths.meta_json()).unwrap()).unwrap();
    assert_eq!(meta["run_id"], run_id);
    assert_eq!(meta["stage_statuses"]["done"], "completed");

    // Index line appended.
    let index = std::fs::read_to_string(drover_core::paths::RunPaths::runs_index(base.path()))
        .unwrap();
    assert!(index.contains(&run_id));
}

#[tokio::test]
async fn s2_fix_loop_recovers_on_second_attempt() {
    let base = TempDir::new().unwrap();
    init_repo(base.path()).await;

    let mut runner = Runner::new(base_config(), base.path(), None, false).unwrap();
    let run_id = runner.run_id().to_string();

    let fake = fake_with_text_stages()
        .with_text_rule("Respond with YAML only", &backlog_yaml(&run_id))
        .with_apply(FakeApply::WriteFiles(vec![(
            "src/app.py".to_string(),
            "def add(a, b):\n    return a - b\n".to_string(),
        )]))
        .with_apply(FakeApply::WriteFiles(vec![(
            "src/app.py".to_string(),
            "def add(a, b):\n    return a + b\n".to_string(),
        )]));
    runner.set_test_executor(EngineType::Fake, Arc::new(fake));

    runner.run("add add(a,b)", "standard").await.unwrap();
    let paths = runner.paths().clone();

    let records = read_stages_from(&paths.stages_jsonl());

    // First verify attempt failed on the gate, second passed.
    let verify: Vec<_> = records.iter().filter(|r| r.stage == "verify").collect();
    assert_eq!(verify.len(), 2);
    assert_eq!(verify[0].attempt, 1);
    assert_eq!(verify[0].status, StageOutcome::Fail);
    assert_eq!(
        verify[0].failure_category,
        Some(drover_core::metrics::schema::FailureCategory::GateFailure)
    );
    assert_eq!(verify[1].attempt, 2);
    assert_eq!(verify[1].status, StageOutcome::Success);

    // Attempt 2 ran as the fix stage for the same item.
    let fix: Vec<_> = records.iter().filter(|r| r.stage == "fix").collect();
    assert_eq!(fix.len(), 1);
    assert_eq!(fix[0].attempt, 2);
    assert_eq!(fix[0].item_id.as_deref(), Some("W001"));

    let backlog = Backlog::load(&paths.backlog_yaml()).unwrap();
    assert!(backlog.all_done());
    assert_eq!(backlog.items[0].attempts, 2);

    let run_json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(paths.run_json()).unwrap()).unwrap();
    assert!(run_json["fix_attempts_total"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn s3_guardrail_blocks_env_modification() {
    let base = TempDir::new().unwrap();
    init_repo(base.path()).await;

    let mut runner = Runner::new(base_config(), base.path(), None, false).unwrap();
    let run_id = runner.run_id().to_string();

    let fake = fake_with_text_stages()
        .with_text_rule("Respond with YAML only", &backlog_yaml(&run_id))
        .with_apply(FakeApply::WriteFiles(vec![
            (
                "src/app.py".to_string(),
                "def add(a, b):\n    return a + b\n".to_string(),
            ),
            (".env".to_string(), "SECRET=leaked\n".to_string()),
        ]));
    runner.set_test_executor(EngineType::Fake, Arc::new(fake));

    let outcome = runner.run("add add(a,b)", "standard").await;
    assert!(outcome.is_err());
    let paths = runner.paths().clone();

    // The violation is terminal for the item: exactly one implement
    // attempt, categorized as a guardrail violation.
    let records = read_stages_from(&paths.stages_jsonl());
    let implement: Vec<_> = records.iter().filter(|r| r.stage == "implement").collect();
    assert_eq!(implement.len(), 1);
    assert_eq!(
        implement[0].failure_category,
        Some(drover_core::metrics::schema::FailureCategory::GuardrailViolation)
    );

    let backlog = Backlog::load(&paths.backlog_yaml()).unwrap();
    assert_eq!(backlog.items[0].status, WorkItemStatus::Failed);

    let state: RunState =
        serde_json::from_str(&std::fs::read_to_string(paths.state_json()).unwrap()).unwrap();
    assert_eq!(state.current_stage, Stage::Failed);

    let meta: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(paths.meta_json()).unwrap()).unwrap();
    assert_eq!(meta["stage_statuses"]["implement_item"], "failed");
}

#[tokio::test]
async fn s4_fallback_switches_model_on_429() {
    let base = TempDir::new().unwrap();
    init_repo(base.path()).await;

    let mut config = base_config();
    config.engine.model = Some("fake-pro".to_string());
    config.fallback.rules.push(FallbackRule {
        matcher: FallbackMatch {
            executor: Some(EngineType::Fake),
            error_contains: vec!["429".to_string(), "quota".to_string()],
        },
        switch_to: FallbackSwitch {
            model: Some("fake-mini".to_string()),
            profile: None,
        },
        max_retries: 1,
    });

    let mut runner = Runner::new(config, base.path(), None, false).unwrap();
    let run_id = runner.run_id().to_string();

    let fake = fake_with_text_stages()
        .with_text_rule("Respond with YAML only", &backlog_yaml(&run_id))
        .with_apply(FakeApply::Fail {
            returncode: 1,
            stderr: "Error: 429 Too Many Requests".to_string(),
        })
        .with_apply(FakeApply::WriteFiles(vec![(
            "src/app.py".to_string(),
            "def add(a, b):\n    return a + b\n".to_string(),
        )]));
    runner.set_test_executor(EngineType::Fake, Arc::new(fake));

    runner.run("add add(a,b)", "standard").await.unwrap();
    let paths = runner.paths().clone();

    let records = read_stages_from(&paths.stages_jsonl());
    let implement: Vec<_> = records.iter().filter(|r| r.stage == "implement").collect();
    assert_eq!(implement.len(), 1);
    assert_eq!(implement[0].status, StageOutcome::Success);
    assert_eq!(implement[0].fallback_applied, Some(true));
    assert_eq!(implement[0].original_model.as_deref(), Some("fake-pro"));
    assert_eq!(implement[0].model.as_deref(), Some("fake-mini"));
    // Two agent invocations folded into one stage attempt.
    assert_eq!(implement[0].agent_invocations, 2);
}

#[tokio::test]
async fn s5_resume_after_crash_mid_implement() {
    let base = TempDir::new().unwrap();
    init_repo(base.path()).await;

    // Seed a run directory as a crashed process would leave it:
    // planning stages completed, implement_item running, one item
    // in_progress with a single recorded attempt, workspace gone.
    let paths = drover_core::paths::RunPaths::create_with_id(
        base.path(),
        RunId::from_string("20260801_000000_feedbeef"),
    )
    .unwrap();
    let run_id = paths.run_id.to_string();

    let baseline = {
        let cmd = CommandRunner::default();
        let (_, sha, _) = cmd.run_git(&["rev-parse", "HEAD"], base.path()).await.unwrap();
        sha.trim().to_string()
    };

    let mut state = StateStore::new(paths.clone());
    state.initialize().unwrap();
    state.set_baseline_sha(&baseline).unwrap();
    for stage in [Stage::Plan, Stage::Spec, Stage::Decompose, Stage::ImplementItem] {
        state.transition_to(stage).unwrap();
    }
    state.set_current_item("W001").unwrap();

    std::fs::write(paths.task_md(), "add add(a,b)").unwrap();
    std::fs::write(paths.plan_md(), "1. Fix add\n").unwrap();
    std::fs::write(paths.spec_md(), "add(a, b) must return a + b\n").unwrap();
    let mut crashed_backlog = backlog_yaml(&run_id);
    crashed_backlog.push_str("    status: in_progress\n    attempts: 1\n");
    std::fs::write(paths.backlog_yaml(), crashed_backlog).unwrap();
    // A stale patch from before the crash.
    std::fs::write(paths.patch_diff(), "stale diff").unwrap();
    // One pre-crash metrics line for the plan stage.
    std::fs::write(
        paths.stages_jsonl(),
        format!(
            "{{\"run_id\":\"{run_id}\",\"stage\":\"plan\",\"attempt\":1,\"start_ts\":\"t\",\"end_ts\":\"t\",\"duration_ms\":5,\"status\":\"success\",\"agent_invocations\":1}}\n"
        ),
    )
    .unwrap();

    let mut runner = Runner::new(
        base_config(),
        base.path(),
        Some(RunId::from_string(run_id.as_str())),
        false,
    )
    .unwrap();
    let fake = fake_with_text_stages().with_apply(FakeApply::WriteFiles(vec![(
        "src/app.py".to_string(),
        "def add(a, b):\n    return a + b\n".to_string(),
    )]));
    runner.set_test_executor(EngineType::Fake, Arc::new(fake));

    runner.resume().await.unwrap();

    // Completed stages were not re-entered: still exactly one plan line.
    let records = read_stages_from(&paths.stages_jsonl());
    assert_eq!(records.iter().filter(|r| r.stage == "plan").count(), 1);
    assert_eq!(records.iter().filter(|r| r.stage == "decompose").count(), 0);

    // The interrupted item was retried: attempt counter advanced.
    let backlog = Backlog::load(&paths.backlog_yaml()).unwrap();
    assert_eq!(backlog.items[0].status, WorkItemStatus::Done);
    assert_eq!(backlog.items[0].attempts, 2);

    // The recorded implement line carries the post-crash attempt.
    let implement: Vec<_> = records.iter().filter(|r| r.stage == "fix").collect();
    assert_eq!(implement.len(), 1);
    assert_eq!(implement[0].attempt, 2);

    let state: RunState =
        serde_json::from_str(&std::fs::read_to_string(paths.state_json()).unwrap()).unwrap();
    assert_eq!(state.current_stage, Stage::Done);
}

#[tokio::test]
async fn s6_concurrent_map_respects_dependencies() {
    let base = TempDir::new().unwrap();
    init_repo(base.path()).await;

    let mut config = base_config();
    config.run.parallel_items = 2;
    // Gate that always passes; the fake writes disjoint files.
    config.gates = vec![GateConfig {
        name: "noop".to_string(),
        enabled: true,
        command: "true".to_string(),
        args: Vec::new(),
        required: true,
    }];

    let mut runner = Runner::new(config, base.path(), None, false).unwrap();
    let run_id = runner.run_id().to_string();

    let backlog = format!(
        "run_id: {run_id}\nitems:\n  - id: W001\n    title: First\n    objective: One\n    acceptance: [done]\n  - id: W002\n    title: Second\n    objective: Two\n    acceptance: [done]\n    depends_on: [W001]\n  - id: W003\n    title: Third\n    objective: Three\n    acceptance: [done]\n"
    );
    let fake = fake_with_text_stages()
        .with_text_rule("Respond with YAML only", &backlog)
        .with_apply(FakeApply::WriteFiles(vec![(
            "out_a.txt".to_string(),
            "a\n".to_string(),
        )]))
        .with_apply(FakeApply::WriteFiles(vec![(
            "out_b.txt".to_string(),
            "b\n".to_string(),
        )]))
        .with_apply(FakeApply::WriteFiles(vec![(
            "out_c.txt".to_string(),
            "c\n".to_string(),
        )]));
    runner.set_test_executor(EngineType::Fake, Arc::new(fake));

    runner.run("three items", "standard").await.unwrap();
    let paths = runner.paths().clone();

    let backlog = Backlog::load(&paths.backlog_yaml()).unwrap();
    assert!(backlog.all_done());

    let records = read_stages_from(&paths.stages_jsonl());
    let implement: Vec<_> = records
        .iter()
        .filter(|r| r.stage == "implement")
        .collect();
    assert_eq!(implement.len(), 3);
    let mut item_ids: Vec<&str> = implement
        .iter()
        .filter_map(|r| r.item_id.as_deref())
        .collect();
    item_ids.sort_unstable();
    assert_eq!(item_ids, vec!["W001", "W002", "W003"]);

    // Dependency order: W001's successful verify precedes W002's
    // implement record.
    let w001_verify_idx = records
        .iter()
        .position(|r| r.stage == "verify" && r.item_id.as_deref() == Some("W001"))
        .unwrap();
    let w002_implement_idx = records
        .iter()
        .position(|r| r.stage == "implement" && r.item_id.as_deref() == Some("W002"))
        .unwrap();
    assert!(w001_verify_idx < w002_implement_idx);

    // The final patch reflects the accumulated state of all items.
    let patch = std::fs::read_to_string(paths.patch_diff()).unwrap();
    assert!(patch.contains("out_b.txt"));
}
