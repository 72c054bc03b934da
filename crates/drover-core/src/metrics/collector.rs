//! In-run metrics accumulation.
//!
//! The collector buffers one `StageMetrics` record per stage attempt
//! (mirroring what the writer appends) and aggregates them into the
//! final `RunMetrics` at completion.

use crate::config::ModelSelector;
use crate::metrics::schema::{
    compute_fingerprint, DiffStats, FailureCategory, GateMetrics, RunMetrics, StageMetrics,
    StageOutcome,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Records a single stage attempt, then folds into the collector.
#[derive(Debug)]
pub struct StageRecorder {
    record: StageMetrics,
    started: DateTime<Utc>,
    llm_started: Option<DateTime<Utc>>,
    verify_started: Option<DateTime<Utc>>,
}

impl StageRecorder {
    fn new(run_id: &str, stage: &str, item_id: Option<&str>, attempt: u32) -> Self {
        let started = Utc::now();
        let mut record = StageMetrics::new(run_id, stage);
        record.item_id = item_id.map(ToString::to_string);
        record.attempt = attempt;
        record.start_ts = started.to_rfc3339();
        Self {
            record,
            started,
            llm_started: None,
            verify_started: None,
        }
    }

    pub fn record_model_selection(&mut self, executor: &str, selector: &ModelSelector) {
        self.record.executor = Some(executor.to_string());
        self.record.model = selector.model.clone();
        self.record.profile = selector.profile.clone();
        self.record.reasoning_effort = selector.reasoning_effort.map(|e| e.as_str().to_string());
    }

    pub fn record_fallback(&mut self, original_model: Option<&str>) {
        self.record.fallback_applied = Some(true);
        self.record.original_model = original_model.map(ToString::to_string);
    }

    pub fn record_gate(&mut self, gate: GateMetrics) {
        self.record.gates.push(gate);
    }

    pub fn record_diff_stats(&mut self, diff: &str) {
        self.record.diff_stats = Some(DiffStats::from_diff(diff));
    }

    pub fn record_inputs_fingerprint<I, P>(&mut self, parts: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.record.inputs_fingerprint = Some(compute_fingerprint(parts));
    }

    pub fn record_outputs_fingerprint<I, P>(&mut self, parts: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.record.outputs_fingerprint = Some(compute_fingerprint(parts));
    }

    pub fn record_artifact(&mut self, name: &str, path: &str) {
        self.record.artifacts.insert(name.to_string(), path.to_string());
    }

    pub fn record_tokens(&mut self, tokens: crate::metrics::schema::TokenUsage) {
        self.record.tokens = Some(tokens);
    }

    pub fn record_error_info(&mut self, info: serde_json::Value) {
        self.record.error_info = Some(info);
    }

    pub fn add_agent_invocation(&mut self) {
        self.record.agent_invocations += 1;
    }

    pub fn start_llm(&mut self) {
        self.llm_started = Some(Utc::now());
    }

    pub fn end_llm(&mut self) {
        if let Some(started) = self.llm_started.take() {
            let elapsed = (Utc::now() - started).num_milliseconds().max(0) as u64;
            self.record.llm_duration_ms = Some(self.record.llm_duration_ms.unwrap_or(0) + elapsed);
        }
    }

    pub fn start_verify(&mut self) {
        self.verify_started = Some(Utc::now());
    }

    pub fn end_verify(&mut self) {
        if let Some(started) = self.verify_started.take() {
            let elapsed = (Utc::now() - started).num_milliseconds().max(0) as u64;
            self.record.verify_duration_ms =
                Some(self.record.verify_duration_ms.unwrap_or(0) + elapsed);
        }
    }

    pub fn success(mut self) -> StageMetrics {
        self.record.status = StageOutcome::Success;
        self.seal()
    }

    pub fn failure(mut self, category: FailureCategory, message: &str) -> StageMetrics {
        self.record.status = match category {
            FailureCategory::Timeout => StageOutcome::Timeout,
            FailureCategory::Cancelled => StageOutcome::Cancel,
            _ => StageOutcome::Fail,
        };
        self.record.failure_category = Some(category);
        self.record.failure_message = Some(message.to_string());
        self.seal()
    }

    pub fn skipped(mut self) -> StageMetrics {
        self.record.status = StageOutcome::Skip;
        self.seal()
    }

    fn seal(mut self) -> StageMetrics {
        let ended = Utc::now();
        self.record.end_ts = ended.to_rfc3339();
        self.record.duration_ms = (ended - self.started).num_milliseconds().max(0) as u64;
        self.record
    }
}

/// Accumulates stage records and run-level counters for one run.
#[derive(Debug)]
pub struct MetricsCollector {
    run_id: String,
    engine: Option<String>,
    model: Option<String>,
    base_branch: Option<String>,
    started: DateTime<Utc>,
    task_fingerprint: Option<String>,
    records: Vec<StageMetrics>,
    fix_attempts_total: u32,
    items_total: usize,
    items_completed: usize,
    items_failed: usize,
    first_green_at: Option<DateTime<Utc>>,
    pr_ready_at: Option<DateTime<Utc>>,
}

impl MetricsCollector {
    pub fn new(
        run_id: &str,
        engine: Option<&str>,
        model: Option<&str>,
        base_branch: Option<&str>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            engine: engine.map(ToString::to_string),
            model: model.map(ToString::to_string),
            base_branch: base_branch.map(ToString::to_string),
            started: Utc::now(),
            task_fingerprint: None,
            records: Vec::new(),
            fix_attempts_total: 0,
            items_total: 0,
            items_completed: 0,
            items_failed: 0,
            first_green_at: None,
            pr_ready_at: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn begin_stage(
        &self,
        stage: &str,
        item_id: Option<&str>,
        attempt: u32,
    ) -> StageRecorder {
        StageRecorder::new(&self.run_id, stage, item_id, attempt)
    }

    /// Fold a finished record into the buffer.
    pub fn push(&mut self, record: StageMetrics) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[StageMetrics] {
        &self.records
    }

    pub fn set_task_fingerprint(&mut self, task: &str) {
        self.task_fingerprint = Some(compute_fingerprint([task]));
    }

    pub fn add_fix_attempt(&mut self) {
        self.fix_attempts_total += 1;
    }

    pub fn mark_first_green(&mut self) {
        if self.first_green_at.is_none() {
            self.first_green_at = Some(Utc::now());
        }
    }

    pub fn mark_pr_ready(&mut self) {
        if self.pr_ready_at.is_none() {
            self.pr_ready_at = Some(Utc::now());
        }
    }

    pub fn set_items_count(&mut self, total: usize, completed: usize, failed: usize) {
        self.items_total = total;
        self.items_completed = completed;
        self.items_failed = failed;
    }

    /// Aggregate everything recorded so far into the run document.
    pub fn build_run_metrics(
        &self,
        final_status: StageOutcome,
        failure_reason: Option<&str>,
        final_diff: Option<&str>,
    ) -> RunMetrics {
        let ended = Utc::now();
        let elapsed_ms = |from: DateTime<Utc>, to: DateTime<Utc>| {
            (to - from).num_milliseconds().max(0) as u64
        };

        let mut stage_breakdown: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_stage_time_ms = 0u64;
        let mut total_llm_time_ms = 0u64;
        let mut total_verify_time_ms = 0u64;
        let mut stages_failed = 0usize;
        let mut retried = 0usize;

        for record in &self.records {
            if record.status != StageOutcome::Skip {
                total_stage_time_ms += record.duration_ms;
                *stage_breakdown.entry(record.stage.clone()).or_insert(0) +=
                    record.duration_ms;
            }
            total_llm_time_ms += record.llm_duration_ms.unwrap_or(0);
            total_verify_time_ms += record.verify_duration_ms.unwrap_or(0);
            if matches!(
                record.status,
                StageOutcome::Fail | StageOutcome::Timeout | StageOutcome::Cancel
            ) {
                stages_failed += 1;
            }
            if record.attempt > 1 {
                retried += 1;
            }
        }

        let rework_ratio = if self.records.is_empty() {
            0.0
        } else {
            retried as f64 / self.records.len() as f64
        };

        RunMetrics {
            run_id: self.run_id.clone(),
            task_fingerprint: self.task_fingerprint.clone(),
            start_ts: self.started.to_rfc3339(),
            end_ts: Some(ended.to_rfc3339()),
            total_duration_ms: Some(elapsed_ms(self.started, ended)),
            final_status,
            final_failure_reason: failure_reason.map(ToString::to_string),
            engine: self.engine.clone(),
            model: self.model.clone(),
            base_branch: self.base_branch.clone(),
            stages_executed: self.records.len(),
            stages_failed,
            time_to_green_ms: self.first_green_at.map(|t| elapsed_ms(self.started, t)),
            time_to_pr_ms: self.pr_ready_at.map(|t| elapsed_ms(self.started, t)),
            total_stage_time_ms,
            total_llm_time_ms,
            total_verify_time_ms,
            fix_attempts_total: self.fix_attempts_total,
            items_total: self.items_total,
            items_completed: self.items_completed,
            items_failed: self.items_failed,
            rework_ratio,
            final_diff_stats: final_diff.map(DiffStats::from_diff),
            stage_breakdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_produces_complete_record() {
        let collector = MetricsCollector::new("run_1", Some("codex"), None, Some("main"));
        let mut recorder = collector.begin_stage("implement", Some("W001"), 1);
        recorder.record_model_selection(
            "codex",
            &ModelSelector {
                model: Some("gpt-5.2".to_string()),
                ..ModelSelector::default()
            },
        );
        recorder.start_llm();
        recorder.end_llm();
        let record = recorder.success();

        assert_eq!(record.stage, "implement");
        assert_eq!(record.item_id.as_deref(), Some("W001"));
        assert_eq!(record.status, StageOutcome::Success);
        assert_eq!(record.executor.as_deref(), Some("codex"));
        assert_eq!(record.model.as_deref(), Some("gpt-5.2"));
        assert!(record.llm_duration_ms.is_some());
        assert!(!record.start_ts.is_empty());
        assert!(!record.end_ts.is_empty());
    }

    #[test]
    fn failure_maps_category_to_outcome() {
        let collector = MetricsCollector::new("run_1", None, None, None);

        let timeout = collector
            .begin_stage("implement", None, 1)
            .failure(FailureCategory::Timeout, "timed out after 600s");
        assert_eq!(timeout.status, StageOutcome::Timeout);

        let cancelled = collector
            .begin_stage("implement", None, 1)
            .failure(FailureCategory::Cancelled, "cancelled");
        assert_eq!(cancelled.status, StageOutcome::Cancel);

        let gate = collector
            .begin_stage("verify", None, 1)
            .failure(FailureCategory::GateFailure, "gate pytest failed");
        assert_eq!(gate.status, StageOutcome::Fail);
        assert_eq!(gate.failure_category, Some(FailureCategory::GateFailure));
    }

    #[test]
    fn run_metrics_aggregates_stage_breakdown() {
        let mut collector = MetricsCollector::new("run_1", Some("codex"), None, None);

        let mut r1 = collector.begin_stage("plan", None, 1).success();
        r1.duration_ms = 100;
        collector.push(r1);

        let mut r2 = collector.begin_stage("implement", Some("W001"), 1).success();
        r2.duration_ms = 200;
        r2.llm_duration_ms = Some(150);
        collector.push(r2);

        let mut r3 = collector
            .begin_stage("implement", Some("W001"), 2)
            .failure(FailureCategory::GateFailure, "gate failed");
        r3.duration_ms = 50;
        collector.push(r3);

        let mut skipped = collector.begin_stage("ship", None, 1).skipped();
        skipped.duration_ms = 999;
        collector.push(skipped);

        collector.add_fix_attempt();
        collector.set_items_count(2, 1, 1);

        let run = collector.build_run_metrics(StageOutcome::Fail, Some("gate failed"), None);
        assert_eq!(run.stages_executed, 4);
        assert_eq!(run.stages_failed, 1);
        assert_eq!(run.total_stage_time_ms, 350);
        assert_eq!(run.stage_breakdown["plan"], 100);
        assert_eq!(run.stage_breakdown["implement"], 250);
        // Skipped stages stay out of the breakdown.
        assert!(!run.stage_breakdown.contains_key("ship"));
        assert_eq!(run.total_llm_time_ms, 150);
        assert_eq!(run.fix_attempts_total, 1);
        assert_eq!(run.items_total, 2);
        assert!((run.rework_ratio - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn first_green_is_sticky() {
        let mut collector = MetricsCollector::new("run_1", None, None, None);
        collector.mark_first_green();
        let first = collector.first_green_at;
        collector.mark_first_green();
        assert_eq!(collector.first_green_at, first);

        let run = collector.build_run_metrics(StageOutcome::Success, None, None);
        assert!(run.time_to_green_ms.is_some());
    }

    #[test]
    fn task_fingerprint_is_deterministic() {
        let mut a = MetricsCollector::new("run_a", None, None, None);
        let mut b = MetricsCollector::new("run_b", None, None, None);
        a.set_task_fingerprint("add add(a,b)");
        b.set_task_fingerprint("add add(a,b)");

        let ra = a.build_run_metrics(StageOutcome::Success, None, None);
        let rb = b.build_run_metrics(StageOutcome::Success, None, None);
        assert_eq!(ra.task_fingerprint, rb.task_fingerprint);
    }
}
