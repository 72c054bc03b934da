//! Durable metrics persistence.
//!
//! `stages.jsonl` is append-only, one self-contained JSON object per
//! line, flushed per write so a crash never leaves a partial line
//! behind a successful call. Write errors are logged and swallowed;
//! metrics must never take a run down.

use crate::metrics::schema::{RunMetrics, StageMetrics};
use crate::paths::{write_atomic, RunPaths};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct MetricsWriter {
    paths: RunPaths,
}

impl MetricsWriter {
    pub fn new(paths: RunPaths) -> Self {
        Self { paths }
    }

    /// Append one stage record to `stages.jsonl`.
    pub fn write_stage(&self, record: &StageMetrics) {
        if let Err(e) = self.try_write_stage(record) {
            warn!(stage = %record.stage, error = %e, "failed to write stage metrics");
        }
    }

    fn try_write_stage(&self, record: &StageMetrics) -> std::io::Result<()> {
        let path = self.paths.stages_jsonl();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        debug!(stage = %record.stage, attempt = record.attempt, "stage metrics appended");
        Ok(())
    }

    /// Append a batch; one bad record does not stop the rest.
    pub fn write_stages(&self, records: &[StageMetrics]) {
        for record in records {
            self.write_stage(record);
        }
    }

    /// Atomically write the aggregate `run.json`.
    pub fn write_run(&self, record: &RunMetrics) {
        let path = self.paths.run_json();
        match serde_json::to_vec_pretty(record) {
            Ok(json) => {
                if let Err(e) = write_atomic(&path, &json) {
                    warn!(error = %e, "failed to write run metrics");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize run metrics"),
        }
    }

    /// Read back all stage records, skipping blank and corrupt lines.
    pub fn read_stages(&self) -> Vec<StageMetrics> {
        read_stages_from(&self.paths.stages_jsonl())
    }
}

/// Tolerant jsonl reader used by both the writer and the HTTP facade.
pub fn read_stages_from(path: &Path) -> Vec<StageMetrics> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StageMetrics>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = idx + 1, error = %e, "skipping corrupt stage metrics line"),
        }
    }
    records
}

/// Append a one-line summary to the per-host `runs/index.jsonl`.
pub fn append_to_index(base_dir: &Path, run_id: &str, summary: &serde_json::Value) {
    let path = RunPaths::runs_index(base_dir);
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entry = summary.clone();
        if let Some(map) = entry.as_object_mut() {
            map.entry("run_id")
                .or_insert_with(|| serde_json::Value::String(run_id.to_string()));
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(entry.to_string().as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    })();
    if let Err(e) = result {
        warn!(run_id, error = %e, "failed to append run index entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::schema::StageOutcome;
    use tempfile::TempDir;

    fn writer() -> (TempDir, MetricsWriter) {
        let base = TempDir::new().unwrap();
        let paths = RunPaths::create_new(base.path()).unwrap();
        (base, MetricsWriter::new(paths))
    }

    #[test]
    fn write_stage_appends_lines() {
        let (_base, writer) = writer();
        writer.write_stage(&StageMetrics::new("r", "plan"));
        writer.write_stage(&StageMetrics::new("r", "spec"));

        let content = std::fs::read_to_string(writer.paths.stages_jsonl()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(content.ends_with('\n'));

        // Each line parses independently.
        for line in lines {
            let _: StageMetrics = serde_json::from_str(line).unwrap();
        }
    }

    #[test]
    fn read_stages_skips_corrupt_lines() {
        let (_base, writer) = writer();
        writer.write_stage(&StageMetrics::new("r", "plan"));

        // Simulate a crash mid-write plus a stray blank line.
        let path = writer.paths.stages_jsonl();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("\n{\"run_id\": \"r\", \"stage\":");
        std::fs::write(&path, content).unwrap();

        let records = writer.read_stages();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "plan");
    }

    #[test]
    fn write_stages_batches_all_records() {
        let (_base, writer) = writer();
        let records = vec![
            StageMetrics::new("r", "plan"),
            StageMetrics::new("r", "spec"),
            StageMetrics::new("r", "decompose"),
        ];
        writer.write_stages(&records);
        assert_eq!(writer.read_stages().len(), 3);
    }

    #[test]
    fn read_stages_missing_file_is_empty() {
        let (_base, writer) = writer();
        assert!(writer.read_stages().is_empty());
    }

    #[test]
    fn write_run_is_atomic_and_parseable() {
        let (_base, writer) = writer();
        let record = RunMetrics {
            run_id: "r".to_string(),
            task_fingerprint: None,
            start_ts: "2026-08-01T00:00:00Z".to_string(),
            end_ts: Some("2026-08-01T00:10:00Z".to_string()),
            total_duration_ms: Some(600_000),
            final_status: StageOutcome::Success,
            final_failure_reason: None,
            engine: Some("codex".to_string()),
            model: None,
            base_branch: Some("main".to_string()),
            stages_executed: 5,
            stages_failed: 0,
            time_to_green_ms: None,
            time_to_pr_ms: None,
            total_stage_time_ms: 1000,
            total_llm_time_ms: 800,
            total_verify_time_ms: 200,
            fix_attempts_total: 0,
            items_total: 1,
            items_completed: 1,
            items_failed: 0,
            rework_ratio: 0.0,
            final_diff_stats: None,
            stage_breakdown: std::collections::BTreeMap::new(),
        };
        writer.write_run(&record);

        let content = std::fs::read_to_string(writer.paths.run_json()).unwrap();
        let parsed: RunMetrics = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.final_status, StageOutcome::Success);
        assert_eq!(parsed.stages_executed, 5);
    }

    #[test]
    fn index_appends_one_line_per_run() {
        let base = TempDir::new().unwrap();
        append_to_index(
            base.path(),
            "run_a",
            &serde_json::json!({"status": "success"}),
        );
        append_to_index(
            base.path(),
            "run_b",
            &serde_json::json!({"run_id": "run_b", "status": "fail"}),
        );

        let content = std::fs::read_to_string(RunPaths::runs_index(base.path())).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["run_id"], "run_a");
        assert_eq!(first["status"], "success");
    }
}
