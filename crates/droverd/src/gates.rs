//! Quality gates: external pass/fail commands run against the
//! workspace.
//!
//! Each gate captures combined stdout+stderr into a single log file
//! and never panics the run; a missing binary simply fails the gate
//! with the shell's 127 in the log. Pytest-style output additionally
//! gets its failed/passed counts parsed from the log tail.

use crate::command::{CommandError, CommandRunner};
use drover_core::config::GateConfig;
use drover_core::metrics::schema::GateMetrics;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A configured gate, ready to run.
#[derive(Debug, Clone)]
pub struct Gate {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub required: bool,
}

impl Gate {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: if config.command.is_empty() {
                config.name.clone()
            } else {
                config.command.clone()
            },
            args: config.args.clone(),
            required: config.required,
        }
    }

    /// Shell line for this gate, output merged into one stream.
    fn shell_line(&self, extra_args: &[String]) -> String {
        let mut parts = vec![shell_quote(&self.command)];
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.extend(extra_args.iter().map(|a| shell_quote(a)));
        format!("{} 2>&1", parts.join(" "))
    }
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Outcome of one gate run.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub name: String,
    pub ok: bool,
    pub returncode: i32,
    pub duration_ms: u64,
    pub log_path: PathBuf,
    /// (tests_failed, tests_total) for pytest-style gates.
    pub parsed: Option<(u32, u32)>,
}

impl GateResult {
    pub fn log_tail(&self, lines: usize) -> String {
        log_tail(&self.log_path, lines)
    }

    pub fn to_metrics(&self) -> GateMetrics {
        GateMetrics {
            name: self.name.clone(),
            exit_code: self.returncode,
            duration_ms: self.duration_ms,
            passed: self.ok,
            tests_failed: self.parsed.map(|(failed, _)| failed),
            tests_total: self.parsed.map(|(_, total)| total),
            error_output: if self.ok {
                None
            } else {
                Some(self.log_tail(30))
            },
        }
    }
}

/// Last `n` lines of a log file.
pub fn log_tail(path: &Path, n: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Parse `N failed` / `M passed` counts out of pytest-style output.
pub fn parse_test_counts(output: &str) -> Option<(u32, u32)> {
    let mut failed: Option<u32> = None;
    let mut passed: Option<u32> = None;

    let words: Vec<&str> = output.split_whitespace().collect();
    for pair in words.windows(2) {
        let Ok(count) = pair[0]
            .trim_matches(|c: char| !c.is_ascii_digit())
            .parse::<u32>()
        else {
            continue;
        };
        let label = pair[1].trim_matches(|c: char| !c.is_ascii_alphabetic());
        if label == "failed" && failed.is_none() {
            failed = Some(count);
        } else if label == "passed" && passed.is_none() {
            passed = Some(count);
        }
    }

    if failed.is_none() && passed.is_none() {
        return None;
    }
    let failed = failed.unwrap_or(0);
    let total = failed + passed.unwrap_or(0);
    Some((failed, total))
}

/// Run one gate, capturing output to `log_path`.
pub async fn run_gate(
    runner: &CommandRunner,
    gate: &Gate,
    cwd: &Path,
    log_path: &Path,
    timeout: Option<u64>,
    extra_args: &[String],
) -> GateResult {
    info!(gate = %gate.name, cwd = %cwd.display(), "running gate");
    let started = std::time::Instant::now();

    let argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        gate.shell_line(extra_args),
    ];

    let returncode = match runner
        .run(&argv, cwd, Some(log_path), None, timeout, &[], None)
        .await
    {
        Ok(outcome) => outcome.returncode,
        Err(CommandError::Timeout(secs, _)) => {
            warn!(gate = %gate.name, timeout = secs, "gate timed out");
            -1
        }
        Err(e) => {
            warn!(gate = %gate.name, error = %e, "gate failed to start");
            -1
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let ok = returncode == 0;

    let parsed = if gate.name == "pytest" || gate.command.contains("pytest") {
        parse_test_counts(&log_tail(log_path, 50))
    } else {
        None
    };

    if ok {
        debug!(gate = %gate.name, duration_ms, "gate passed");
    } else {
        warn!(gate = %gate.name, returncode, duration_ms, "gate failed");
    }

    GateResult {
        name: gate.name.clone(),
        ok,
        returncode,
        duration_ms,
        log_path: log_path.to_path_buf(),
        parsed,
    }
}

/// Run gates sequentially (deterministic log interleaving). Returns
/// every result; the run proceeds iff all required gates passed.
pub async fn run_gates<F>(
    runner: &CommandRunner,
    gates: &[Gate],
    cwd: &Path,
    timeout: Option<u64>,
    mut log_path_for: F,
) -> Vec<GateResult>
where
    F: FnMut(&Gate) -> PathBuf,
{
    let mut results = Vec::with_capacity(gates.len());
    for gate in gates {
        let log_path = log_path_for(gate);
        let result = run_gate(runner, gate, cwd, &log_path, timeout, &[]).await;
        results.push(result);
    }
    results
}

/// All required gates passed.
pub fn all_required_passed(results: &[GateResult], gates: &[Gate]) -> bool {
    results.iter().all(|result| {
        let required = gates
            .iter()
            .find(|g| g.name == result.name)
            .is_none_or(|g| g.required);
        result.ok || !required
    })
}
