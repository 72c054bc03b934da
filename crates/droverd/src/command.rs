//! Async subprocess runner shared by executors, gates, and git.
//!
//! Output streams to log files as it arrives so a follow reader can
//! tail a live invocation; a heartbeat line is emitted while the child
//! runs; timeouts and cancellation kill the child and reap it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("command timed out after {0}s: {1}")]
    Timeout(u64, String),
    #[error("command cancelled: {0}")]
    Cancelled(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Outcome of a file-captured command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub returncode: i32,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    pub dry_run: bool,
    /// Seconds between "still running" log lines; 0 disables.
    pub heartbeat_interval: u64,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            dry_run: false,
            heartbeat_interval: 30,
        }
    }
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Run a command, teeing stdout/stderr into the given files.
    pub async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        stdout_path: Option<&Path>,
        stderr_path: Option<&Path>,
        timeout: Option<u64>,
        env: &[(String, String)],
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandOutcome> {
        let cmd_display = argv.join(" ");
        info!(command = %cmd_display, cwd = %cwd.display(), "running command");

        if self.dry_run {
            info!("dry run, skipping execution");
            if let Some(path) = stdout_path {
                write_log_file(path, b"[dry-run] command not executed\n").await?;
            }
            if let Some(path) = stderr_path {
                write_log_file(path, b"").await?;
            }
            return Ok(CommandOutcome {
                returncode: 0,
                stdout_path: stdout_path.map(Path::to_path_buf),
                stderr_path: stderr_path.map(Path::to_path_buf),
            });
        }

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CommandError::NotFound("<empty argv>".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::NotFound(program.clone())
            } else {
                CommandError::Io(e)
            }
        })?;

        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_task = spawn_tee(stdout_handle, stdout_path.map(Path::to_path_buf));
        let stderr_task = spawn_tee(stderr_handle, stderr_path.map(Path::to_path_buf));

        let started = std::time::Instant::now();
        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.heartbeat_interval.max(1),
        ));
        heartbeat.tick().await; // first tick fires immediately

        let timeout_fut = async {
            match timeout {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout_fut);
        let cancel_fut = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancel_fut);

        let returncode = loop {
            tokio::select! {
                status = child.wait() => {
                    break status?.code().unwrap_or(-1);
                }
                () = &mut timeout_fut => {
                    let secs = timeout.unwrap_or(0);
                    warn!(command = %cmd_display, timeout = secs, "command timed out, killing");
                    kill_and_reap(&mut child).await;
                    finish_tee(stdout_task, stderr_task).await;
                    return Err(CommandError::Timeout(secs, cmd_display));
                }
                () = &mut cancel_fut => {
                    warn!(command = %cmd_display, "command cancelled, killing");
                    kill_and_reap(&mut child).await;
                    finish_tee(stdout_task, stderr_task).await;
                    return Err(CommandError::Cancelled(cmd_display));
                }
                _ = heartbeat.tick(), if self.heartbeat_interval > 0 => {
                    let elapsed = started.elapsed().as_secs();
                    if elapsed > 0 {
                        info!(command = %cmd_display, elapsed_seconds = elapsed, "command still running");
                    }
                }
            }
        };

        finish_tee(stdout_task, stderr_task).await;
        debug!(command = %cmd_display, returncode, "command completed");

        Ok(CommandOutcome {
            returncode,
            stdout_path: stdout_path.map(Path::to_path_buf),
            stderr_path: stderr_path.map(Path::to_path_buf),
        })
    }

    /// Run a command and capture output in memory.
    pub async fn run_capture(
        &self,
        argv: &[String],
        cwd: &Path,
        timeout: Option<u64>,
    ) -> Result<(i32, String, String)> {
        let cmd_display = argv.join(" ");
        debug!(command = %cmd_display, "running command (capture)");

        if self.dry_run {
            return Ok((0, String::new(), String::new()));
        }

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CommandError::NotFound("<empty argv>".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::NotFound(program.clone())
            } else {
                CommandError::Io(e)
            }
        })?;

        let output = if let Some(secs) = timeout {
            match tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => return Err(CommandError::Timeout(secs, cmd_display)),
            }
        } else {
            child.wait_with_output().await?
        };

        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    /// Convenience wrapper for git.
    pub async fn run_git(&self, args: &[&str], cwd: &Path) -> Result<(i32, String, String)> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|a| (*a).to_string()));
        self.run_capture(&argv, cwd, Some(120)).await
    }
}

async fn write_log_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

/// Stream a child pipe into a file (or discard), flushing per chunk so
/// a tail reader sees output as it happens.
fn spawn_tee<R>(
    reader: Option<R>,
    path: Option<PathBuf>,
) -> Option<tokio::task::JoinHandle<()>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut reader = reader?;
    Some(tokio::spawn(async move {
        let mut file = match path {
            Some(p) => {
                if let Some(parent) = p.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                match tokio::fs::File::create(&p).await {
                    Ok(f) => Some(f),
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "failed to open log file");
                        None
                    }
                }
            }
            None => None,
        };

        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(file) = file.as_mut() {
                        if file.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = file.flush().await;
                    }
                }
            }
        }
    }))
}

async fn finish_tee(
    stdout: Option<tokio::task::JoinHandle<()>>,
    stderr: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(task) = stdout {
        let _ = task.await;
    }
    if let Some(task) = stderr {
        let _ = task.await;
    }
}

async fn kill_and_reap(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill child process");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| (*p).to_string()).collect()
    }

    #[tokio::test]
    async fn run_captures_stdout_to_file() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("logs/stdout.log");
        let err = dir.path().join("logs/stderr.log");

        let runner = CommandRunner::default();
        let outcome = runner
            .run(
                &argv(&["sh", "-c", "echo hello"]),
                dir.path(),
                Some(&out),
                Some(&err),
                Some(10),
                &[],
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.returncode, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::default();
        let outcome = runner
            .run(&argv(&["sh", "-c", "exit 3"]), dir.path(), None, None, Some(10), &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.returncode, 3);
    }

    #[tokio::test]
    async fn run_times_out_and_kills() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::default();
        let started = std::time::Instant::now();
        let result = runner
            .run(&argv(&["sleep", "30"]), dir.path(), None, None, Some(1), &[], None)
            .await;
        assert!(matches!(result, Err(CommandError::Timeout(1, _))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn run_cancellation_kills() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::default();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let result = runner
            .run(&argv(&["sleep", "30"]), dir.path(), None, None, None, &[], Some(&token))
            .await;
        assert!(matches!(result, Err(CommandError::Cancelled(_))));
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::default();
        let result = runner
            .run(&argv(&["definitely-not-a-binary-xyz"]), dir.path(), None, None, None, &[], None)
            .await;
        assert!(matches!(result, Err(CommandError::NotFound(_))));
    }

    #[tokio::test]
    async fn dry_run_writes_marker() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("stdout.log");
        let runner = CommandRunner::new(true);
        let outcome = runner
            .run(&argv(&["rm", "-rf", "/"]), dir.path(), Some(&out), None, None, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.returncode, 0);
        assert!(std::fs::read_to_string(&out).unwrap().contains("dry-run"));
    }

    #[tokio::test]
    async fn run_capture_returns_output() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::default();
        let (code, stdout, stderr) = runner
            .run_capture(&argv(&["sh", "-c", "echo out; echo err >&2"]), dir.path(), Some(10))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(stdout, "out\n");
        assert_eq!(stderr, "err\n");
    }

    #[tokio::test]
    async fn env_vars_are_passed() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("stdout.log");
        let runner = CommandRunner::default();
        runner
            .run(
                &argv(&["sh", "-c", "echo $DROVER_TEST_VAR"]),
                dir.path(),
                Some(&out),
                None,
                Some(10),
                &[("DROVER_TEST_VAR".to_string(), "42".to_string())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "42\n");
    }
}
