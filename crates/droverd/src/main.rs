//! drover - local orchestrator for code-generation CLI agents.

use clap::{Parser, Subcommand};
use drover_core::config::Config;
use drover_core::types::RunId;
use droverd::runner::{Runner, RunnerError};
use droverd::server::{self, AppState};
use droverd::worker::{RunWorker, DEFAULT_MAX_CONCURRENT_RUNS};
use eyre::WrapErr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "drover", about = "Drive coding agents through a reviewed, tested change set")]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Base directory for runs (defaults to the current directory).
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a new run for a task.
    Run {
        /// Task description.
        #[arg(long, conflicts_with = "task_file")]
        task: Option<String>,
        /// File containing the task description.
        #[arg(long)]
        task_file: Option<PathBuf>,
        /// Pipeline to execute.
        #[arg(long, default_value = "standard")]
        pipeline: String,
        /// Resolve invocations without executing agents.
        #[arg(long)]
        dry_run: bool,
    },
    /// Resume an interrupted run.
    Resume {
        run_id: String,
    },
    /// Show the state of a run.
    Status {
        run_id: String,
    },
    /// Serve the read/control HTTP dashboard.
    Serve {
        #[arg(long, default_value_t = 7700)]
        port: u16,
        #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_RUNS)]
        max_concurrent: usize,
    },
}

fn load_config(path: Option<&PathBuf>) -> eyre::Result<Config> {
    match path {
        Some(path) => Config::load(path).wrap_err_with(|| format!("loading {}", path.display())),
        None => {
            let default_path = PathBuf::from("drover.yaml");
            if default_path.exists() {
                Config::load(&default_path).wrap_err("loading drover.yaml")
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create runtime: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let code = runtime.block_on(execute(cli));
    std::process::exit(code);
}

async fn execute(cli: Cli) -> i32 {
    let base_dir = cli
        .base_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return EXIT_FAILURE;
        }
    };

    match cli.command {
        Command::Run {
            task,
            task_file,
            pipeline,
            dry_run,
        } => {
            let task = match (task, task_file) {
                (Some(task), _) => task,
                (None, Some(path)) => match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        eprintln!("failed to read task file: {e}");
                        return EXIT_FAILURE;
                    }
                },
                (None, None) => {
                    eprintln!("one of --task or --task-file is required");
                    return EXIT_FAILURE;
                }
            };

            let mut runner = match Runner::new(config, &base_dir, None, dry_run) {
                Ok(runner) => runner,
                Err(e) => {
                    eprintln!("failed to create run: {e}");
                    return EXIT_FAILURE;
                }
            };
            let run_path = runner.paths().root().to_path_buf();
            let cancel = runner.cancel_token();

            let run_fut = runner.run(&task, &pipeline);
            tokio::pin!(run_fut);
            let mut interrupted = false;
            let outcome = tokio::select! {
                outcome = &mut run_fut => outcome,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("interrupt received, cancelling run");
                    interrupted = true;
                    cancel.cancel();
                    // Let the run unwind so state and metrics flush.
                    run_fut.await
                }
            };
            if interrupted {
                return EXIT_CANCELLED;
            }

            match outcome {
                Ok(result) => {
                    if result.review_changes_requested {
                        println!("Run completed; review requested changes (ship skipped).");
                    } else {
                        println!("Run completed.");
                    }
                    println!("{}", run_path.display());
                    EXIT_OK
                }
                Err(e) => {
                    // Single line, red when the terminal supports it.
                    eprintln!("\x1b[31mRun failed.\x1b[0m {e}");
                    eprintln!("{}", run_path.display());
                    EXIT_FAILURE
                }
            }
        }

        Command::Resume { run_id } => {
            let mut runner =
                match Runner::new(config, &base_dir, Some(RunId::from_string(run_id.as_str())), false) {
                    Ok(runner) => runner,
                    Err(e) => {
                        eprintln!("failed to attach to run: {e}");
                        return EXIT_FAILURE;
                    }
                };
            let run_path = runner.paths().root().to_path_buf();
            let cancel = runner.cancel_token();

            let resume_fut = runner.resume();
            tokio::pin!(resume_fut);
            let mut interrupted = false;
            let outcome = tokio::select! {
                outcome = &mut resume_fut => outcome,
                _ = tokio::signal::ctrl_c() => {
                    interrupted = true;
                    cancel.cancel();
                    resume_fut.await
                }
            };
            if interrupted {
                return EXIT_CANCELLED;
            }

            match outcome {
                Ok(_) => {
                    println!("Run completed.");
                    EXIT_OK
                }
                Err(RunnerError::NotResumable) => {
                    eprintln!("run {run_id} is finished and cannot be resumed");
                    EXIT_FAILURE
                }
                Err(e) => {
                    eprintln!("\x1b[31mRun failed.\x1b[0m {e}");
                    eprintln!("{}", run_path.display());
                    EXIT_FAILURE
                }
            }
        }

        Command::Status { run_id } => {
            let state_path = base_dir.join("runs").join(&run_id).join("state.json");
            let content = match std::fs::read_to_string(&state_path) {
                Ok(content) => content,
                Err(_) => {
                    eprintln!("run {run_id} not found under {}", base_dir.display());
                    return EXIT_FAILURE;
                }
            };
            match serde_json::from_str::<drover_core::state::RunState>(&content) {
                Ok(state) => {
                    println!("run:        {run_id}");
                    println!("stage:      {}", state.current_stage);
                    if let Some(item) = &state.current_item_id {
                        println!("item:       {item} (iteration {})", state.current_iteration);
                    }
                    for (key, status) in &state.stage_statuses {
                        let error = status
                            .error
                            .as_deref()
                            .map(|e| format!(" - {e}"))
                            .unwrap_or_default();
                        println!("  {key}: {}{error}", status.status.as_str());
                    }
                    if !state.last_failure_evidence.is_empty() {
                        println!("evidence:");
                        for (key, value) in &state.last_failure_evidence {
                            let first_line = value.lines().next().unwrap_or("");
                            println!("  {key}: {first_line}");
                        }
                    }
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("corrupt state file: {e}");
                    EXIT_FAILURE
                }
            }
        }

        Command::Serve {
            port,
            max_concurrent,
        } => {
            let worker = Arc::new(RunWorker::new(
                config.clone(),
                base_dir.clone(),
                max_concurrent,
            ));
            let state = Arc::new(AppState {
                base_dir,
                config,
                worker,
            });
            tokio::select! {
                result = server::serve(state, port) => {
                    if let Err(e) = result {
                        eprintln!("server error: {e}");
                        return EXIT_FAILURE;
                    }
                    EXIT_OK
                }
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("shutting down");
                    EXIT_OK
                }
            }
        }
    }
}
