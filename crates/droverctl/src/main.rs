//! droverctl - CLI client for the droverd dashboard.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::Client;
use eyre::Result;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "droverctl", about = "Inspect and control drover runs")]
struct Cli {
    /// Base URL of the droverd facade.
    #[arg(long, default_value = "http://127.0.0.1:7700", env = "DROVERD_URL")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List runs, newest first.
    List {
        #[arg(long)]
        active: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show full run detail.
    Show { run_id: String },
    /// Show the short status line for a run.
    Status { run_id: String },
    /// Start a new run.
    Start {
        #[arg(long)]
        task: String,
        #[arg(long)]
        repo_path: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        #[arg(long)]
        pipeline: Option<String>,
    },
    /// Cancel an active run.
    Cancel { run_id: String },
    /// Restart a finished run with its original configuration.
    Restart { run_id: String },
    /// Tail a run log.
    Logs {
        run_id: String,
        name: String,
        #[arg(long, default_value_t = 100)]
        lines: usize,
        /// Keep polling for new lines.
        #[arg(long)]
        follow: bool,
    },
    /// Describe available engines and stages.
    Engines,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new(cli.url.trim_end_matches('/'));

    match cli.command {
        Command::List { active, limit } => {
            let list = client.list_runs(active, limit).await?;
            print!("{}", render::render_run_table(&list.runs));
            if list.total > list.runs.len() {
                println!("({} of {} runs shown)", list.runs.len(), list.total);
            }
        }
        Command::Show { run_id } => {
            let detail = client.get_run(&run_id).await?;
            println!("{}", render::render_json(&detail));
        }
        Command::Status { run_id } => {
            let status = client.run_status(&run_id).await?;
            println!("{}", render::render_json(&status));
        }
        Command::Start {
            task,
            repo_path,
            base_branch,
            pipeline,
        } => {
            let request = serde_json::json!({
                "task": task,
                "repo_path": repo_path,
                "base_branch": base_branch,
                "pipeline": pipeline,
                "config_overrides": {},
            });
            let response = client.start_run(&request).await?;
            println!("{}", render::render_json(&response));
        }
        Command::Cancel { run_id } => {
            let response = client.cancel_run(&run_id).await?;
            println!("{}", render::render_json(&response));
        }
        Command::Restart { run_id } => {
            let response = client.restart_run(&run_id).await?;
            println!("{}", render::render_json(&response));
        }
        Command::Logs {
            run_id,
            name,
            lines,
            follow,
        } => {
            let mut page = client.tail_log(&run_id, &name, -1, lines).await?;
            for line in &page.lines {
                println!("{line}");
            }
            while follow {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                let next = client
                    .tail_log(&run_id, &name, page.cursor as i64, lines)
                    .await?;
                for line in &next.lines {
                    println!("{line}");
                }
                page = next;
            }
        }
        Command::Engines => {
            let engines = client.engines().await?;
            println!("{}", render::render_json(&engines));
        }
    }

    Ok(())
}
