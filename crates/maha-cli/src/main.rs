mod cleanup_cmd;
mod retry_cmd;
mod run_cmd;
mod status_cmd;
mod stop_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use run_cmd::{RunArgs, RunExit};

#[derive(Parser)]
#[command(name = "maha", about = "Orchestrator for parallel AI coding agents against a single repository")]
struct Cli {
    /// Path to the git repository being worked on
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Directory holding per-feature state documents
    #[arg(long, global = true, default_value = ".maha/state")]
    state_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a feature's task graph to completion
    Run {
        /// Feature name (also the state document's key)
        feature: String,
        /// Path to the task graph JSON document (default: <feature>.tasks.json)
        #[arg(long)]
        graph: Option<PathBuf>,
        /// Base branch the feature branches off of and merges back into
        #[arg(long, default_value = "main")]
        base_branch: String,
        /// Maximum number of concurrent workers (overrides config)
        #[arg(long)]
        workers: Option<usize>,
        /// Worker backend: cooperative, process, or container
        #[arg(long)]
        mode: Option<String>,
        /// Validate and print the level breakdown without running anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show level and task progress for a feature
    Status {
        /// Feature name
        feature: String,
    },
    /// Request graceful cancellation of a running feature
    Stop {
        /// Feature name
        feature: String,
        /// Skip the grace-period wait for workers to drain
        #[arg(long)]
        force: bool,
    },
    /// Reset failed tasks back to PENDING with a zeroed attempt count
    Retry {
        /// Feature name
        feature: String,
        /// Retry a single task by id
        #[arg(long)]
        task: Option<String>,
        /// Retry every FAILED task at the feature
        #[arg(long)]
        all_failed: bool,
    },
    /// Remove worktrees, worker branches, and transient state for a feature
    Cleanup {
        /// Feature name
        feature: String,
        /// Keep the state document and monitor log
        #[arg(long)]
        keep_logs: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            feature,
            graph,
            base_branch,
            workers,
            mode,
            dry_run,
        } => {
            let graph_path = graph.unwrap_or_else(|| PathBuf::from(format!("{feature}.tasks.json")));
            let exit = run_cmd::run(RunArgs {
                feature: &feature,
                graph_path: &graph_path,
                repo_path: &cli.repo,
                state_root: &cli.state_root,
                base_branch: &base_branch,
                workers,
                mode,
                dry_run,
            })
            .await;

            match exit {
                RunExit::Success => Ok(()),
                RunExit::GenericFailure(reason) => {
                    eprintln!("run failed: {reason}");
                    std::process::exit(1);
                }
                RunExit::ValidationError(reason) => {
                    eprintln!("graph validation failed: {reason}");
                    std::process::exit(2);
                }
                RunExit::ConfigError(reason) => {
                    eprintln!("configuration or runtime error: {reason}");
                    std::process::exit(3);
                }
                RunExit::Cancelled => {
                    std::process::exit(130);
                }
            }
        }
        Commands::Status { feature } => {
            status_cmd::run_status(&cli.state_root, &feature)?;
            Ok(())
        }
        Commands::Stop { feature, force } => {
            stop_cmd::run_stop(&cli.state_root, &feature, force).await?;
            Ok(())
        }
        Commands::Retry { feature, task, all_failed } => {
            retry_cmd::run_retry(&cli.state_root, &feature, task.as_deref(), all_failed)?;
            Ok(())
        }
        Commands::Cleanup { feature, keep_logs } => {
            cleanup_cmd::run_cleanup(&cli.repo, &cli.state_root, &feature, keep_logs)?;
            Ok(())
        }
    }
}
