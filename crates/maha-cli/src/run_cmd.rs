//! `maha run <feature>` command: drive a task graph to completion using the
//! orchestrator, grounded on the dispatch command's graceful-shutdown and
//! exit-code pattern.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use maha_core::config::{BackendKind, CliOverrides, MahaConfig};
use maha_core::{
    parse_graph, ContainerBackend, CooperativeBackend, MergeCoordinator, Orchestrator,
    OrchestratorOutcome, ProcessBackend, TaskGraph, WorktreeManager,
};
use maha_db::StateStore;

/// Exit code surfaced by [`run`] on a successful-but-nonzero outcome,
/// matching spec §6's taxonomy rather than a single "something went wrong".
pub enum RunExit {
    Success,
    GenericFailure(String),
    ValidationError(String),
    ConfigError(String),
    Cancelled,
}

pub struct RunArgs<'a> {
    pub feature: &'a str,
    pub graph_path: &'a Path,
    pub repo_path: &'a Path,
    pub state_root: &'a Path,
    pub base_branch: &'a str,
    pub workers: Option<usize>,
    pub mode: Option<String>,
    pub dry_run: bool,
}

/// Run the `run` command end to end.
pub async fn run(args: RunArgs<'_>) -> RunExit {
    match run_inner(args).await {
        Ok(exit) => exit,
        Err(e) => RunExit::ConfigError(format!("{e:#}")),
    }
}

async fn run_inner(args: RunArgs<'_>) -> Result<RunExit> {
    let graph_json = std::fs::read_to_string(args.graph_path)
        .with_context(|| format!("reading task graph at {}", args.graph_path.display()))?;
    let graph = match parse_graph(&graph_json) {
        Ok(g) => g,
        Err(e) => return Ok(RunExit::ValidationError(e.to_string())),
    };

    if args.dry_run {
        print_dry_run_summary(&graph);
        return Ok(RunExit::Success);
    }

    let overrides = CliOverrides {
        max_concurrent: args.workers,
        backend: args.mode.clone(),
    };
    let config = MahaConfig::resolve(&overrides)?;

    let worktree = WorktreeManager::new(args.repo_path, None)
        .with_context(|| format!("opening repo at {}", args.repo_path.display()))?;
    let merge = MergeCoordinator::new(worktree.clone(), config.gates.clone())
        .with_improvement_loop_max_iterations(config.improvement_loop_max_iterations)
        .with_verification_staleness_threshold(config.verification_staleness_threshold);

    let backend: Arc<dyn maha_core::Backend> = match config.backend {
        BackendKind::Cooperative => Arc::new(CooperativeBackend::new()),
        BackendKind::Process => Arc::new(ProcessBackend::new(maha_core::backend::process::ProcessBackendConfig {
            worker_command: std::env::var("MAHA_WORKER_COMMAND").unwrap_or_else(|_| "maha-worker".to_string()),
            worker_args: Vec::new(),
        })),
        BackendKind::Container => Arc::new(ContainerBackend::new(maha_core::backend::container::ContainerConfig {
            image: std::env::var("MAHA_WORKER_IMAGE").unwrap_or_else(|_| "mahabharatha-worker:latest".to_string()),
            extra_flags: Vec::new(),
        })),
    };

    let state = Arc::new(StateStore::new(args.state_root, args.feature));
    let graph = Arc::new(graph);

    let spec_dir = args
        .graph_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let orchestrator = Orchestrator::new(
        Arc::clone(&state),
        Arc::clone(&graph),
        backend,
        worktree,
        merge,
        config.scheduler,
        args.feature,
        args.base_branch,
        spec_dir,
        args.state_root.to_path_buf(),
    );

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nforce exit.");
                std::process::exit(130);
            }
            eprintln!("\nshutting down gracefully (Ctrl+C again to force)...");
            state.set_cancel_requested(true).ok();
            cancel_clone.cancel();
        }
    });

    let outcome = orchestrator.run(cancel).await?;

    match outcome {
        OrchestratorOutcome::Completed => {
            println!("\nfeature {:?} completed: all levels DONE.", args.feature);
            Ok(RunExit::Success)
        }
        OrchestratorOutcome::Failed { level, reason } => {
            println!("\nfeature {:?} failed at level {level}: {reason}", args.feature);
            Ok(RunExit::GenericFailure(reason))
        }
        OrchestratorOutcome::Interrupted => {
            println!("\nrun interrupted by signal. in-flight tasks drained.");
            println!("re-run `maha run {}` to resume.", args.feature);
            Ok(RunExit::Cancelled)
        }
    }
}

fn print_dry_run_summary(graph: &TaskGraph) {
    println!("feature: {}", graph.feature);
    println!("tasks: {}", graph.len());
    for level in graph.levels() {
        let ids = graph.tasks_at_level(level);
        println!("  level {level}: {} task(s)", ids.len());
        for id in ids {
            println!("    - {id}");
        }
    }
}
