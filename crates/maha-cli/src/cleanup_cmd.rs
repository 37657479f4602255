//! `maha cleanup <feature>` command: remove worktrees and worker branches
//! left behind by a finished or abandoned run.

use anyhow::{Context, Result};

use maha_core::WorktreeManager;
use maha_db::{StatePaths, StateStore, TaskStatus};

/// Run the cleanup command. Removes worker worktrees/branches for every
/// worker recorded in the feature's state document; unless `keep_logs`,
/// also deletes the state document and its peer files.
pub fn run_cleanup(
    repo_path: &std::path::Path,
    state_root: &std::path::Path,
    feature: &str,
    keep_logs: bool,
) -> Result<()> {
    let store = StateStore::new(state_root, feature);
    let doc = store
        .load()
        .with_context(|| format!("no state document for feature {feature:?} under {}", state_root.display()))?;

    let worktree_manager =
        WorktreeManager::new(repo_path, None).with_context(|| format!("opening repo at {}", repo_path.display()))?;

    let mut removed = 0;
    let mut skipped = 0;

    for worker in doc.workers.values() {
        let still_claimed = doc.tasks.values().any(|t| {
            t.worker_id == Some(worker.id) && !matches!(t.status, TaskStatus::Complete | TaskStatus::Failed)
        });
        if still_claimed {
            skipped += 1;
            continue;
        }

        let path = std::path::Path::new(&worker.worktree);
        match worktree_manager.remove_worktree(path) {
            Ok(()) => {
                println!("  removed worktree {} (worker {})", worker.worktree, worker.id);
                removed += 1;
            }
            Err(e) => {
                eprintln!("  warning: failed to remove worktree for worker {}: {e}", worker.id);
            }
        }
        let _ = worktree_manager.delete_branch(&worker.branch);
    }

    let _ = worktree_manager.cleanup_stale();

    println!("\ncleanup complete: {removed} worktree(s) removed, {skipped} skipped.");

    if !keep_logs {
        let paths = StatePaths::new(state_root, feature);
        for worker_id in doc.workers.keys() {
            let _ = std::fs::remove_file(paths.heartbeat_file(*worker_id));
            let _ = std::fs::remove_file(paths.progress_file(*worker_id));
        }
        let _ = std::fs::remove_file(paths.monitor_log());
        let _ = std::fs::remove_file(paths.state_document());
        let _ = std::fs::remove_file(paths.lock_file());
        let _ = std::fs::remove_file(paths.temp_document());
        println!("removed state document and peer files.");
    }

    Ok(())
}
