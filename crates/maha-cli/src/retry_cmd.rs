//! `maha retry <feature>` command: reset matched tasks to PENDING and zero
//! their attempt count, mirroring the operator-retry path the scheduler
//! itself takes for tasks still under the retry ceiling.

use anyhow::{Context, Result};

use maha_db::{StateStore, TaskStatus};

/// Run the retry command. When `task_id` is set, resets that single task;
/// when `all_failed` is set, resets every FAILED task at the feature.
/// Exactly one of the two must be given.
pub fn run_retry(
    state_root: &std::path::Path,
    feature: &str,
    task_id: Option<&str>,
    all_failed: bool,
) -> Result<()> {
    let store = StateStore::new(state_root, feature);
    let doc = store
        .load()
        .with_context(|| format!("no state document for feature {feature:?} under {}", state_root.display()))?;

    let targets: Vec<String> = match (task_id, all_failed) {
        (Some(id), false) => {
            doc.tasks
                .get(id)
                .with_context(|| format!("task {id:?} not found in feature {feature:?}"))?;
            vec![id.to_string()]
        }
        (None, true) => doc
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect(),
        (Some(_), true) => anyhow::bail!("pass either --task or --all-failed, not both"),
        (None, false) => anyhow::bail!("pass --task <id> or --all-failed"),
    };

    if targets.is_empty() {
        println!("no matching failed tasks to retry.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    for id in &targets {
        store.reset_task_for_retry(id, now)?;
        println!("  {id} -> pending (attempt reset to 0)");
    }

    println!("\n{} task(s) reset for retry.", targets.len());
    Ok(())
}
