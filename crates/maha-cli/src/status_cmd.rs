//! `maha status <feature>` command: show level and task progress for a
//! feature's state document.

use anyhow::{Context, Result};

use maha_db::{LevelStatus, StateStore, TaskStatus};

/// Run the status command.
pub fn run_status(state_root: &std::path::Path, feature: &str) -> Result<()> {
    let store = StateStore::new(state_root, feature);
    let doc = store
        .load()
        .with_context(|| format!("no state document for feature {feature:?} under {}", state_root.display()))?;

    println!("Feature: {feature}");
    if doc.cancel_requested {
        println!("Cancellation requested.");
    }
    if doc.paused {
        println!("Paused.");
    }
    println!();

    let mut levels: Vec<u32> = doc.levels.keys().copied().collect();
    levels.sort();

    for level in &levels {
        let record = &doc.levels[level];
        println!("Level {level}: {}", record.status);
        if let Some(branch) = &record.staging_branch {
            println!("  staging branch: {branch}");
        }
        for outcome in &record.gate_outcomes {
            let verdict = if outcome.passed { "pass" } else { "fail" };
            println!("  gate {} -> {verdict} (exit {:?})", outcome.name, outcome.exit_code);
        }

        let mut tasks: Vec<_> = doc.tasks.values().filter(|t| t.level == *level).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        for task in tasks {
            let icon = status_icon(task.status);
            println!(
                "  [{icon}] {} (attempt {}, worker {:?}, {})",
                task.id, task.attempt, task.worker_id, task.status
            );
        }
        println!();
    }

    let total = doc.tasks.len();
    let complete = doc.tasks.values().filter(|t| t.status == TaskStatus::Complete).count();
    println!("Progress: {complete}/{total} tasks complete across {} level(s).", levels.len());

    let done_levels = levels.iter().filter(|l| doc.levels[l].status == LevelStatus::Done).count();
    println!("Levels done: {done_levels}/{}.", levels.len());

    Ok(())
}

fn status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => ".",
        TaskStatus::Claimed => ">",
        TaskStatus::InProgress => "*",
        TaskStatus::Complete => "+",
        TaskStatus::Failed => "!",
        TaskStatus::Paused => "=",
    }
}
