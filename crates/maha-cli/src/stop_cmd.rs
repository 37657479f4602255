//! `maha stop <feature>` command: request graceful cancellation and wait for
//! the run to drain, mirroring the dispatch command's own Ctrl+C handling.

use std::time::Duration;

use anyhow::{Context, Result};

use maha_db::StateStore;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Run the stop command. Sets the state document's `cancel_requested` flag
/// and waits, up to a grace period, for every worker to leave the busy
/// state. `force` skips the wait and returns as soon as the flag is set.
pub async fn run_stop(state_root: &std::path::Path, feature: &str, force: bool) -> Result<()> {
    let store = StateStore::new(state_root, feature);
    store
        .load()
        .with_context(|| format!("no state document for feature {feature:?} under {}", state_root.display()))?;

    store.set_cancel_requested(true)?;
    println!("cancellation requested for feature {feature:?}.");

    if force {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + GRACE_PERIOD;
    loop {
        let doc = store.load()?;
        let busy = doc
            .workers
            .values()
            .any(|w| w.status == maha_db::WorkerStatus::Busy);
        if !busy {
            println!("all workers drained.");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            println!("grace period elapsed with workers still busy; state preserved for inspection.");
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
