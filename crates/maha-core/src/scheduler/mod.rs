//! Level-gated scheduler / orchestrator (spec §4.5).
//!
//! A single loop drives one level of the task graph to completion before
//! the next level's tasks become eligible: maintain worker slot capacity,
//! run watchdogs over stale tasks and stalled workers, promote retry-eligible
//! failures back to PENDING, and once every task at the level is terminal,
//! hand off to the merge coordinator before advancing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use maha_db::models::{LevelStatus, TaskStatus, WorkerRecord, WorkerStatus};
use maha_db::StateStore;

use crate::backend::{spawn_with_retry, Backend, BackendHandle, SpawnRequest, SpawnResult, SpawnRetryPolicy};
use crate::graph::TaskGraph;
use crate::merge::{MergeCoordinator, MergeOutcome};
use crate::worktree::WorktreeManager;

/// Mirrors the `workers.*` config options of spec §9.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub spawn_retry: SpawnRetryPolicy,
    pub task_stale_timeout: Duration,
    pub heartbeat_stale_threshold: Duration,
    pub reconcile_interval: Duration,
    pub poll_interval: Duration,
    pub auto_respawn: bool,
    pub max_respawn_attempts: u32,
    /// Not in §9's config table; see DESIGN.md Open Question decisions.
    pub task_max_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            spawn_retry: SpawnRetryPolicy::default(),
            task_stale_timeout: Duration::from_secs(600),
            heartbeat_stale_threshold: Duration::from_secs(120),
            reconcile_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            auto_respawn: true,
            max_respawn_attempts: 5,
            task_max_attempts: 3,
            retry_backoff_base: Duration::from_secs(2),
            retry_backoff_cap: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorOutcome {
    Completed,
    Failed { level: u32, reason: String },
    Interrupted,
}

struct WorkerSlot {
    handle: BackendHandle,
    respawn_count: u32,
}

/// Drives a task graph's levels to completion, one at a time.
pub struct Orchestrator {
    state: Arc<StateStore>,
    graph: Arc<TaskGraph>,
    backend: Arc<dyn Backend>,
    worktree: WorktreeManager,
    merge: MergeCoordinator,
    config: SchedulerConfig,
    feature: String,
    base_branch: String,
    spec_dir: PathBuf,
    state_root: PathBuf,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateStore>,
        graph: Arc<TaskGraph>,
        backend: Arc<dyn Backend>,
        worktree: WorktreeManager,
        merge: MergeCoordinator,
        config: SchedulerConfig,
        feature: impl Into<String>,
        base_branch: impl Into<String>,
        spec_dir: impl Into<PathBuf>,
        state_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state,
            graph,
            backend,
            worktree,
            merge,
            config,
            feature: feature.into(),
            base_branch: base_branch.into(),
            spec_dir: spec_dir.into(),
            state_root: state_root.into(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<OrchestratorOutcome> {
        let mut slots: HashMap<u32, WorkerSlot> = HashMap::new();
        let mut last_reconcile = Instant::now()
            .checked_sub(self.config.reconcile_interval)
            .unwrap_or_else(Instant::now);

        for level in self.graph.levels() {
            self.state.ensure_level(level)?;
            self.state.set_level_status(level, LevelStatus::InProgress)?;
            for task_id in self.graph.tasks_at_level(level) {
                self.state.ensure_task(task_id, level)?;
            }

            loop {
                if cancel.is_cancelled() || self.state.is_cancel_requested()? {
                    tracing::info!(feature = %self.feature, level, "cancellation requested, draining workers");
                    self.terminate_all(&mut slots, true).await;
                    return Ok(OrchestratorOutcome::Interrupted);
                }

                if self.state.is_paused()? {
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }

                if last_reconcile.elapsed() >= self.config.reconcile_interval {
                    self.reconcile_periodic()?;
                    last_reconcile = Instant::now();
                }

                self.run_watchdogs(level)?;
                self.promote_retry_eligible_tasks(level)?;
                self.maintain_capacity(&mut slots).await;

                if self.level_is_terminal(level)? {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = cancel.cancelled() => {}
                }
            }

            self.state.set_level_status(level, LevelStatus::Merging)?;
            match self
                .merge
                .run_for_level(&self.state, &self.graph, level, &self.base_branch)
                .await
            {
                Ok(MergeOutcome::Merged) => {
                    self.state.set_level_status(level, LevelStatus::Done)?;
                }
                Ok(MergeOutcome::Failed { reason }) => {
                    self.state.set_level_status(level, LevelStatus::Failed)?;
                    self.terminate_all(&mut slots, true).await;
                    return Ok(OrchestratorOutcome::Failed { level, reason });
                }
                Err(e) => {
                    self.state.set_level_status(level, LevelStatus::Failed)?;
                    self.terminate_all(&mut slots, true).await;
                    return Ok(OrchestratorOutcome::Failed {
                        level,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.terminate_all(&mut slots, true).await;
        Ok(OrchestratorOutcome::Completed)
    }

    /// A level is terminal once every task in it is COMPLETE or
    /// FAILED-exhausted (attempt ceiling reached, no retry left).
    fn level_is_terminal(&self, level: u32) -> anyhow::Result<bool> {
        let total = self.graph.tasks_at_level(level).len();
        let complete = self.state.get_tasks_by_status_and_level(TaskStatus::Complete, level)?;
        let failed = self.state.get_tasks_by_status_and_level(TaskStatus::Failed, level)?;
        let exhausted = failed
            .iter()
            .filter(|t| t.attempt >= self.config.task_max_attempts)
            .count();

        Ok(complete.len() + exhausted == total)
    }

    /// Promote FAILED tasks still under the retry ceiling back to PENDING
    /// once their backoff window has passed.
    fn promote_retry_eligible_tasks(&self, level: u32) -> anyhow::Result<()> {
        let now = Utc::now();
        let failed = self.state.get_tasks_by_status_and_level(TaskStatus::Failed, level)?;
        for task in failed {
            if task.attempt >= self.config.task_max_attempts {
                continue;
            }
            let eligible = task.next_eligible_after.map(|na| na <= now).unwrap_or(true);
            if eligible {
                self.state.set_task_status(&task.id, TaskStatus::Pending, None, now)?;
            }
        }
        Ok(())
    }

    /// Watchdogs (spec §4.5 step 5): stale IN_PROGRESS tasks are failed as
    /// an attempt (timeout is a verification-class failure); workers whose
    /// heartbeat has gone stale release their task without incrementing
    /// attempt (infrastructure-class) and are marked STALLED for respawn.
    fn run_watchdogs(&self, level: u32) -> anyhow::Result<()> {
        let now = Utc::now();

        let in_progress = self.state.get_tasks_by_status_and_level(TaskStatus::InProgress, level)?;
        for task in in_progress {
            let Some(claimed_at) = task.claimed_at else { continue };
            let elapsed = now.signed_duration_since(claimed_at);
            if elapsed.to_std().unwrap_or(Duration::ZERO) > self.config.task_stale_timeout {
                tracing::warn!(task_id = %task.id, "task stale, marking failed (timeout)");
                self.state.fail_task_attempt(
                    &task.id,
                    "timeout",
                    self.config.retry_backoff_base,
                    self.config.retry_backoff_cap,
                    now,
                )?;
            }
        }

        let doc = self.state.load()?;
        for worker in doc.workers.values() {
            if worker.status != WorkerStatus::Busy {
                continue;
            }
            let Some(last_heartbeat) = worker.last_heartbeat else { continue };
            let elapsed = now.signed_duration_since(last_heartbeat);
            if elapsed.to_std().unwrap_or(Duration::ZERO) > self.config.heartbeat_stale_threshold {
                tracing::warn!(worker_id = worker.id, "worker heartbeat stale, marking stalled");
                let mut updated = worker.clone();
                updated.status = WorkerStatus::Stalled;
                self.state.set_worker_state(updated)?;
                if let Some(task_id) = &worker.task_id {
                    self.state.reassign_without_attempt(task_id, "heartbeat_stale", now)?;
                }
            }
        }

        Ok(())
    }

    fn reconcile_periodic(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let fixed = self.state.reconcile_dead_worker_tasks(now)?;
        if !fixed.is_empty() {
            tracing::info!(tasks = ?fixed, "reconciled tasks held by dead workers");
        }
        for level in self.graph.levels() {
            self.state.reconcile_level_done_with_incomplete(level)?;
        }
        Ok(())
    }

    /// For each worker slot below `max_concurrent` that isn't currently
    /// tracked as alive, spawn one through the retry envelope.
    async fn maintain_capacity(&self, slots: &mut HashMap<u32, WorkerSlot>) {
        let mut dead: Vec<u32> = Vec::new();
        for (&worker_id, slot) in slots.iter() {
            if !self.backend.is_alive(&slot.handle).await {
                dead.push(worker_id);
            }
        }
        for worker_id in dead {
            slots.remove(&worker_id);
        }

        if slots.len() >= self.config.max_concurrent {
            return;
        }
        if !slots.is_empty() && !self.config.auto_respawn {
            return;
        }

        for worker_id in 0..self.config.max_concurrent as u32 {
            if slots.len() >= self.config.max_concurrent {
                break;
            }
            if slots.contains_key(&worker_id) {
                continue;
            }

            let respawn_count = slots.get(&worker_id).map(|s| s.respawn_count).unwrap_or(0);
            if respawn_count > self.config.max_respawn_attempts {
                continue;
            }

            let branch = WorktreeManager::branch_name(worker_id, &self.feature);
            let worktree_path = match self
                .worktree
                .create_worktree(&branch, &self.base_branch)
            {
                Ok(info) => info.path,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "failed to create worktree for worker");
                    continue;
                }
            };

            let req = SpawnRequest {
                worker_id,
                feature: self.feature.clone(),
                worktree: worktree_path.clone(),
                branch: branch.clone(),
                main_repo: self.worktree.repo_path().to_path_buf(),
                spec_dir: self.spec_dir.clone(),
                state_root: self.state_root.clone(),
            };

            match spawn_with_retry(self.backend.as_ref(), &req, &self.config.spawn_retry).await {
                SpawnResult::Spawned(handle) => {
                    let record = WorkerRecord::new(worker_id, branch, worktree_path.display().to_string());
                    if let Err(e) = self.state.set_worker_state(record) {
                        tracing::error!(worker_id, error = %e, "failed to persist spawned worker state");
                    }
                    slots.insert(worker_id, WorkerSlot { handle, respawn_count });
                }
                SpawnResult::Failed { reason, .. } => {
                    tracing::error!(worker_id, reason, "worker spawn exhausted retries");
                }
            }
        }
    }

    async fn terminate_all(&self, slots: &mut HashMap<u32, WorkerSlot>, graceful: bool) {
        for (_, slot) in slots.drain() {
            let _ = self.backend.terminate(&slot.handle, graceful).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cooperative::CooperativeBackend;
    use crate::graph::parse_graph;
    use crate::merge::{GateConfig, MergeCoordinator};

    fn single_task_graph() -> TaskGraph {
        let json = serde_json::json!({
            "feature": "checkout-flow",
            "schema_version": 2,
            "tasks": [{
                "id": "checkout-flow-L1-add-button",
                "title": "Add button",
                "description": "desc",
                "level": 1,
                "dependencies": [],
                "files": {"create": ["src/button.rs"], "modify": [], "read": []},
                "verification": {"command": "true", "timeout_seconds": 10}
            }]
        });
        parse_graph(&json.to_string()).expect("valid graph")
    }

    fn setup() -> (tempfile::TempDir, Arc<StateStore>, Arc<TaskGraph>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path(), "checkout-flow"));
        let graph = Arc::new(single_task_graph());
        (dir, store, graph)
    }

    fn init_repo() -> (tempfile::TempDir, WorktreeManager) {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            std::process::Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
        };
        run(&["init"]);
        run(&["config", "user.email", "test@mahabharatha.dev"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
        let mgr = WorktreeManager::new(dir.path(), None).unwrap();
        (dir, mgr)
    }

    #[tokio::test]
    async fn level_is_terminal_when_all_tasks_complete() {
        let (_dir, store, graph) = setup();
        store.ensure_task("checkout-flow-L1-add-button", 1).unwrap();
        store
            .set_task_status("checkout-flow-L1-add-button", TaskStatus::Complete, None, Utc::now())
            .unwrap();

        let (_repo_dir, worktree) = init_repo();
        let backend = Arc::new(CooperativeBackend::new());
        let merge = MergeCoordinator::new(worktree.clone(), vec![]);
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            backend,
            worktree,
            merge,
            SchedulerConfig::default(),
            "checkout-flow",
            "main",
            "/tmp/spec",
            "/tmp/state",
        );

        assert!(orchestrator.level_is_terminal(1).unwrap());
    }

    #[tokio::test]
    async fn level_is_terminal_when_failures_exhaust_retry_ceiling() {
        let (_dir, store, graph) = setup();
        store.ensure_task("checkout-flow-L1-add-button", 1).unwrap();
        for _ in 0..3 {
            store
                .fail_task_attempt(
                    "checkout-flow-L1-add-button",
                    "verification failed",
                    Duration::from_secs(0),
                    Duration::from_secs(0),
                    Utc::now(),
                )
                .unwrap();
        }

        let (_repo_dir, worktree) = init_repo();
        let backend = Arc::new(CooperativeBackend::new());
        let merge = MergeCoordinator::new(worktree.clone(), vec![]);
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            backend,
            worktree,
            merge,
            SchedulerConfig {
                task_max_attempts: 3,
                ..SchedulerConfig::default()
            },
            "checkout-flow",
            "main",
            "/tmp/spec",
            "/tmp/state",
        );

        assert!(orchestrator.level_is_terminal(1).unwrap());
    }

    #[tokio::test]
    async fn promote_retry_eligible_tasks_resets_failed_to_pending() {
        let (_dir, store, graph) = setup();
        store.ensure_task("checkout-flow-L1-add-button", 1).unwrap();
        store
            .fail_task_attempt(
                "checkout-flow-L1-add-button",
                "flaky",
                Duration::from_secs(0),
                Duration::from_secs(0),
                Utc::now(),
            )
            .unwrap();

        let (_repo_dir, worktree) = init_repo();
        let backend = Arc::new(CooperativeBackend::new());
        let merge = MergeCoordinator::new(worktree.clone(), vec![]);
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            backend,
            worktree,
            merge,
            SchedulerConfig::default(),
            "checkout-flow",
            "main",
            "/tmp/spec",
            "/tmp/state",
        );

        orchestrator.promote_retry_eligible_tasks(1).unwrap();
        let task = store.get_task("checkout-flow-L1-add-button").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
