//! Merge coordinator (spec §4.6): isolates a level's worker branches onto a
//! staging branch, runs quality gates before and after merging, and either
//! finalizes the feature branch or leaves the level FAILED with the staging
//! branch intact for inspection.

use std::time::Duration;

use maha_db::{EventKind, GateOutcome, StateStore, TaskStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{run_command, validate_command, CommandError};
use crate::graph::{TaskDef, TaskGraph};
use crate::worktree::{MergeResult, WorktreeError, WorktreeManager};

/// One configured quality gate (spec §6.1 `[[gates]]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub command: String,
    pub timeout_seconds: u64,
    pub required: bool,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Store(#[from] maha_db::StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Failed { reason: String },
}

/// Merges a level's worker branches into a per-level staging branch, gated
/// by configured quality checks, then fast-forwards the feature branch.
pub struct MergeCoordinator {
    worktree: WorktreeManager,
    gates: Vec<GateConfig>,
    improvement_loop_max_iterations: u32,
    verification_staleness_threshold: Duration,
}

impl MergeCoordinator {
    pub fn new(worktree: WorktreeManager, gates: Vec<GateConfig>) -> Self {
        Self {
            worktree,
            gates,
            improvement_loop_max_iterations: 1,
            verification_staleness_threshold: Duration::from_secs(1800),
        }
    }

    /// Cap on post-merge gate re-runs (`[improvement_loops] max_iterations`,
    /// default 1 i.e. no retry beyond the initial run).
    pub fn with_improvement_loop_max_iterations(mut self, max_iterations: u32) -> Self {
        self.improvement_loop_max_iterations = max_iterations.max(1);
        self
    }

    /// How long a task's COMPLETE verification is trusted without a re-check
    /// before merge (`[verification] staleness_threshold_seconds`).
    pub fn with_verification_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.verification_staleness_threshold = threshold;
        self
    }

    /// Drive the full spec §4.6 sequence for one level:
    /// prepare staging -> pre-merge gates -> merge worker branches
    /// (re-verifying any task whose COMPLETE status has gone stale first) ->
    /// post-merge gates with a bounded improvement loop -> finalize or abort.
    ///
    /// Async because it shares [`crate::command::run_command`] with
    /// verification; the git calls themselves stay the same blocking
    /// `std::process::Command` style as [`WorktreeManager`] since this runs
    /// only between scheduler polls, never under contention.
    pub async fn run_for_level(
        &self,
        state: &StateStore,
        graph: &TaskGraph,
        level: u32,
        base_branch: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let staging_branch = format!("{}-L{level}-staging", graph.feature);

        self.worktree.create_branch(&staging_branch, base_branch)?;
        self.worktree.checkout(&staging_branch)?;

        if let Some(outcome) = self.run_gates(state, level, &staging_branch, "pre-merge").await? {
            return Ok(outcome);
        }

        let complete_tasks = state.get_tasks_by_status_and_level(TaskStatus::Complete, level)?;
        let mut ordered_ids: Vec<String> = complete_tasks.iter().map(|t| t.id.clone()).collect();
        ordered_ids.sort();

        for task_id in &ordered_ids {
            let Some(task_def) = graph.task(task_id) else { continue };
            let worker_id = complete_tasks
                .iter()
                .find(|t| &t.id == task_id)
                .and_then(|t| t.worker_id);
            let Some(worker_id) = worker_id else { continue };
            let branch = WorktreeManager::branch_name(worker_id, &graph.feature);

            if !self.worktree.branch_exists(&branch)? {
                continue;
            }

            if self.verification_is_stale(state, task_id)? {
                if let Some(reason) = self.reverify_task(task_def, &branch, base_branch).await? {
                    return Ok(MergeOutcome::Failed { reason });
                }
            }

            match self.worktree.merge_branch(&branch)? {
                MergeResult::Success => {}
                MergeResult::Conflict { details } => {
                    let reason = format!(
                        "conflict merging branch {branch} (task {}) into {staging_branch}: {details}",
                        task_def.id
                    );
                    return Ok(MergeOutcome::Failed { reason });
                }
            }
        }

        if let Some(outcome) = self.run_post_merge_gates(state, level, &staging_branch).await? {
            return Ok(outcome);
        }

        self.worktree.checkout(base_branch)?;
        match self.worktree.fast_forward_merge(&staging_branch)? {
            MergeResult::Success => {}
            MergeResult::Conflict { details } => {
                let reason = format!(
                    "feature branch {base_branch} could not fast-forward to {staging_branch}: {details}"
                );
                return Ok(MergeOutcome::Failed { reason });
            }
        }

        for task_id in &ordered_ids {
            if let Some(task) = complete_tasks.iter().find(|t| &t.id == task_id) {
                if let Some(worker_id) = task.worker_id {
                    let branch = WorktreeManager::branch_name(worker_id, &graph.feature);
                    let _ = self.worktree.delete_branch(&branch);
                }
            }
        }

        Ok(MergeOutcome::Merged)
    }

    /// Whether `task_id`'s most recent COMPLETE event is older than
    /// `verification_staleness_threshold`. Tasks with no recorded COMPLETE
    /// event (e.g. reconciled into COMPLETE without an event, which
    /// shouldn't happen but isn't this method's job to police) are treated
    /// as fresh.
    fn verification_is_stale(&self, state: &StateStore, task_id: &str) -> Result<bool, MergeError> {
        let doc = state.load()?;
        let last_complete = doc
            .events
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::Complete && e.task_id.as_deref() == Some(task_id))
            .map(|e| e.ts);
        let Some(completed_at) = last_complete else {
            return Ok(false);
        };
        let age = chrono::Utc::now().signed_duration_since(completed_at);
        let threshold = chrono::Duration::from_std(self.verification_staleness_threshold)
            .unwrap_or(chrono::Duration::MAX);
        Ok(age > threshold)
    }

    /// Re-run a task's own verification command in a fresh worktree for its
    /// branch before trusting a stale COMPLETE status at merge time. Returns
    /// `Some(reason)` if the re-check fails, `None` if it still passes.
    async fn reverify_task(
        &self,
        task: &TaskDef,
        branch: &str,
        base_branch: &str,
    ) -> Result<Option<String>, MergeError> {
        let info = self.worktree.create_worktree(branch, base_branch)?;
        let outcome = run_command(
            &task.verification.command,
            &info.path,
            Duration::from_secs(task.verification.timeout_seconds),
        )
        .await;
        let _ = self.worktree.remove_worktree(&info.path);
        let result = outcome?;
        if result.passed {
            Ok(None)
        } else {
            Ok(Some(format!(
                "task {} completed more than {}s ago and failed re-verification before merge (exit {:?}): {}",
                task.id,
                self.verification_staleness_threshold.as_secs(),
                result.exit_code,
                result.stderr
            )))
        }
    }

    /// Run post-merge gates, then -- if a required gate fails -- re-run them
    /// up to `improvement_loop_max_iterations` times, reusing the first run
    /// as the loop's starting score. Stops early once a run produces the
    /// same failure reason as the run before it, since that means no
    /// automated fix landed between attempts.
    async fn run_post_merge_gates(
        &self,
        state: &StateStore,
        level: u32,
        branch: &str,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        let mut outcome = self.run_gates(state, level, branch, "post-merge").await?;
        let mut previous_reason = failed_reason(&outcome);
        for _ in 1..self.improvement_loop_max_iterations {
            if !matches!(outcome, Some(MergeOutcome::Failed { .. })) {
                break;
            }
            outcome = self.run_gates(state, level, branch, "post-merge").await?;
            let reason = failed_reason(&outcome);
            if reason == previous_reason {
                break;
            }
            previous_reason = reason;
        }
        Ok(outcome)
    }

    /// Run every configured gate against `branch`'s checked-out working
    /// tree, recording each outcome on the level record. Each gate's command
    /// is checked against the same dangerous-pattern validator the graph
    /// parser uses before it is ever handed to the shell; an unsafe command
    /// aborts the level without running it, required or not. Returns
    /// `Some(Failed)` as soon as a required gate fails (spec §4.6 "any
    /// required gate failing aborts"); non-required gate failures are
    /// recorded but do not abort. On abort, the level's status is flipped to
    /// FAILED and the staging branch is left in place for inspection.
    async fn run_gates(
        &self,
        state: &StateStore,
        level: u32,
        branch: &str,
        stage: &str,
    ) -> Result<Option<MergeOutcome>, MergeError> {
        for gate in &self.gates {
            if let Err(source) = validate_command(&gate.command) {
                state.set_level_status(level, maha_db::LevelStatus::Failed)?;
                return Ok(Some(MergeOutcome::Failed {
                    reason: format!(
                        "{stage} gate {:?} has an unsafe command and was not run: {source}",
                        gate.name
                    ),
                }));
            }

            let result = run_command(
                &gate.command,
                self.worktree.repo_path(),
                Duration::from_secs(gate.timeout_seconds),
            )
            .await?;

            state.record_gate_outcome(
                level,
                branch,
                GateOutcome {
                    name: gate.name.clone(),
                    passed: result.passed,
                    exit_code: result.exit_code,
                    stderr_snippet: if result.stderr.is_empty() {
                        None
                    } else {
                        Some(result.stderr.clone())
                    },
                },
            )?;

            if !result.passed && gate.required {
                state.set_level_status(level, maha_db::LevelStatus::Failed)?;
                return Ok(Some(MergeOutcome::Failed {
                    reason: format!(
                        "{stage} gate {:?} failed on branch {branch} (exit {:?}): {}",
                        gate.name, result.exit_code, result.stderr
                    ),
                }));
            }
        }
        Ok(None)
    }
}

fn failed_reason(outcome: &Option<MergeOutcome>) -> Option<String> {
    match outcome {
        Some(MergeOutcome::Failed { reason }) => Some(reason.clone()),
        _ => None,
    }
}
