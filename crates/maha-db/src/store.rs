//! The state store (spec §4.2): a durable, per-feature JSON document with
//! serialized mutation.
//!
//! Every mutating method acquires the in-process reentrant lock for its
//! entire body, then the cross-process file lock for the duration of the
//! read-modify-write cycle against the document on disk. The two locks are
//! never interleaved with any other lock (spec §5's locking discipline).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::lock::FileLock;
use crate::models::{
    EventKind, ExecutionEvent, FileOwnership, GateOutcome, LevelRecord, LevelStatus, TaskRecord,
    TaskStatus, WorkerRecord, WorkerStatus,
};
use crate::paths::StatePaths;

/// Maximum number of execution events retained in the bounded log (spec §3,
/// §6: "tail-bounded").
const EVENT_LOG_CAPACITY: usize = 2000;

/// The on-disk shape of a feature's state document (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    pub feature: String,
    #[serde(default)]
    pub tasks: HashMap<String, TaskRecord>,
    #[serde(default)]
    pub workers: HashMap<u32, WorkerRecord>,
    #[serde(default)]
    pub levels: HashMap<u32, LevelRecord>,
    #[serde(default)]
    pub events: Vec<ExecutionEvent>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl StateDocument {
    fn empty(feature: &str) -> Self {
        Self {
            feature: feature.to_string(),
            ..Default::default()
        }
    }

    fn push_event(&mut self, event: ExecutionEvent) {
        self.events.push(event);
        if self.events.len() > EVENT_LOG_CAPACITY {
            let overflow = self.events.len() - EVENT_LOG_CAPACITY;
            self.events.drain(0..overflow);
        }
    }
}

/// Retry backoff: `base * 2^(attempt-1)`, capped (spec §4.2).
pub fn retry_backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let scaled = base.saturating_mul(factor as u32);
    scaled.min(cap)
}

/// Durable per-feature state store backed by a JSON document on disk.
pub struct StateStore {
    paths: StatePaths,
    /// Reentrant in-process guard: a single mutex wraps the whole store, so
    /// every public method acquires it once for its full body. Composite
    /// reads performed by private helpers reuse the caller's already-locked
    /// reference rather than locking again.
    inner: Mutex<Cache>,
}

#[derive(Default)]
struct Cache {
    doc: Option<StateDocument>,
    mtime: Option<std::time::SystemTime>,
}

impl StateStore {
    pub fn new(state_root: impl Into<std::path::PathBuf>, feature: impl Into<String>) -> Self {
        Self {
            paths: StatePaths::new(state_root, feature),
            inner: Mutex::new(Cache::default()),
        }
    }

    /// `load(feature)`: returns the persisted state, initializing an empty
    /// document if none exists yet (spec §4.2 contract table).
    pub fn load(&self) -> Result<StateDocument> {
        let mut guard = self.inner.lock().expect("state store mutex poisoned");
        self.reload_if_stale(&mut guard)?;
        Ok(guard
            .doc
            .clone()
            .unwrap_or_else(|| StateDocument::empty(self.paths.feature())))
    }

    fn reload_if_stale(&self, guard: &mut Cache) -> Result<()> {
        std::fs::create_dir_all(self.paths.root())?;
        let path = self.paths.state_document();
        let disk_mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());

        if guard.doc.is_some() && guard.mtime == disk_mtime {
            return Ok(());
        }

        let doc = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                StateDocument::empty(self.paths.feature())
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        guard.doc = Some(doc);
        guard.mtime = disk_mtime;
        Ok(())
    }

    /// Write-to-temp-then-rename, giving atomicity against process death
    /// mid-write (spec §4.2).
    fn persist(&self, guard: &mut Cache, doc: StateDocument) -> Result<()> {
        let tmp = self.paths.temp_document();
        let final_path = self.paths.state_document();
        let bytes = serde_json::to_vec_pretty(&doc)?;
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &final_path)?;
        let mtime = std::fs::metadata(&final_path).ok().and_then(|m| m.modified().ok());
        guard.mtime = mtime;
        guard.doc = Some(doc);
        Ok(())
    }

    /// Run `f` against the current document under both the in-process lock
    /// and the cross-process file lock, persisting whatever `f` leaves
    /// behind. The file lock spans the entire cycle, including `f`'s body,
    /// so no caller can observe or create an interleaved write.
    fn mutate<T>(&self, f: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().expect("state store mutex poisoned");
        std::fs::create_dir_all(self.paths.root())?;
        let _file_lock = FileLock::acquire(&self.paths.lock_file())?;

        self.reload_if_stale(&mut guard)?;
        let mut doc = guard
            .doc
            .clone()
            .unwrap_or_else(|| StateDocument::empty(self.paths.feature()));

        let result = f(&mut doc)?;
        self.persist(&mut guard, doc)?;
        Ok(result)
    }

    /// `claim_task(worker_id, level)`: returns at most one PENDING task in
    /// `level` with all dependencies COMPLETE and file-ownership disjoint
    /// from every currently CLAIMED/IN_PROGRESS task, atomically marking it
    /// CLAIMED (spec §4.2 contract table). `dependencies` and `files` come
    /// from the read-only task graph, not the state document, since the
    /// store has no notion of graph structure.
    pub fn claim_task(
        &self,
        worker_id: u32,
        level: u32,
        dependencies: &HashMap<String, Vec<String>>,
        files: &HashMap<String, FileOwnership>,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<String>> {
        self.mutate(|doc| {
            let in_flight_paths: Vec<String> = doc
                .tasks
                .values()
                .filter(|t| matches!(t.status, TaskStatus::Claimed | TaskStatus::InProgress))
                .flat_map(|t| {
                    files
                        .get(&t.id)
                        .map(|fo| fo.create.iter().chain(fo.modify.iter()).cloned().collect::<Vec<_>>())
                        .unwrap_or_default()
                })
                .collect();

            let mut candidate_ids: Vec<String> = doc
                .tasks
                .values()
                .filter(|t| t.level == level)
                .filter(|t| t.status == TaskStatus::Pending)
                .filter(|t| t.next_eligible_after.map(|na| na <= now).unwrap_or(true))
                .filter(|t| {
                    dependencies
                        .get(&t.id)
                        .map(|deps| {
                            deps.iter().all(|d| {
                                doc.tasks
                                    .get(d)
                                    .map(|dt| dt.status == TaskStatus::Complete)
                                    .unwrap_or(false)
                            })
                        })
                        .unwrap_or(true)
                })
                .filter(|t| {
                    let own_paths = files
                        .get(&t.id)
                        .map(|fo| fo.create.iter().chain(fo.modify.iter()).cloned().collect::<Vec<_>>())
                        .unwrap_or_default();
                    own_paths.iter().all(|p| !in_flight_paths.contains(p))
                })
                .map(|t| t.id.clone())
                .collect();
            candidate_ids.sort();

            let Some(task_id) = candidate_ids.into_iter().next() else {
                return Ok(None);
            };

            let record = doc.tasks.get_mut(&task_id).expect("candidate exists");
            record.status = TaskStatus::Claimed;
            record.worker_id = Some(worker_id);
            record.claimed_at = Some(now);
            doc.push_event(ExecutionEvent {
                ts: now,
                worker_id: Some(worker_id),
                task_id: Some(task_id.clone()),
                kind: EventKind::Claim,
                data: serde_json::Value::Null,
            });
            Ok(Some(task_id))
        })
    }

    /// `set_task_status(task_id, status, reason?)`: validates the transition
    /// (warn-and-allow, always logged) and writes it (spec §4.5).
    pub fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: Option<&str>,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|doc| {
            let record = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            let from = record.status;
            let well_formed = TaskStatus::is_well_formed_transition(from, status);
            record.status = status;
            record.reason = reason.map(str::to_string);
            if status.is_terminal() || status == TaskStatus::Pending {
                record.claimed_at = None;
            }

            let kind = match status {
                TaskStatus::Complete => EventKind::Complete,
                TaskStatus::Failed => EventKind::Fail,
                TaskStatus::InProgress => EventKind::Start,
                _ => EventKind::ReconcileFix,
            };
            let worker_id = record.worker_id;
            doc.push_event(ExecutionEvent {
                ts: now,
                worker_id,
                task_id: Some(task_id.to_string()),
                kind,
                data: serde_json::json!({
                    "from": from.to_string(),
                    "to": status.to_string(),
                    "well_formed": well_formed,
                    "reason": reason,
                }),
            });
            Ok(())
        })
    }

    /// `release_task(task_id)`: CLAIMED/IN_PROGRESS → PENDING (spec §4.2).
    pub fn release_task(&self, task_id: &str, now: chrono::DateTime<Utc>) -> Result<()> {
        self.mutate(|doc| {
            let record = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            if matches!(record.status, TaskStatus::Claimed | TaskStatus::InProgress) {
                record.status = TaskStatus::Pending;
                record.worker_id = None;
                record.claimed_at = None;
            }
            doc.push_event(ExecutionEvent {
                ts: now,
                worker_id: None,
                task_id: Some(task_id.to_string()),
                kind: EventKind::ReconcileFix,
                data: serde_json::json!({"action": "release"}),
            });
            Ok(())
        })
    }

    /// Mark a verification failure as an attempt: increments `attempt`,
    /// sets `next_eligible_after` using the backoff policy, and transitions
    /// to FAILED with the given reason (spec §4.2, §7 "task verification").
    pub fn fail_task_attempt(
        &self,
        task_id: &str,
        reason: &str,
        base: Duration,
        cap: Duration,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|doc| {
            let record = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            record.attempt += 1;
            record.status = TaskStatus::Failed;
            record.reason = Some(reason.to_string());
            let delay = retry_backoff(base, record.attempt, cap);
            record.next_eligible_after = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            let worker_id = record.worker_id;
            let attempt = record.attempt;
            doc.push_event(ExecutionEvent {
                ts: now,
                worker_id,
                task_id: Some(task_id.to_string()),
                kind: EventKind::Fail,
                data: serde_json::json!({"reason": reason, "attempt": attempt}),
            });
            Ok(())
        })
    }

    /// Release a task back to PENDING without incrementing attempt count —
    /// used for infrastructure-class failures (worker crash, stale
    /// heartbeat) per spec §4.2 "crashes do not count as attempts".
    pub fn reassign_without_attempt(
        &self,
        task_id: &str,
        reason: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|doc| {
            let record = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            record.status = TaskStatus::Pending;
            record.worker_id = None;
            record.claimed_at = None;
            record.reason = Some(reason.to_string());
            doc.push_event(ExecutionEvent {
                ts: now,
                worker_id: None,
                task_id: Some(task_id.to_string()),
                kind: EventKind::Reassign,
                data: serde_json::json!({"reason": reason}),
            });
            Ok(())
        })
    }

    /// Reset a task to PENDING and zero its attempt count (spec §6.1
    /// `retry` verb: "resets matched tasks to PENDING and zeroes attempt
    /// count"), unlike [`Self::set_task_status`]'s Pending transition which
    /// leaves `attempt` untouched for the scheduler's own retry-ceiling
    /// promotion path.
    pub fn reset_task_for_retry(&self, task_id: &str, now: chrono::DateTime<Utc>) -> Result<()> {
        self.mutate(|doc| {
            let record = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            record.status = TaskStatus::Pending;
            record.attempt = 0;
            record.worker_id = None;
            record.claimed_at = None;
            record.next_eligible_after = None;
            record.reason = None;
            doc.push_event(ExecutionEvent {
                ts: now,
                worker_id: None,
                task_id: Some(task_id.to_string()),
                kind: EventKind::Retry,
                data: serde_json::json!({"action": "operator_retry"}),
            });
            Ok(())
        })
    }

    /// `get_tasks_by_status_and_level(status, level)`: filtered snapshot
    /// (spec §4.2 contract table).
    pub fn get_tasks_by_status_and_level(
        &self,
        status: TaskStatus,
        level: u32,
    ) -> Result<Vec<TaskRecord>> {
        let mut guard = self.inner.lock().expect("state store mutex poisoned");
        self.reload_if_stale(&mut guard)?;
        let doc = guard.doc.as_ref().expect("reload populated doc");
        Ok(doc
            .tasks
            .values()
            .filter(|t| t.status == status && t.level == level)
            .cloned()
            .collect())
    }

    /// `set_worker_state(worker_id, state)`: persists the worker record
    /// (spec §4.2 contract table). Inserts a new record if the worker is
    /// unseen.
    pub fn set_worker_state(&self, record: WorkerRecord) -> Result<()> {
        self.mutate(|doc| {
            doc.workers.insert(record.id, record);
            Ok(())
        })
    }

    /// `record_heartbeat(worker_id, task_id, step, pct)`: writes last-beat
    /// with a monotonic timestamp (spec §4.2). An older heartbeat than the
    /// one on file is ignored (spec §5, §8 invariant 7).
    pub fn record_heartbeat(
        &self,
        worker_id: u32,
        task_id: Option<&str>,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(|doc| {
            let Some(worker) = doc.workers.get_mut(&worker_id) else {
                return Err(StoreError::WorkerNotFound(worker_id));
            };
            if worker.last_heartbeat.map(|lb| now <= lb).unwrap_or(false) {
                return Ok(());
            }
            worker.last_heartbeat = Some(now);
            worker.task_id = task_id.map(str::to_string);
            Ok(())
        })
    }

    /// `is_paused()` (spec §4.2 contract table).
    pub fn is_paused(&self) -> Result<bool> {
        Ok(self.load()?.paused)
    }

    /// `is_cancel_requested()` (spec §4.2 contract table).
    pub fn is_cancel_requested(&self) -> Result<bool> {
        Ok(self.load()?.cancel_requested)
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.mutate(|doc| {
            doc.paused = paused;
            Ok(())
        })
    }

    pub fn set_cancel_requested(&self, cancel: bool) -> Result<()> {
        self.mutate(|doc| {
            doc.cancel_requested = cancel;
            Ok(())
        })
    }

    /// `append_event(event)` (spec §4.2 contract table).
    pub fn append_event(&self, event: ExecutionEvent) -> Result<()> {
        self.mutate(|doc| {
            doc.push_event(event);
            Ok(())
        })
    }

    /// Ensure a task exists in the document with PENDING status, used when
    /// first materializing a loaded task graph into the store.
    pub fn ensure_task(&self, id: &str, level: u32) -> Result<()> {
        self.mutate(|doc| {
            doc.tasks
                .entry(id.to_string())
                .or_insert_with(|| TaskRecord::new(id, level));
            Ok(())
        })
    }

    pub fn ensure_level(&self, level: u32) -> Result<()> {
        self.mutate(|doc| {
            doc.levels.entry(level).or_insert_with(|| LevelRecord::new(level));
            Ok(())
        })
    }

    pub fn set_level_status(&self, level: u32, status: LevelStatus) -> Result<()> {
        self.mutate(|doc| {
            let record = doc.levels.entry(level).or_insert_with(|| LevelRecord::new(level));
            record.status = status;
            Ok(())
        })
    }

    /// Append a gate outcome to a level's record and, once, stamp its
    /// staging branch name -- used by the merge coordinator, which otherwise
    /// has no way to persist gate results without reaching into the
    /// document directly.
    pub fn record_gate_outcome(
        &self,
        level: u32,
        staging_branch: &str,
        outcome: GateOutcome,
    ) -> Result<()> {
        self.mutate(|doc| {
            let record = doc.levels.entry(level).or_insert_with(|| LevelRecord::new(level));
            if record.staging_branch.is_none() {
                record.staging_branch = Some(staging_branch.to_string());
            }
            record.gate_outcomes.push(outcome);
            Ok(())
        })
    }

    pub fn get_level(&self, level: u32) -> Result<Option<LevelRecord>> {
        Ok(self.load()?.levels.get(&level).cloned())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.load()?.tasks.get(task_id).cloned())
    }

    pub fn get_worker(&self, worker_id: u32) -> Result<Option<WorkerRecord>> {
        Ok(self.load()?.workers.get(&worker_id).cloned())
    }

    /// Reconciliation fix (a): dead-worker-holding-task → FAILED, reason
    /// `worker_crash`, attempt count unchanged (spec §4.5.3).
    pub fn reconcile_dead_worker_tasks(&self, now: chrono::DateTime<Utc>) -> Result<Vec<String>> {
        self.mutate(|doc| {
            let dead_workers: Vec<u32> = doc
                .workers
                .values()
                .filter(|w| w.status.is_dead())
                .map(|w| w.id)
                .collect();

            let mut fixed = Vec::new();
            for (id, task) in doc.tasks.iter_mut() {
                if matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress)
                    && task.worker_id.map(|w| dead_workers.contains(&w)).unwrap_or(false)
                {
                    task.status = TaskStatus::Failed;
                    task.reason = Some("worker_crash".to_string());
                    fixed.push(id.clone());
                }
            }
            for id in &fixed {
                doc.push_event(ExecutionEvent {
                    ts: now,
                    worker_id: None,
                    task_id: Some(id.clone()),
                    kind: EventKind::ReconcileFix,
                    data: serde_json::json!({"reason": "worker_crash"}),
                });
            }
            Ok(fixed)
        })
    }

    /// Reconciliation fix (b): a level marked DONE while holding incomplete
    /// tasks is demoted (spec §4.5.3, §8 invariant 5).
    pub fn reconcile_level_done_with_incomplete(&self, level: u32) -> Result<bool> {
        self.mutate(|doc| {
            let incomplete = doc
                .tasks
                .values()
                .any(|t| t.level == level && t.status != TaskStatus::Complete && t.status != TaskStatus::Failed);
            let all_complete = doc
                .tasks
                .values()
                .filter(|t| t.level == level)
                .all(|t| t.status == TaskStatus::Complete);

            if let Some(record) = doc.levels.get_mut(&level) {
                if record.status == LevelStatus::Done && (incomplete || !all_complete) {
                    record.status = LevelStatus::InProgress;
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "checkout-flow");
        (dir, store)
    }

    #[test]
    fn load_initializes_empty_document() {
        let (_dir, store) = new_store();
        let doc = store.load().unwrap();
        assert_eq!(doc.feature, "checkout-flow");
        assert!(doc.tasks.is_empty());
        assert!(!doc.paused);
    }

    #[test]
    fn claim_task_marks_claimed_and_is_idempotent_per_call() {
        let (_dir, store) = new_store();
        store.ensure_task("t1-L1-a", 1).unwrap();
        let now = Utc::now();
        let deps = HashMap::new();
        let files = HashMap::new();

        let claimed = store.claim_task(1, 1, &deps, &files, now).unwrap();
        assert_eq!(claimed.as_deref(), Some("t1-L1-a"));

        let second = store.claim_task(2, 1, &deps, &files, now).unwrap();
        assert_eq!(second, None, "already-claimed task must not be claimed twice");
    }

    #[test]
    fn claim_task_respects_dependency_completion() {
        let (_dir, store) = new_store();
        store.ensure_task("dep", 1).unwrap();
        store.ensure_task("dependent", 2).unwrap();
        let now = Utc::now();
        let mut deps = HashMap::new();
        deps.insert("dependent".to_string(), vec!["dep".to_string()]);
        let files = HashMap::new();

        let claimed = store.claim_task(1, 2, &deps, &files, now).unwrap();
        assert_eq!(claimed, None, "dependency not complete yet");

        store.set_task_status("dep", TaskStatus::Complete, None, now).unwrap();
        let claimed = store.claim_task(1, 2, &deps, &files, now).unwrap();
        assert_eq!(claimed.as_deref(), Some("dependent"));
    }

    #[test]
    fn claim_task_respects_file_ownership_disjointness() {
        let (_dir, store) = new_store();
        store.ensure_task("a", 1).unwrap();
        store.ensure_task("b", 1).unwrap();
        let now = Utc::now();
        let deps = HashMap::new();
        let mut files = HashMap::new();
        files.insert(
            "a".to_string(),
            FileOwnership {
                create: vec!["shared.rs".into()],
                modify: vec![],
                read: vec![],
            },
        );
        files.insert(
            "b".to_string(),
            FileOwnership {
                create: vec![],
                modify: vec!["shared.rs".into()],
                read: vec![],
            },
        );

        let first = store.claim_task(1, 1, &deps, &files, now).unwrap();
        assert!(first.is_some());
        let second = store.claim_task(2, 1, &deps, &files, now).unwrap();
        assert_eq!(second, None, "overlapping file ownership must block concurrent claim");
    }

    #[test]
    fn concurrent_claims_yield_exactly_one_winner() {
        let (_dir, store) = new_store();
        store.ensure_task("only-task-L1-x", 1).unwrap();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for worker_id in 0..8u32 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let now = Utc::now();
                store
                    .claim_task(worker_id, 1, &HashMap::new(), &HashMap::new(), now)
                    .unwrap()
            }));
        }

        let results: Vec<Option<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_some()).count();
        assert_eq!(winners, 1, "exactly one concurrent claimer should win");
    }

    #[test]
    fn set_task_status_appends_event_even_on_malformed_transition() {
        let (_dir, store) = new_store();
        store.ensure_task("t1", 1).unwrap();
        let now = Utc::now();
        // pending -> complete is not in the well-formed table, but must be
        // allowed (warn-and-allow) and logged.
        store
            .set_task_status("t1", TaskStatus::Complete, None, now)
            .unwrap();
        let doc = store.load().unwrap();
        assert_eq!(doc.tasks["t1"].status, TaskStatus::Complete);
        assert!(doc.events.iter().any(|e| e.task_id.as_deref() == Some("t1")));
    }

    #[test]
    fn complete_is_terminal_and_not_reset_by_release() {
        let (_dir, store) = new_store();
        store.ensure_task("t1", 1).unwrap();
        let now = Utc::now();
        store.set_task_status("t1", TaskStatus::Complete, None, now).unwrap();
        store.release_task("t1", now).unwrap();
        let doc = store.load().unwrap();
        assert_eq!(doc.tasks["t1"].status, TaskStatus::Complete);
    }

    #[test]
    fn fail_task_attempt_sets_backoff_and_increments_attempt() {
        let (_dir, store) = new_store();
        store.ensure_task("t1", 1).unwrap();
        let now = Utc::now();
        store
            .fail_task_attempt("t1", "assertion failed", Duration::from_secs(1), Duration::from_secs(30), now)
            .unwrap();
        let doc = store.load().unwrap();
        let record = &doc.tasks["t1"];
        assert_eq!(record.attempt, 1);
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.next_eligible_after.unwrap() > now);
    }

    #[test]
    fn reassign_without_attempt_does_not_increment_attempt() {
        let (_dir, store) = new_store();
        store.ensure_task("t1", 1).unwrap();
        let now = Utc::now();
        store.claim_task(1, 1, &HashMap::new(), &HashMap::new(), now).unwrap();
        store.reassign_without_attempt("t1", "worker_crash", now).unwrap();
        let doc = store.load().unwrap();
        assert_eq!(doc.tasks["t1"].attempt, 0);
        assert_eq!(doc.tasks["t1"].status, TaskStatus::Pending);
    }

    #[test]
    fn heartbeat_ignores_out_of_order_updates() {
        let (_dir, store) = new_store();
        store.set_worker_state(WorkerRecord::new(1, "worker-1/f", "/tmp/wt")).unwrap();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(30);
        store.record_heartbeat(1, None, later).unwrap();
        store.record_heartbeat(1, None, earlier).unwrap();
        let worker = store.get_worker(1).unwrap().unwrap();
        assert_eq!(worker.last_heartbeat, Some(later));
    }

    #[test]
    fn reconcile_dead_worker_tasks_fixes_without_incrementing_attempt() {
        let (_dir, store) = new_store();
        let mut worker = WorkerRecord::new(7, "worker-7/f", "/tmp/wt");
        worker.status = WorkerStatus::Crashed;
        store.set_worker_state(worker).unwrap();
        store.ensure_task("t1", 1).unwrap();
        let now = Utc::now();
        store.claim_task(7, 1, &HashMap::new(), &HashMap::new(), now).unwrap();

        let fixed = store.reconcile_dead_worker_tasks(now).unwrap();
        assert_eq!(fixed, vec!["t1".to_string()]);
        let doc = store.load().unwrap();
        assert_eq!(doc.tasks["t1"].status, TaskStatus::Failed);
        assert_eq!(doc.tasks["t1"].attempt, 0);
    }

    #[test]
    fn retry_backoff_is_capped_exponential() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        assert_eq!(retry_backoff(base, 1, cap), Duration::from_secs(2));
        assert_eq!(retry_backoff(base, 2, cap), Duration::from_secs(4));
        assert_eq!(retry_backoff(base, 3, cap), Duration::from_secs(8));
        assert_eq!(retry_backoff(base, 10, cap), cap);
    }

    #[test]
    fn reload_picks_up_external_mtime_change() {
        let (_dir, store) = new_store();
        store.ensure_task("t1", 1).unwrap();
        let path = store.paths.state_document();
        let mut doc: StateDocument = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        doc.tasks.get_mut("t1").unwrap().status = TaskStatus::Complete;
        std::thread::sleep(Duration::from_millis(10));
        std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.tasks["t1"].status, TaskStatus::Complete);
    }
}
