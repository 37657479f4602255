use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Complete,
    Failed,
    Paused,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

impl TaskStatus {
    /// The transition table of §4.5, enforced as warn-and-allow: callers may
    /// still apply a transition not in this table, but it is always logged.
    pub fn is_well_formed_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Claimed)
                | (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Failed)
                | (Self::Claimed, Self::InProgress)
                | (Self::Claimed, Self::Pending)
                | (Self::Claimed, Self::Failed)
                | (Self::InProgress, Self::Complete)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Paused)
                | (Self::Failed, Self::Pending)
                | (Self::Paused, Self::InProgress)
                | (Self::Paused, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

// ---------------------------------------------------------------------------

/// Status of a worker slot (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawning,
    Ready,
    Busy,
    Stalled,
    Exited,
    Crashed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Stalled => "stalled",
            Self::Exited => "exited",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawning" => Ok(Self::Spawning),
            "ready" => Ok(Self::Ready),
            "busy" => Ok(Self::Busy),
            "stalled" => Ok(Self::Stalled),
            "exited" => Ok(Self::Exited),
            "crashed" => Ok(Self::Crashed),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

impl WorkerStatus {
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Exited | Self::Crashed)
    }
}

// ---------------------------------------------------------------------------

/// Aggregate status of a level (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    InProgress,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for LevelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Merging => "merging",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for LevelStatus {
    type Err = LevelStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "merging" => Ok(Self::Merging),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(LevelStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LevelStatus`] string.
#[derive(Debug, Clone)]
pub struct LevelStatusParseError(pub String);

impl fmt::Display for LevelStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid level status: {:?}", self.0)
    }
}

impl std::error::Error for LevelStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of execution event appended to the monitor log (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Spawn,
    Retry,
    Ready,
    Claim,
    Start,
    Complete,
    Fail,
    Timeout,
    Reassign,
    Crash,
    HeartbeatStale,
    ReconcileFix,
    LevelComplete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawn => "spawn",
            Self::Retry => "retry",
            Self::Ready => "ready",
            Self::Claim => "claim",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
            Self::Reassign => "reassign",
            Self::Crash => "crash",
            Self::HeartbeatStale => "heartbeat-stale",
            Self::ReconcileFix => "reconcile-fix",
            Self::LevelComplete => "level-complete",
        };
        f.write_str(s)
    }
}

impl FromStr for EventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawn" => Ok(Self::Spawn),
            "retry" => Ok(Self::Retry),
            "ready" => Ok(Self::Ready),
            "claim" => Ok(Self::Claim),
            "start" => Ok(Self::Start),
            "complete" => Ok(Self::Complete),
            "fail" => Ok(Self::Fail),
            "timeout" => Ok(Self::Timeout),
            "reassign" => Ok(Self::Reassign),
            "crash" => Ok(Self::Crash),
            "heartbeat-stale" => Ok(Self::HeartbeatStale),
            "reconcile-fix" => Ok(Self::ReconcileFix),
            "level-complete" => Ok(Self::LevelComplete),
            other => Err(EventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventKind`] string.
#[derive(Debug, Clone)]
pub struct EventKindParseError(pub String);

impl fmt::Display for EventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event kind: {:?}", self.0)
    }
}

impl std::error::Error for EventKindParseError {}

// ---------------------------------------------------------------------------
// Document structs
// ---------------------------------------------------------------------------

/// File-ownership triple declared by a task (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOwnership {
    #[serde(default)]
    pub create: Vec<String>,
    #[serde(default)]
    pub modify: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

impl FileOwnership {
    /// The `create ∪ modify` set whose pairwise intersection must be empty
    /// across same-level tasks (spec §3 invariant d, §8 invariant 2).
    pub fn exclusive_paths(&self) -> VecDeque<&str> {
        self.create
            .iter()
            .chain(self.modify.iter())
            .map(String::as_str)
            .collect()
    }
}

/// The per-task persisted record held inside the state document (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub level: u32,
    pub status: TaskStatus,
    pub worker_id: Option<u32>,
    pub attempt: u32,
    pub next_eligible_after: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, level: u32) -> Self {
        Self {
            id: id.into(),
            level,
            status: TaskStatus::Pending,
            worker_id: None,
            attempt: 0,
            next_eligible_after: None,
            reason: None,
            claimed_at: None,
        }
    }
}

/// The per-worker persisted record held inside the state document (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: u32,
    pub status: WorkerStatus,
    pub task_id: Option<String>,
    pub branch: String,
    pub worktree: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub respawn_count: u32,
}

impl WorkerRecord {
    pub fn new(id: u32, branch: impl Into<String>, worktree: impl Into<String>) -> Self {
        Self {
            id,
            status: WorkerStatus::Spawning,
            task_id: None,
            branch: branch.into(),
            worktree: worktree.into(),
            last_heartbeat: None,
            restart_count: 0,
            respawn_count: 0,
        }
    }
}

/// Outcome of a single gate run, recorded on the level (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub name: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stderr_snippet: Option<String>,
}

/// The per-level persisted record held inside the state document (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelRecord {
    pub level: u32,
    pub status: LevelStatus,
    pub staging_branch: Option<String>,
    #[serde(default)]
    pub gate_outcomes: Vec<GateOutcome>,
}

impl LevelRecord {
    pub fn new(level: u32) -> Self {
        Self {
            level,
            status: LevelStatus::Pending,
            staging_branch: None,
            gate_outcomes: Vec::new(),
        }
    }
}

/// An append-only execution event (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub ts: DateTime<Utc>,
    pub worker_id: Option<u32>,
    pub task_id: Option<String>,
    pub kind: EventKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Claimed,
            TaskStatus::InProgress,
            TaskStatus::Complete,
            TaskStatus::Failed,
            TaskStatus::Paused,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("nope".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_transition_table() {
        assert!(TaskStatus::is_well_formed_transition(
            TaskStatus::Pending,
            TaskStatus::Claimed
        ));
        assert!(TaskStatus::is_well_formed_transition(
            TaskStatus::Failed,
            TaskStatus::Pending
        ));
        assert!(!TaskStatus::is_well_formed_transition(
            TaskStatus::Complete,
            TaskStatus::Pending
        ));
        assert!(!TaskStatus::is_well_formed_transition(
            TaskStatus::Pending,
            TaskStatus::Complete
        ));
    }

    #[test]
    fn task_status_terminal() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn worker_status_display_roundtrip() {
        let variants = [
            WorkerStatus::Spawning,
            WorkerStatus::Ready,
            WorkerStatus::Busy,
            WorkerStatus::Stalled,
            WorkerStatus::Exited,
            WorkerStatus::Crashed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: WorkerStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn worker_status_invalid() {
        assert!("zombie".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn worker_status_is_dead() {
        assert!(WorkerStatus::Exited.is_dead());
        assert!(WorkerStatus::Crashed.is_dead());
        assert!(!WorkerStatus::Ready.is_dead());
    }

    #[test]
    fn level_status_display_roundtrip() {
        let variants = [
            LevelStatus::Pending,
            LevelStatus::InProgress,
            LevelStatus::Merging,
            LevelStatus::Done,
            LevelStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: LevelStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn level_status_invalid() {
        assert!("ongoing".parse::<LevelStatus>().is_err());
    }

    #[test]
    fn event_kind_display_roundtrip() {
        let variants = [
            EventKind::Spawn,
            EventKind::Retry,
            EventKind::Ready,
            EventKind::Claim,
            EventKind::Start,
            EventKind::Complete,
            EventKind::Fail,
            EventKind::Timeout,
            EventKind::Reassign,
            EventKind::Crash,
            EventKind::HeartbeatStale,
            EventKind::ReconcileFix,
            EventKind::LevelComplete,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EventKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_kind_invalid() {
        assert!("unknown-thing".parse::<EventKind>().is_err());
    }

    #[test]
    fn file_ownership_exclusive_paths() {
        let fo = FileOwnership {
            create: vec!["a.rs".into()],
            modify: vec!["b.rs".into()],
            read: vec!["c.rs".into()],
        };
        let paths: Vec<&str> = fo.exclusive_paths().into_iter().collect();
        assert_eq!(paths, vec!["a.rs", "b.rs"]);
    }
}
