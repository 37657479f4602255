//! Worker backend abstraction (spec §4.3).
//!
//! A backend is responsible for turning a claimed worktree into a running
//! worker process, wherever that process actually lives: inside this
//! orchestrator, as a sibling OS process, or inside a container. All three
//! backends expose the same four operations so the scheduler never needs to
//! know which one is active.

pub mod container;
pub mod cooperative;
pub mod port;
pub mod process;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

pub use container::ContainerBackend;
pub use cooperative::CooperativeBackend;
pub use port::PortAllocator;
pub use process::ProcessBackend;

/// Everything a backend needs to bring a worker to life.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub worker_id: u32,
    pub feature: String,
    pub worktree: PathBuf,
    pub branch: String,
    pub main_repo: PathBuf,
    /// Directory the worker reads its task graph and supporting spec files
    /// from (`SPEC_DIR`, spec.md:266).
    pub spec_dir: PathBuf,
    /// Directory holding the state document and peer files (`STATE_ROOT`).
    pub state_root: PathBuf,
}

/// Opaque reference to a running worker, backend-specific in content but
/// uniform in shape.
#[derive(Debug, Clone)]
pub struct BackendHandle {
    pub worker_id: u32,
    pub backend_name: String,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
    pub port: Option<u16>,
}

/// Liveness as observed directly from the OS/container runtime, independent
/// of whatever the state store believes (spec §4.5 reconciliation needs
/// exactly this divergence to detect silent deaths).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    Exited { code: Option<i32> },
    Unknown,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn worker {worker_id}: {reason}")]
    SpawnFailed { worker_id: u32, reason: String },

    #[error("failed to terminate worker {worker_id}: {reason}")]
    TerminateFailed { worker_id: u32, reason: String },

    #[error("no ephemeral port available in range {0}-{1}")]
    NoPortAvailable(u16, u16),

    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("required image missing: {0}")]
    ImageMissing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of the spawn-retry envelope (spec §4.3 "Spawn retry"). Exhaustion
/// is reported, never propagated as an error -- the caller always gets a
/// concrete, actionable result.
#[derive(Debug, Clone)]
pub enum SpawnResult {
    Spawned(BackendHandle),
    Failed { reason: String, attempts: u32 },
}

/// Backend abstraction: cooperative in-process task, local OS process, or
/// container (spec §4.3).
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// A single spawn attempt. Callers go through [`spawn_with_retry`]
    /// rather than calling this directly.
    async fn spawn(&self, req: &SpawnRequest) -> Result<BackendHandle, BackendError>;

    async fn terminate(&self, handle: &BackendHandle, graceful: bool) -> Result<(), BackendError>;

    async fn is_alive(&self, handle: &BackendHandle) -> bool;

    /// Reconcile OS/container-level liveness with logical worker state,
    /// catching processes that died without the orchestrator noticing.
    async fn sync_state(&self, handle: &BackendHandle) -> LivenessState;
}

/// Exponential backoff with a fixed attempt ceiling, `base * 2^(attempt-1)`
/// capped at `max` -- the same formula the state store uses for task
/// retries, reused here for spawn retries.
struct SpawnBackoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl backoff::backoff::Backoff for SpawnBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            return None;
        }
        let secs = self.base.as_secs_f64() * 2f64.powi((self.attempt - 1) as i32);
        Some(Duration::from_secs_f64(secs).min(self.max))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Configuration for [`spawn_with_retry`], mirroring the
/// `workers.spawn_*` config options.
#[derive(Debug, Clone)]
pub struct SpawnRetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Default for SpawnRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_seconds: 2,
            backoff_max_seconds: 30,
        }
    }
}

/// Drive `backend.spawn(req)` through the retry envelope described in spec
/// §4.3: up to `policy.max_attempts` tries with exponential backoff,
/// logging kind/reason/elapsed on every failure. Never raises -- exhaustion
/// is reported as [`SpawnResult::Failed`] with an actionable message.
pub async fn spawn_with_retry(
    backend: &dyn Backend,
    req: &SpawnRequest,
    policy: &SpawnRetryPolicy,
) -> SpawnResult {
    let attempts = std::sync::atomic::AtomicU32::new(0);
    let started = Instant::now();

    let backoff = SpawnBackoff {
        base: Duration::from_secs(policy.backoff_base_seconds),
        max: Duration::from_secs(policy.backoff_max_seconds),
        max_attempts: policy.max_attempts.saturating_sub(1),
        attempt: 0,
    };

    let outcome = backoff::future::retry(backoff, || async {
        let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let attempt_started = Instant::now();

        match backend.spawn(req).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::warn!(
                    worker_id = req.worker_id,
                    backend = backend.name(),
                    attempt,
                    elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                    error = %e,
                    "spawn attempt failed"
                );
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await;

    let total_attempts = attempts.load(std::sync::atomic::Ordering::SeqCst);

    match outcome {
        Ok(handle) => SpawnResult::Spawned(handle),
        Err(e) => SpawnResult::Failed {
            reason: format!(
                "worker {} failed to spawn after {total_attempts} attempt(s) over {:?}: {e}",
                req.worker_id,
                started.elapsed()
            ),
            attempts: total_attempts,
        },
    }
}
