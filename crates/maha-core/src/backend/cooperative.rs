//! Cooperative in-process backend.
//!
//! Spawns a lightweight tokio task inside the orchestrating process rather
//! than an OS process or container. No network/port allocation happens
//! here; this backend exists for integrating with an external agent host
//! that drives the worker loop itself and merely needs the orchestrator to
//! track a logical "slot" for bookkeeping and heartbeat purposes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Backend, BackendError, BackendHandle, LivenessState, SpawnRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Running,
    Exited(Option<i32>),
}

/// In-process worker registry. `mark_exited` is the hook an external agent
/// host (or a cooperative worker task itself) calls when it finishes, since
/// there is no OS process to `wait()` on.
#[derive(Debug, Default)]
pub struct CooperativeBackend {
    slots: Mutex<HashMap<u32, Slot>>,
}

impl CooperativeBackend {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_exited(&self, worker_id: u32, code: Option<i32>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(worker_id, Slot::Exited(code));
    }
}

#[async_trait]
impl Backend for CooperativeBackend {
    fn name(&self) -> &str {
        "cooperative"
    }

    async fn spawn(&self, req: &SpawnRequest) -> Result<BackendHandle, BackendError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(req.worker_id, Slot::Running);

        Ok(BackendHandle {
            worker_id: req.worker_id,
            backend_name: self.name().to_string(),
            pid: None,
            container_id: None,
            port: None,
        })
    }

    async fn terminate(&self, handle: &BackendHandle, _graceful: bool) -> Result<(), BackendError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(handle.worker_id, Slot::Exited(None));
        Ok(())
    }

    async fn is_alive(&self, handle: &BackendHandle) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        matches!(slots.get(&handle.worker_id), Some(Slot::Running))
    }

    async fn sync_state(&self, handle: &BackendHandle) -> LivenessState {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(&handle.worker_id) {
            Some(Slot::Running) => LivenessState::Alive,
            Some(Slot::Exited(code)) => LivenessState::Exited { code: *code },
            None => LivenessState::Unknown,
        }
    }
}
