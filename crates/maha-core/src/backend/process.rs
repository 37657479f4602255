//! Local OS process backend.
//!
//! Spawns a worker as a sibling process with the worktree as its working
//! directory and the worker protocol environment variables injected. Holds
//! the `tokio::process::Child` handle for the process's lifetime so it can
//! signal and reap it later.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{Backend, BackendError, BackendHandle, LivenessState, SpawnRequest};

/// Command used to launch the worker protocol entry point. Overridable for
/// tests; in production this is the orchestrator's own worker binary.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    pub worker_command: String,
    pub worker_args: Vec<String>,
}

#[derive(Debug)]
pub struct ProcessBackend {
    config: ProcessBackendConfig,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    async fn spawn(&self, req: &SpawnRequest) -> Result<BackendHandle, BackendError> {
        let child = Command::new(&self.config.worker_command)
            .args(&self.config.worker_args)
            .current_dir(&req.worktree)
            .env("WORKER_ID", req.worker_id.to_string())
            .env("FEATURE", &req.feature)
            .env("WORKTREE", &req.worktree)
            .env("BRANCH", &req.branch)
            .env("SPEC_DIR", &req.spec_dir)
            .env("STATE_ROOT", &req.state_root)
            .env("GIT_WORKTREE_DIR", &req.worktree)
            .env("GIT_MAIN_DIR", &req.main_repo)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| BackendError::SpawnFailed {
                worker_id: req.worker_id,
                reason: e.to_string(),
            })?;

        let pid = child.id();

        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.insert(req.worker_id, child);

        Ok(BackendHandle {
            worker_id: req.worker_id,
            backend_name: self.name().to_string(),
            pid,
            container_id: None,
            port: None,
        })
    }

    async fn terminate(&self, handle: &BackendHandle, graceful: bool) -> Result<(), BackendError> {
        let Some(pid) = handle.pid else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let nix_pid = Pid::from_raw(pid as i32);
            let signal = if graceful { Signal::SIGTERM } else { Signal::SIGKILL };

            if let Err(e) = kill(nix_pid, signal) {
                if e != nix::errno::Errno::ESRCH {
                    return Err(BackendError::TerminateFailed {
                        worker_id: handle.worker_id,
                        reason: e.to_string(),
                    });
                }
            }

            if graceful {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                let still_alive = self.is_alive(handle).await;
                if still_alive {
                    let _ = kill(nix_pid, Signal::SIGKILL);
                }
            }
        }

        let child = {
            let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            children.remove(&handle.worker_id)
        };
        if let Some(mut child) = child {
            let _ = child.wait().await;
        }

        Ok(())
    }

    async fn is_alive(&self, handle: &BackendHandle) -> bool {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        match children.get_mut(&handle.worker_id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn sync_state(&self, handle: &BackendHandle) -> LivenessState {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        match children.get_mut(&handle.worker_id) {
            Some(child) => match child.try_wait() {
                Ok(None) => LivenessState::Alive,
                Ok(Some(status)) => LivenessState::Exited { code: status.code() },
                Err(_) => LivenessState::Unknown,
            },
            None => LivenessState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn req(worker_id: u32, dir: &std::path::Path) -> SpawnRequest {
        SpawnRequest {
            worker_id,
            feature: "checkout-flow".into(),
            worktree: dir.to_path_buf(),
            branch: format!("worker-{worker_id}/checkout-flow"),
            main_repo: PathBuf::from("/tmp/repo"),
            spec_dir: PathBuf::from("/tmp/spec"),
            state_root: PathBuf::from("/tmp/state"),
        }
    }

    #[tokio::test]
    async fn spawn_short_lived_process_and_observe_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = ProcessBackend::new(ProcessBackendConfig {
            worker_command: "true".into(),
            worker_args: vec![],
        });

        let handle = backend.spawn(&req(1, dir.path())).await.expect("spawn failed");
        assert!(handle.pid.is_some());

        for _ in 0..50 {
            if !backend.is_alive(&handle).await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert!(!backend.is_alive(&handle).await);
        assert!(matches!(
            backend.sync_state(&handle).await,
            LivenessState::Exited { .. }
        ));
    }

    #[tokio::test]
    async fn terminate_kills_long_running_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = ProcessBackend::new(ProcessBackendConfig {
            worker_command: "sleep".into(),
            worker_args: vec!["30".into()],
        });

        let handle = backend.spawn(&req(2, dir.path())).await.expect("spawn failed");
        assert!(backend.is_alive(&handle).await);

        backend.terminate(&handle, false).await.expect("terminate failed");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!backend.is_alive(&handle).await);
    }

    #[tokio::test]
    async fn spawn_passes_spec_dir_and_state_root_env_vars() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("env-check.txt");
        let backend = ProcessBackend::new(ProcessBackendConfig {
            worker_command: "sh".into(),
            worker_args: vec![
                "-c".into(),
                format!("printf '%s:%s' \"$SPEC_DIR\" \"$STATE_ROOT\" > {}", marker.display()),
            ],
        });

        let handle = backend.spawn(&req(4, dir.path())).await.expect("spawn failed");
        for _ in 0..50 {
            if !backend.is_alive(&handle).await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let contents = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(contents, "/tmp/spec:/tmp/state");
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = ProcessBackend::new(ProcessBackendConfig {
            worker_command: "definitely-not-a-real-command-xyz".into(),
            worker_args: vec![],
        });
        let result = backend.spawn(&req(3, dir.path())).await;
        assert!(result.is_err());
    }
}
