//! Container backend (spec §4.3).
//!
//! Runs a worker inside a Docker container with the worktree bind-mounted
//! read-write and the main repository's `.git` directory bind-mounted
//! read-only. Because the worktree's `.git` file and the main repo's
//! `.git/worktrees/<name>/commondir` both embed host paths, both are
//! rewritten to the in-container mount points before the worker protocol
//! starts -- otherwise every git command inside the container would resolve
//! against paths that don't exist there.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use super::port::PortAllocator;
use super::{Backend, BackendError, BackendHandle, LivenessState, SpawnRequest};

const CONTAINER_WORKTREE_PATH: &str = "/workspace";
const CONTAINER_MAIN_GIT_PATH: &str = "/main-git";
const CONTAINER_SPEC_PATH: &str = "/spec";
const CONTAINER_STATE_ROOT_PATH: &str = "/state";

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub extra_flags: Vec<String>,
}

#[derive(Debug)]
struct ContainerState {
    container_id: String,
    port: u16,
}

/// Isolation backend that runs each worker inside its own container.
#[derive(Debug)]
pub struct ContainerBackend {
    config: ContainerConfig,
    containers: Mutex<HashMap<u32, ContainerState>>,
    ports: PortAllocator,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            containers: Mutex::new(HashMap::new()),
            ports: PortAllocator::new(),
        }
    }

    /// Verify the container runtime is reachable and the configured image
    /// exists locally, failing closed with a diagnostic if not (spec §4.3
    /// "Container-specific concerns").
    pub async fn preflight(&self) -> Result<(), BackendError> {
        let info = Command::new("docker")
            .arg("info")
            .output()
            .await
            .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;
        if !info.status.success() {
            return Err(BackendError::RuntimeUnreachable(
                String::from_utf8_lossy(&info.stderr).to_string(),
            ));
        }

        let inspect = Command::new("docker")
            .args(["image", "inspect", &self.config.image])
            .output()
            .await
            .map_err(|e| BackendError::RuntimeUnreachable(e.to_string()))?;
        if !inspect.status.success() {
            return Err(BackendError::ImageMissing(self.config.image.clone()));
        }

        Ok(())
    }

    fn container_name(worker_id: u32) -> String {
        format!("maha-worker-{worker_id}")
    }

    /// Rewrite the worktree's `.git` file and the main repo's matching
    /// `commondir` entry so git resolves the in-container mount points
    /// rather than the host paths baked in at worktree-creation time.
    fn patch_git_metadata(worktree: &Path, main_repo: &Path) -> Result<(), BackendError> {
        let git_file = worktree.join(".git");
        let contents = std::fs::read_to_string(&git_file)?;
        let gitdir_line = contents
            .lines()
            .find(|l| l.starts_with("gitdir:"))
            .ok_or_else(|| {
                BackendError::SpawnFailed {
                    worker_id: 0,
                    reason: format!("{} does not look like a worktree .git file", git_file.display()),
                }
            })?;

        let host_gitdir = gitdir_line.trim_start_matches("gitdir:").trim();
        let worktree_name = Path::new(host_gitdir)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("worktree")
            .to_string();

        let container_gitdir = format!(
            "{CONTAINER_MAIN_GIT_PATH}/worktrees/{worktree_name}"
        );
        std::fs::write(&git_file, format!("gitdir: {container_gitdir}\n"))?;

        let commondir_file = main_repo
            .join(".git")
            .join("worktrees")
            .join(&worktree_name)
            .join("commondir");
        if commondir_file.exists() {
            std::fs::write(&commondir_file, format!("{CONTAINER_MAIN_GIT_PATH}\n"))?;
        }

        Ok(())
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    async fn spawn(&self, req: &SpawnRequest) -> Result<BackendHandle, BackendError> {
        self.preflight().await?;

        Self::patch_git_metadata(&req.worktree, &req.main_repo).map_err(|_| {
            BackendError::SpawnFailed {
                worker_id: req.worker_id,
                reason: "failed to patch worktree git metadata for container mount".into(),
            }
        })?;

        let port = self.ports.allocate()?;
        let container_name = Self::container_name(req.worker_id);
        let main_git_dir: PathBuf = req.main_repo.join(".git");

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            container_name.clone(),
            "-p".to_string(),
            format!("{port}:{port}"),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKTREE_PATH}:rw", req.worktree.display()),
            "-v".to_string(),
            format!("{}:{CONTAINER_MAIN_GIT_PATH}:ro", main_git_dir.display()),
            "-v".to_string(),
            format!("{}:{CONTAINER_SPEC_PATH}:ro", req.spec_dir.display()),
            "-v".to_string(),
            format!("{}:{CONTAINER_STATE_ROOT_PATH}:rw", req.state_root.display()),
            "-w".to_string(),
            CONTAINER_WORKTREE_PATH.to_string(),
            "-e".to_string(),
            format!("WORKER_ID={}", req.worker_id),
            "-e".to_string(),
            format!("FEATURE={}", req.feature),
            "-e".to_string(),
            format!("WORKTREE={CONTAINER_WORKTREE_PATH}"),
            "-e".to_string(),
            format!("BRANCH={}", req.branch),
            "-e".to_string(),
            format!("SPEC_DIR={CONTAINER_SPEC_PATH}"),
            "-e".to_string(),
            format!("STATE_ROOT={CONTAINER_STATE_ROOT_PATH}"),
        ];
        args.extend(self.config.extra_flags.iter().cloned());
        args.push(self.config.image.clone());

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| BackendError::SpawnFailed {
                worker_id: req.worker_id,
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(BackendError::SpawnFailed {
                worker_id: req.worker_id,
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let start = Command::new("docker")
            .args(["start", &container_id])
            .output()
            .await
            .map_err(|e| BackendError::SpawnFailed {
                worker_id: req.worker_id,
                reason: e.to_string(),
            })?;

        if !start.status.success() {
            let _ = Command::new("docker").args(["rm", "-f", &container_id]).output().await;
            return Err(BackendError::SpawnFailed {
                worker_id: req.worker_id,
                reason: String::from_utf8_lossy(&start.stderr).to_string(),
            });
        }

        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.insert(
            req.worker_id,
            ContainerState {
                container_id: container_id.clone(),
                port,
            },
        );

        Ok(BackendHandle {
            worker_id: req.worker_id,
            backend_name: self.name().to_string(),
            pid: None,
            container_id: Some(container_id),
            port: Some(port),
        })
    }

    async fn terminate(&self, handle: &BackendHandle, graceful: bool) -> Result<(), BackendError> {
        let Some(container_id) = &handle.container_id else {
            return Ok(());
        };

        let args: Vec<&str> = if graceful {
            vec!["stop", container_id]
        } else {
            vec!["rm", "-f", container_id]
        };

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| BackendError::TerminateFailed {
                worker_id: handle.worker_id,
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                return Err(BackendError::TerminateFailed {
                    worker_id: handle.worker_id,
                    reason: stderr.to_string(),
                });
            }
        }

        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = containers.remove(&handle.worker_id) {
            self.ports.release(state.port);
        }

        Ok(())
    }

    /// Checks the liveness marker file the container's entry script
    /// maintains, not just whether the container process exists -- the
    /// entry script's exit trap clears the sentinel so a dying worker
    /// protocol is visible even if the container's PID 1 lingers.
    async fn is_alive(&self, handle: &BackendHandle) -> bool {
        let Some(container_id) = &handle.container_id else {
            return false;
        };

        let output = Command::new("docker")
            .args(["exec", container_id, "test", "-f", "/tmp/maha-alive"])
            .output()
            .await;

        matches!(output, Ok(o) if o.status.success())
    }

    async fn sync_state(&self, handle: &BackendHandle) -> LivenessState {
        let Some(container_id) = &handle.container_id else {
            return LivenessState::Unknown;
        };

        let output = Command::new("docker")
            .args(["inspect", "--format", "{{.State.Status}}|{{.State.ExitCode}}", container_id])
            .output()
            .await;

        match output {
            Ok(o) if o.status.success() => {
                let text = String::from_utf8_lossy(&o.stdout);
                let mut parts = text.trim().split('|');
                match parts.next() {
                    Some("running") => LivenessState::Alive,
                    Some(_) => {
                        let code = parts.next().and_then(|c| c.parse::<i32>().ok());
                        LivenessState::Exited { code }
                    }
                    None => LivenessState::Unknown,
                }
            }
            _ => LivenessState::Unknown,
        }
    }
}
