//! Git worktree management for worker isolation (spec §4.3).
//!
//! Each worker executes its claimed task in its own git worktree, giving
//! filesystem isolation without the cost of a full repository clone.
//! Worktrees share the object store of the main repository but have
//! independent working directories and index files.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error(
        "worktree path exists but has unexpected branch: expected {expected}, found {found}"
    )]
    BranchMismatch { expected: String, found: String },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Result of a branch merge (spec §4.6 step 3: conflict aborts the merge,
/// no auto-resolution).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    Conflict { details: String },
}

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages git worktrees for worker isolation.
///
/// Git serialises worktree operations on the same repository through a lock
/// file on the shared object store; this manager serialises its own
/// mutating git calls through an internal mutex so concurrent worker
/// lifecycle events don't race each other.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// `worktree_base` defaults to `../<repo-name>-maha-worktrees/` relative
    /// to `repo_path` when `None`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| default_worktree_base(&repo_path));

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// The worker branch convention: `worker-{id}/{feature}` (spec §3, §4.3).
    pub fn branch_name(worker_id: u32, feature: &str) -> String {
        format!("worker-{worker_id}/{feature}")
    }

    /// Spawn a pre-built `git` command, mapping spawn failure to
    /// [`WorktreeError::GitCommand`]. Exit status is left for the caller to
    /// inspect -- some callers (`branch_exists`) care only about the status,
    /// not a hard failure.
    fn run(&self, mut cmd: Command, label: &str) -> Result<Output, WorktreeError> {
        cmd.output().map_err(|e| WorktreeError::GitCommand {
            message: format!("failed to run git {label}"),
            source: e,
        })
    }

    /// Run a pre-built `git` command and turn a non-zero exit into
    /// [`WorktreeError::GitExit`].
    fn run_checked(&self, cmd: Command, label: &str) -> Result<Output, WorktreeError> {
        let output = self.run(cmd, label)?;
        if output.status.success() {
            return Ok(output);
        }
        Err(WorktreeError::GitExit {
            command: label.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Build `git <args>` rooted at the main repo; args are plain strings,
    /// for the call sites that never need to pass a filesystem path.
    fn git_cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.repo_path);
        cmd
    }

    fn git(&self, args: &[&str], label: &str) -> Result<Output, WorktreeError> {
        self.run(self.git_cmd(args), label)
    }

    fn git_checked(&self, args: &[&str], label: &str) -> Result<Output, WorktreeError> {
        self.run_checked(self.git_cmd(args), label)
    }

    /// Create a new worktree checked out to `branch_name`, branching from
    /// `base_branch` if the branch doesn't already exist. Idempotent: a
    /// worktree already present at the expected path with the expected
    /// branch is returned as-is.
    pub fn create_worktree(
        &self,
        branch_name: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let worktree_path = self.worktree_base.join(branch_name.replace('/', "--"));

        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            return self.accept_existing_worktree(existing, branch_name);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| WorktreeError::GitCommand {
                message: format!(
                    "failed to create worktree base directory: {}",
                    self.worktree_base.display()
                ),
                source: e,
            })?;
        }

        let mut cmd = Command::new("git");
        cmd.arg("worktree").arg("add").current_dir(&self.repo_path);
        if self.branch_exists(branch_name)? {
            cmd.arg(&worktree_path).arg(branch_name);
        } else {
            cmd.arg("-b").arg(branch_name).arg(&worktree_path).arg(base_branch);
        }

        if let Err(e) = self.run_checked(cmd, "worktree add") {
            self.cleanup_partial(&worktree_path);
            return Err(e);
        }

        self.find_worktree_by_path(&worktree_path)
    }

    fn accept_existing_worktree(
        &self,
        existing: WorktreeInfo,
        branch_name: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        match &existing.branch {
            Some(branch) if branch == branch_name => {
                tracing::info!(
                    path = %existing.path.display(),
                    branch = branch_name,
                    "worktree already exists, returning existing"
                );
                Ok(existing)
            }
            Some(branch) => Err(WorktreeError::BranchMismatch {
                expected: branch_name.to_string(),
                found: branch.clone(),
            }),
            None => {
                tracing::info!(
                    path = %existing.path.display(),
                    "worktree exists with detached HEAD, returning existing"
                );
                Ok(existing)
            }
        }
    }

    /// Remove a worktree by path. No-op (not an error) if it doesn't exist.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let mut cmd = Command::new("git");
        cmd.args(["worktree", "remove", "--force"]).arg(path).current_dir(&self.repo_path);
        match self.run_checked(cmd, "worktree remove") {
            Ok(_) => Ok(()),
            Err(WorktreeError::GitExit { stderr, .. }) if stderr.contains("is not a working tree") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = self.git_checked(&["worktree", "list", "--porcelain"], "worktree list")?;
        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Runs `git worktree prune`, clearing references to worktrees whose
    /// directories were removed externally.
    pub fn cleanup_stale(&self) -> Result<(), WorktreeError> {
        self.git_checked(&["worktree", "prune"], "worktree prune")?;
        Ok(())
    }

    /// Merge `branch_name` into whatever is currently checked out in the
    /// main repo, via `--no-ff`. A conflict aborts the merge and is
    /// reported with the paths that failed to merge cleanly, never
    /// auto-resolved (spec §4.6, §9 open question).
    pub fn merge_branch(&self, branch_name: &str) -> Result<MergeResult, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = self.git(&["merge", "--no-ff", branch_name], "merge")?;
        if output.status.success() {
            return Ok(MergeResult::Success);
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !looks_like_merge_conflict(&stdout, &stderr) {
            return Err(WorktreeError::GitExit {
                command: "merge".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let conflicting_paths = self.conflicting_paths();
        let _ = self.git(&["merge", "--abort"], "merge --abort");

        let details = if conflicting_paths.is_empty() {
            format!("{stdout}\n{stderr}").trim().to_string()
        } else {
            format!("conflicting paths: {}", conflicting_paths.join(", "))
        };
        Ok(MergeResult::Conflict { details })
    }

    /// Paths left unmerged by the aborted merge attempt, per
    /// `git diff --diff-filter=U`. Best-effort: an error here just means the
    /// conflict details fall back to the raw merge output.
    fn conflicting_paths(&self) -> Vec<String> {
        self.git(&["diff", "--name-only", "--diff-filter=U"], "diff --diff-filter=U")
            .ok()
            .filter(|output| output.status.success())
            .map(|output| {
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Force-delete a local branch. Idempotent: a missing branch is not an
    /// error. `-D` is used because a `--no-ff` merge leaves the branch
    /// unmerged from git's own point of view.
    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        match self.git_checked(&["branch", "-D", branch_name], "branch -D") {
            Ok(_) => Ok(()),
            Err(WorktreeError::GitExit { stderr, .. }) if stderr.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a branch at `base_branch` without a worktree, used for level
    /// staging branches (spec §4.6 step 1).
    pub fn create_branch(&self, branch_name: &str, base_branch: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        match self.git_checked(&["branch", branch_name, base_branch], "branch") {
            Ok(_) => Ok(()),
            Err(WorktreeError::GitExit { stderr, .. }) if stderr.contains("already exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn checkout(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.git_checked(&["checkout", branch_name], "checkout")?;
        Ok(())
    }

    /// Fast-forward the current branch to `branch_name` (spec §4.6 step 4:
    /// finalize via fast-forward of the feature branch).
    pub fn fast_forward_merge(&self, branch_name: &str) -> Result<MergeResult, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        match self.git_checked(&["merge", "--ff-only", branch_name], "merge --ff-only") {
            Ok(_) => Ok(MergeResult::Success),
            Err(e) => Err(e),
        }
    }

    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let output = self.git(
            &["rev-parse", "--verify", &format!("refs/heads/{branch_name}")],
            "rev-parse --verify",
        )?;
        Ok(output.status.success())
    }

    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.list_worktrees()?
            .into_iter()
            .find(|wt| wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone()) == canonical)
            .ok_or_else(|| {
                WorktreeError::ParseError(format!("worktree not found at path: {}", path.display()))
            })
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

fn default_worktree_base(repo_path: &Path) -> PathBuf {
    let repo_name = repo_path.file_name().and_then(|n| n.to_str()).unwrap_or("repo");
    let base_name = format!("{repo_name}-maha-worktrees");
    repo_path.parent().map(|p| p.join(&base_name)).unwrap_or_else(|| PathBuf::from(base_name))
}

fn looks_like_merge_conflict(stdout: &str, stderr: &str) -> bool {
    stdout.contains("CONFLICT") || stderr.contains("CONFLICT") || stderr.contains("Automatic merge failed")
}

/// Parse `git worktree list --porcelain` output: blocks of `worktree <path>`
/// / `HEAD <sha>` / `branch <ref>` (or `bare`/`detached` in place of
/// `branch`) lines, separated by blank lines.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    output
        .split("\n\n")
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(parse_worktree_block)
        .collect()
}

fn parse_worktree_block(block: &str) -> Result<WorktreeInfo, WorktreeError> {
    let mut path = None;
    let mut head_commit = None;
    let mut branch = None;

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head_commit = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
    }

    let path = path.ok_or_else(|| {
        WorktreeError::ParseError(format!("worktree block missing 'worktree' line: {block:?}"))
    })?;
    let head_commit = head_commit.ok_or_else(|| {
        WorktreeError::ParseError(format!("worktree block missing 'HEAD' line: {block:?}"))
    })?;

    Ok(WorktreeInfo { path, branch, head_commit })
}
