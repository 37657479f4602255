//! Shared test fixtures for orchestrator integration tests.
//!
//! Two things every scheduler/worktree/merge test needs: a throwaway git
//! repository to operate on, and a task graph small enough to reason about
//! by hand. Both are provided here instead of duplicated per test module.

use std::path::PathBuf;
use std::process::Command;

use maha_core::graph::{parse_graph, TaskGraph};
use tempfile::TempDir;

/// A temporary git repository with a single commit on its default branch.
///
/// The `TempDir` must be kept alive for as long as the repo is in use; it
/// removes the directory tree on drop.
pub struct TempRepo {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TempRepo {
    /// Initialize a fresh repository with one commit, ready for worktrees
    /// to be created off it.
    pub fn init() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().to_path_buf();

        run_git(&path, &["init"]);
        run_git(&path, &["config", "user.email", "test@mahabharatha.dev"]);
        run_git(&path, &["config", "user.name", "Mahabharatha Test"]);

        std::fs::write(path.join("README.md"), "# test repo\n").expect("failed to write README");
        run_git(&path, &["add", "."]);
        run_git(&path, &["commit", "-m", "initial commit"]);

        Self { dir, path }
    }

    /// The branch `git init` checked out (`main` or `master` depending on
    /// the host's git config).
    pub fn default_branch(&self) -> String {
        let output = Command::new("git")
            .args(["branch", "--show-current"])
            .current_dir(&self.path)
            .output()
            .expect("failed to read current branch");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

fn run_git(repo_path: &std::path::Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(status.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&status.stderr));
}

/// Build and parse a canned two-level task graph: one level-1 task with no
/// dependencies, two level-2 tasks that each depend on it and own disjoint
/// files. Useful as the default fixture for scheduler and merge tests that
/// don't care about graph shape specifically.
pub fn canned_graph(feature: &str) -> TaskGraph {
    let json = canned_graph_json(feature);
    parse_graph(&json).expect("canned graph should be valid")
}

/// The raw JSON document behind [`canned_graph`], for tests that exercise
/// the parser itself or need to write the document to a file.
pub fn canned_graph_json(feature: &str) -> String {
    format!(
        r#"{{
  "feature": "{feature}",
  "schema_version": 1,
  "tasks": [
    {{
      "id": "setup",
      "title": "Set up shared scaffolding",
      "level": 1,
      "dependencies": [],
      "files": {{"create": ["src/lib.rs"], "modify": [], "read": []}},
      "verification": {{"command": "true", "timeout_seconds": 30}}
    }},
    {{
      "id": "feature-a",
      "title": "Implement feature A",
      "level": 2,
      "dependencies": ["setup"],
      "files": {{"create": ["src/a.rs"], "modify": [], "read": ["src/lib.rs"]}},
      "verification": {{"command": "true", "timeout_seconds": 30}}
    }},
    {{
      "id": "feature-b",
      "title": "Implement feature B",
      "level": 2,
      "dependencies": ["setup"],
      "files": {{"create": ["src/b.rs"], "modify": [], "read": ["src/lib.rs"]}},
      "verification": {{"command": "true", "timeout_seconds": 30}}
    }}
  ]
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_repo_has_one_commit_on_default_branch() {
        let repo = TempRepo::init();
        assert!(!repo.default_branch().is_empty());
        assert!(repo.path.join("README.md").exists());
    }

    #[test]
    fn canned_graph_has_three_tasks_across_two_levels() {
        let graph = canned_graph("demo-feature");
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.levels(), vec![1, 2]);
        assert_eq!(graph.tasks_at_level(1), &["setup".to_string()]);
        assert_eq!(graph.tasks_at_level(2).len(), 2);
    }
}
