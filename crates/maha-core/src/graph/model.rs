//! Task graph types (spec §3, §6).
//!
//! A task graph is read-only after [`TaskGraph::load`]; only the state store
//! mutates anything derived from it at runtime.

use std::collections::{HashMap, HashSet};

use maha_db::FileOwnership;
use serde::{Deserialize, Serialize};

/// A verification contract: the shell command that proves a task's work is
/// done, and the timeout it must finish within (spec §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    60
}

/// One task as it appears in the external task graph document (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default, rename = "dependencies")]
    pub dependencies: Vec<String>,
    #[serde(default, rename = "files")]
    pub files: FileOwnership,
    pub verification: Verification,
}

/// The document as read from disk (spec §6): `{feature, schema_version, tasks}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraphDocument {
    pub feature: String,
    pub schema_version: u32,
    pub tasks: Vec<TaskDef>,
}

/// A validated, immutable task graph plus its derived indexes (spec §4.1).
///
/// Only produced by [`crate::graph::parser::parse_graph`]; every task in it
/// has already passed the schema, dependency, and ownership checks, and its
/// `level` field is always resolved (never `None`).
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub feature: String,
    pub schema_version: u32,
    tasks: HashMap<String, TaskDef>,
    levels: HashMap<String, u32>,
    by_level: HashMap<u32, Vec<String>>,
    reverse_dependencies: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    pub(crate) fn new(feature: String, schema_version: u32, tasks: Vec<TaskDef>, levels: HashMap<String, u32>) -> Self {
        let mut by_level: HashMap<u32, Vec<String>> = HashMap::new();
        let mut reverse_dependencies: HashMap<String, Vec<String>> = HashMap::new();

        for task in &tasks {
            let level = levels[&task.id];
            by_level.entry(level).or_default().push(task.id.clone());
            for dep in &task.dependencies {
                reverse_dependencies.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }
        for ids in by_level.values_mut() {
            ids.sort();
        }

        let tasks: HashMap<String, TaskDef> = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

        Self {
            feature,
            schema_version,
            tasks,
            levels,
            by_level,
            reverse_dependencies,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskDef> {
        self.tasks.get(id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn level_of(&self, id: &str) -> Option<u32> {
        self.levels.get(id).copied()
    }

    pub fn tasks_at_level(&self, level: u32) -> &[String] {
        self.by_level.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn levels(&self) -> Vec<u32> {
        let mut ls: Vec<u32> = self.by_level.keys().copied().collect();
        ls.sort();
        ls
    }

    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.reverse_dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependencies_map(&self) -> HashMap<String, Vec<String>> {
        self.tasks.iter().map(|(id, t)| (id.clone(), t.dependencies.clone())).collect()
    }

    pub fn files_map(&self) -> HashMap<String, FileOwnership> {
        self.tasks.iter().map(|(id, t)| (id.clone(), t.files.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every dependency appearing anywhere in the graph, for validation
    /// helpers that need a quick existence check before building indexes.
    pub(crate) fn known_ids(tasks: &[TaskDef]) -> HashSet<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }
}
