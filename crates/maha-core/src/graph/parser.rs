//! Task graph parser with three-pass validation (spec §4.1).
//!
//! Parses a task graph document into a [`TaskGraph`] and validates:
//! - Schema: required fields present, `level` ≥ 1, ids unique.
//! - Dependency: references exist, no cycles (Kahn's algorithm), every
//!   dependency's level is strictly less than the dependent's.
//! - Ownership: `create ∪ modify` sets are pairwise disjoint within a level.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::command::{validate_command, CommandValidationError};

use super::model::{TaskDef, TaskGraph, TaskGraphDocument};

/// Level 0 is reserved and always invalid (spec §6).
const MIN_LEVEL: u32 = 1;

/// Errors raised while validating a task graph document.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to deserialize task graph document: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("task graph contains no tasks")]
    Empty,

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {0:?} has no level and its id does not match the \"*-L{{n}}-*\" fallback convention")]
    MissingLevel(String),

    #[error("task {task:?} declares level {level}, but level 0 is reserved")]
    ReservedLevel { task: String, level: u32 },

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),

    #[error("task {task:?} at level {task_level} depends on {dependency:?} at level {dependency_level}, which is not strictly less")]
    LevelOrderingViolation {
        task: String,
        task_level: u32,
        dependency: String,
        dependency_level: u32,
    },

    #[error("tasks {first:?} and {second:?} at level {level} both claim path {path:?}")]
    OwnershipConflict {
        level: u32,
        first: String,
        second: String,
        path: String,
    },

    #[error("task {task:?} has an unsafe verification command: {source}")]
    UnsafeVerificationCommand {
        task: String,
        #[source]
        source: CommandValidationError,
    },
}

/// Parse a level out of a task id using the `*-L{n}-*` fallback convention
/// (spec §4.1 "Level parser fallback").
fn level_from_id(id: &str) -> Option<u32> {
    let marker = id.find("-L")?;
    let rest = &id[marker + 2..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Parse and validate a task graph document from its JSON serialization.
pub fn parse_graph(json: &str) -> Result<TaskGraph, GraphError> {
    let doc: TaskGraphDocument = serde_json::from_str(json)?;
    build_graph(doc)
}

fn build_graph(doc: TaskGraphDocument) -> Result<TaskGraph, GraphError> {
    if doc.tasks.is_empty() {
        return Err(GraphError::Empty);
    }

    let levels = schema_pass(&doc.tasks)?;
    dependency_pass(&doc.tasks, &levels)?;
    ownership_pass(&doc.tasks, &levels)?;
    command_pass(&doc.tasks)?;

    Ok(TaskGraph::new(doc.feature, doc.schema_version, doc.tasks, levels))
}

/// Command pass: every verification command is checked against the same
/// dangerous-pattern validator the merge coordinator's gates use, because
/// the graph is untrusted input and a rejection here must be fail-closed
/// (spec §4.4.2, §7).
fn command_pass(tasks: &[TaskDef]) -> Result<(), GraphError> {
    for task in tasks {
        validate_command(&task.verification.command).map_err(|source| {
            GraphError::UnsafeVerificationCommand {
                task: task.id.clone(),
                source,
            }
        })?;
    }
    Ok(())
}

/// Schema pass: unique ids, resolved levels (explicit or `*-L{n}-*`
/// fallback), level ≥ 1.
fn schema_pass(tasks: &[TaskDef]) -> Result<HashMap<String, u32>, GraphError> {
    let mut seen = HashSet::new();
    let mut levels = HashMap::new();

    for task in tasks {
        if !seen.insert(task.id.clone()) {
            return Err(GraphError::DuplicateTaskId(task.id.clone()));
        }

        let level = match task.level {
            Some(l) => l,
            None => level_from_id(&task.id).ok_or_else(|| GraphError::MissingLevel(task.id.clone()))?,
        };
        if level < MIN_LEVEL {
            return Err(GraphError::ReservedLevel {
                task: task.id.clone(),
                level,
            });
        }
        levels.insert(task.id.clone(), level);
    }

    Ok(levels)
}

/// Dependency pass: existence, acyclicity, strict level ordering.
fn dependency_pass(tasks: &[TaskDef], levels: &HashMap<String, u32>) -> Result<(), GraphError> {
    let known = TaskGraph::known_ids(tasks);

    for task in tasks {
        for dep in &task.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
            let task_level = levels[&task.id];
            let dep_level = levels[dep.as_str()];
            if dep_level >= task_level {
                return Err(GraphError::LevelOrderingViolation {
                    task: task.id.clone(),
                    task_level,
                    dependency: dep.clone(),
                    dependency_level: dep_level,
                });
            }
        }
    }

    check_for_cycles(tasks)
}

/// Kahn's-algorithm cycle detection over the dependency edges.
fn check_for_cycles(tasks: &[TaskDef]) -> Result<(), GraphError> {
    let task_ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let index_of: HashMap<&str, usize> = task_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let n = task_ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];

    for task in tasks {
        let task_idx = index_of[task.id.as_str()];
        for dep in &task.dependencies {
            let dep_idx = index_of[dep.as_str()];
            adjacency[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &adjacency[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| task_ids[i])
            .collect();
        return Err(GraphError::CycleDetected(cyclic.join(", ")));
    }

    Ok(())
}

/// Ownership pass: within each level, `create ∪ modify` sets must be
/// pairwise disjoint. Read-only overlap, and overlap across levels, is
/// permitted (spec §3 invariant d, §4.1).
fn ownership_pass(tasks: &[TaskDef], levels: &HashMap<String, u32>) -> Result<(), GraphError> {
    let mut by_level: HashMap<u32, Vec<&TaskDef>> = HashMap::new();
    for task in tasks {
        by_level.entry(levels[&task.id]).or_default().push(task);
    }

    for (level, level_tasks) in &by_level {
        let mut claimed: HashMap<&str, &str> = HashMap::new();
        for task in level_tasks {
            for path in task.files.create.iter().chain(task.files.modify.iter()) {
                if let Some(&owner) = claimed.get(path.as_str()) {
                    return Err(GraphError::OwnershipConflict {
                        level: *level,
                        first: owner.to_string(),
                        second: task.id.clone(),
                        path: path.clone(),
                    });
                }
                claimed.insert(path.as_str(), &task.id);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(tasks_json: &str) -> String {
        format!(r#"{{"feature": "checkout-flow", "schema_version": 2, "tasks": [{tasks_json}]}}"#)
    }

    fn task(id: &str, level: Option<u32>, deps: &[&str]) -> String {
        let level_field = match level {
            Some(l) => format!(r#""level": {l},"#),
            None => String::new(),
        };
        let deps_json: Vec<String> = deps.iter().map(|d| format!("{d:?}")).collect();
        format!(
            r#"{{"id": {id:?}, "title": "t", {level_field} "dependencies": [{}], "verification": {{"command": "true"}}}}"#,
            deps_json.join(", ")
        )
    }

    #[test]
    fn parses_minimal_graph() {
        let json = doc(&task("add-cart-L1-a", Some(1), &[]));
        let graph = parse_graph(&json).expect("should parse");
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.level_of("add-cart-L1-a"), Some(1));
    }

    #[test]
    fn rejects_empty_task_list() {
        let json = r#"{"feature": "f", "schema_version": 2, "tasks": []}"#;
        assert!(matches!(parse_graph(json), Err(GraphError::Empty)));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = doc(&format!(
            "{}, {}",
            task("a-L1-x", Some(1), &[]),
            task("a-L1-x", Some(1), &[])
        ));
        assert!(matches!(parse_graph(&json), Err(GraphError::DuplicateTaskId(ref id)) if id == "a-L1-x"));
    }

    #[test]
    fn falls_back_to_level_parsed_from_id() {
        let json = doc(&task("add-cart-L3-endpoint", None, &[]));
        let graph = parse_graph(&json).expect("should parse via fallback");
        assert_eq!(graph.level_of("add-cart-L3-endpoint"), Some(3));
    }

    #[test]
    fn rejects_missing_level_with_no_fallback_match() {
        let json = doc(&task("totally-unleveled-task", None, &[]));
        assert!(matches!(parse_graph(&json), Err(GraphError::MissingLevel(_))));
    }

    #[test]
    fn rejects_level_zero() {
        let json = doc(&task("a-L0-x", Some(0), &[]));
        assert!(matches!(parse_graph(&json), Err(GraphError::ReservedLevel { level: 0, .. })));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let json = doc(&task("a-L1-x", Some(1), &["ghost"]));
        assert!(matches!(parse_graph(&json), Err(GraphError::UnknownDependency { .. })));
    }

    #[test]
    fn rejects_direct_cycle() {
        let json = doc(&format!(
            "{}, {}",
            task("a-L2-x", Some(2), &["b-L1-y"]),
            task("b-L1-y", Some(1), &["a-L2-x"])
        ));
        assert!(matches!(parse_graph(&json), Err(GraphError::CycleDetected(_))));
    }

    #[test]
    fn rejects_dependency_at_same_or_higher_level() {
        let json = doc(&format!(
            "{}, {}",
            task("a-L1-x", Some(1), &[]),
            task("b-L1-y", Some(1), &["a-L1-x"])
        ));
        assert!(matches!(
            parse_graph(&json),
            Err(GraphError::LevelOrderingViolation { .. })
        ));
    }

    #[test]
    fn accepts_diamond_dag_with_proper_level_ordering() {
        let json = doc(&format!(
            "{}, {}, {}, {}",
            task("a-L1-x", Some(1), &[]),
            task("b-L2-x", Some(2), &["a-L1-x"]),
            task("c-L2-y", Some(2), &["a-L1-x"]),
            task("d-L3-x", Some(3), &["b-L2-x", "c-L2-y"])
        ));
        let graph = parse_graph(&json).expect("diamond DAG should be valid");
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.tasks_at_level(2).len(), 2);
    }

    fn task_with_files(id: &str, level: u32, create: &[&str], modify: &[&str]) -> String {
        let create_json: Vec<String> = create.iter().map(|p| format!("{p:?}")).collect();
        let modify_json: Vec<String> = modify.iter().map(|p| format!("{p:?}")).collect();
        format!(
            r#"{{"id": {id:?}, "title": "t", "level": {level}, "dependencies": [], "files": {{"create": [{}], "modify": [{}]}}, "verification": {{"command": "true"}}}}"#,
            create_json.join(", "),
            modify_json.join(", ")
        )
    }

    #[test]
    fn rejects_overlapping_ownership_within_a_level() {
        let json = doc(&format!(
            "{}, {}",
            task_with_files("a-L1-x", 1, &["shared.rs"], &[]),
            task_with_files("b-L1-y", 1, &[], &["shared.rs"])
        ));
        assert!(matches!(parse_graph(&json), Err(GraphError::OwnershipConflict { .. })));
    }

    #[test]
    fn allows_same_path_across_different_levels() {
        let json = doc(&format!(
            "{}, {}",
            task_with_files("a-L1-x", 1, &["shared.rs"], &[]),
            task_with_files("b-L2-y", 2, &[], &["shared.rs"])
        ));
        assert!(parse_graph(&json).is_ok());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(parse_graph("not json"), Err(GraphError::Deserialize(_))));
    }

    #[test]
    fn rejects_verification_command_with_chaining() {
        let json = r#"{"feature": "checkout-flow", "schema_version": 2, "tasks": [{"id": "a-L1-x", "title": "t", "level": 1, "dependencies": [], "verification": {"command": "npm test && rm -rf /"}}]}"#;
        assert!(matches!(
            parse_graph(json),
            Err(GraphError::UnsafeVerificationCommand { ref task, .. }) if task == "a-L1-x"
        ));
    }
}
