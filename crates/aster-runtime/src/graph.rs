//! Dependency graph: per-task dependency tracking, ready-set maintenance,
//! priority ordering and cycle detection.
//!
//! The graph is not thread-safe; the task registry owns it behind a single
//! lock and is the only mutator.

use crate::error::{RuntimeError, RuntimeResult};
use daggy::Dag;
use std::collections::{BTreeSet, HashMap, HashSet};

/// A unique identifier for a task in the registry.
pub type TaskId = String;

/// A unique identifier for a workflow.
pub type WorkflowId = String;

/// One node of the dependency graph.
#[derive(Debug, Clone)]
struct Node {
    /// Direct dependencies.
    deps: HashSet<TaskId>,

    /// Scheduling priority; lower runs earlier.
    priority: i32,

    /// Insertion sequence, the FIFO tiebreaker for equal priorities.
    seq: u64,

    /// Count of dependencies not yet completed.
    remaining_unmet: usize,
}

/// Dependency graph over registered tasks.
///
/// A node enters the ready set iff `remaining_unmet == 0` and it has not yet
/// been marked completed. The ready set is ordered by ascending priority,
/// ties broken by insertion order.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, Node>,
    completed: HashSet<TaskId>,
    ready: BTreeSet<(i32, u64, TaskId)>,
    next_seq: u64,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task with its dependencies and priority.
    ///
    /// Fails with `DuplicateTask` if the id is already present and with
    /// `Cycle` if the insertion would close a dependency cycle. Dependencies
    /// already marked completed are pre-counted as met, so registration
    /// after some dependencies finish is allowed.
    pub fn add(&mut self, id: &str, deps: &[TaskId], priority: i32) -> RuntimeResult<()> {
        if self.nodes.contains_key(id) || self.completed.contains(id) {
            return Err(RuntimeError::DuplicateTask(id.to_string()));
        }

        let deps: HashSet<TaskId> = deps.iter().cloned().collect();
        if deps.contains(id) {
            return Err(RuntimeError::Cycle(format!("task {id} depends on itself")));
        }
        self.check_acyclic_with(id, &deps)?;

        let remaining_unmet = deps
            .iter()
            .filter(|d| !self.completed.contains(d.as_str()))
            .count();
        let seq = self.next_seq;
        self.next_seq += 1;

        if remaining_unmet == 0 {
            self.ready.insert((priority, seq, id.to_string()));
        }
        self.nodes.insert(
            id.to_string(),
            Node {
                deps,
                priority,
                seq,
                remaining_unmet,
            },
        );
        Ok(())
    }

    /// Marks a task completed (any terminal state counts). Idempotent.
    ///
    /// Removes the node from the ready set and decrements `remaining_unmet`
    /// on every dependent, promoting dependents that reach zero.
    pub fn mark_completed(&mut self, id: &str) {
        if !self.completed.insert(id.to_string()) {
            return;
        }

        if let Some(node) = self.nodes.get(id) {
            self.ready.remove(&(node.priority, node.seq, id.to_string()));
        }

        let mut promoted: Vec<(i32, u64, TaskId)> = Vec::new();
        for (other_id, node) in self.nodes.iter_mut() {
            if other_id != id && node.deps.contains(id) && !self.completed.contains(other_id) {
                if node.remaining_unmet > 0 {
                    node.remaining_unmet -= 1;
                    if node.remaining_unmet == 0 {
                        promoted.push((node.priority, node.seq, other_id.clone()));
                    }
                }
            }
        }
        for key in promoted {
            self.ready.insert(key);
        }
    }

    /// Ready tasks ordered by ascending priority, FIFO within a priority.
    pub fn ready_snapshot(&self) -> Vec<TaskId> {
        self.ready.iter().map(|(_, _, id)| id.clone()).collect()
    }

    /// Evicts a task from all structures (workflow teardown).
    pub fn remove(&mut self, id: &str) {
        if let Some(node) = self.nodes.remove(id) {
            self.ready.remove(&(node.priority, node.seq, id.to_string()));
        }
        self.completed.remove(id);
    }

    /// Returns true if the task is present (completed or not).
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Returns true if the task has been marked completed.
    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    /// Direct dependencies of a task.
    pub fn deps_of(&self, id: &str) -> Vec<TaskId> {
        self.nodes
            .get(id)
            .map(|n| n.deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true if every dependency of the task has completed.
    pub fn deps_met(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .map(|n| n.remaining_unmet == 0)
            .unwrap_or(false)
    }

    /// All transitive dependents of a task, in unspecified order.
    pub fn dependents_transitive(&self, id: &str) -> Vec<TaskId> {
        let mut found: Vec<TaskId> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut frontier: Vec<&str> = vec![id];

        while let Some(current) = frontier.pop() {
            for (other_id, node) in &self.nodes {
                if node.deps.contains(current) && seen.insert(other_id.as_str()) {
                    found.push(other_id.clone());
                    frontier.push(other_id.as_str());
                }
            }
        }
        found
    }

    /// Non-completed tasks with their unmet dependency sets, for deadlock
    /// diagnostics. Sorted by task id for stable output.
    pub fn pending_with_unmet(&self) -> Vec<(TaskId, Vec<TaskId>)> {
        let mut pending: Vec<(TaskId, Vec<TaskId>)> = self
            .nodes
            .iter()
            .filter(|(id, _)| !self.completed.contains(id.as_str()))
            .map(|(id, node)| {
                let mut unmet: Vec<TaskId> = node
                    .deps
                    .iter()
                    .filter(|d| !self.completed.contains(d.as_str()))
                    .cloned()
                    .collect();
                unmet.sort();
                (id.clone(), unmet)
            })
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        pending
    }

    /// Searches for a dependency cycle among non-completed nodes using a DFS
    /// with an explicit recursion stack. Returns the cycle path if found.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            graph: &'a DependencyGraph,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<TaskId>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                    let mut cycle: Vec<TaskId> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(id.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(id, Mark::InProgress);
            stack.push(id);
            if let Some(node) = graph.nodes.get(id) {
                for dep in &node.deps {
                    if graph.nodes.contains_key(dep.as_str()) {
                        if let Some(cycle) = visit(graph, dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }
            stack.pop();
            marks.insert(id, Mark::Done);
            None
        }

        for id in self.nodes.keys() {
            if !marks.contains_key(id.as_str()) {
                if let Some(cycle) = visit(self, id, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Number of nodes present.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no nodes are present.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Rebuilds the DAG including the candidate node and fails if any edge
    /// would close a cycle.
    fn check_acyclic_with(&self, id: &str, deps: &HashSet<TaskId>) -> RuntimeResult<()> {
        let mut dag: Dag<&str, ()> = Dag::new();
        let mut indices = HashMap::new();

        for existing in self.nodes.keys() {
            indices.insert(existing.as_str(), dag.add_node(existing.as_str()));
        }
        indices.insert(id, dag.add_node(id));

        let candidate = self
            .nodes
            .iter()
            .map(|(task, node)| (task.as_str(), &node.deps))
            .chain(std::iter::once((id, deps)));

        for (task, task_deps) in candidate {
            let to = indices[task];
            for dep in task_deps.iter() {
                if let Some(&from) = indices.get(dep.as_str()) {
                    dag.add_edge(from, to, ()).map_err(|_| {
                        RuntimeError::Cycle(format!(
                            "adding task {task} with dependency {dep} closes a cycle"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Inserts a node bypassing the cycle check. Test hook for deadlock
    /// diagnostics.
    #[cfg(test)]
    pub(crate) fn add_unchecked(&mut self, id: &str, deps: &[TaskId], priority: i32) {
        let deps: HashSet<TaskId> = deps.iter().cloned().collect();
        let remaining_unmet = deps
            .iter()
            .filter(|d| !self.completed.contains(d.as_str()))
            .count();
        let seq = self.next_seq;
        self.next_seq += 1;
        if remaining_unmet == 0 {
            self.ready.insert((priority, seq, id.to_string()));
        }
        self.nodes.insert(
            id.to_string(),
            Node {
                deps,
                priority,
                seq,
                remaining_unmet,
            },
        );
    }
}
