//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! `TaskDAG` owns the subagent tasks of one orchestration. An edge
//! `a -> b` means `b` depends on `a`. Node indices follow insertion order,
//! which is also the creation order of the tasks, so every query that walks
//! `node_indices()` is deterministic.

use crate::core::task::{SubagentTask, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<SubagentTask, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Rebuild a DAG from task records, using each task's `depends_on`.
    ///
    /// Tasks are inserted in `sequence` order so the dispatch tie-break
    /// survives a save/restore round.
    pub fn from_tasks(mut tasks: Vec<SubagentTask>) -> Result<Self> {
        tasks.sort_by_key(|t| t.sequence);
        let edges: Vec<(TaskId, TaskId)> = tasks
            .iter()
            .flat_map(|t| t.depends_on.iter().map(move |dep| (*dep, t.id)))
            .collect();

        let mut dag = Self::new();
        for task in tasks {
            dag.add_task(task);
        }
        for (from, to) in edges {
            dag.add_dependency(&from, &to)?;
        }
        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// If the task already exists (same TaskId), returns the existing NodeIndex.
    pub fn add_task(&mut self, task: SubagentTask) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// Also records `from` in `to.depends_on`.
    ///
    /// # Errors
    /// `GraphConstruction` if either task is unknown, the edge is a
    /// self-reference, or the edge would close a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = self.node_or_err(from)?;
        let to_index = self.node_or_err(to)?;

        if from_index == to_index {
            return Err(Error::GraphConstruction(format!(
                "task {} depends on itself",
                from
            )));
        }
        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::GraphConstruction(format!(
                "dependency from {} to {} would create a cycle",
                from, to
            )));
        }

        if let Some(task) = self.graph.node_weight_mut(to_index) {
            if !task.depends_on.contains(from) {
                task.depends_on.push(*from);
            }
        }
        Ok(())
    }

    fn node_or_err(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::GraphConstruction(format!("task {} not found in DAG", id)))
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&SubagentTask> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut SubagentTask> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Tasks the given task depends on, in creation order.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&SubagentTask> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&SubagentTask> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut indices: Vec<NodeIndex> =
            self.graph.neighbors_directed(index, direction).collect();
        indices.sort();
        indices
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .collect()
    }

    /// All tasks reachable through dependent edges, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(task) = self.graph.node_weight(next) {
                    if seen.insert(task.id) {
                        queue.push_back(next);
                    }
                }
            }
        }
        seen
    }

    /// All tasks in creation order.
    pub fn all_tasks(&self) -> Vec<&SubagentTask> {
        self.graph.node_weights().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose dependencies are all `Completed`, in creation order.
    pub fn ready_tasks(&self) -> Vec<&SubagentTask> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if task.status != TaskStatus::Pending {
                    return None;
                }

                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| d.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });

                deps_satisfied.then_some(task)
            })
            .collect()
    }

    /// Pending tasks that can never become ready because some transitive
    /// dependency failed.
    pub fn blocked_tasks(&self) -> Vec<&SubagentTask> {
        let mut blocked: HashSet<TaskId> = HashSet::new();
        for task in self.graph.node_weights() {
            if task.status == TaskStatus::Failed {
                blocked.extend(self.transitive_dependents(&task.id));
            }
        }
        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Pending && blocked.contains(&t.id))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.count_with(TaskStatus::Running)
    }

    pub fn count_with(&self, status: TaskStatus) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status == status)
            .count()
    }

    /// Get tasks in topological order, ties broken by creation order.
    pub fn topological_order(&self) -> Result<Vec<&SubagentTask>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let task_name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.name.as_str())
                .unwrap_or("unknown");
            Error::GraphConstruction(format!("cycle detected at task: {}", task_name))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Adjacency list keyed by task id: each task maps to the ids it
    /// depends on. This is the orchestration's `dependencyGraph`.
    pub fn adjacency(&self) -> BTreeMap<TaskId, Vec<TaskId>> {
        self.graph
            .node_weights()
            .map(|t| {
                let deps = self
                    .get_dependencies(&t.id)
                    .into_iter()
                    .map(|d| d.id)
                    .collect();
                (t.id, deps)
            })
            .collect()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("task_count", &self.task_count())
            .field("dependency_count", &self.dependency_count())
            .finish()
    }
}
