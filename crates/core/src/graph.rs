use crate::error::GraphError;
use crate::task::{FailureDisposition, Task};
use crate::types::{TaskId, TaskStatus};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::time::Instant;

/// Directed acyclic graph of tasks.
///
/// Edges run from a dependency to its dependent. Nodes are never removed, so
/// node indices follow insertion order.
#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    indices: HashMap<TaskId, NodeIndex>,
    children: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.indices.contains_key(&id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.indices.get(&id).map(|&idx| &self.graph[idx])
    }

    pub fn task(&self, id: TaskId) -> Result<&Task, GraphError> {
        self.get(id).ok_or(GraphError::UnknownTask(id))
    }

    /// All tasks in insertion order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.graph.node_weights()
    }

    fn index(&self, id: TaskId) -> Result<NodeIndex, GraphError> {
        self.indices
            .get(&id)
            .copied()
            .ok_or(GraphError::UnknownTask(id))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, GraphError> {
        let idx = self.index(id)?;
        Ok(&mut self.graph[idx])
    }

    fn insert(&mut self, task: Task) -> TaskId {
        let id = task.id();
        if let Some(parent) = task.parent() {
            self.children.entry(parent).or_default().push(id);
        }
        let idx = self.graph.add_node(task);
        self.indices.insert(id, idx);
        id
    }

    /// Register a task
    pub fn add_task(&mut self, task: Task) -> Result<TaskId, GraphError> {
        if self.contains(task.id()) {
            return Err(GraphError::DuplicateTask(task.id()));
        }
        Ok(self.insert(task))
    }

    /// Register several tasks; nothing is added if any of them is a duplicate
    pub fn add_tasks(
        &mut self,
        tasks: impl IntoIterator<Item = Task>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let tasks: Vec<Task> = tasks.into_iter().collect();

        let mut seen = std::collections::HashSet::new();
        for task in &tasks {
            if self.contains(task.id()) || !seen.insert(task.id()) {
                return Err(GraphError::DuplicateTask(task.id()));
            }
        }

        Ok(tasks.into_iter().map(|task| self.insert(task)).collect())
    }

    /// Make `dependent` wait for every task in `dependencies`.
    ///
    /// Every edge is checked before any is inserted, so a failed call leaves
    /// the graph unchanged.
    pub fn add_dependency(
        &mut self,
        dependent: TaskId,
        dependencies: impl IntoIterator<Item = TaskId>,
    ) -> Result<(), GraphError> {
        let dependent_idx = self.index(dependent)?;

        let mut edges = Vec::new();
        for dependency in dependencies {
            let dependency_idx = self.index(dependency)?;

            // Adding dependency -> dependent closes a cycle when the dependent
            // already reaches the dependency
            if dependency_idx == dependent_idx
                || has_path_connecting(&self.graph, dependent_idx, dependency_idx, None)
            {
                return Err(GraphError::Cycle {
                    dependent,
                    dependency,
                });
            }
            edges.push(dependency_idx);
        }

        for dependency_idx in edges {
            self.graph.update_edge(dependency_idx, dependent_idx, ());
        }
        Ok(())
    }

    /// Add the tasks and chain them so each one waits for the previous one
    pub fn sequence(
        &mut self,
        tasks: impl IntoIterator<Item = Task>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let ids = self.add_tasks(tasks)?;
        self.chain(&ids)?;
        Ok(ids)
    }

    /// Chain tasks already in the graph
    pub fn chain(&mut self, ids: &[TaskId]) -> Result<(), GraphError> {
        for pair in ids.windows(2) {
            self.add_dependency(pair[1], [pair[0]])?;
        }
        Ok(())
    }

    /// Direct dependencies of a task
    pub fn dependencies(&self, id: TaskId) -> Result<Vec<TaskId>, GraphError> {
        let idx = self.index(id)?;
        Ok(self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| self.graph[n].id())
            .collect())
    }

    /// Tasks that directly depend on the given task
    pub fn dependents(&self, id: TaskId) -> Result<Vec<TaskId>, GraphError> {
        let idx = self.index(id)?;
        Ok(self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].id())
            .collect())
    }

    /// Tasks expanded from a workflow task
    pub fn children(&self, parent: TaskId) -> &[TaskId] {
        self.children
            .get(&parent)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Tasks with no dependencies
    pub fn roots(&self) -> Vec<TaskId> {
        self.externals(Direction::Incoming)
    }

    /// Tasks nothing depends on
    pub fn leaves(&self) -> Vec<TaskId> {
        self.externals(Direction::Outgoing)
    }

    fn externals(&self, direction: Direction) -> Vec<TaskId> {
        self.graph
            .externals(direction)
            .map(|n| self.graph[n].id())
            .collect()
    }

    /// Task ids in dependency order (dependencies first)
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut topo = Topo::new(&self.graph);
        let mut order = Vec::with_capacity(self.len());
        while let Some(node) = topo.next(&self.graph) {
            order.push(self.graph[node].id());
        }
        order
    }

    /// Tasks that can be dispatched now
    pub fn ready_tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.ready_tasks_at(Instant::now())
    }

    /// Tasks whose dependencies all reached terminal success and which are
    /// pending, or retrying with their retry instant at or before `now`
    pub fn ready_tasks_at(&self, now: Instant) -> impl Iterator<Item = &Task> + '_ {
        self.graph.node_indices().filter_map(move |idx| {
            let task = &self.graph[idx];
            let ready = task.is_due(now)
                && self.parent_running(task)
                && self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|dep| self.graph[dep].is_terminal_success());
            ready.then_some(task)
        })
    }

    fn parent_running(&self, task: &Task) -> bool {
        match task.parent() {
            Some(parent) => self
                .get(parent)
                .map_or(false, |p| p.status() == TaskStatus::Started),
            None => true,
        }
    }

    /// Earliest instant a retrying task becomes due
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.graph
            .node_weights()
            .filter(|t| t.status() == TaskStatus::Retrying)
            .filter_map(|t| t.state().retry_at)
            .min()
    }

    /// Every task succeeded or failed with its failure ignored
    pub fn is_complete(&self) -> bool {
        self.graph.node_weights().all(Task::is_terminal_success)
    }

    /// Some task failed and its failure is not ignored
    pub fn has_failed(&self) -> bool {
        self.graph.node_weights().any(Task::is_fatal_failure)
    }

    /// Tasks that have not reached a terminal state
    pub fn unfinished(&self) -> Vec<TaskId> {
        self.graph
            .node_weights()
            .filter(|t| !t.status().is_terminal())
            .map(Task::id)
            .collect()
    }

    pub fn mark_started(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.task_mut(id)?.start()
    }

    /// Return a started task to the ready set without counting an attempt
    pub fn release(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.task_mut(id)?.release()
    }

    /// Mark a task succeeded; returns the workflow tasks settled as a result
    pub fn mark_succeeded(&mut self, id: TaskId) -> Result<Vec<TaskId>, GraphError> {
        self.task_mut(id)?.succeed()?;
        self.settle_ancestors(id)
    }

    /// Record a failed attempt.
    ///
    /// Returns how the retry policy disposed of the failure and the workflow
    /// tasks settled as a result.
    pub fn record_failure(
        &mut self,
        id: TaskId,
        reason: impl Into<String>,
        now: Instant,
    ) -> Result<(FailureDisposition, Vec<TaskId>), GraphError> {
        let disposition = self.task_mut(id)?.fail(reason.into(), now)?;
        let settled = match disposition {
            FailureDisposition::Retry { .. } => Vec::new(),
            FailureDisposition::Ignored | FailureDisposition::Failed => {
                self.settle_ancestors(id)?
            }
        };
        Ok((disposition, settled))
    }

    /// Fail a task outright, bypassing its retry policy
    pub fn abort(
        &mut self,
        id: TaskId,
        reason: impl Into<String>,
    ) -> Result<Vec<TaskId>, GraphError> {
        self.task_mut(id)?.abort(reason.into())?;
        self.settle_ancestors(id)
    }

    /// Propagate a terminal child up the chain of workflow tasks.
    ///
    /// A workflow task succeeds once all of its children reached terminal
    /// success and fails as soon as one child fails fatally.
    fn settle_ancestors(&mut self, id: TaskId) -> Result<Vec<TaskId>, GraphError> {
        let mut settled = Vec::new();
        let mut current = id;

        loop {
            let child = self.task(current)?;
            let Some(parent_id) = child.parent() else {
                break;
            };
            let failure = child
                .is_fatal_failure()
                .then(|| format!("task '{}' failed", child.name()));

            if self.task(parent_id)?.status() != TaskStatus::Started {
                break;
            }

            match failure {
                Some(reason) => self.task_mut(parent_id)?.abort(reason)?,
                None if self.children_succeeded(parent_id) => {
                    self.task_mut(parent_id)?.succeed()?
                }
                None => break,
            }

            settled.push(parent_id);
            current = parent_id;
        }

        Ok(settled)
    }

    fn children_succeeded(&self, parent: TaskId) -> bool {
        self.children(parent)
            .iter()
            .filter_map(|c| self.get(*c))
            .all(Task::is_terminal_success)
    }

    /// Attach the graph built by a started workflow task.
    ///
    /// Nested tasks become children of `parent` and keep their own edges.
    /// Tasks that depended on the workflow task wait until all children
    /// reached terminal success. Returns the workflow tasks settled as a
    /// result, which is only non-empty for an empty nested graph.
    pub fn splice(
        &mut self,
        parent: TaskId,
        nested: TaskGraph,
    ) -> Result<Vec<TaskId>, GraphError> {
        let parent_task = self.task(parent)?;
        if !parent_task.is_workflow() || parent_task.status() != TaskStatus::Started {
            return Err(GraphError::invalid(format!(
                "task '{}' is not a running workflow task",
                parent_task.name()
            )));
        }
        if let Some(dup) = nested.tasks().find(|t| self.contains(t.id())) {
            return Err(GraphError::DuplicateTask(dup.id()));
        }

        if nested.is_empty() {
            self.task_mut(parent)?.succeed()?;
            let mut settled = vec![parent];
            settled.extend(self.settle_ancestors(parent)?);
            return Ok(settled);
        }

        let (nodes, edges) = nested.graph.into_nodes_edges();
        let mut mapped = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut task = node.weight;
            task.set_parent(parent);
            let id = self.insert(task);
            mapped.push(self.indices[&id]);
        }
        for edge in edges {
            self.graph.add_edge(
                mapped[edge.source().index()],
                mapped[edge.target().index()],
                (),
            );
        }

        Ok(Vec::new())
    }

    /// Serializable view of every task's status
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            tasks: self.graph.node_weights().map(TaskSnapshot::from).collect(),
        }
    }
}

/// Status of one task, detached from the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    pub workflow: bool,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub ignore_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskSnapshot {
    pub fn is_terminal_success(&self) -> bool {
        match self.status {
            TaskStatus::Succeeded => true,
            TaskStatus::Failed => self.ignore_failure,
            _ => false,
        }
    }

    pub fn is_fatal_failure(&self) -> bool {
        self.status == TaskStatus::Failed && !self.ignore_failure
    }
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        let options = task.options();
        Self {
            id: task.id(),
            name: task.name().to_string(),
            parent: task.parent(),
            workflow: task.is_workflow(),
            status: task.status(),
            attempt: task.attempt(),
            max_attempts: options.max_attempts,
            ignore_failure: options.ignore_failure,
            last_error: task.state().last_error.clone(),
        }
    }
}

/// Task statuses of a graph; completion verdicts are computed from the
/// statuses alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub tasks: Vec<TaskSnapshot>,
}

impl GraphSnapshot {
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(TaskSnapshot::is_terminal_success)
    }

    pub fn has_failed(&self) -> bool {
        self.tasks.iter().any(TaskSnapshot::is_fatal_failure)
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Tasks that failed fatally
    pub fn failed(&self) -> impl Iterator<Item = &TaskSnapshot> + '_ {
        self.tasks.iter().filter(|t| t.is_fatal_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{OperationTarget, TaskOptions};
    use crate::types::Inputs;
    use crate::workflow::FnWorkflow;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn op(instance: &str) -> Task {
        Task::operation(
            OperationTarget::node_instance(instance),
            "lifecycle.create",
            Inputs::new(),
            TaskOptions::default(),
        )
        .unwrap()
    }

    fn op_with(instance: &str, options: TaskOptions) -> Task {
        Task::operation(
            OperationTarget::node_instance(instance),
            "lifecycle.create",
            Inputs::new(),
            options,
        )
        .unwrap()
    }

    fn workflow_task(name: &str) -> Task {
        let workflow = FnWorkflow::new(name, |_, _, _| Ok(()));
        Task::workflow(name, Arc::new(workflow), Default::default())
    }

    fn ready(graph: &TaskGraph) -> HashSet<TaskId> {
        graph.ready_tasks().map(Task::id).collect()
    }

    fn run(graph: &mut TaskGraph, id: TaskId) {
        graph.mark_started(id).unwrap();
        graph.mark_succeeded(id).unwrap();
    }

    #[test]
    fn test_linear_graph() {
        let mut graph = TaskGraph::new();
        let ids = graph.sequence([op("a"), op("b"), op("c")]).unwrap();

        assert_eq!(graph.topological_order(), ids);
        assert_eq!(graph.roots(), vec![ids[0]]);
        assert_eq!(graph.leaves(), vec![ids[2]]);
        assert_eq!(graph.dependencies(ids[1]).unwrap(), vec![ids[0]]);
        assert_eq!(graph.dependents(ids[1]).unwrap(), vec![ids[2]]);
    }

    #[test]
    fn duplicate_and_unknown_tasks_are_rejected() {
        let mut graph = TaskGraph::new();
        let task = op("a");
        let id = graph.add_task(task.clone()).unwrap();

        assert_eq!(graph.add_task(task.clone()), Err(GraphError::DuplicateTask(id)));
        assert_eq!(
            graph.add_tasks([op("b"), task]),
            Err(GraphError::DuplicateTask(id))
        );
        assert_eq!(graph.len(), 1);

        let stranger = TaskId::new();
        assert_eq!(
            graph.add_dependency(id, [stranger]),
            Err(GraphError::UnknownTask(stranger))
        );
        assert_eq!(
            graph.add_dependency(stranger, [id]),
            Err(GraphError::UnknownTask(stranger))
        );
    }

    #[test]
    fn test_cyclic_dependency_rejected() {
        let mut graph = TaskGraph::new();
        let ids = graph.sequence([op("a"), op("b"), op("c")]).unwrap();
        let extra = graph.add_task(op("d")).unwrap();
        let edges_before = graph.graph.edge_count();

        // a -> b -> c; making a depend on c closes the loop
        let err = graph.add_dependency(ids[0], [extra, ids[2]]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                dependent: ids[0],
                dependency: ids[2]
            }
        );
        assert_eq!(graph.graph.edge_count(), edges_before);
        assert!(graph.dependencies(ids[0]).unwrap().is_empty());

        assert!(matches!(
            graph.add_dependency(extra, [extra]),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn ready_tasks_follow_dependencies() {
        let mut graph = TaskGraph::new();
        let a = graph.add_task(op("a")).unwrap();
        let b = graph.add_task(op("b")).unwrap();
        let c = graph.add_task(op("c")).unwrap();
        graph.add_dependency(c, [a, b]).unwrap();

        assert_eq!(ready(&graph), HashSet::from([a, b]));
        assert!(!graph.is_complete());

        run(&mut graph, a);
        assert_eq!(ready(&graph), HashSet::from([b]));

        // Started tasks are not ready
        graph.mark_started(b).unwrap();
        assert!(ready(&graph).is_empty());
        graph.mark_succeeded(b).unwrap();
        assert_eq!(ready(&graph), HashSet::from([c]));

        run(&mut graph, c);
        assert!(graph.is_complete());
        assert!(!graph.has_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_task_is_ready_when_due() {
        let mut graph = TaskGraph::new();
        let id = graph
            .add_task(op_with(
                "a",
                TaskOptions {
                    max_attempts: 2,
                    retry_interval: Duration::from_secs(10),
                    ignore_failure: false,
                },
            ))
            .unwrap();

        let now = Instant::now();
        graph.mark_started(id).unwrap();
        let (disposition, _) = graph.record_failure(id, "boom", now).unwrap();
        assert!(matches!(disposition, FailureDisposition::Retry { .. }));

        assert_eq!(graph.ready_tasks_at(now).count(), 0);
        assert_eq!(graph.next_retry_at(), Some(now + Duration::from_secs(10)));
        assert_eq!(
            graph
                .ready_tasks_at(now + Duration::from_secs(10))
                .map(Task::id)
                .collect::<Vec<_>>(),
            vec![id]
        );
    }

    #[test]
    fn failures_block_dependents() {
        let mut graph = TaskGraph::new();
        let ignored = graph
            .add_task(op_with(
                "a",
                TaskOptions {
                    ignore_failure: true,
                    ..TaskOptions::default()
                },
            ))
            .unwrap();
        let fatal = graph.add_task(op("b")).unwrap();
        let after_ignored = graph.add_task(op("c")).unwrap();
        let after_fatal = graph.add_task(op("d")).unwrap();
        graph.add_dependency(after_ignored, [ignored]).unwrap();
        graph.add_dependency(after_fatal, [fatal]).unwrap();

        let now = Instant::now();
        for id in [ignored, fatal] {
            graph.mark_started(id).unwrap();
            graph.record_failure(id, "boom", now).unwrap();
        }

        assert_eq!(ready(&graph), HashSet::from([after_ignored]));
        assert!(graph.has_failed());
        assert!(!graph.is_complete());
    }

    #[test]
    fn splice_completes_workflow_task_with_children() {
        let mut graph = TaskGraph::new();
        let wf = graph.add_task(workflow_task("install_node_instance")).unwrap();
        let after = graph.add_task(op("after")).unwrap();
        graph.add_dependency(after, [wf]).unwrap();

        graph.mark_started(wf).unwrap();
        let mut nested = TaskGraph::new();
        let children = nested.sequence([op("x"), op("y")]).unwrap();
        assert!(graph.splice(wf, nested).unwrap().is_empty());

        assert_eq!(graph.children(wf), children.as_slice());
        assert_eq!(graph.get(children[0]).unwrap().parent(), Some(wf));
        assert_eq!(ready(&graph), HashSet::from([children[0]]));

        graph.mark_started(children[0]).unwrap();
        assert!(graph.mark_succeeded(children[0]).unwrap().is_empty());
        graph.mark_started(children[1]).unwrap();
        assert_eq!(graph.mark_succeeded(children[1]).unwrap(), vec![wf]);

        assert_eq!(graph.get(wf).unwrap().status(), TaskStatus::Succeeded);
        assert_eq!(ready(&graph), HashSet::from([after]));
    }

    #[test]
    fn child_failure_fails_workflow_task() {
        let mut graph = TaskGraph::new();
        let wf = graph.add_task(workflow_task("wf")).unwrap();
        graph.mark_started(wf).unwrap();

        let mut nested = TaskGraph::new();
        let child = nested.add_task(op("x")).unwrap();
        let sibling = nested.add_task(op("y")).unwrap();
        graph.splice(wf, nested).unwrap();

        graph.mark_started(child).unwrap();
        let (_, settled) = graph.record_failure(child, "boom", Instant::now()).unwrap();
        assert_eq!(settled, vec![wf]);
        assert!(graph.get(wf).unwrap().is_fatal_failure());

        // Children of a failed workflow task are never dispatched
        assert!(!ready(&graph).contains(&sibling));
    }

    #[test]
    fn empty_nested_graph_succeeds_immediately() {
        let mut graph = TaskGraph::new();
        let wf = graph.add_task(workflow_task("wf")).unwrap();
        graph.mark_started(wf).unwrap();

        assert_eq!(graph.splice(wf, TaskGraph::new()).unwrap(), vec![wf]);
        assert!(graph.is_complete());
    }

    #[test]
    fn splice_requires_running_workflow_task() {
        let mut graph = TaskGraph::new();
        let plain = graph.add_task(op("a")).unwrap();
        let wf = graph.add_task(workflow_task("wf")).unwrap();

        assert!(graph.splice(plain, TaskGraph::new()).is_err());
        assert!(graph.splice(wf, TaskGraph::new()).is_err());
    }

    #[test]
    fn snapshot_round_trip_matches_live_verdict() {
        let mut graph = TaskGraph::new();
        let ids = graph
            .sequence([
                op("a"),
                op_with(
                    "b",
                    TaskOptions {
                        ignore_failure: true,
                        ..TaskOptions::default()
                    },
                ),
                op("c"),
            ])
            .unwrap();

        let check = |graph: &TaskGraph| {
            let json = serde_json::to_string(&graph.snapshot()).unwrap();
            let restored: GraphSnapshot = serde_json::from_str(&json).unwrap();
            assert_eq!(restored.is_complete(), graph.is_complete());
            assert_eq!(restored.has_failed(), graph.has_failed());
        };

        check(&graph);
        run(&mut graph, ids[0]);
        check(&graph);
        graph.mark_started(ids[1]).unwrap();
        graph.record_failure(ids[1], "ignored", Instant::now()).unwrap();
        check(&graph);
        run(&mut graph, ids[2]);
        check(&graph);
        assert!(graph.is_complete());
    }
}
