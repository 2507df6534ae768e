//! Derives task dependencies from relationship edges between instances.

use crate::error::GraphError;
use crate::graph::TaskGraph;
use crate::model::Topology;
use crate::types::TaskId;
use std::collections::HashMap;

/// First and last task of the work built for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpan {
    pub first: TaskId,
    pub last: TaskId,
}

impl TaskSpan {
    /// Span of a chained sequence; `None` for an empty sequence
    pub fn of_sequence(ids: &[TaskId]) -> Option<Self> {
        Some(Self {
            first: *ids.first()?,
            last: *ids.last()?,
        })
    }
}

impl From<TaskId> for TaskSpan {
    fn from(id: TaskId) -> Self {
        Self { first: id, last: id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyDirection {
    /// An instance's work waits for the instances it has relationships to
    Forward,
    /// The instances it has relationships to wait for the instance's work
    Reverse,
}

/// Add edges between per-instance task spans following relationship
/// instances in the topology.
///
/// Instances without a span are skipped. Each dependent gets a single
/// batched `add_dependency` call. Returns the number of calls made.
pub fn add_instance_dependencies(
    graph: &mut TaskGraph,
    topology: &Topology,
    instance_tasks: &[(&str, TaskSpan)],
    direction: DependencyDirection,
) -> Result<usize, GraphError> {
    let spans: HashMap<&str, TaskSpan> = instance_tasks.iter().copied().collect();
    let mut calls = 0;

    match direction {
        DependencyDirection::Forward => {
            for (instance, span) in instance_tasks {
                let dependencies: Vec<TaskId> = topology
                    .outbound_targets(instance)
                    .into_iter()
                    .filter_map(|target| spans.get(target).map(|s| s.last))
                    .collect();

                if !dependencies.is_empty() {
                    graph.add_dependency(span.first, dependencies)?;
                    calls += 1;
                }
            }
        }
        DependencyDirection::Reverse => {
            // Group by target so each target gets one batched call
            let mut order: Vec<&str> = Vec::new();
            let mut by_target: HashMap<&str, Vec<TaskId>> = HashMap::new();

            for (instance, span) in instance_tasks {
                for target in topology.outbound_targets(instance) {
                    if !spans.contains_key(target) {
                        continue;
                    }
                    by_target
                        .entry(target)
                        .or_insert_with(|| {
                            order.push(target);
                            Vec::new()
                        })
                        .push(span.last);
                }
            }

            for target in order {
                let dependencies = by_target.remove(target).unwrap_or_default();
                graph.add_dependency(spans[target].first, dependencies)?;
                calls += 1;
            }
        }
    }

    tracing::debug!(
        "Added {:?} instance dependencies with {} batched calls",
        direction,
        calls
    );
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::task::{OperationTarget, Task, TaskOptions};
    use crate::types::Inputs;

    fn instance_sequence(graph: &mut TaskGraph, instance: &str) -> TaskSpan {
        let tasks = ["lifecycle.create", "lifecycle.configure", "lifecycle.start"].map(|op| {
            Task::operation(
                OperationTarget::node_instance(instance),
                op,
                Inputs::new(),
                TaskOptions::default(),
            )
            .unwrap()
        });
        let ids = graph.sequence(tasks).unwrap();
        TaskSpan::of_sequence(&ids).unwrap()
    }

    /// a depends on b, b depends on c
    fn chain_topology() -> Topology {
        let store = store();
        add_node(&store, "a", &[]);
        add_node(&store, "b", &[]);
        add_node(&store, "c", &[]);
        connect(&store, "a", "b", &[], &[]);
        connect(&store, "b", "c", &[], &[]);
        Topology::load(store.as_ref(), DEPLOYMENT).unwrap()
    }

    fn reaches(graph: &TaskGraph, from: TaskId, to: TaskId) -> bool {
        // `to` depends transitively on `from`
        let mut stack = vec![to];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if id == from {
                return true;
            }
            if seen.insert(id) {
                stack.extend(graph.dependencies(id).unwrap());
            }
        }
        false
    }

    #[test]
    fn forward_dependencies_follow_relationships() {
        let topology = chain_topology();
        let mut graph = TaskGraph::new();
        let a = instance_sequence(&mut graph, "a_1");
        let b = instance_sequence(&mut graph, "b_1");
        let c = instance_sequence(&mut graph, "c_1");

        let calls = add_instance_dependencies(
            &mut graph,
            &topology,
            &[("a_1", a), ("b_1", b), ("c_1", c)],
            DependencyDirection::Forward,
        )
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(graph.dependencies(a.first).unwrap(), vec![b.last]);
        assert!(reaches(&graph, c.last, a.first));
        assert!(!reaches(&graph, a.last, c.first));
    }

    #[test]
    fn reverse_dependencies_invert_order() {
        let topology = chain_topology();
        let mut graph = TaskGraph::new();
        let a = instance_sequence(&mut graph, "a_1");
        let b = instance_sequence(&mut graph, "b_1");
        let c = instance_sequence(&mut graph, "c_1");

        add_instance_dependencies(
            &mut graph,
            &topology,
            &[("a_1", a), ("b_1", b), ("c_1", c)],
            DependencyDirection::Reverse,
        )
        .unwrap();

        assert_eq!(graph.dependencies(c.first).unwrap(), vec![b.last]);
        assert!(reaches(&graph, a.last, c.first));
        assert!(!reaches(&graph, c.last, a.first));
    }

    #[test]
    fn reverse_batches_per_target() {
        let store = store();
        add_node(&store, "host", &[]);
        add_node(&store, "web", &[]);
        add_node(&store, "db", &[]);
        connect(&store, "web", "host", &[], &[]);
        connect(&store, "db", "host", &[], &[]);
        let topology = Topology::load(store.as_ref(), DEPLOYMENT).unwrap();

        let mut graph = TaskGraph::new();
        let host = instance_sequence(&mut graph, "host_1");
        let web = instance_sequence(&mut graph, "web_1");
        let db = instance_sequence(&mut graph, "db_1");

        let calls = add_instance_dependencies(
            &mut graph,
            &topology,
            &[("host_1", host), ("web_1", web), ("db_1", db)],
            DependencyDirection::Reverse,
        )
        .unwrap();

        assert_eq!(calls, 1);
        let mut deps = graph.dependencies(host.first).unwrap();
        deps.sort();
        let mut expected = vec![web.last, db.last];
        expected.sort();
        assert_eq!(deps, expected);
    }

    #[test]
    fn instances_without_tasks_are_skipped() {
        let topology = chain_topology();
        let mut graph = TaskGraph::new();
        let a = instance_sequence(&mut graph, "a_1");
        let c = instance_sequence(&mut graph, "c_1");

        // b has no tasks, so neither edge can be resolved
        let calls = add_instance_dependencies(
            &mut graph,
            &topology,
            &[("a_1", a), ("c_1", c)],
            DependencyDirection::Forward,
        )
        .unwrap();

        assert_eq!(calls, 0);
        assert!(graph.dependencies(a.first).unwrap().is_empty());
    }
}
