//! Per-instance lifecycle workflows.

use super::Workflow;
use crate::context::WorkflowContext;
use crate::error::{ParameterError, WorkflowError};
use crate::graph::TaskGraph;
use crate::model::{ParameterDeclaration, Topology};
use crate::parameters::required_str;
use crate::task::Task;
use crate::types::{Inputs, Parameters, RelationshipEnd};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CREATE: &str = "tosca.interfaces.node.lifecycle.Standard.create";
pub const CONFIGURE: &str = "tosca.interfaces.node.lifecycle.Standard.configure";
pub const START: &str = "tosca.interfaces.node.lifecycle.Standard.start";
pub const STOP: &str = "tosca.interfaces.node.lifecycle.Standard.stop";
pub const DELETE: &str = "tosca.interfaces.node.lifecycle.Standard.delete";

pub const PRE_CONFIGURE_SOURCE: &str = "tosca.interfaces.relationship.Configure.pre_configure_source";
pub const PRE_CONFIGURE_TARGET: &str = "tosca.interfaces.relationship.Configure.pre_configure_target";
pub const POST_CONFIGURE_SOURCE: &str =
    "tosca.interfaces.relationship.Configure.post_configure_source";
pub const POST_CONFIGURE_TARGET: &str =
    "tosca.interfaces.relationship.Configure.post_configure_target";
pub const ADD_SOURCE: &str = "tosca.interfaces.relationship.Configure.add_source";
pub const ADD_TARGET: &str = "tosca.interfaces.relationship.Configure.add_target";
pub const TARGET_CHANGED: &str = "tosca.interfaces.relationship.Configure.target_changed";
pub const REMOVE_TARGET: &str = "tosca.interfaces.relationship.Configure.remove_target";

/// Parameter naming the instance a lifecycle workflow runs for
pub const NODE_INSTANCE_ID: &str = "node_instance_id";

/// One step of a lifecycle sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Operation on the node instance itself
    Node(&'static str),
    /// Operation on each outbound relationship instance, on the given end
    Relationship(&'static str, RelationshipEnd),
}

use RelationshipEnd::{Source, Target};

const START_STEPS: &[Step] = &[
    Step::Node(START),
    Step::Relationship(ADD_SOURCE, Source),
    Step::Relationship(ADD_TARGET, Target),
    Step::Relationship(TARGET_CHANGED, Target),
];

const STOP_STEPS: &[Step] = &[
    Step::Relationship(REMOVE_TARGET, Target),
    Step::Relationship(TARGET_CHANGED, Target),
    Step::Node(STOP),
];

const INSTALL_STEPS: &[Step] = &[
    Step::Node(CREATE),
    Step::Relationship(PRE_CONFIGURE_SOURCE, Source),
    Step::Relationship(PRE_CONFIGURE_TARGET, Target),
    Step::Node(CONFIGURE),
    Step::Relationship(POST_CONFIGURE_SOURCE, Source),
    Step::Relationship(POST_CONFIGURE_TARGET, Target),
    Step::Node(START),
    Step::Relationship(ADD_SOURCE, Source),
    Step::Relationship(ADD_TARGET, Target),
    Step::Relationship(TARGET_CHANGED, Target),
];

const UNINSTALL_STEPS: &[Step] = &[
    Step::Relationship(REMOVE_TARGET, Target),
    Step::Relationship(TARGET_CHANGED, Target),
    Step::Node(STOP),
    Step::Node(DELETE),
];

/// Build the operation tasks for one instance.
///
/// A step only yields a task when the node, or the relationship on the
/// step's end, declares the operation.
pub fn instance_tasks(
    ctx: &WorkflowContext,
    topology: &Topology,
    instance_id: &str,
    steps: &[Step],
) -> Result<Vec<Task>, WorkflowError> {
    let instance = topology.node_instance(instance_id).ok_or_else(|| {
        WorkflowError::Parameter(ParameterError::Invalid {
            name: NODE_INSTANCE_ID.to_string(),
            reason: format!("node instance '{}' is not part of the deployment", instance_id),
        })
    })?;
    let node = topology.node_of(instance);

    let mut tasks = Vec::new();
    for step in steps {
        match *step {
            Step::Node(operation) => {
                if node.map_or(false, |n| n.operations.contains_key(operation)) {
                    tasks.push(ctx.node_operation(instance_id, operation, Inputs::new())?);
                }
            }
            Step::Relationship(operation, end) => {
                for ri in topology.outbound(instance_id) {
                    let declared = topology
                        .relationship(&ri.relationship_id)
                        .map_or(false, |r| r.operations(end).contains_key(operation));
                    if declared {
                        tasks.push(ctx.relationship_operation(
                            &ri.id,
                            end,
                            operation,
                            Inputs::new(),
                        )?);
                    }
                }
            }
        }
    }
    Ok(tasks)
}

/// Workflow running one lifecycle sequence for a single node instance
pub struct LifecycleWorkflow {
    name: &'static str,
    steps: &'static [Step],
}

impl LifecycleWorkflow {
    pub fn steps(&self) -> &'static [Step] {
        self.steps
    }
}

impl Workflow for LifecycleWorkflow {
    fn name(&self) -> &str {
        self.name
    }

    fn parameters(&self) -> BTreeMap<String, ParameterDeclaration> {
        BTreeMap::from([(
            NODE_INSTANCE_ID.to_string(),
            ParameterDeclaration::required("node instance to run the sequence for"),
        )])
    }

    fn build(
        &self,
        ctx: &WorkflowContext,
        graph: &mut TaskGraph,
        parameters: &Parameters,
    ) -> Result<(), WorkflowError> {
        let instance_id = required_str(parameters, NODE_INSTANCE_ID)?;
        // Read the topology now so earlier tasks' effects are visible
        let topology = ctx.topology()?;
        let tasks = instance_tasks(ctx, &topology, instance_id, self.steps)?;
        graph.sequence(tasks)?;
        Ok(())
    }
}

pub fn install_node_instance() -> Arc<dyn Workflow> {
    Arc::new(LifecycleWorkflow {
        name: "install_node_instance",
        steps: INSTALL_STEPS,
    })
}

pub fn uninstall_node_instance() -> Arc<dyn Workflow> {
    Arc::new(LifecycleWorkflow {
        name: "uninstall_node_instance",
        steps: UNINSTALL_STEPS,
    })
}

pub fn start_node_instance() -> Arc<dyn Workflow> {
    Arc::new(LifecycleWorkflow {
        name: "start_node_instance",
        steps: START_STEPS,
    })
}

pub fn stop_node_instance() -> Arc<dyn Workflow> {
    Arc::new(LifecycleWorkflow {
        name: "stop_node_instance",
        steps: STOP_STEPS,
    })
}
