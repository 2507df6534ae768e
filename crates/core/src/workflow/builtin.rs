//! Deployment-wide builtin workflows.

use super::lifecycle::{self, NODE_INSTANCE_ID};
use super::Workflow;
use crate::context::WorkflowContext;
use crate::dependency::{add_instance_dependencies, DependencyDirection, TaskSpan};
use crate::error::WorkflowError;
use crate::graph::TaskGraph;
use crate::model::ParameterDeclaration;
use crate::parameters::{optional_bool, optional_object, optional_str_list, required_str};
use crate::task::Task;
use crate::types::Parameters;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// All deployment-wide builtin workflows
pub fn all() -> Vec<Arc<dyn Workflow>> {
    vec![
        Arc::new(InstanceWorkflow {
            name: "install",
            per_instance: lifecycle::install_node_instance(),
            direction: DependencyDirection::Forward,
        }),
        Arc::new(InstanceWorkflow {
            name: "uninstall",
            per_instance: lifecycle::uninstall_node_instance(),
            direction: DependencyDirection::Reverse,
        }),
        Arc::new(InstanceWorkflow {
            name: "start",
            per_instance: lifecycle::start_node_instance(),
            direction: DependencyDirection::Forward,
        }),
        Arc::new(InstanceWorkflow {
            name: "stop",
            per_instance: lifecycle::stop_node_instance(),
            direction: DependencyDirection::Reverse,
        }),
        Arc::new(ExecuteOperation),
    ]
}

/// One workflow task per node instance, ordered along relationships
struct InstanceWorkflow {
    name: &'static str,
    per_instance: Arc<dyn Workflow>,
    direction: DependencyDirection,
}

impl Workflow for InstanceWorkflow {
    fn name(&self) -> &str {
        self.name
    }

    fn build(
        &self,
        ctx: &WorkflowContext,
        graph: &mut TaskGraph,
        _parameters: &Parameters,
    ) -> Result<(), WorkflowError> {
        let topology = ctx.topology()?;

        let mut instance_tasks = Vec::new();
        for instance in topology.node_instances() {
            let mut parameters = Parameters::new();
            parameters.insert(NODE_INSTANCE_ID.to_string(), json!(instance.id));
            let task = Task::workflow(
                format!("{}.{}", self.per_instance.name(), instance.id),
                self.per_instance.clone(),
                parameters,
            );
            let id = graph.add_task(task)?;
            instance_tasks.push((instance.id.as_str(), TaskSpan::from(id)));
        }

        add_instance_dependencies(graph, &topology, &instance_tasks, self.direction)?;

        tracing::debug!(
            "{} workflow planned {} node instances",
            self.name,
            instance_tasks.len()
        );
        Ok(())
    }
}

/// Run a single operation on every (or selected) node instance
struct ExecuteOperation;

impl Workflow for ExecuteOperation {
    fn name(&self) -> &str {
        "execute_operation"
    }

    fn parameters(&self) -> BTreeMap<String, ParameterDeclaration> {
        BTreeMap::from([
            (
                "operation".to_string(),
                ParameterDeclaration::required("the operation to execute"),
            ),
            (
                "operation_kwargs".to_string(),
                ParameterDeclaration::optional("inputs passed to the operation", json!({})),
            ),
            (
                "allow_kwargs_override".to_string(),
                ParameterDeclaration::optional(
                    "forwarded to the operation when set",
                    Value::Null,
                ),
            ),
            (
                "run_by_dependency_order".to_string(),
                ParameterDeclaration::optional(
                    "order instances along their relationships",
                    json!(false),
                ),
            ),
            (
                "node_ids".to_string(),
                ParameterDeclaration::optional(
                    "only run on instances of these nodes; empty means all",
                    json!([]),
                ),
            ),
        ])
    }

    fn build(
        &self,
        ctx: &WorkflowContext,
        graph: &mut TaskGraph,
        parameters: &Parameters,
    ) -> Result<(), WorkflowError> {
        let operation = required_str(parameters, "operation")?;
        let mut inputs = optional_object(parameters, "operation_kwargs")?;
        if let Some(allow) = optional_bool(parameters, "allow_kwargs_override")? {
            inputs.insert("allow_kwargs_override".to_string(), json!(allow));
        }
        let by_dependency_order =
            optional_bool(parameters, "run_by_dependency_order")?.unwrap_or(false);
        let node_ids = optional_str_list(parameters, "node_ids")?;

        let topology = ctx.topology()?;
        let mut instance_tasks = Vec::new();
        for instance in topology.node_instances() {
            if !node_ids.is_empty() && !node_ids.contains(&instance.node_id) {
                continue;
            }
            let task = ctx.node_operation(&instance.id, operation, inputs.clone())?;
            let id = graph.add_task(task)?;
            instance_tasks.push((instance.id.as_str(), TaskSpan::from(id)));
        }

        if by_dependency_order {
            add_instance_dependencies(
                graph,
                &topology,
                &instance_tasks,
                DependencyDirection::Forward,
            )?;
        }
        Ok(())
    }
}
