use crate::error::{GraphError, StoreError};
use crate::events::{EventSink, TracingEventSink};
use crate::model::Topology;
use crate::storage::{ModelStore, ResourceStore};
use crate::task::{OperationTarget, Task, TaskOptions};
use crate::types::{ExecutionId, Inputs, Parameters, RelationshipEnd};
use std::sync::Arc;

/// Identity of one execution plus read access to the model.
///
/// Built once before the graph is constructed and never mutated afterwards;
/// the engine shares it with every workflow expansion.
#[derive(Clone)]
pub struct WorkflowContext {
    execution_id: ExecutionId,
    deployment_id: String,
    workflow_name: String,
    parameters: Parameters,
    model: Arc<dyn ModelStore>,
    resources: Option<Arc<dyn ResourceStore>>,
    sink: Arc<dyn EventSink>,
    task_defaults: TaskOptions,
}

impl WorkflowContext {
    pub fn new(
        deployment_id: impl Into<String>,
        workflow_name: impl Into<String>,
        model: Arc<dyn ModelStore>,
    ) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            deployment_id: deployment_id.into(),
            workflow_name: workflow_name.into(),
            parameters: Parameters::new(),
            model,
            resources: None,
            sink: Arc::new(TracingEventSink),
            task_defaults: TaskOptions::default(),
        }
    }

    pub fn with_execution_id(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = execution_id;
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceStore>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Retry policy applied to operation tasks created through this context
    pub fn with_task_defaults(mut self, defaults: TaskOptions) -> Self {
        self.task_defaults = defaults;
        self
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn model(&self) -> &Arc<dyn ModelStore> {
        &self.model
    }

    pub fn resources(&self) -> Option<&Arc<dyn ResourceStore>> {
        self.resources.as_ref()
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn task_defaults(&self) -> TaskOptions {
        self.task_defaults
    }

    /// Current topology of the deployment, read from the model store
    pub fn topology(&self) -> Result<Topology, StoreError> {
        Topology::load(self.model.as_ref(), &self.deployment_id)
    }

    /// Operation task on a node instance with the default retry policy
    pub fn node_operation(
        &self,
        instance_id: &str,
        operation: &str,
        inputs: Inputs,
    ) -> Result<Task, GraphError> {
        Task::operation(
            OperationTarget::node_instance(instance_id),
            operation,
            inputs,
            self.task_defaults,
        )
    }

    /// Operation task on one end of a relationship instance with the default
    /// retry policy
    pub fn relationship_operation(
        &self,
        relationship_instance_id: &str,
        end: RelationshipEnd,
        operation: &str,
        inputs: Inputs,
    ) -> Result<Task, GraphError> {
        Task::operation(
            OperationTarget::relationship_instance(relationship_instance_id, end),
            operation,
            inputs,
            self.task_defaults,
        )
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("execution_id", &self.execution_id)
            .field("deployment_id", &self.deployment_id)
            .field("workflow_name", &self.workflow_name)
            .field("parameters", &self.parameters)
            .field("task_defaults", &self.task_defaults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use std::time::Duration;

    #[test]
    fn tasks_use_context_defaults() {
        let store = fixtures::store();
        let defaults = TaskOptions {
            max_attempts: 4,
            retry_interval: Duration::from_secs(2),
            ignore_failure: false,
        };
        let ctx = WorkflowContext::new(fixtures::DEPLOYMENT, "install", store)
            .with_task_defaults(defaults);

        let task = ctx
            .node_operation("vm_1", "lifecycle.create", Inputs::new())
            .unwrap();
        assert_eq!(task.options(), defaults);

        let rel = ctx
            .relationship_operation("r_1", RelationshipEnd::Target, "a.b", Inputs::new())
            .unwrap();
        assert_eq!(rel.options().max_attempts, 4);
    }

    #[test]
    fn topology_reads_current_model() {
        let store = fixtures::store();
        let ctx = WorkflowContext::new(fixtures::DEPLOYMENT, "install", store.clone());
        assert!(ctx.topology().unwrap().node_instances().is_empty());

        fixtures::add_node(&store, "vm", &[]);
        assert_eq!(ctx.topology().unwrap().node_instances().len(), 1);
    }
}
