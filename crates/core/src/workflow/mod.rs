//! Workflows: functions that build task graphs through the builder interface.

pub mod builtin;
pub mod lifecycle;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::graph::TaskGraph;
use crate::model::{ParameterDeclaration, WorkflowDeclaration};
use crate::types::Parameters;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A named graph builder.
///
/// `build` receives an empty graph and adds the work needed for the
/// workflow's intent. It may read the model through the context but must not
/// execute anything itself.
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    /// Declared parameters; those without a default are mandatory
    fn parameters(&self) -> BTreeMap<String, ParameterDeclaration> {
        BTreeMap::new()
    }

    fn build(
        &self,
        ctx: &WorkflowContext,
        graph: &mut TaskGraph,
        parameters: &Parameters,
    ) -> Result<(), WorkflowError>;
}

/// Workflow backed by a closure
pub struct FnWorkflow<F> {
    name: String,
    parameters: BTreeMap<String, ParameterDeclaration>,
    build: F,
}

impl<F> FnWorkflow<F>
where
    F: Fn(&WorkflowContext, &mut TaskGraph, &Parameters) -> Result<(), WorkflowError>
        + Send
        + Sync,
{
    pub fn new(name: impl Into<String>, build: F) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            build,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, declaration: ParameterDeclaration) -> Self {
        self.parameters.insert(name.into(), declaration);
        self
    }
}

impl<F> Workflow for FnWorkflow<F>
where
    F: Fn(&WorkflowContext, &mut TaskGraph, &Parameters) -> Result<(), WorkflowError>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> BTreeMap<String, ParameterDeclaration> {
        self.parameters.clone()
    }

    fn build(
        &self,
        ctx: &WorkflowContext,
        graph: &mut TaskGraph,
        parameters: &Parameters,
    ) -> Result<(), WorkflowError> {
        (self.build)(ctx, graph, parameters)
    }
}

/// Registry of workflows keyed by name
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding install, uninstall, start, stop and execute_operation
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for workflow in builtin::all() {
            registry.register(workflow);
        }
        registry
    }

    /// Register a workflow under its own name
    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows.insert(workflow.name().to_string(), workflow);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Workflow>, WorkflowError> {
        self.get(name)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Declarations for a deployment exposing every registered workflow
    pub fn declarations(&self) -> BTreeMap<String, WorkflowDeclaration> {
        self.workflows
            .iter()
            .map(|(name, workflow)| {
                (
                    name.clone(),
                    WorkflowDeclaration {
                        handler: name.clone(),
                        parameters: workflow.parameters(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let registry = WorkflowRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["execute_operation", "install", "start", "stop", "uninstall"]
        );

        let declarations = registry.declarations();
        let execute = &declarations["execute_operation"];
        assert_eq!(execute.handler, "execute_operation");
        assert!(execute.parameters["operation"].default.is_none());
        assert_eq!(
            execute.parameters["run_by_dependency_order"].default,
            Some(json!(false))
        );

        assert!(matches!(
            registry.resolve("scale"),
            Err(WorkflowError::UnknownWorkflow(name)) if name == "scale"
        ));
    }

    #[test]
    fn closures_become_workflows() {
        let workflow = FnWorkflow::new("custom", |_, graph, _| {
            assert!(graph.is_empty());
            Ok(())
        })
        .with_parameter("x", ParameterDeclaration::required("x"));

        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(workflow));
        let resolved = registry.resolve("custom").unwrap();
        assert_eq!(resolved.parameters().len(), 1);
    }
}
