//! Operation implementations, the context they run with and their registry.

use crate::error::{ExecutionFailure, OperationError, StoreError, UnknownOperationError};
use crate::events::{Event, EventSink, EventType};
use crate::model::{Node, NodeInstance, Relationship, RelationshipInstance};
use crate::storage::{ModelStore, ModelStoreExt};
use crate::task::{OperationTarget, OperationTask};
use crate::types::{ExecutionId, Inputs, RelationshipEnd, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// An operation implementation.
///
/// Returning `Err` fails the current attempt; the engine's retry policy
/// decides what happens next.
pub trait Operation: Send + Sync {
    fn run(&self, ctx: &OperationContext, inputs: &Inputs) -> Result<(), OperationError>;
}

impl<F> Operation for F
where
    F: Fn(&OperationContext, &Inputs) -> Result<(), OperationError> + Send + Sync,
{
    fn run(&self, ctx: &OperationContext, inputs: &Inputs) -> Result<(), OperationError> {
        self(ctx, inputs)
    }
}

/// The model records an operation task targets, resolved at dispatch time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedTarget {
    NodeInstance {
        instance: NodeInstance,
        node: Node,
    },
    RelationshipInstance {
        end: RelationshipEnd,
        instance: RelationshipInstance,
        relationship: Relationship,
        source: NodeInstance,
        target: NodeInstance,
    },
}

impl ResolvedTarget {
    /// Load the records behind a task target
    pub fn load(store: &dyn ModelStore, target: &OperationTarget) -> Result<Self, StoreError> {
        match target {
            OperationTarget::NodeInstance { id } => {
                let instance: NodeInstance = store.get(id)?;
                let node: Node = store.get(&instance.node_id)?;
                Ok(Self::NodeInstance { instance, node })
            }
            OperationTarget::RelationshipInstance { id, end } => {
                let instance: RelationshipInstance = store.get(id)?;
                let relationship: Relationship = store.get(&instance.relationship_id)?;
                let source: NodeInstance = store.get(&instance.source_node_instance_id)?;
                let target: NodeInstance = store.get(&instance.target_node_instance_id)?;
                Ok(Self::RelationshipInstance {
                    end: *end,
                    instance,
                    relationship,
                    source,
                    target,
                })
            }
        }
    }

    /// Operations declared for this target
    pub fn operations(&self) -> &crate::model::Operations {
        match self {
            Self::NodeInstance { node, .. } => &node.operations,
            Self::RelationshipInstance {
                end, relationship, ..
            } => relationship.operations(*end),
        }
    }

    /// Whether the target declares the named operation
    pub fn declares(&self, operation: &str) -> bool {
        self.operations().contains_key(operation)
    }
}

/// Everything an operation needs to know about the task it runs for.
///
/// This is also the payload sent to out-of-process workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub task_name: String,
    pub execution_id: ExecutionId,
    pub deployment_id: String,
    pub workflow_name: String,
    /// Interface operation name
    pub operation: String,
    /// Registry key of the implementation to run
    pub implementation: String,
    pub inputs: Inputs,
    pub attempt: u32,
    pub max_attempts: u32,
    pub target: ResolvedTarget,
}

impl TaskDescriptor {
    /// Bind an operation task to its implementation.
    ///
    /// A declared operation supplies the implementation name and default
    /// inputs, which task inputs override. An undeclared operation name is
    /// its own implementation name.
    pub fn bind(task: &OperationTask, target: &ResolvedTarget) -> (String, Inputs) {
        match target.operations().get(&task.operation) {
            Some(spec) => {
                let mut inputs = spec.inputs.clone();
                inputs.extend(task.inputs.clone());
                (spec.implementation.clone(), inputs)
            }
            None => (task.operation.clone(), task.inputs.clone()),
        }
    }
}

/// Context passed to every operation invocation
#[derive(Clone)]
pub struct OperationContext {
    pub descriptor: TaskDescriptor,
    model: Option<Arc<dyn ModelStore>>,
    sink: Arc<dyn EventSink>,
}

impl OperationContext {
    pub fn new(descriptor: TaskDescriptor, sink: Arc<dyn EventSink>) -> Self {
        Self {
            descriptor,
            model: None,
            sink,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelStore>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.descriptor.task_id
    }

    pub fn target(&self) -> &ResolvedTarget {
        &self.descriptor.target
    }

    /// Model store, when the operation runs in the engine's process
    pub fn model(&self) -> Option<&dyn ModelStore> {
        self.model.as_deref()
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Report a message for this task through the event sink
    pub fn log(&self, message: impl Into<String>) {
        self.sink.emit(Event::new(
            self.descriptor.execution_id.clone(),
            EventType::OperationMessage {
                task_id: self.descriptor.task_id,
                message: message.into(),
            },
        ));
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("descriptor", &self.descriptor)
            .field("has_model", &self.model.is_some())
            .finish()
    }
}

/// Registry of operation implementations keyed by name
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `builtin.*` operations
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_fn("builtin.noop", noop);
        registry.register_fn("builtin.log", log);
        registry.register_fn("builtin.fail", fail);
        registry.register_fn("builtin.sleep", sleep);
        registry.register_fn("builtin.flaky", flaky);
        registry.register_fn("builtin.set_state", set_state);
        registry
    }

    /// Register an implementation, replacing any previous one with that name
    pub fn register(&mut self, name: impl Into<String>, operation: impl Operation + 'static) {
        self.operations.insert(name.into(), Arc::new(operation));
    }

    /// Register a closure as an implementation
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&OperationContext, &Inputs) -> Result<(), OperationError> + Send + Sync + 'static,
    {
        self.register(name, f);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Operation>, UnknownOperationError> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownOperationError(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve and run the implementation named by the context's descriptor
    pub fn invoke(&self, ctx: &OperationContext) -> Result<(), ExecutionFailure> {
        let operation = self.resolve(&ctx.descriptor.implementation)?;
        operation.run(ctx, &ctx.descriptor.inputs)?;
        Ok(())
    }
}

/// Read an optional unsigned integer input
pub fn input_u64(inputs: &Inputs, key: &str, default: u64) -> Result<u64, OperationError> {
    match inputs.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| {
            OperationError::new(format!("input '{}' must be a non-negative integer", key))
        }),
    }
}

/// Read an optional string input
pub fn input_str<'a>(inputs: &'a Inputs, key: &str) -> Result<Option<&'a str>, OperationError> {
    match inputs.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| OperationError::new(format!("input '{}' must be a string", key))),
    }
}

fn noop(_ctx: &OperationContext, _inputs: &Inputs) -> Result<(), OperationError> {
    Ok(())
}

fn log(ctx: &OperationContext, inputs: &Inputs) -> Result<(), OperationError> {
    let mut message = match ctx.target() {
        ResolvedTarget::NodeInstance { instance, .. } => {
            format!("> node instance: {}", instance.name)
        }
        ResolvedTarget::RelationshipInstance { source, target, .. } => {
            format!("> relationship instance: {} -> {}", source.name, target.name)
        }
    };
    if let Some(extra) = input_str(inputs, "message")? {
        message.push(' ');
        message.push_str(extra);
    }
    ctx.log(message);
    Ok(())
}

fn fail(_ctx: &OperationContext, inputs: &Inputs) -> Result<(), OperationError> {
    let message = input_str(inputs, "message")?.unwrap_or("operation failed");
    Err(OperationError::new(message))
}

fn sleep(_ctx: &OperationContext, inputs: &Inputs) -> Result<(), OperationError> {
    let millis = input_u64(inputs, "millis", 0)?;
    std::thread::sleep(Duration::from_millis(millis));
    Ok(())
}

fn flaky(ctx: &OperationContext, inputs: &Inputs) -> Result<(), OperationError> {
    let succeed_on = input_u64(inputs, "succeed_on_attempt", 2)?;
    let attempt = u64::from(ctx.descriptor.attempt);
    if attempt < succeed_on {
        return Err(OperationError::new(format!(
            "attempt {} of {} failed (succeeds on attempt {})",
            attempt, ctx.descriptor.max_attempts, succeed_on
        )));
    }
    Ok(())
}

fn set_state(ctx: &OperationContext, inputs: &Inputs) -> Result<(), OperationError> {
    let state = input_str(inputs, "state")?
        .ok_or_else(|| OperationError::new("input 'state' is required"))?;
    let model = ctx
        .model()
        .ok_or_else(|| OperationError::new("no model store available to this operation"))?;

    let ResolvedTarget::NodeInstance { instance, .. } = ctx.target() else {
        return Err(OperationError::new(
            "builtin.set_state only applies to node instances",
        ));
    };

    let mut current: NodeInstance = model
        .get(&instance.id)
        .map_err(|e| OperationError::new(e.to_string()))?;
    current.state = state.to_string();
    model
        .put(&current)
        .map_err(|e| OperationError::new(e.to_string()))?;

    ctx.log(format!("{} state set to '{}'", current.name, state));
    Ok(())
}
