//! Error types shared across the orchestration core.

use crate::types::{TaskId, TaskStatus};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or mutating a task graph.
///
/// All of these are programming errors in workflow-authoring code and are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("invalid task: {reason}")]
    InvalidTask { reason: String },

    #[error("task {0} is already in the graph")]
    DuplicateTask(TaskId),

    #[error("task {0} is not in the graph")]
    UnknownTask(TaskId),

    #[error("dependency {dependent} -> {dependency} would create a cycle")]
    Cycle { dependent: TaskId, dependency: TaskId },

    #[error("task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl GraphError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            reason: reason.into(),
        }
    }
}

/// Errors from the model store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection} '{id}' not found")]
    NotFound { collection: &'static str, id: String },

    #[error("model store backend error: {0}")]
    Backend(#[from] redb::Error),

    #[error("failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn backend<E: Into<redb::Error>>(error: E) -> StoreError {
    StoreError::Backend(error.into())
}

/// Pre-flight validation errors for execution parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("workflow '{workflow}' must be provided with the following parameters to execute: {}", names.join(","))]
    Missing { workflow: String, names: Vec<String> },

    #[error("workflow '{workflow}' does not have the following parameters declared: {}", names.join(","))]
    Unexpected { workflow: String, names: Vec<String> },

    #[error("parameter '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

/// Errors raised by a workflow function while building its graph
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
}

/// Resolution failure for an operation implementation name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no operation implementation registered for '{0}'")]
pub struct UnknownOperationError(pub String);

/// Failure raised by an operation implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Why a single task attempt failed.
///
/// Every variant is delivered through the completion channel and drives the
/// same retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    #[error("operation failed: {0}")]
    Operation(#[from] OperationError),

    #[error(transparent)]
    UnknownOperation(#[from] UnknownOperationError),

    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("worker process exited without a result ({status})")]
    WorkerCrashed { status: String },

    #[error("worker process timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not resolve task target: {0}")]
    Target(String),

    #[error("workflow expansion failed: {0}")]
    Expansion(String),
}

/// Errors returned synchronously by an executor's `submit`
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor is closed")]
    Closed,

    #[error("failed to start worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Fatal engine errors that abort a run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("inconsistent graph state: {0}")]
    Inconsistent(#[from] GraphError),

    #[error("failed to build workflow graph: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("run cannot make progress; {} task(s) still pending", pending.len())]
    Stalled { pending: Vec<TaskId> },
}
