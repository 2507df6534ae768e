//! Tasks: the nodes of a task graph and their runtime state machine.

use crate::error::GraphError;
use crate::types::{Inputs, Parameters, RelationshipEnd, TaskId, TaskStatus};
use crate::workflow::Workflow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Input keys owned by the operation context and never accepted from callers
pub const RESERVED_INPUT_KEYS: &[&str] = &["ctx", "operation_context"];

/// What an operation task runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationTarget {
    NodeInstance { id: String },
    RelationshipInstance { id: String, end: RelationshipEnd },
}

impl OperationTarget {
    pub fn node_instance(id: impl Into<String>) -> Self {
        Self::NodeInstance { id: id.into() }
    }

    pub fn relationship_instance(id: impl Into<String>, end: RelationshipEnd) -> Self {
        Self::RelationshipInstance { id: id.into(), end }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::NodeInstance { id } | Self::RelationshipInstance { id, .. } => id,
        }
    }
}

impl std::fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeInstance { id } => write!(f, "{}", id),
            Self::RelationshipInstance { id, end } => write!(f, "{}[{}]", id, end),
        }
    }
}

/// Retry policy of an operation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub ignore_failure: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_interval: Duration::ZERO,
            ignore_failure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationTask {
    pub target: OperationTarget,
    /// Interface operation name, e.g. `tosca.interfaces.node.lifecycle.Standard.create`
    pub operation: String,
    pub inputs: Inputs,
    pub options: TaskOptions,
}

/// A task whose work is a nested graph built when the engine reaches it
#[derive(Clone)]
pub struct WorkflowTask {
    pub workflow: Arc<dyn Workflow>,
    pub parameters: Parameters,
}

impl std::fmt::Debug for WorkflowTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowTask")
            .field("workflow", &self.workflow.name())
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Operation(OperationTask),
    Workflow(WorkflowTask),
}

/// Runtime state of a task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempt: u32,
    pub retry_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempt: 1,
            retry_at: None,
            last_error: None,
        }
    }
}

/// Outcome of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Attempts remain; the task is due again at the given instant
    Retry { at: Instant },
    /// Attempts exhausted but the failure does not fail the run
    Ignored,
    /// Attempts exhausted
    Failed,
}

#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    name: String,
    kind: TaskKind,
    /// Workflow task this task was expanded from
    parent: Option<TaskId>,
    state: TaskState,
}

impl Task {
    /// Create an operation task, validating its shape
    pub fn operation(
        target: OperationTarget,
        operation: impl Into<String>,
        inputs: Inputs,
        options: TaskOptions,
    ) -> Result<Self, GraphError> {
        let operation = operation.into();

        if target.id().trim().is_empty() {
            return Err(GraphError::invalid("operation task has no target instance"));
        }
        if operation.is_empty() {
            return Err(GraphError::invalid("operation name is empty"));
        }
        if !operation.contains('.') || operation.split('.').any(|s| s.trim().is_empty()) {
            return Err(GraphError::invalid(format!(
                "operation name '{}' is not a dotted name",
                operation
            )));
        }
        if let Some(key) = RESERVED_INPUT_KEYS.iter().find(|k| inputs.contains_key(**k)) {
            return Err(GraphError::invalid(format!(
                "input key '{}' is reserved",
                key
            )));
        }
        if options.max_attempts < 1 {
            return Err(GraphError::invalid("max_attempts must be at least 1"));
        }

        let name = format!("{}@{}", short_operation_name(&operation), target);
        Ok(Self {
            id: TaskId::new(),
            name,
            kind: TaskKind::Operation(OperationTask {
                target,
                operation,
                inputs,
                options,
            }),
            parent: None,
            state: TaskState::default(),
        })
    }

    /// Create a workflow task; its graph is built when the engine reaches it
    pub fn workflow(
        name: impl Into<String>,
        workflow: Arc<dyn Workflow>,
        parameters: Parameters,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            kind: TaskKind::Workflow(WorkflowTask {
                workflow,
                parameters,
            }),
            parent: None,
            state: TaskState::default(),
        }
    }

    /// Replace the display name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn as_operation(&self) -> Option<&OperationTask> {
        match &self.kind {
            TaskKind::Operation(op) => Some(op),
            TaskKind::Workflow(_) => None,
        }
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self.kind, TaskKind::Workflow(_))
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: TaskId) {
        self.parent = Some(parent);
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status
    }

    pub fn attempt(&self) -> u32 {
        self.state.attempt
    }

    pub fn options(&self) -> TaskOptions {
        match &self.kind {
            TaskKind::Operation(op) => op.options,
            TaskKind::Workflow(_) => TaskOptions::default(),
        }
    }

    /// Succeeded, or failed with the failure ignored
    pub fn is_terminal_success(&self) -> bool {
        match self.state.status {
            TaskStatus::Succeeded => true,
            TaskStatus::Failed => self.options().ignore_failure,
            _ => false,
        }
    }

    /// Failed and not ignorable
    pub fn is_fatal_failure(&self) -> bool {
        self.state.status == TaskStatus::Failed && !self.options().ignore_failure
    }

    /// Whether the task may be dispatched at `now`, ignoring its dependencies
    pub fn is_due(&self, now: Instant) -> bool {
        match self.state.status {
            TaskStatus::Pending => true,
            TaskStatus::Retrying => self.state.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    fn transition_error(&self, to: TaskStatus) -> GraphError {
        GraphError::InvalidTransition {
            task: self.id,
            from: self.state.status,
            to,
        }
    }

    pub(crate) fn start(&mut self) -> Result<(), GraphError> {
        match self.state.status {
            TaskStatus::Pending | TaskStatus::Retrying => {
                self.state.status = TaskStatus::Started;
                self.state.retry_at = None;
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Started)),
        }
    }

    pub(crate) fn succeed(&mut self) -> Result<(), GraphError> {
        match self.state.status {
            TaskStatus::Started => {
                self.state.status = TaskStatus::Succeeded;
                Ok(())
            }
            _ => Err(self.transition_error(TaskStatus::Succeeded)),
        }
    }

    /// Record a failed attempt and apply the retry policy
    pub(crate) fn fail(
        &mut self,
        reason: String,
        now: Instant,
    ) -> Result<FailureDisposition, GraphError> {
        if self.state.status != TaskStatus::Started {
            return Err(self.transition_error(TaskStatus::Failed));
        }
        self.state.last_error = Some(reason);

        let options = self.options();
        if self.state.attempt < options.max_attempts {
            let at = now + options.retry_interval;
            self.state.status = TaskStatus::Retrying;
            self.state.attempt += 1;
            self.state.retry_at = Some(at);
            return Ok(FailureDisposition::Retry { at });
        }

        self.state.status = TaskStatus::Failed;
        if options.ignore_failure {
            Ok(FailureDisposition::Ignored)
        } else {
            Ok(FailureDisposition::Failed)
        }
    }

    /// Undo a start whose attempt never reached the executor
    pub(crate) fn release(&mut self) -> Result<(), GraphError> {
        if self.state.status != TaskStatus::Started {
            return Err(self.transition_error(TaskStatus::Pending));
        }
        // Attempts past the first come from a recorded failure
        self.state.status = if self.state.attempt > 1 {
            TaskStatus::Retrying
        } else {
            TaskStatus::Pending
        };
        Ok(())
    }

    /// Fail without consulting the retry policy
    pub(crate) fn abort(&mut self, reason: String) -> Result<(), GraphError> {
        if self.state.status.is_terminal() {
            return Err(self.transition_error(TaskStatus::Failed));
        }
        self.state.status = TaskStatus::Failed;
        self.state.retry_at = None;
        self.state.last_error = Some(reason);
        Ok(())
    }
}

/// Last segment of a dotted operation name
fn short_operation_name(operation: &str) -> &str {
    operation.rsplit('.').next().unwrap_or(operation)
}
