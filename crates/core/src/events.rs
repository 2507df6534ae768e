use crate::types::{ExecutionId, RunStatus, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// An event emitted while a workflow executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(execution_id: ExecutionId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow: String,
        deployment_id: String,
        tasks: usize,
    },
    RunFinished {
        status: RunStatus,
        failed_tasks: Vec<TaskId>,
    },
    RunCancelRequested,

    // Task lifecycle events
    WorkflowExpanded {
        task_id: TaskId,
        name: String,
        tasks: usize,
    },
    TaskStarted {
        task_id: TaskId,
        name: String,
        attempt: u32,
    },
    TaskSucceeded {
        task_id: TaskId,
        name: String,
        attempt: u32,
    },
    TaskFailed {
        task_id: TaskId,
        name: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    TaskFailureIgnored {
        task_id: TaskId,
        name: String,
        error: String,
    },

    // Reported by operation implementations
    OperationMessage {
        task_id: TaskId,
        message: String,
    },
}

/// Destination for run events.
///
/// Sinks are shared by the engine and by concurrently running operations, so
/// every implementation synchronises internally.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Renders events as log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        let execution = &event.execution_id;
        match &event.event_type {
            EventType::RunStarted {
                workflow,
                deployment_id,
                tasks,
            } => tracing::info!(
                "[{}] starting workflow '{}' on deployment '{}' ({} tasks)",
                execution,
                workflow,
                deployment_id,
                tasks
            ),
            EventType::RunFinished {
                status,
                failed_tasks,
            } => {
                if failed_tasks.is_empty() {
                    tracing::info!("[{}] run {}", execution, status)
                } else {
                    tracing::error!(
                        "[{}] run {} ({} failed tasks)",
                        execution,
                        status,
                        failed_tasks.len()
                    )
                }
            }
            EventType::RunCancelRequested => {
                tracing::warn!("[{}] cancellation requested", execution)
            }
            EventType::WorkflowExpanded { name, tasks, .. } => {
                tracing::debug!("[{}] expanded {} into {} tasks", execution, name, tasks)
            }
            EventType::TaskStarted { name, attempt, .. } => {
                tracing::info!("[{}] {} started (attempt {})", execution, name, attempt)
            }
            EventType::TaskSucceeded { name, .. } => {
                tracing::info!("[{}] {} succeeded", execution, name)
            }
            EventType::TaskFailed {
                name,
                attempt,
                error,
                will_retry,
                ..
            } => {
                if *will_retry {
                    tracing::warn!(
                        "[{}] {} failed on attempt {}, will retry: {}",
                        execution,
                        name,
                        attempt,
                        error
                    )
                } else {
                    tracing::error!("[{}] {} failed: {}", execution, name, error)
                }
            }
            EventType::TaskFailureIgnored { name, error, .. } => {
                tracing::warn!("[{}] {} failed (ignored): {}", execution, name, error)
            }
            EventType::OperationMessage { message, .. } => {
                tracing::info!("[{}] {}", execution, message)
            }
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events emitted so far
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Forwards each event to several sinks
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
