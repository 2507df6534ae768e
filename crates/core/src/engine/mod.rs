//! The engine: drives one task graph to a terminal run status.
//!
//! Bookkeeping runs on a single logical thread. Operation tasks are handed to
//! an [`Executor`] and their completions are awaited together, so independent
//! tasks overlap while status transitions stay serialized.

use crate::context::WorkflowContext;
use crate::error::{EngineError, ExecutionFailure, GraphError, WorkflowError};
use crate::events::{Event, EventType};
use crate::executor::{Executor, TaskCompletion, TaskHandle};
use crate::graph::{GraphSnapshot, TaskGraph};
use crate::operation::{OperationContext, ResolvedTarget, TaskDescriptor};
use crate::parameters::merge_and_validate;
use crate::task::{FailureDisposition, Task, TaskKind};
use crate::types::{ExecutionId, RunStatus, TaskId, TaskStatus};
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;


/// Requests cooperative cancellation of a run.
///
/// Tasks already handed to the executor finish; nothing new is submitted.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A task that failed the run, with its last recorded reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub name: String,
    pub reason: String,
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: GraphSnapshot,
    pub failures: Vec<TaskFailure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// What woke the scheduling loop
enum Wake {
    Completed(TaskCompletion),
    RetryDue,
    Cancelled,
}

/// Runs a task graph over an executor
pub struct Engine {
    ctx: WorkflowContext,
    graph: TaskGraph,
    executor: Arc<dyn Executor>,
    cancel: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(ctx: WorkflowContext, graph: TaskGraph, executor: Arc<dyn Executor>) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        Self {
            ctx,
            graph,
            executor,
            cancel: Arc::new(cancel),
            cancel_rx,
        }
    }

    /// Validate the context's parameters against the workflow's declarations
    /// and build the top-level graph.
    ///
    /// Parameter and graph errors surface here, before anything runs.
    pub fn for_workflow(
        ctx: WorkflowContext,
        workflow: Arc<dyn Workflow>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, EngineError> {
        let parameters =
            merge_and_validate(workflow.name(), &workflow.parameters(), ctx.parameters())
                .map_err(WorkflowError::from)?;
        let ctx = ctx.with_parameters(parameters.clone());

        let mut graph = TaskGraph::new();
        workflow.build(&ctx, &mut graph, &parameters)?;

        tracing::debug!(
            "Built graph for workflow {} with {} tasks",
            workflow.name(),
            graph.len()
        );
        Ok(Self::new(ctx, graph, executor))
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel.clone(),
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    /// Run the graph to a terminal status.
    ///
    /// Task failures are reported in the returned [`RunReport`]; `Err` is
    /// reserved for engine faults that abort the run.
    pub async fn execute(mut self) -> Result<RunReport, EngineError> {
        let started_at = Utc::now();
        tracing::info!(
            "Starting run: execution_id={}, workflow={}, tasks={}",
            self.ctx.execution_id(),
            self.ctx.workflow_name(),
            self.graph.len()
        );
        self.emit(EventType::RunStarted {
            workflow: self.ctx.workflow_name().to_string(),
            deployment_id: self.ctx.deployment_id().to_string(),
            tasks: self.graph.len(),
        });

        let outcome = self.run().await;
        self.executor.close().await;

        let snapshot = self.graph.snapshot();
        let failures: Vec<TaskFailure> = snapshot
            .failed()
            .map(|t| TaskFailure {
                task_id: t.id,
                name: t.name.clone(),
                reason: t.last_error.clone().unwrap_or_default(),
            })
            .collect();
        let failed_tasks = failures.iter().map(|f| f.task_id).collect();

        let status = outcome.and_then(|cancelled| {
            final_status(&snapshot, cancelled).ok_or_else(|| EngineError::Stalled {
                pending: self.graph.unfinished(),
            })
        });
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(
                    "Run aborted: execution_id={}, error={}",
                    self.ctx.execution_id(),
                    e
                );
                self.emit(EventType::RunFinished {
                    status: RunStatus::Failed,
                    failed_tasks,
                });
                return Err(e);
            }
        };

        match status {
            RunStatus::Succeeded => tracing::info!(
                "Run succeeded: execution_id={}",
                self.ctx.execution_id()
            ),
            _ => tracing::warn!(
                "Run {}: execution_id={}, failed tasks={}",
                status,
                self.ctx.execution_id(),
                failures.len()
            ),
        }
        self.emit(EventType::RunFinished {
            status,
            failed_tasks,
        });

        Ok(RunReport {
            execution_id: self.ctx.execution_id().clone(),
            workflow_name: self.ctx.workflow_name().to_string(),
            status,
            started_at,
            finished_at: Utc::now(),
            tasks: snapshot,
            failures,
        })
    }

    /// The scheduling loop; returns whether cancellation was requested
    async fn run(&mut self) -> Result<bool, EngineError> {
        let mut in_flight: FuturesUnordered<TaskHandle> = FuturesUnordered::new();
        let mut cancel_rx = self.cancel_rx.clone();
        let mut cancelled = false;

        loop {
            if !cancelled && *cancel_rx.borrow_and_update() {
                cancelled = true;
                self.cancel_requested(in_flight.len());
            }
            if !cancelled && !self.graph.has_failed() {
                self.dispatch_ready(&mut in_flight).await?;
            }

            // After a fatal failure or a cancel request only in-flight work
            // is awaited
            let stopping = cancelled || self.graph.has_failed();
            let retry_at = if stopping {
                None
            } else {
                self.graph.next_retry_at()
            };

            if in_flight.is_empty() && retry_at.is_none() {
                if stopping || self.graph.is_complete() {
                    return Ok(cancelled);
                }
                if self.graph.ready_tasks().next().is_some() {
                    continue;
                }
                return Err(EngineError::Stalled {
                    pending: self.graph.unfinished(),
                });
            }

            let wake = tokio::select! {
                Some(completion) = in_flight.next() => Wake::Completed(completion),
                _ = sleep_until(retry_at) => Wake::RetryDue,
                Ok(()) = cancel_rx.changed(), if !cancelled => Wake::Cancelled,
            };

            match wake {
                Wake::Completed(completion) => self.complete(completion)?,
                Wake::RetryDue => {}
                Wake::Cancelled => {
                    if *cancel_rx.borrow_and_update() {
                        cancelled = true;
                        self.cancel_requested(in_flight.len());
                    }
                }
            }
        }
    }

    fn cancel_requested(&self, in_flight: usize) {
        tracing::warn!(
            "Cancellation requested: execution_id={}, in flight={}",
            self.ctx.execution_id(),
            in_flight
        );
        self.emit(EventType::RunCancelRequested);
    }

    /// Submit every ready task, expanding workflow tasks on the way.
    ///
    /// Repeats until nothing is ready, since an expansion can make its
    /// children ready immediately.
    async fn dispatch_ready(
        &mut self,
        in_flight: &mut FuturesUnordered<TaskHandle>,
    ) -> Result<(), EngineError> {
        loop {
            if *self.cancel_rx.borrow() {
                return Ok(());
            }

            let ready: Vec<TaskId> = self
                .graph
                .ready_tasks_at(Instant::now())
                .map(Task::id)
                .collect();
            if ready.is_empty() {
                return Ok(());
            }

            for id in ready {
                if self.graph.has_failed() {
                    return Ok(());
                }
                if self.graph.task(id)?.is_workflow() {
                    self.expand(id)?;
                } else {
                    match self.submit(id).await? {
                        Some(handle) => in_flight.push(handle),
                        // Cancelled while the executor had no capacity
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Build a workflow task's nested graph and splice it under the task
    fn expand(&mut self, id: TaskId) -> Result<(), EngineError> {
        self.graph.mark_started(id)?;
        let task = self.graph.task(id)?;
        let name = task.name().to_string();
        let TaskKind::Workflow(nested) = task.kind() else {
            return Err(GraphError::invalid(format!("task '{}' is not a workflow task", name)).into());
        };
        let workflow = nested.workflow.clone();
        let parameters = nested.parameters.clone();

        self.emit(EventType::TaskStarted {
            task_id: id,
            name: name.clone(),
            attempt: 1,
        });

        let mut graph = TaskGraph::new();
        let built = merge_and_validate(workflow.name(), &workflow.parameters(), &parameters)
            .map_err(WorkflowError::from)
            .and_then(|parameters| workflow.build(&self.ctx, &mut graph, &parameters));

        let settled = match built {
            Ok(()) => {
                let tasks = graph.len();
                let settled = self.graph.splice(id, graph)?;
                tracing::debug!("Expanded {} into {} tasks", name, tasks);
                self.emit(EventType::WorkflowExpanded {
                    task_id: id,
                    name,
                    tasks,
                });
                settled
            }
            Err(e) => {
                let reason = ExecutionFailure::Expansion(e.to_string()).to_string();
                tracing::error!("Failed to expand {}: {}", name, e);
                let settled = self.graph.abort(id, reason.clone())?;
                self.emit(EventType::TaskFailed {
                    task_id: id,
                    name,
                    attempt: 1,
                    error: reason,
                    will_retry: false,
                });
                settled
            }
        };
        self.report_settled(&settled);
        Ok(())
    }

    /// Start one attempt of an operation task.
    ///
    /// Failures to resolve the target or to reach the executor become an
    /// already-resolved failed attempt, so they go through the retry policy.
    /// Returns `None` when cancellation arrived while the executor was
    /// applying backpressure; the task is released back to the ready set.
    async fn submit(&mut self, id: TaskId) -> Result<Option<TaskHandle>, EngineError> {
        self.graph.mark_started(id)?;
        let task = self.graph.task(id)?;
        let name = task.name().to_string();
        let attempt = task.attempt();
        let operation = task
            .as_operation()
            .ok_or_else(|| GraphError::invalid(format!("task '{}' is not an operation task", name)))?
            .clone();

        self.emit(EventType::TaskStarted {
            task_id: id,
            name: name.clone(),
            attempt,
        });

        let target = match ResolvedTarget::load(&**self.ctx.model(), &operation.target) {
            Ok(target) => target,
            Err(e) => {
                return Ok(Some(TaskHandle::ready(
                    id,
                    Err(ExecutionFailure::Target(e.to_string())),
                )))
            }
        };

        let (implementation, inputs) = TaskDescriptor::bind(&operation, &target);
        tracing::debug!(
            "Submitting {} ({}) attempt {}/{} to {} executor",
            name,
            implementation,
            attempt,
            operation.options.max_attempts,
            self.executor.name()
        );

        let descriptor = TaskDescriptor {
            task_id: id,
            task_name: name,
            execution_id: self.ctx.execution_id().clone(),
            deployment_id: self.ctx.deployment_id().to_string(),
            workflow_name: self.ctx.workflow_name().to_string(),
            operation: operation.operation.clone(),
            implementation,
            inputs,
            attempt,
            max_attempts: operation.options.max_attempts,
            target,
        };
        let op_ctx = OperationContext::new(descriptor, self.ctx.sink().clone())
            .with_model(self.ctx.model().clone());

        let executor = self.executor.clone();
        let mut cancel_rx = self.cancel_rx.clone();
        let submitted = tokio::select! {
            biased;
            Ok(_) = cancel_rx.wait_for(|cancelled| *cancelled) => None,
            submitted = executor.submit(op_ctx) => Some(submitted),
        };

        match submitted {
            Some(Ok(handle)) => Ok(Some(handle)),
            Some(Err(e)) => {
                tracing::warn!("Executor rejected task {}: {}", id, e);
                Ok(Some(TaskHandle::ready(
                    id,
                    Err(ExecutionFailure::Transport(e.to_string())),
                )))
            }
            None => {
                tracing::info!("Cancelled before {} reached the executor", id);
                self.graph.release(id)?;
                Ok(None)
            }
        }
    }

    /// Apply one attempt's outcome to the graph
    fn complete(&mut self, completion: TaskCompletion) -> Result<(), EngineError> {
        let id = completion.task_id;
        let task = self.graph.task(id)?;
        let name = task.name().to_string();
        let attempt = task.attempt();

        let settled = match completion.result {
            Ok(()) => {
                let settled = self.graph.mark_succeeded(id)?;
                self.emit(EventType::TaskSucceeded {
                    task_id: id,
                    name,
                    attempt,
                });
                settled
            }
            Err(failure) => {
                let error = failure.to_string();
                let (disposition, settled) =
                    self.graph.record_failure(id, error.clone(), Instant::now())?;
                let will_retry = matches!(disposition, FailureDisposition::Retry { .. });

                match disposition {
                    FailureDisposition::Retry { .. } => tracing::warn!(
                        "Task {} failed on attempt {}, retrying: {}",
                        name,
                        attempt,
                        error
                    ),
                    FailureDisposition::Ignored => tracing::warn!(
                        "Task {} failed after {} attempts, failure ignored: {}",
                        name,
                        attempt,
                        error
                    ),
                    FailureDisposition::Failed => tracing::error!(
                        "Task {} failed after {} attempts: {}",
                        name,
                        attempt,
                        error
                    ),
                }

                self.emit(EventType::TaskFailed {
                    task_id: id,
                    name: name.clone(),
                    attempt,
                    error: error.clone(),
                    will_retry,
                });
                if disposition == FailureDisposition::Ignored {
                    self.emit(EventType::TaskFailureIgnored {
                        task_id: id,
                        name,
                        error,
                    });
                }
                settled
            }
        };

        self.report_settled(&settled);
        Ok(())
    }

    /// Publish the terminal status of workflow tasks settled by a child
    fn report_settled(&self, settled: &[TaskId]) {
        for id in settled {
            let Some(task) = self.graph.get(*id) else {
                continue;
            };
            let event = match task.status() {
                TaskStatus::Succeeded => EventType::TaskSucceeded {
                    task_id: *id,
                    name: task.name().to_string(),
                    attempt: task.attempt(),
                },
                TaskStatus::Failed => EventType::TaskFailed {
                    task_id: *id,
                    name: task.name().to_string(),
                    attempt: task.attempt(),
                    error: task.state().last_error.clone().unwrap_or_default(),
                    will_retry: false,
                },
                _ => continue,
            };
            self.emit(event);
        }
    }

    fn emit(&self, event_type: EventType) {
        self.ctx
            .sink()
            .emit(Event::new(self.ctx.execution_id().clone(), event_type));
    }
}

/// Terminal status from the final graph; `None` when the run stopped short
/// of completion without being cancelled
fn final_status(snapshot: &GraphSnapshot, cancelled: bool) -> Option<RunStatus> {
    if snapshot.has_failed() {
        Some(RunStatus::Failed)
    } else if snapshot.is_complete() {
        Some(RunStatus::Succeeded)
    } else if cancelled {
        Some(RunStatus::Cancelled)
    } else {
        None
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
