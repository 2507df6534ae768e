//! Pluggable executors.
//!
//! Every executor reports completion through a [`TaskHandle`], so the engine's
//! wait step does not depend on where an operation runs.

pub mod inline;
pub mod process;
pub mod protocol;
pub mod thread_pool;
pub mod worker;

pub use inline::InlineExecutor;
pub use process::{ProcessConfig, ProcessExecutor};
pub use thread_pool::ThreadPoolExecutor;

use crate::error::{ExecutionFailure, ExecutorError};
use crate::operation::{OperationContext, OperationRegistry};
use crate::types::TaskId;
use async_trait::async_trait;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Result of one attempt of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub result: Result<(), ExecutionFailure>,
}

/// Resolves once the executor finished the submitted attempt
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<Result<(), ExecutionFailure>>,
}

impl TaskHandle {
    /// A handle and the sender that resolves it
    pub fn channel(task_id: TaskId) -> (oneshot::Sender<Result<(), ExecutionFailure>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { task_id, rx })
    }

    /// A handle that is already resolved
    pub fn ready(task_id: TaskId, result: Result<(), ExecutionFailure>) -> Self {
        let (tx, handle) = Self::channel(task_id);
        let _ = tx.send(result);
        handle
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for TaskHandle {
    type Output = TaskCompletion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task_id = self.task_id;
        Pin::new(&mut self.rx).poll(cx).map(|received| TaskCompletion {
            task_id,
            result: received.unwrap_or_else(|_| {
                Err(ExecutionFailure::Transport(
                    "executor dropped the task without a result".to_string(),
                ))
            }),
        })
    }
}

/// Runs operation tasks.
///
/// `submit` only fails synchronously when the executor cannot accept work;
/// operation failures are always delivered through the returned handle.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Start one attempt of an operation
    async fn submit(&self, ctx: OperationContext) -> Result<TaskHandle, ExecutorError>;

    /// Stop accepting work and wait for outstanding attempts to finish
    async fn close(&self);
}

/// Invoke an operation, turning a panic into a failed attempt
pub(crate) fn run_guarded(
    registry: &OperationRegistry,
    ctx: &OperationContext,
) -> Result<(), ExecutionFailure> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| registry.invoke(ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ExecutionFailure::Panicked(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::testing::context;
    use crate::types::Inputs;

    #[tokio::test]
    async fn dropped_sender_is_a_transport_failure() {
        let id = TaskId::new();
        let (tx, handle) = TaskHandle::channel(id);
        drop(tx);

        let completion = handle.await;
        assert_eq!(completion.task_id, id);
        assert!(matches!(completion.result, Err(ExecutionFailure::Transport(_))));
    }

    #[test]
    fn panics_become_failures() {
        let mut registry = OperationRegistry::new();
        registry.register_fn("test.panic", |_, _| panic!("kaboom"));
        let (ctx, _) = context("test.panic", Inputs::new());

        assert_eq!(
            run_guarded(&registry, &ctx),
            Err(ExecutionFailure::Panicked("kaboom".to_string()))
        );
    }
}
