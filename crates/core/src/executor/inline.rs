use super::{run_guarded, Executor, TaskHandle};
use crate::error::ExecutorError;
use crate::operation::{OperationContext, OperationRegistry};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Runs each operation to completion inside `submit`, on the calling thread
pub struct InlineExecutor {
    registry: Arc<OperationRegistry>,
    closed: AtomicBool,
}

impl InlineExecutor {
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self {
            registry,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        "inline"
    }

    async fn submit(&self, ctx: OperationContext) -> Result<TaskHandle, ExecutorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Closed);
        }

        tracing::debug!(
            "Running {} ({}) inline",
            ctx.descriptor.task_name,
            ctx.descriptor.implementation
        );
        let result = run_guarded(&self.registry, &ctx);
        Ok(TaskHandle::ready(ctx.task_id(), result))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecutionFailure, OperationError};
    use crate::operation::testing::context;
    use crate::types::Inputs;

    #[tokio::test]
    async fn runs_during_submit() {
        let executor = InlineExecutor::new(Arc::new(OperationRegistry::with_builtins()));

        let (ctx, sink) = context("builtin.log", Inputs::new());
        let handle = executor.submit(ctx).await.unwrap();
        // The message is already out before the handle is awaited
        assert_eq!(sink.events().len(), 1);
        assert_eq!(handle.await.result, Ok(()));

        let (ctx, _) = context("builtin.fail", Inputs::new());
        let completion = executor.submit(ctx).await.unwrap().await;
        assert_eq!(
            completion.result,
            Err(ExecutionFailure::Operation(OperationError::new("operation failed")))
        );
    }

    #[tokio::test]
    async fn rejects_work_after_close() {
        let executor = InlineExecutor::new(Arc::new(OperationRegistry::with_builtins()));
        executor.close().await;

        let (ctx, _) = context("builtin.noop", Inputs::new());
        assert!(matches!(
            executor.submit(ctx).await,
            Err(ExecutorError::Closed)
        ));
    }
}
