use super::{run_guarded, Executor, TaskHandle};
use crate::error::{ExecutionFailure, ExecutorError};
use crate::operation::{OperationContext, OperationRegistry};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

struct Job {
    ctx: OperationContext,
    done: oneshot::Sender<Result<(), ExecutionFailure>>,
}

/// Fixed pool of worker threads fed from a bounded queue.
///
/// `submit` waits while the queue is full. Jobs already queued when the pool
/// is closed still run.
pub struct ThreadPoolExecutor {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(
        registry: Arc<OperationRegistry>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<Self, ExecutorError> {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let registry = registry.clone();
            let handle = std::thread::Builder::new()
                .name(format!("topograph-worker-{}", index))
                .spawn(move || worker_loop(index, &registry, &rx))?;
            handles.push(handle);
        }

        tracing::info!(
            "Started thread pool with {} workers (queue capacity {})",
            handles.len(),
            queue_capacity.max(1)
        );

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }
}

fn worker_loop(
    index: usize,
    registry: &OperationRegistry,
    rx: &Mutex<mpsc::Receiver<Job>>,
) {
    loop {
        // Only one idle worker waits on the queue at a time
        let job = {
            let mut rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.blocking_recv()
        };

        let Some(job) = job else {
            tracing::debug!("Worker {} exiting", index);
            return;
        };

        tracing::debug!(
            "Worker {} running {} ({})",
            index,
            job.ctx.descriptor.task_name,
            job.ctx.descriptor.implementation
        );
        let result = run_guarded(registry, &job.ctx);
        let _ = job.done.send(result);
    }
}

#[async_trait]
impl Executor for ThreadPoolExecutor {
    fn name(&self) -> &str {
        "thread_pool"
    }

    async fn submit(&self, ctx: OperationContext) -> Result<TaskHandle, ExecutorError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExecutorError::Closed)?;

        let (done, handle) = TaskHandle::channel(ctx.task_id());
        sender
            .send(Job { ctx, done })
            .await
            .map_err(|_| ExecutorError::Closed)?;
        Ok(handle)
    }

    async fn close(&self) {
        // Dropping the last sender lets workers drain the queue and exit
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if handles.is_empty() {
            return;
        }

        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("Thread pool worker panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            tracing::error!("Failed to join thread pool workers: {}", e);
        }
    }
}
