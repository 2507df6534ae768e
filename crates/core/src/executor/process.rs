use super::protocol::{JsonRpcRequest, JsonRpcResponse, RunResult, MAX_FRAME_LENGTH, METHOD_RUN};
use super::{Executor, TaskHandle};
use crate::error::{ExecutionFailure, ExecutorError};
use crate::operation::OperationContext;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Semaphore;
use tokio_util::codec::{FramedRead, LinesCodec};

/// How long a worker may take to exit after its stdout closed
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Worker process settings
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Per-attempt deadline; the worker is killed when it passes
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl ProcessConfig {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            max_concurrent: 4,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }
}

/// Runs each attempt in a fresh worker process.
///
/// The task descriptor goes to the worker's stdin as one JSON-RPC request;
/// the worker answers with one response line on stdout. A worker that exits
/// without answering, or outlives the timeout, fails the attempt.
pub struct ProcessExecutor {
    config: ProcessConfig,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    next_request: AtomicU64,
}

impl ProcessExecutor {
    pub fn new(config: ProcessConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            permits,
            closed: AtomicBool::new(false),
            next_request: AtomicU64::new(1),
        }
    }

    fn spawn_worker(&self) -> Result<Child, ExecutorError> {
        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    async fn submit(&self, ctx: OperationContext) -> Result<TaskHandle, ExecutorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Closed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Closed)?;

        let child = self.spawn_worker()?;
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let timeout = self.config.timeout;

        tracing::debug!(
            pid = child.id(),
            task = %ctx.descriptor.task_name,
            "spawned worker"
        );

        let (done, handle) = TaskHandle::channel(ctx.task_id());
        tokio::spawn(async move {
            let result = run_worker(child, request_id, &ctx, timeout).await;
            drop(permit);
            let _ = done.send(result);
        });
        Ok(handle)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        // Every permit back means every worker finished
        let all = u32::try_from(self.config.max_concurrent.max(1)).unwrap_or(u32::MAX);
        match self.permits.acquire_many(all).await {
            Ok(permits) => permits.forget(),
            Err(_) => return,
        }
        self.permits.close();
    }
}

fn transport(message: impl std::fmt::Display) -> ExecutionFailure {
    ExecutionFailure::Transport(message.to_string())
}

async fn run_worker(
    mut child: Child,
    request_id: u64,
    ctx: &OperationContext,
    timeout: Duration,
) -> Result<(), ExecutionFailure> {
    let request =
        JsonRpcRequest::new(request_id, METHOD_RUN, &ctx.descriptor).map_err(transport)?;
    let mut line = serde_json::to_string(&request).map_err(transport)?;
    line.push('\n');

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| transport("worker stdout missing"))?;

    let stdin = child.stdin.take();
    let mut frames = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));

    // The deadline covers the request write too: a worker that never reads
    // stdin blocks a request larger than the pipe buffer
    let exchange = async {
        // A worker that dies before reading its request is reported through
        // the missing response below
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                tracing::warn!("Failed to write request to worker: {}", e);
            }
        }
        read_response(&mut frames).await
    };

    let response = match tokio::time::timeout(timeout, exchange).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(
                "Worker for {} timed out after {:?}, killing it",
                ctx.descriptor.task_name,
                timeout
            );
            if let Err(e) = child.kill().await {
                tracing::error!("Failed to kill worker: {}", e);
            }
            return Err(ExecutionFailure::Timeout(timeout));
        }
    };
    drop(frames);

    let status = wait_for_exit(&mut child).await;

    let response = match response? {
        Some(response) => response,
        None => return Err(ExecutionFailure::WorkerCrashed { status }),
    };

    if response.id != serde_json::Value::from(request_id) {
        return Err(transport(format!(
            "response id {} does not match request {}",
            response.id, request_id
        )));
    }

    if let Some(error) = response.error {
        return Err(error.into_failure());
    }

    let result: RunResult = match response.result {
        Some(value) => serde_json::from_value(value).map_err(transport)?,
        None => return Err(transport("response has neither result nor error")),
    };
    for message in result.messages {
        ctx.log(message);
    }
    Ok(())
}

/// First response frame, or `None` when the worker closed stdout first
async fn read_response(
    frames: &mut FramedRead<ChildStdout, LinesCodec>,
) -> Result<Option<JsonRpcResponse>, ExecutionFailure> {
    while let Some(frame) = frames.next().await {
        let line = frame.map_err(transport)?;
        if line.trim().is_empty() {
            continue;
        }
        let response = serde_json::from_str(&line)
            .map_err(|e| transport(format!("invalid response frame: {}", e)))?;
        return Ok(Some(response));
    }
    Ok(None)
}

async fn wait_for_exit(child: &mut Child) -> String {
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => format!("unknown exit status: {}", e),
        Err(_) => {
            let _ = child.kill().await;
            "killed after closing stdout".to_string()
        }
    }
}
