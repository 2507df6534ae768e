//! Worker side of the process executor.
//!
//! A worker reads JSON-RPC requests from its input one line at a time, runs
//! each operation against its own registry and writes one response line per
//! request. It has no model store: operations see only their descriptor.

use super::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RunResult, MAX_FRAME_LENGTH, METHOD_RUN};
use super::run_guarded;
use crate::error::OperationError;
use crate::events::{EventType, MemoryEventSink};
use crate::operation::{input_u64, OperationContext, OperationRegistry, TaskDescriptor};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Registry used by the `worker` subcommand: the builtins plus
/// `worker.exit`, which terminates the worker without answering
pub fn worker_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::with_builtins();
    registry.register_fn("worker.exit", |_, inputs| {
        let code = input_u64(inputs, "code", 1)?;
        let code = i32::try_from(code).map_err(|_| OperationError::new("exit code out of range"))?;
        std::process::exit(code)
    });
    registry
}

/// Serve requests until the input closes
pub async fn serve<R, W>(registry: Arc<OperationRegistry>, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let mut responses = FramedWrite::new(writer, LinesCodec::new());

    while let Some(frame) = requests.next().await {
        let line = frame?;
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&registry, &line).await;
        let encoded = serde_json::to_string(&response)?;
        responses.send(encoded).await?;
    }

    tracing::debug!("Worker input closed");
    Ok(())
}

async fn handle_line(registry: &Arc<OperationRegistry>, line: &str) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Unparseable request: {}", e);
            return JsonRpcResponse::error(serde_json::Value::Null, JsonRpcError::parse_error());
        }
    };
    let id = request.id.clone().unwrap_or(serde_json::Value::Null);

    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::error(id, JsonRpcError::invalid_request());
    }
    if request.method != METHOD_RUN {
        return JsonRpcResponse::error(id, JsonRpcError::method_not_found(&request.method));
    }

    let descriptor: TaskDescriptor = match request
        .params
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => return JsonRpcResponse::error(id, JsonRpcError::invalid_params("missing params")),
        Err(e) => return JsonRpcResponse::error(id, JsonRpcError::invalid_params(e.to_string())),
    };

    tracing::info!(
        "Running {} ({}) attempt {}/{}",
        descriptor.task_name,
        descriptor.implementation,
        descriptor.attempt,
        descriptor.max_attempts
    );

    let registry = registry.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let sink = Arc::new(MemoryEventSink::new());
        let ctx = OperationContext::new(descriptor, sink.clone());
        let result = run_guarded(&registry, &ctx);
        (result, sink.events())
    })
    .await;

    match outcome {
        Ok((Ok(()), events)) => {
            let messages = events
                .into_iter()
                .filter_map(|event| match event.event_type {
                    EventType::OperationMessage { message, .. } => Some(message),
                    _ => None,
                })
                .collect();
            match serde_json::to_value(RunResult { messages }) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::error(id, JsonRpcError::custom(-32603, e.to_string())),
            }
        }
        Ok((Err(failure), _)) => JsonRpcResponse::error(id, JsonRpcError::from_failure(&failure)),
        Err(e) => JsonRpcResponse::error(id, JsonRpcError::custom(-32603, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionFailure;
    use crate::operation::testing::descriptor;
    use crate::types::Inputs;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn roundtrip(lines: &[String]) -> Vec<JsonRpcResponse> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let worker = tokio::spawn(serve(
            Arc::new(OperationRegistry::with_builtins()),
            server_read,
            server_write,
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        for line in lines {
            client_write.write_all(line.as_bytes()).await.unwrap();
            client_write.write_all(b"\n").await.unwrap();
        }
        client_write.shutdown().await.unwrap();

        let mut responses = Vec::new();
        let mut reader = BufReader::new(client_read).lines();
        while let Some(line) = reader.next_line().await.unwrap() {
            responses.push(serde_json::from_str(&line).unwrap());
        }
        worker.await.unwrap().unwrap();
        responses
    }

    fn run_request(id: u64, implementation: &str, inputs: Inputs) -> String {
        let request = JsonRpcRequest::new(id, METHOD_RUN, descriptor(implementation, inputs)).unwrap();
        serde_json::to_string(&request).unwrap()
    }

    #[tokio::test]
    async fn answers_each_request_in_order() {
        let mut inputs = Inputs::new();
        inputs.insert("message".to_string(), json!("disk full"));

        let responses = roundtrip(&[
            run_request(1, "builtin.log", Inputs::new()),
            run_request(2, "builtin.fail", inputs),
            run_request(3, "no.such_operation", Inputs::new()),
        ])
        .await;
        assert_eq!(responses.len(), 3);

        assert_eq!(responses[0].id, json!(1));
        let result: RunResult =
            serde_json::from_value(responses[0].result.clone().unwrap()).unwrap();
        assert_eq!(result.messages, vec!["> node instance: vm_1".to_string()]);

        assert_eq!(responses[1].id, json!(2));
        assert_eq!(
            responses[1].error.clone().unwrap().into_failure(),
            ExecutionFailure::Operation(OperationError::new("disk full"))
        );

        assert!(matches!(
            responses[2].error.clone().unwrap().into_failure(),
            ExecutionFailure::UnknownOperation(_)
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let unknown_method = serde_json::to_string(
            &JsonRpcRequest::new(7, "tools/list", json!({})).unwrap(),
        )
        .unwrap();

        let responses = roundtrip(&["not json".to_string(), unknown_method]).await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, -32700);
        assert_eq!(responses[1].id, json!(7));
        assert_eq!(responses[1].error.as_ref().unwrap().code, -32601);
    }

    #[test]
    fn worker_registry_adds_exit() {
        let registry = worker_registry();
        assert!(registry.contains("worker.exit"));
        assert!(registry.contains("builtin.noop"));
    }
}
