//! End-to-end tests against the real `topograph` binary.

use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use topograph_core::events::{EventType, MemoryEventSink};
use topograph_core::executor::{Executor, ProcessConfig, ProcessExecutor};
use topograph_core::model::{Blueprint, Deployment, Node, NodeInstance};
use topograph_core::storage::{MemoryModelStore, ModelStoreExt};
use topograph_core::{
    Engine, Inputs, OperationTarget, RunStatus, Task, TaskGraph, TaskOptions, WorkflowContext,
};

const BINARY: &str = env!("CARGO_BIN_EXE_topograph");

fn model() -> Arc<MemoryModelStore> {
    let store = Arc::new(MemoryModelStore::new());
    store
        .put(&Blueprint {
            id: "bp".to_string(),
            name: "bp".to_string(),
            description: String::new(),
            main_file_name: "bp.json".to_string(),
            created_at: Utc::now(),
        })
        .unwrap();
    store
        .put(&Deployment {
            id: "dep".to_string(),
            name: "dep".to_string(),
            blueprint_id: "bp".to_string(),
            description: String::new(),
            workflows: Default::default(),
            inputs: Inputs::new(),
            created_at: Utc::now(),
        })
        .unwrap();
    store
        .put(&Node {
            id: "vm".to_string(),
            name: "vm".to_string(),
            deployment_id: "dep".to_string(),
            type_name: "test.VM".to_string(),
            operations: Default::default(),
            properties: Inputs::new(),
            number_of_instances: 1,
        })
        .unwrap();
    store
        .put(&NodeInstance {
            id: "vm_1".to_string(),
            name: "vm_1".to_string(),
            node_id: "vm".to_string(),
            deployment_id: "dep".to_string(),
            state: String::new(),
            runtime_properties: Inputs::new(),
        })
        .unwrap();
    store
}

fn worker_executor(timeout: Duration) -> Arc<dyn Executor> {
    Arc::new(ProcessExecutor::new(
        ProcessConfig::new(BINARY, timeout)
            .with_args(["worker"])
            .with_max_concurrent(2),
    ))
}

async fn run_one(
    operation: &str,
    inputs: serde_json::Value,
    max_attempts: u32,
    timeout: Duration,
) -> (topograph_core::RunReport, Arc<MemoryEventSink>) {
    let sink = Arc::new(MemoryEventSink::new());
    let ctx = WorkflowContext::new("dep", "process-test", model()).with_sink(sink.clone());

    let mut graph = TaskGraph::new();
    graph
        .add_task(
            Task::operation(
                OperationTarget::node_instance("vm_1"),
                operation,
                inputs.as_object().cloned().unwrap_or_default(),
                TaskOptions {
                    max_attempts,
                    ..TaskOptions::default()
                },
            )
            .unwrap(),
        )
        .unwrap();

    let report = Engine::new(ctx, graph, worker_executor(timeout))
        .execute()
        .await
        .unwrap();
    (report, sink)
}

fn started(sink: &MemoryEventSink) -> usize {
    sink.events()
        .iter()
        .filter(|e| matches!(e.event_type, EventType::TaskStarted { .. }))
        .count()
}

#[tokio::test]
async fn worker_runs_operation_and_returns_messages() {
    let (report, sink) = run_one(
        "builtin.log",
        json!({"message": "hello"}),
        1,
        Duration::from_secs(30),
    )
    .await;

    assert_eq!(report.status, RunStatus::Succeeded);
    let messages: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e.event_type {
            EventType::OperationMessage { message, .. } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec!["> node instance: vm_1 hello".to_string()]);
}

#[tokio::test]
async fn operation_failure_crosses_the_process_boundary() {
    let (report, _) = run_one(
        "builtin.fail",
        json!({"message": "disk full"}),
        1,
        Duration::from_secs(30),
    )
    .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failures[0].reason, "operation failed: disk full");
}

#[tokio::test]
async fn crashed_worker_is_retried_then_fails() {
    let (report, sink) = run_one(
        "worker.exit",
        json!({"code": 3}),
        2,
        Duration::from_secs(30),
    )
    .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.failures[0]
        .reason
        .starts_with("worker process exited without a result"));
    assert_eq!(started(&sink), 2);
}

#[tokio::test]
async fn hung_worker_is_killed_after_timeout() {
    let (report, _) = run_one(
        "builtin.sleep",
        json!({"millis": 30_000}),
        1,
        Duration::from_secs(1),
    )
    .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.failures[0].reason.starts_with("worker process timed out"));
}

fn topograph(data_dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(BINARY)
        .arg("--config")
        .arg(data_dir.join("absent.toml"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn cli_installs_a_loaded_topology() {
    let dir = tempfile::tempdir().unwrap();
    let document = dir.path().join("topology.json");
    std::fs::write(
        &document,
        json!({
            "name": "hello",
            "nodes": [
                {"name": "compute", "type": "test.Compute",
                 "operations": {"tosca.interfaces.node.lifecycle.Standard.create": "builtin.log"}},
                {"name": "app", "type": "test.App",
                 "operations": {"tosca.interfaces.node.lifecycle.Standard.create": "builtin.log"}}
            ],
            "relationships": [{"source": "app", "target": "compute"}]
        })
        .to_string(),
    )
    .unwrap();

    let output = topograph(dir.path(), &["load", document.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let output = topograph(dir.path(), &["workflows", "hello"]);
    let listed = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(listed.lines().any(|l| l == "install"));
    assert!(listed.contains("operation (required)"));

    for executor in ["inline", "thread-pool", "process"] {
        let output = topograph(
            dir.path(),
            &["execute", "hello", "install", "--executor", executor],
        );
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        assert_eq!(output.status.code(), Some(0), "{}", stdout);

        let first = stdout.lines().next().unwrap();
        assert!(first.ends_with(" succeeded"), "{}", first);
        let execution_id = first.split_whitespace().nth(1).unwrap();

        let output = topograph(dir.path(), &["events", execution_id]);
        assert!(output.status.success());
        let events = String::from_utf8_lossy(&output.stdout).to_string();
        assert!(events.contains("\"run_started\""));
        assert!(events.lines().last().unwrap().contains("\"run_finished\""));
    }
}

#[test]
fn cli_exit_codes_separate_preflight_from_run_failures() {
    let dir = tempfile::tempdir().unwrap();
    let document = dir.path().join("topology.json");
    std::fs::write(
        &document,
        json!({
            "name": "broken",
            "nodes": [
                {"name": "vm", "type": "test.VM",
                 "operations": {"tosca.interfaces.node.lifecycle.Standard.create": "builtin.fail"}}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let output = topograph(dir.path(), &["load", document.to_str().unwrap()]);
    assert!(output.status.success());

    // Missing mandatory parameter
    let output = topograph(dir.path(), &["execute", "broken", "execute_operation"]);
    assert_eq!(output.status.code(), Some(2));

    // Undeclared parameter
    let output = topograph(
        dir.path(),
        &["execute", "broken", "install", "--parameters", "unexpected=1"],
    );
    assert_eq!(output.status.code(), Some(2));

    let output = topograph(dir.path(), &["execute", "broken", "install", "--executor", "inline"]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    assert!(stdout.contains("failed: create@vm_1: operation failed: operation failed"));
}
