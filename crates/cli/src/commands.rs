use crate::config::{Config, ExecutorConfig, ExecutorKind};
use crate::document::TopologyDocument;
use crate::inputs;
use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use topograph_core::events::{EventSink, FanoutEventSink, TracingEventSink};
use topograph_core::executor::worker::{serve, worker_registry};
use topograph_core::executor::{
    Executor, InlineExecutor, ProcessConfig, ProcessExecutor, ThreadPoolExecutor,
};
use topograph_core::model::Deployment;
use topograph_core::storage::{
    FilesystemResourceStore, JsonlEventLog, ModelStore, ModelStoreExt, RedbModelStore,
};
use topograph_core::{Engine, ExecutionId, OperationRegistry, RunReport, WorkflowContext, WorkflowRegistry};

/// Exit code of a run that finished without succeeding
const RUN_FAILED: u8 = 1;

fn open_model(config: &Config) -> Result<Arc<dyn ModelStore>> {
    let store = RedbModelStore::new(config.model_path()).context("Failed to open model store")?;
    Ok(Arc::new(store))
}

pub fn load(config: &Config, document: &Path, deployment_id: Option<String>) -> Result<()> {
    let document = TopologyDocument::read(document)?;
    let deployment_id = deployment_id.unwrap_or_else(|| document.name.clone());
    let model = open_model(config)?;

    let summary = document.load(&*model, &deployment_id, &WorkflowRegistry::with_builtins())?;
    println!(
        "Deployment {} loaded: {} nodes, {} node instances, {} relationship instances",
        summary.deployment_id, summary.nodes, summary.node_instances, summary.relationship_instances
    );
    Ok(())
}

pub fn workflows(config: &Config, deployment_id: &str) -> Result<()> {
    let model = open_model(config)?;
    let deployment: Deployment = model
        .get(deployment_id)
        .with_context(|| format!("Failed to load deployment '{}'", deployment_id))?;

    for (name, declaration) in &deployment.workflows {
        println!("{}", name);
        for (parameter, spec) in &declaration.parameters {
            match &spec.default {
                None => println!("  {} (required)", parameter),
                Some(default) => println!("  {} (default: {})", parameter, default),
            }
        }
    }
    Ok(())
}

fn build_executor(config: &ExecutorConfig) -> Result<Arc<dyn Executor>> {
    let registry = Arc::new(OperationRegistry::with_builtins());
    let executor: Arc<dyn Executor> = match config.kind {
        ExecutorKind::Inline => Arc::new(InlineExecutor::new(registry)),
        ExecutorKind::ThreadPool => Arc::new(
            ThreadPoolExecutor::new(registry, config.workers, config.queue_capacity)
                .context("Failed to start thread pool")?,
        ),
        ExecutorKind::Process => {
            let program = match &config.worker_program {
                Some(program) => program.clone(),
                None => std::env::current_exe().context("Failed to locate the worker executable")?,
            };
            Arc::new(ProcessExecutor::new(
                ProcessConfig::new(program, config.process_timeout())
                    .with_args(["worker"])
                    .with_max_concurrent(config.workers),
            ))
        }
    };
    Ok(executor)
}

/// Run a workflow.
///
/// `Err` means the run never started; a started run always yields an exit
/// code.
pub async fn execute(
    config: &Config,
    deployment_id: &str,
    workflow_id: &str,
    parameters: &[String],
) -> Result<ExitCode> {
    let model = open_model(config)?;
    let deployment: Deployment = model
        .get(deployment_id)
        .with_context(|| format!("Failed to load deployment '{}'", deployment_id))?;
    let declaration = deployment.workflows.get(workflow_id).ok_or_else(|| {
        anyhow!(
            "deployment '{}' has no workflow '{}'",
            deployment_id,
            workflow_id
        )
    })?;
    let workflow = WorkflowRegistry::with_builtins().resolve(&declaration.handler)?;
    let parameters = inputs::parse_all(parameters)?;

    let resources = Arc::new(
        FilesystemResourceStore::new(config.resource_path())
            .context("Failed to create resource store")?,
    );
    let event_log = Arc::new(
        JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
    );
    let sink: Arc<dyn EventSink> = Arc::new(
        FanoutEventSink::new()
            .with(Arc::new(TracingEventSink))
            .with(event_log.clone()),
    );

    let ctx = WorkflowContext::new(deployment_id, workflow_id, model)
        .with_parameters(parameters)
        .with_resources(resources)
        .with_sink(sink)
        .with_task_defaults(config.engine.task_defaults());
    let execution_id = ctx.execution_id().clone();

    let executor = build_executor(&config.executor)?;
    let engine = Engine::for_workflow(ctx, workflow, executor)?;

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let outcome = engine.execute().await;
    if let Err(e) = event_log.flush() {
        tracing::error!("Failed to flush event log: {}", e);
    }

    match outcome {
        Ok(report) => {
            print_report(&report);
            if report.succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(RUN_FAILED))
            }
        }
        Err(e) => {
            println!("Execution {} aborted", execution_id);
            eprintln!("Error: {}", e);
            Ok(ExitCode::from(RUN_FAILED))
        }
    }
}

fn print_report(report: &RunReport) {
    println!("Execution {} {}", report.execution_id, report.status);
    let operations = report.tasks.tasks.iter().filter(|t| !t.workflow).count();
    println!(
        "  workflow: {}, tasks: {} ({} operations)",
        report.workflow_name,
        report.tasks.tasks.len(),
        operations
    );
    for failure in &report.failures {
        println!("  failed: {}: {}", failure.name, failure.reason);
    }
}

pub fn events(config: &Config, execution_id: &str) -> Result<()> {
    let event_log =
        JsonlEventLog::new(config.event_log_path()).context("Failed to open event log")?;
    let events = event_log.read_events(&ExecutionId::named(execution_id))?;
    if events.is_empty() {
        bail!("no events recorded for execution '{}'", execution_id);
    }
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

/// Serve operation requests on stdin/stdout for the process executor
pub async fn worker() -> Result<()> {
    let registry = Arc::new(worker_registry());
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}
