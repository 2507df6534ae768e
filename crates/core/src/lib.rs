// Core of the topograph orchestration engine: task graphs built from a
// deployment topology, executed through pluggable executors

pub mod context;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod model;
pub mod operation;
pub mod parameters;
pub mod storage;
pub mod task;
pub mod types;
pub mod workflow;

pub use context::WorkflowContext;
pub use engine::{CancelHandle, Engine, RunReport, TaskFailure};
pub use error::{
    EngineError, ExecutionFailure, ExecutorError, GraphError, OperationError, ParameterError,
    StoreError, UnknownOperationError, WorkflowError,
};
pub use graph::{GraphSnapshot, TaskGraph, TaskSnapshot};
pub use operation::{Operation, OperationContext, OperationRegistry};
pub use task::{OperationTarget, Task, TaskOptions};
pub use types::*;
pub use workflow::{FnWorkflow, Workflow, WorkflowRegistry};
