//! Flow execution engine
//!
//! This crate drives executions of flow graphs: it validates flows,
//! dispatches nodes through the handler registry, fans out Parallel and
//! Loop nodes into child executions and reaps executions that get stuck.

mod config;
mod executor;
mod graph;
mod registry;
mod runtime;
mod scheduler;
mod store;
mod supervisor;

pub use config::{RuntimeConfig, SupervisorConfig};
pub use executor::{Dispatch, NodeExecutor};
pub use graph::FlowGraph;
pub use registry::{HandlerMetadata, HandlerRegistry};
pub use runtime::FlowRuntime;
pub use scheduler::Scheduler;
pub use store::{ExecutionStore, FlowStore, MemoryExecutionStore, MemoryFlowStore};
pub use supervisor::Supervisor;
