//! Core abstractions for the flow execution engine
//!
//! This crate provides the data model (flows, executions, execution log),
//! the handler contract and the error taxonomy that the engine and the
//! handler crates share. It holds no scheduling logic.

pub mod condition;
mod error;
pub mod events;
mod execution;
mod flow;
mod handler;
mod value;

pub use condition::{ConditionRule, ConditionSpec, Operator};
pub use error::{FlowError, NodeError, ValidationError};
pub use events::*;
pub use execution::{
    Execution, ExecutionId, ExecutionStatus, LogEntry, LogStatus, ResumeContext, StatusGuard,
    Transition, LOOP_ITEM_VAR,
};
pub use flow::{Edge, Flow, FlowId, Node, NodeId, NodeKind, LOOP_BODY_LABEL, LOOP_DONE_LABEL};
pub use handler::{HandlerContext, HandlerOutput, NodeHandler};
pub use value::{lookup, Value, Variables};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
