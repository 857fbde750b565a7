use crate::{ExecutionId, ExecutionStatus, FlowId, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Invalid flow: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Node {node_id} failed: {source}")]
    NodeExecution {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },

    #[error("Condition node {node_id} could not resolve an outgoing edge{}", label_suffix(.label))]
    ConditionUnresolved {
        node_id: NodeId,
        label: Option<String>,
    },

    #[error("Concurrency conflict on execution {execution_id}: expected {expected:?}, found {actual}")]
    ConcurrencyConflict {
        execution_id: ExecutionId,
        expected: Vec<ExecutionStatus>,
        actual: ExecutionStatus,
    },

    #[error("Loop node {node_id} has {items} items, limit is {limit}")]
    LoopLimitExceeded {
        node_id: NodeId,
        items: usize,
        limit: usize,
    },

    #[error("Execution exceeded {0} steps")]
    StepLimitExceeded(usize),

    #[error("Flow not found: {0}")]
    FlowNotFound(FlowId),

    #[error("Flow {0} is not active")]
    FlowInactive(FlowId),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Execution {id} cannot be retried: {reason}")]
    NotRetryable { id: ExecutionId, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn label_suffix(label: &Option<String>) -> String {
    match label {
        Some(label) => format!(" for label '{}'", label),
        None => String::new(),
    }
}

/// Errors raised by node handlers
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required variable: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid handler output: {0}")]
    InvalidOutput(String),
}

/// Structural problems in a flow graph, detected before any dispatch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Edge {from} -> {to} references unknown node {missing}")]
    DanglingEdge {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },

    #[error("Flow has no trigger node")]
    MissingTrigger,

    #[error("Flow has several trigger nodes: {0:?}")]
    MultipleTriggers(Vec<NodeId>),

    #[error("Trigger node {0} has incoming edges")]
    TriggerHasIncoming(NodeId),

    #[error("Node {0} is unreachable from the trigger")]
    Unreachable(NodeId),

    #[error("Cycle through {0} does not pass a loop node")]
    Cycle(NodeId),

    #[error("Node {node_id} allows at most {max} outgoing edges, found {found}")]
    TooManyEdges {
        node_id: NodeId,
        max: usize,
        found: usize,
    },

    #[error("Condition node {0} has an unlabelled outgoing edge")]
    UnlabelledConditionEdge(NodeId),

    #[error("Node {node_id} has duplicate edge label '{label}'")]
    DuplicateLabel { node_id: NodeId, label: String },

    #[error("Condition node {node_id} references label '{label}' with no matching edge")]
    UnresolvedLabel { node_id: NodeId, label: String },

    #[error("Node {node_id} is misconfigured: {reason}")]
    InvalidConfig { node_id: NodeId, reason: String },
}
