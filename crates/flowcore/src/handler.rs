use crate::{events::EventEmitter, ExecutionId, NodeError, NodeId, Value, Variables};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Executable unit behind a node type
///
/// Handlers are opaque to the engine: they receive the execution's variables
/// and the node's static config and return output variables to merge.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Registry key (e.g. "ai.classify", "trigger")
    fn handler_type(&self) -> &str;

    /// Run the node with the given context
    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError>;

    /// Optional: Validate configuration at flow load time
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Context passed to each handler invocation
#[derive(Clone)]
pub struct HandlerContext {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,

    /// Execution variables, including `loopItem` for loop children
    pub variables: Variables,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,
}

impl HandlerContext {
    /// Get required variable or return error
    pub fn require_variable(&self, name: &str) -> Result<&Value, NodeError> {
        crate::value::lookup(&self.variables, name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }
}

/// Output from a handler; `outputs` are merged into the execution context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub outputs: Variables,
}

impl HandlerOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}
