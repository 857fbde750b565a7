use async_trait::async_trait;
use flowcore::{FlowError, HandlerContext, HandlerOutput, NodeError, NodeHandler, NodeKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Metadata about a handler type
#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub description: String,
    pub category: String,
}

impl Default for HandlerMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

struct Registration {
    handler: Arc<dyn NodeHandler>,
    metadata: HandlerMetadata,
}

/// Maps a node's handler key to the unit that executes it
///
/// Pure dispatch: retries, side effects and orchestration stay out of here.
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl HandlerRegistry {
    /// Registry with the built-in control handlers (trigger, condition,
    /// parallel, loop, terminal) already registered
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for kind in ["trigger", "condition", "parallel", "loop", "terminal"] {
            registry.register_with_metadata(
                Arc::new(ControlHandler { kind }),
                HandlerMetadata {
                    description: format!("Built-in {} node", kind),
                    category: "control".to_string(),
                },
            );
        }
        registry
    }

    /// Registry without any handler
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.register_with_metadata(handler, HandlerMetadata::default());
    }

    pub fn register_with_metadata(&mut self, handler: Arc<dyn NodeHandler>, metadata: HandlerMetadata) {
        let handler_type = handler.handler_type().to_string();
        tracing::debug!("Registering handler type: {}", handler_type);
        self.handlers
            .insert(handler_type, Registration { handler, metadata });
    }

    /// Resolve the handler for a node kind
    pub fn resolve(&self, kind: &NodeKind) -> Result<Arc<dyn NodeHandler>, FlowError> {
        let key = kind.handler_key();
        self.handlers
            .get(key)
            .map(|r| Arc::clone(&r.handler))
            .ok_or_else(|| FlowError::UnknownNodeType(key.to_string()))
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    /// Get all registered handler types, sorted
    pub fn list_handler_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, handler_type: &str) -> Option<HandlerMetadata> {
        self.handlers.get(handler_type).map(|r| r.metadata.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pass-through handler for structural node kinds; the scheduler owns
/// their branching semantics
struct ControlHandler {
    kind: &'static str,
}

#[async_trait]
impl NodeHandler for ControlHandler {
    fn handler_type(&self) -> &str {
        self.kind
    }

    async fn execute(&self, _ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        Ok(HandlerOutput::new())
    }
}
