//! Standard handler library
//!
//! Collection of built-in action handlers for common operations

mod context;
mod debug;
mod http;
mod time;
mod transform;

pub use context::{render, SetVariables, Template};
pub use debug::DebugLog;
pub use http::HttpRequest;
pub use time::Delay;
pub use transform::{JsonParse, JsonStringify};

use flowcore::NodeHandler;
use flowengine::{HandlerMetadata, HandlerRegistry};
use std::sync::Arc;

fn metadata(description: &str, category: &str) -> HandlerMetadata {
    HandlerMetadata {
        description: description.to_string(),
        category: category.to_string(),
    }
}

/// Register all standard handlers with a registry
pub fn register_all(registry: &mut HandlerRegistry) {
    let handlers: Vec<(Arc<dyn NodeHandler>, HandlerMetadata)> = vec![
        (
            Arc::new(DebugLog),
            metadata("Logs a message for debugging", "debug"),
        ),
        (
            Arc::new(SetVariables),
            metadata("Sets literal variables", "context"),
        ),
        (
            Arc::new(Template),
            metadata("Renders a text template from variables", "context"),
        ),
        (
            Arc::new(JsonParse),
            metadata("Parse JSON string", "transform"),
        ),
        (
            Arc::new(JsonStringify),
            metadata("Convert value to JSON string", "transform"),
        ),
        (
            Arc::new(Delay),
            metadata("Delay execution for specified milliseconds", "time"),
        ),
        (
            Arc::new(HttpRequest::new()),
            metadata("Make HTTP requests", "http"),
        ),
    ];

    for (handler, metadata) in handlers {
        registry.register_with_metadata(handler, metadata);
    }
}
