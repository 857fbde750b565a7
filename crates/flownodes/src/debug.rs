use async_trait::async_trait;
use flowcore::{HandlerContext, HandlerOutput, NodeError, NodeHandler, Value};

/// Logs a message and, optionally, the execution variables
pub struct DebugLog;

#[async_trait]
impl NodeHandler for DebugLog {
    fn handler_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let message = match ctx.config.get("message") {
            Some(Value::String(template)) => crate::context::render(template, &ctx.variables)?,
            _ => "(no message)".to_string(),
        };

        tracing::info!("[{}] {}", ctx.node_id, message);
        ctx.events.info(format!("DEBUG: {}", message));

        if ctx.get_config_or("dump", Value::Bool(false)).is_truthy() {
            let mut keys: Vec<&String> = ctx.variables.keys().collect();
            keys.sort();
            for key in keys {
                ctx.events.info(format!("  {}: {}", key, ctx.variables[key].to_json()));
            }
        }

        Ok(HandlerOutput::new())
    }
}
