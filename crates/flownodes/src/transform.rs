use async_trait::async_trait;
use flowcore::{HandlerContext, HandlerOutput, NodeError, NodeHandler, Value};

fn names<'a>(ctx: &'a HandlerContext, input: &'a str, output: &'a str) -> (&'a str, &'a str) {
    (
        ctx.config.get("input").and_then(Value::as_str).unwrap_or(input),
        ctx.config.get("output").and_then(Value::as_str).unwrap_or(output),
    )
}

/// Parse a JSON string variable into a structured value
pub struct JsonParse;

#[async_trait]
impl NodeHandler for JsonParse {
    fn handler_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let (input, output) = names(&ctx, "json", "parsed");
        let value = ctx.require_variable(input)?;
        let text = value.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: input.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })?;

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(HandlerOutput::new().with_output(output, Value::from(parsed)))
    }
}

/// Serialise a variable to a JSON string
pub struct JsonStringify;

#[async_trait]
impl NodeHandler for JsonStringify {
    fn handler_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let (input, output) = names(&ctx, "value", "json");
        let value = ctx.require_variable(input)?;

        let json = if ctx.get_config_or("pretty", Value::Bool(false)).is_truthy() {
            serde_json::to_string_pretty(&value.to_json())
        } else {
            serde_json::to_string(&value.to_json())
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(HandlerOutput::new().with_output(output, json))
    }
}
