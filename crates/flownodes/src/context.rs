//! Handlers that shape the execution context

use async_trait::async_trait;
use flowcore::{lookup, HandlerContext, HandlerOutput, NodeError, NodeHandler, Value, Variables};
use std::collections::HashMap;

/// Merges the literal `values` object from config into the context
pub struct SetVariables;

#[async_trait]
impl NodeHandler for SetVariables {
    fn handler_type(&self) -> &str {
        "context.set"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let values = values_config(&ctx.config)?;
        ctx.events
            .info(format!("Setting {} variable(s)", values.len()));
        Ok(HandlerOutput {
            outputs: values.clone(),
        })
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        values_config(config).map(|_| ())
    }
}

fn values_config(config: &HashMap<String, Value>) -> Result<&HashMap<String, Value>, NodeError> {
    match config.get("values") {
        Some(Value::Object(values)) => Ok(values),
        Some(other) => Err(NodeError::Configuration(format!(
            "'values' must be an object, got {}",
            other.type_name()
        ))),
        None => Err(NodeError::Configuration("Missing config: values".to_string())),
    }
}

/// Renders `{{ path }}` placeholders in `template` into the `output` variable
pub struct Template;

#[async_trait]
impl NodeHandler for Template {
    fn handler_type(&self) -> &str {
        "context.template"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let template = ctx
            .require_config("template")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("'template' must be a string".to_string()))?;
        let output = ctx
            .config
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or("text")
            .to_string();

        let rendered = render(template, &ctx.variables)?;
        Ok(HandlerOutput::new().with_output(output, rendered))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("template") {
            Some(Value::String(template)) => placeholders(template).map(|_| ()),
            _ => Err(NodeError::Configuration(
                "'template' must be a string".to_string(),
            )),
        }
    }
}

/// Substitute every `{{ path }}` with the variable it names
///
/// Strings are inserted as-is, other values as compact JSON. A path that
/// does not resolve is a `MissingInput` error.
pub fn render(template: &str, variables: &Variables) -> Result<String, NodeError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for (start, end, path) in placeholders(template)? {
        out.push_str(&template[last..start]);
        let value = lookup(variables, path).ok_or_else(|| NodeError::MissingInput(path.to_string()))?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_json().to_string()),
        }
        last = end;
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Byte ranges and trimmed paths of each placeholder
fn placeholders(template: &str) -> Result<Vec<(usize, usize, &str)>, NodeError> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(open) = template[cursor..].find("{{") {
        let start = cursor + open;
        let close = template[start..]
            .find("}}")
            .ok_or_else(|| NodeError::Configuration(format!("Unclosed placeholder at byte {}", start)))?;
        let end = start + close + 2;
        let path = template[start + 2..end - 2].trim();
        if path.is_empty() {
            return Err(NodeError::Configuration(format!("Empty placeholder at byte {}", start)));
        }
        found.push((start, end, path));
        cursor = end;
    }
    Ok(found)
}
