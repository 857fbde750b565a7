use async_trait::async_trait;
use flowcore::{HandlerContext, HandlerOutput, NodeError, NodeHandler, Value};
use std::collections::HashMap;

const METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// HTTP request handler
///
/// `url` is a template over the execution variables. The response is stored
/// as `{status, body, headers}` under `output` (default `response`).
pub struct HttpRequest {
    client: reqwest::Client,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn method(config: &HashMap<String, Value>) -> Result<String, NodeError> {
    let method = config
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_uppercase();
    if METHODS.contains(&method.as_str()) {
        Ok(method)
    } else {
        Err(NodeError::Configuration(format!("Unsupported method: {}", method)))
    }
}

#[async_trait]
impl NodeHandler for HttpRequest {
    fn handler_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let template = ctx
            .require_config("url")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("'url' must be a string".to_string()))?;
        let url = crate::context::render(template, &ctx.variables)?;
        let method = method(&ctx.config)?;

        ctx.events.info(format!("{} {}", method, url));

        let mut request = match method.as_str() {
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "PATCH" => self.client.patch(&url),
            "DELETE" => self.client.delete(&url),
            _ => self.client.get(&url),
        };

        if let Some(Value::Object(headers)) = ctx.config.get("headers") {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key, val_str);
                }
            }
        }

        // `body` names the variable to send as JSON
        if let Some(path) = ctx.config.get("body").and_then(Value::as_str) {
            request = request.json(&ctx.require_variable(path)?.to_json());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(v.to_str().unwrap_or(""))))
            .collect();
        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        let fail_on_status = ctx.get_config_or("fail_on_status", Value::Bool(true)).is_truthy();
        if fail_on_status && (status.is_client_error() || status.is_server_error()) {
            return Err(NodeError::ExecutionFailed(format!(
                "{} {} returned {}",
                method, url, status
            )));
        }

        // JSON bodies are stored structured, anything else as text
        let body = serde_json::from_str::<serde_json::Value>(&body_text)
            .map(Value::from)
            .unwrap_or(Value::String(body_text));

        let mut result = HashMap::new();
        result.insert("status".to_string(), Value::from(status.as_u16() as f64));
        result.insert("body".to_string(), body);
        result.insert("headers".to_string(), Value::Object(headers_map));

        let output = ctx
            .config
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or("response");
        Ok(HandlerOutput::new().with_output(output, Value::Object(result)))
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("url") {
            Some(Value::String(_)) => method(config).map(|_| ()),
            _ => Err(NodeError::Configuration("Missing config: url".to_string())),
        }
    }
}
