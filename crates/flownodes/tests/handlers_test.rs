use flowcore::{
    EventBus, ExecutionId, ExecutionStatus, Flow, HandlerContext, Node, NodeError, NodeHandler,
    Value, Variables,
};
use flowengine::{FlowRuntime, HandlerRegistry, MemoryExecutionStore, MemoryFlowStore, RuntimeConfig};
use flownodes::{Delay, HttpRequest, JsonParse, JsonStringify, SetVariables, Template};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// Helper function to create a test context
fn create_test_context(config: HashMap<String, Value>, variables: Variables) -> HandlerContext {
    let event_bus = Arc::new(EventBus::new(100));
    let execution_id = ExecutionId::new_v4();

    HandlerContext {
        execution_id,
        node_id: "node".to_string(),
        variables,
        config,
        events: event_bus.create_emitter(execution_id, "node".to_string()),
    }
}

fn map(value: serde_json::Value) -> HashMap<String, Value> {
    match Value::from(value) {
        Value::Object(map) => map,
        other => panic!("expected an object, got {:?}", other),
    }
}

/// Serve a single canned HTTP response and return the base URL
async fn serve_once(status_line: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    });
    format!("http://{}", addr)
}

fn local_http() -> HttpRequest {
    HttpRequest::with_client(reqwest::Client::builder().no_proxy().build().unwrap())
}

#[tokio::test]
async fn test_set_variables_outputs_literal_values() {
    let config = map(json!({"values": {"channel": "politics", "priority": 2}}));
    let ctx = create_test_context(config, Variables::new());

    let output = SetVariables.execute(ctx).await.unwrap();

    assert_eq!(output.outputs.get("channel"), Some(&Value::from("politics")));
    assert_eq!(output.outputs.get("priority").and_then(Value::as_f64), Some(2.0));
}

#[tokio::test]
async fn test_set_variables_rejects_non_object() {
    let config = map(json!({"values": [1, 2]}));
    assert!(matches!(
        SetVariables.validate_config(&config),
        Err(NodeError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_template_renders_into_output_variable() {
    let config = map(json!({"template": "[{{ label }}] {{ article.title }}", "output": "headline"}));
    let variables = map(json!({"label": "politics", "article": {"title": "Budget vote"}}));
    let ctx = create_test_context(config, variables);

    let output = Template.execute(ctx).await.unwrap();

    assert_eq!(
        output.outputs.get("headline"),
        Some(&Value::from("[politics] Budget vote"))
    );
}

#[tokio::test]
async fn test_json_parse_and_stringify() {
    let ctx = create_test_context(
        HashMap::new(),
        map(json!({"json": "{\"tags\": [\"a\", \"b\"]}"})),
    );
    let parsed = JsonParse.execute(ctx).await.unwrap();
    let tags = parsed.outputs["parsed"].path("tags").unwrap();
    assert_eq!(tags.as_array().map(Vec::len), Some(2));

    let ctx = create_test_context(
        map(json!({"input": "payload", "output": "text"})),
        map(json!({"payload": {"ok": true}})),
    );
    let output = JsonStringify.execute(ctx).await.unwrap();
    assert_eq!(output.outputs.get("text"), Some(&Value::from("{\"ok\":true}")));
}

#[tokio::test]
async fn test_json_parse_reports_bad_input() {
    let ctx = create_test_context(HashMap::new(), map(json!({"json": 42})));
    assert!(matches!(
        JsonParse.execute(ctx).await,
        Err(NodeError::InvalidInputType { expected, .. }) if expected == "string"
    ));

    let ctx = create_test_context(HashMap::new(), map(json!({"json": "{broken"})));
    assert!(matches!(
        JsonParse.execute(ctx).await,
        Err(NodeError::ExecutionFailed(_))
    ));
}

#[tokio::test]
async fn test_delay_validates_config() {
    assert!(Delay.validate_config(&map(json!({"delay_ms": 5}))).is_ok());
    assert!(Delay.validate_config(&map(json!({"delay_ms": -1}))).is_err());
    assert!(Delay.validate_config(&map(json!({"delay_ms": "soon"}))).is_err());

    let ctx = create_test_context(map(json!({"delay_ms": 1})), Variables::new());
    assert!(Delay.execute(ctx).await.unwrap().outputs.is_empty());
}

#[tokio::test]
async fn test_http_request_stores_structured_response() {
    let base = serve_once("200 OK", "{\"label\": \"politics\"}").await;
    let config = map(json!({"url": format!("{}/classify/{{{{ id }}}}", base), "output": "classifier"}));
    let ctx = create_test_context(config, map(json!({"id": "a1"})));

    let output = local_http().execute(ctx).await.unwrap();

    let response = &output.outputs["classifier"];
    assert_eq!(response.path("status").and_then(Value::as_f64), Some(200.0));
    assert_eq!(response.path("body.label"), Some(&Value::from("politics")));
}

#[tokio::test]
async fn test_http_request_fails_on_error_status() {
    let base = serve_once("503 Service Unavailable", "{}").await;
    let ctx = create_test_context(map(json!({"url": base})), Variables::new());

    match local_http().execute(ctx).await {
        Err(NodeError::ExecutionFailed(message)) => assert!(message.contains("503")),
        other => panic!("expected failure, got {:?}", other.map(|o| o.outputs)),
    }
}

#[tokio::test]
async fn test_http_request_rejects_unknown_method() {
    let config = map(json!({"url": "http://localhost", "method": "brew"}));
    assert!(matches!(
        HttpRequest::new().validate_config(&config),
        Err(NodeError::Configuration(message)) if message.contains("BREW")
    ));
}

#[tokio::test]
async fn test_standard_handlers_in_a_flow() {
    let mut registry = HandlerRegistry::new();
    flownodes::register_all(&mut registry);
    assert!(registry.contains("context.template"));
    assert_eq!(
        registry.get_metadata("http.request").map(|m| m.category),
        Some("http".to_string())
    );

    let mut flow = Flow::new("standard");
    flow.add_node(Node::trigger("start"));
    flow.add_node(
        Node::action("defaults", "context.set")
            .with_config("values", Value::from(json!({"channel": "politics"}))),
    );
    flow.add_node(
        Node::action("headline", "context.template")
            .with_config("template", "#{{channel}}: {{text}}"),
    );
    flow.add_node(Node::action("log", "debug.log").with_config("message", "{{text}}"));
    flow.connect("start", "defaults");
    flow.connect("defaults", "headline");
    flow.connect("headline", "log");

    let flows = Arc::new(MemoryFlowStore::new());
    let flow_id = flows.insert(flow).await;
    let runtime = FlowRuntime::new(
        registry,
        flows,
        Arc::new(MemoryExecutionStore::new()),
        RuntimeConfig::default(),
    );

    let mut variables = Variables::new();
    variables.insert("text".to_string(), Value::from("budget vote"));
    let execution = runtime.execute(flow_id, variables).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.execution_log.len(), 4);
    assert_eq!(
        execution.context.get("text"),
        Some(&Value::from("#politics: budget vote"))
    );
}
