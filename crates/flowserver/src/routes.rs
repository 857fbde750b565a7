use crate::error::ApiError;
use actix_web::{get, post, web, HttpResponse, Responder, Result as ActixResult};
use actix_ws::Message;
use flowcore::{Flow, FlowError, Variables};
use flowengine::{FlowRuntime, FlowStore, MemoryFlowStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub runtime: Arc<FlowRuntime>,
    pub flows: Arc<MemoryFlowStore>,
}

/// Request body for starting an execution
#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    context: Variables,
}

/// Request body for an administrative stuck sweep
#[derive(Debug, Default, Deserialize)]
struct KillStuckRequest {
    /// Defaults to the supervisor's configured threshold
    threshold_secs: Option<u64>,
}

/// Response for flow creation
#[derive(Debug, Serialize)]
struct FlowResponse {
    id: Uuid,
    message: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_flows)
        .service(create_flow)
        .service(get_flow)
        .service(delete_flow)
        .service(start_execution)
        .service(kill_stuck)
        .service(get_execution)
        .service(child_executions)
        .service(cancel_execution)
        .service(retry_execution)
        .service(websocket_events)
        .service(list_handlers);
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowengine"
    }))
}

/// List all flows
#[get("/api/flows")]
async fn list_flows(data: web::Data<AppState>) -> impl Responder {
    let flows: Vec<_> = data
        .flows
        .list()
        .await
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id,
                "name": f.name,
                "description": f.description,
                "active": f.active,
                "nodes": f.nodes.len(),
                "edges": f.edges.len(),
            })
        })
        .collect();

    HttpResponse::Ok().json(flows)
}

/// Validate and store a flow
#[post("/api/flows")]
async fn create_flow(
    data: web::Data<AppState>,
    flow: web::Json<Flow>,
) -> Result<HttpResponse, ApiError> {
    let flow = flow.into_inner();
    data.runtime.validate_flow(&flow)?;

    info!("Creating flow: {} ({})", flow.name, flow.id);
    let id = data.flows.insert(flow).await;

    Ok(HttpResponse::Created().json(FlowResponse {
        id,
        message: "Flow created successfully".to_string(),
    }))
}

#[get("/api/flows/{id}")]
async fn get_flow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let flow = data.flows.get_flow(id).await?;
    Ok(HttpResponse::Ok().json(flow))
}

/// Delete a flow; executions already running keep their snapshot
#[actix_web::delete("/api/flows/{id}")]
async fn delete_flow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    data.flows
        .remove(id)
        .await
        .ok_or(FlowError::FlowNotFound(id))?;

    info!("Deleted flow: {}", id);
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Flow deleted successfully"
    })))
}

/// Create a root execution and dispatch it in the background
/// Decode an optional JSON body; only an empty body means "use the defaults"
fn optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError(FlowError::from(e)))
}

#[post("/api/flows/{id}/executions")]
async fn start_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let flow_id = path.into_inner();
    let context = optional_body::<StartRequest>(&body)?.context;

    let execution_id = data.runtime.start_execution(flow_id, context).await?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "execution_id": execution_id,
        "status": "pending",
    })))
}

#[get("/api/executions/{id}")]
async fn get_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let execution = data.runtime.get_execution(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(execution))
}

#[get("/api/executions/{id}/children")]
async fn child_executions(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let children = data.runtime.child_executions(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(children))
}

#[post("/api/executions/{id}/cancel")]
async fn cancel_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let execution = data.runtime.cancel_execution(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(execution))
}

#[post("/api/executions/{id}/retry")]
async fn retry_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let execution = data.runtime.retry_execution(path.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(execution))
}

#[post("/api/executions/kill-stuck")]
async fn kill_stuck(
    data: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let threshold = optional_body::<KillStuckRequest>(&body)?
        .threshold_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| data.runtime.config().supervisor.stuck_threshold());

    let killed = data.runtime.kill_stuck(threshold).await?;
    info!(
        "Manual sweep cancelled {} executions older than {}s",
        killed,
        threshold.as_secs()
    );
    Ok(HttpResponse::Ok().json(serde_json::json!({ "killed": killed })))
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("WebSocket client lagged, skipped {} events", skipped);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List registered handler types
#[get("/api/handlers")]
async fn list_handlers(data: web::Data<AppState>) -> impl Responder {
    let registry = data.runtime.registry();
    let handlers: Vec<_> = registry
        .list_handler_types()
        .iter()
        .map(|handler_type| {
            let metadata = registry.get_metadata(handler_type);
            serde_json::json!({
                "type": handler_type,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();

    HttpResponse::Ok().json(handlers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use flowcore::{Execution, ExecutionStatus, Node};
    use flowengine::{ExecutionStore, HandlerRegistry, MemoryExecutionStore, RuntimeConfig};

    fn state() -> (web::Data<AppState>, Arc<MemoryExecutionStore>) {
        let mut registry = HandlerRegistry::new();
        flownodes::register_all(&mut registry);
        let flows = Arc::new(MemoryFlowStore::new());
        let store = Arc::new(MemoryExecutionStore::new());
        let runtime = FlowRuntime::new(registry, flows.clone(), store.clone(), RuntimeConfig::default());
        (
            web::Data::new(AppState {
                runtime: Arc::new(runtime),
                flows,
            }),
            store,
        )
    }

    fn sample_flow() -> Flow {
        let mut flow = Flow::new("sample");
        flow.add_node(Node::trigger("start"));
        flow.add_node(
            Node::action("greet", "context.template").with_config("template", "hello {{name}}"),
        );
        flow.connect("start", "greet");
        flow
    }

    #[actix_web::test]
    async fn test_create_flow_rejects_invalid_graph() {
        let (data, _) = state();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let mut flow = sample_flow();
        flow.connect("greet", "nowhere");
        let req = test::TestRequest::post()
            .uri("/api/flows")
            .set_json(&flow)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/flows")
            .set_json(sample_flow())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[actix_web::test]
    async fn test_start_and_fetch_execution() {
        let (data, _) = state();
        let flow_id = data.flows.insert(sample_flow()).await;
        let runtime = data.runtime.clone();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri(&format!("/api/flows/{}/executions", flow_id))
            .set_json(serde_json::json!({"context": {"name": "ada"}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let id: Uuid = serde_json::from_value(body["execution_id"].clone()).unwrap();

        let done = runtime.wait_for(id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);

        let req = test::TestRequest::get()
            .uri(&format!("/api/executions/{}", id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["context"]["text"], "hello ada");
        assert_eq!(body["execution_log"].as_array().map(Vec::len), Some(2));
    }

    #[actix_web::test]
    async fn test_error_statuses() {
        let (data, store) = state();
        let done = {
            let mut execution = Execution::root(Uuid::new_v4(), Variables::new());
            execution.status = ExecutionStatus::Completed;
            execution
        };
        let done_id = done.id;
        store.insert(done).await.unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/executions/{}", Uuid::new_v4()))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri(&format!("/api/executions/{}/cancel", done_id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri(&format!("/api/executions/{}/retry", done_id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_kill_stuck_reports_count() {
        let (data, store) = state();
        store
            .insert(Execution::root(Uuid::new_v4(), Variables::new()))
            .await
            .unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/executions/kill-stuck")
            .set_json(serde_json::json!({"threshold_secs": 0}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["killed"], 1);
    }

    #[actix_web::test]
    async fn test_kill_stuck_rejects_malformed_body() {
        let (data, store) = state();
        let fresh = Execution::root(Uuid::new_v4(), Variables::new());
        let fresh_id = fresh.id;
        store.insert(fresh).await.unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/executions/kill-stuck")
            .set_json(serde_json::json!({"threshold_secs": "abc"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        // No body at all falls back to the configured threshold
        let req = test::TestRequest::post()
            .uri("/api/executions/kill-stuck")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["killed"], 0);
        assert_eq!(
            store.get(fresh_id).await.unwrap().status,
            ExecutionStatus::Pending
        );
    }
}
