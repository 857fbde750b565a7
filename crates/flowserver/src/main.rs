mod error;
mod routes;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use flowengine::{FlowRuntime, HandlerRegistry, MemoryExecutionStore, MemoryFlowStore, RuntimeConfig};
use routes::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn load_config() -> anyhow::Result<RuntimeConfig> {
    match std::env::var("FLOW_CONFIG") {
        Ok(path) => {
            info!("Loading runtime config from {}", path);
            Ok(RuntimeConfig::load(&path)?)
        }
        Err(_) => Ok(RuntimeConfig::default()),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Flow Engine Server");

    let config = load_config()?;

    let mut registry = HandlerRegistry::new();
    flownodes::register_all(&mut registry);

    let flows = Arc::new(MemoryFlowStore::new());
    let runtime = Arc::new(FlowRuntime::new(
        registry,
        flows.clone(),
        Arc::new(MemoryExecutionStore::new()),
        config,
    ));

    info!(
        "Runtime initialized with {} handler types",
        runtime.registry().list_handler_types().len()
    );

    let shutdown = CancellationToken::new();
    let supervisor = runtime.spawn_supervisor(shutdown.clone());

    let app_state = web::Data::new(AppState { runtime, flows });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    shutdown.cancel();
    if let Some(handle) = supervisor {
        let _ = handle.await;
    }

    Ok(())
}
