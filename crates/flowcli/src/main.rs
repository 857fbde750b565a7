use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ExecutionEvent, ExecutionStatus, Flow, Node, NodeEvent, Value, Variables};
use flowengine::{FlowRuntime, HandlerRegistry, MemoryExecutionStore, MemoryFlowStore, RuntimeConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Runtime config (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Initial context as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available handler types
    Nodes,

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => {
            tracing::info!("Loading runtime config from {}", path.display());
            RuntimeConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(RuntimeConfig::default()),
    }
}

fn read_flow(file: &PathBuf) -> Result<Flow> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("{} is not a valid flow", file.display()))
}

fn parse_input(input: Option<String>) -> Result<Variables> {
    let Some(input) = input else {
        return Ok(Variables::new());
    };
    let json: serde_json::Value = serde_json::from_str(&input).context("input is not valid JSON")?;
    match Value::from(json) {
        Value::Object(context) => Ok(context),
        other => bail!("Input must be a JSON object, got {}", other.type_name()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
        } => {
            let level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
                )
                .init();

            let config = load_config(cli.config.as_ref())?;
            run_flow(file, input, config).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flow(output)?;
        }
    }

    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionStarted {
            execution_id,
            parent_execution_id,
            ..
        } => match parent_execution_id {
            Some(parent) => println!("  ↳ Child execution {} started (parent {})", execution_id, parent),
            None => println!("▶️  Execution {} started", execution_id),
        },
        ExecutionEvent::NodeStarted {
            node_id, node_type, ..
        } => {
            println!("  ⚡ Starting node: {} ({})", node_id, node_type);
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::ChildrenSpawned {
            node_id, children, ..
        } => {
            println!("  🔀 Node {} spawned {} child executions", node_id, children.len());
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", node_id, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", node_id, percent);
                }
            }
            NodeEvent::Data { .. } => {}
        },
        ExecutionEvent::ExecutionFinished {
            execution_id,
            status,
            error,
            ..
        } => match error {
            Some(error) => println!("💥 Execution {} {}: {}", execution_id, status, error),
            None => println!("✨ Execution {} {}", execution_id, status),
        },
        ExecutionEvent::ExecutionCancelled {
            execution_id,
            reason,
            ..
        } => {
            println!("🛑 Execution {} cancelled ({:?})", execution_id, reason);
        }
    }
}

async fn run_flow(file: PathBuf, input: Option<String>, config: RuntimeConfig) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());

    let flow = read_flow(&file)?;
    println!("📋 Flow: {}", flow.name);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Edges: {}", flow.edges.len());
    println!();

    let context = parse_input(input)?;

    let flows = Arc::new(MemoryFlowStore::new());
    let flow_id = flows.insert(flow).await;
    let runtime = FlowRuntime::new(registry(), flows, Arc::new(MemoryExecutionStore::new()), config);

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let execution = runtime.execute(flow_id, context).await?;

    // Let the printer drain before the summary
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let children = runtime.child_executions(execution.id).await?;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {}", execution.status);
    println!("   Logged nodes: {}", execution.execution_log.len());
    if !children.is_empty() {
        let completed = children
            .iter()
            .filter(|c| c.status == ExecutionStatus::Completed)
            .count();
        println!("   Children: {}/{} completed", completed, children.len());
    }

    if !execution.context.is_empty() {
        println!();
        println!("📤 Context:");
        let mut keys: Vec<&String> = execution.context.keys().collect();
        keys.sort();
        for key in keys {
            println!("   {}: {}", key, execution.context[key].to_json());
        }
    }

    match execution.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!(
            "execution {}: {}",
            status,
            execution.error_message.unwrap_or_default()
        ),
    }
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let flow = read_flow(&file)?;
    let registry = registry();

    let unknown: Vec<&str> = flow
        .nodes
        .iter()
        .map(|n| n.kind.handler_key())
        .filter(|key| !registry.contains(key))
        .collect();

    let runtime = FlowRuntime::new(
        registry,
        Arc::new(MemoryFlowStore::new()),
        Arc::new(MemoryExecutionStore::new()),
        RuntimeConfig::default(),
    );
    runtime.validate_flow(&flow)?;

    println!("✅ Flow is valid:");
    println!("   Name: {}", flow.name);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Edges: {}", flow.edges.len());
    for key in unknown {
        println!("   ⚠️  No handler registered for '{}'", key);
    }

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Handler Types:");
    println!();

    let registry = registry();
    for handler_type in registry.list_handler_types() {
        if let Some(metadata) = registry.get_metadata(&handler_type) {
            println!("  • {} ({})", handler_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", handler_type);
        }
    }
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let mut flow = Flow::new("Example HTTP Flow");
    flow.description = Some("Fetches data from an API and logs the result".to_string());

    flow.add_node(Node::trigger("start").with_name("Start"));
    flow.add_node(
        Node::action("fetch", "http.request")
            .with_name("Fetch Data")
            .with_config("url", "{{url}}")
            .with_config("method", "GET"),
    );
    flow.add_node(
        Node::action("log", "debug.log")
            .with_name("Log Response")
            .with_config("message", "{{response.body}}"),
    );
    flow.connect("start", "fetch");
    flow.connect("fetch", "log");

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );

    Ok(())
}
