#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    Flow, FlowId, HandlerContext, HandlerOutput, NodeError, NodeHandler, NodeId, Value, Variables,
};
use flowengine::{
    FlowRuntime, HandlerRegistry, MemoryExecutionStore, MemoryFlowStore, RuntimeConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub type Seen = Arc<Mutex<Vec<NodeId>>>;

/// Records every node it runs and outputs `<node_id> = true`
pub struct Record {
    pub seen: Seen,
}

#[async_trait]
impl NodeHandler for Record {
    fn handler_type(&self) -> &str {
        "test.record"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        self.seen.lock().unwrap().push(ctx.node_id.clone());
        let mut output = HandlerOutput::new().with_output(ctx.node_id.clone(), true);
        if let Some(item) = ctx.variables.get("loopItem") {
            output = output.with_output(format!("{}_item", ctx.node_id), item.clone());
        }
        Ok(output)
    }
}

/// Labels `text` as politics when it mentions a vote
pub struct Classify;

#[async_trait]
impl NodeHandler for Classify {
    fn handler_type(&self) -> &str {
        "ai.classify"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        let text = ctx
            .require_variable("text")?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "text".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;
        let label = if text.contains("vote") { "politics" } else { "other" };
        Ok(HandlerOutput::new().with_output("label", label))
    }
}

/// Always fails
pub struct Fail;

#[async_trait]
impl NodeHandler for Fail {
    fn handler_type(&self) -> &str {
        "test.fail"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        Err(NodeError::ExecutionFailed(format!("{} refused", ctx.node_id)))
    }
}

/// Fails on its first call, succeeds afterwards
#[derive(Default)]
pub struct Flaky {
    calls: AtomicUsize,
}

#[async_trait]
impl NodeHandler for Flaky {
    fn handler_type(&self) -> &str {
        "test.flaky"
    }

    async fn execute(&self, _ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(NodeError::ExecutionFailed("upstream unavailable".to_string())),
            n => Ok(HandlerOutput::new().with_output("attempt", (n + 1) as f64)),
        }
    }
}

/// Signals arrival, then blocks until the test opens it
///
/// Arrivals and releases are counted, so several gated branches can be
/// held at once.
#[derive(Clone)]
pub struct Gate {
    reached: Arc<Semaphore>,
    release: Arc<Semaphore>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            reached: Arc::new(Semaphore::new(0)),
            release: Arc::new(Semaphore::new(0)),
        }
    }
}

impl Gate {
    /// Wait until `n` gated nodes are blocked in the gate
    pub async fn arrived(&self, n: u32) {
        tokio::time::timeout(Duration::from_secs(5), self.reached.acquire_many(n))
            .await
            .expect("gated nodes should arrive")
            .unwrap()
            .forget();
    }

    /// Let `n` gated nodes through
    pub fn open(&self, n: usize) {
        self.release.add_permits(n);
    }
}

#[async_trait]
impl NodeHandler for Gate {
    fn handler_type(&self) -> &str {
        "test.gate"
    }

    async fn execute(&self, ctx: HandlerContext) -> Result<HandlerOutput, NodeError> {
        self.reached.add_permits(1);
        self.release
            .acquire()
            .await
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?
            .forget();
        Ok(HandlerOutput::new().with_output(ctx.node_id.clone(), true))
    }
}

pub struct Harness {
    pub runtime: Arc<FlowRuntime>,
    pub flows: Arc<MemoryFlowStore>,
    pub store: Arc<MemoryExecutionStore>,
    pub seen: Seen,
    pub gate: Gate,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        init_tracing();
        let seen = Seen::default();
        let gate = Gate::default();

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Record { seen: seen.clone() }));
        registry.register(Arc::new(Classify));
        registry.register(Arc::new(Fail));
        registry.register(Arc::new(Flaky::default()));
        registry.register(Arc::new(gate.clone()));

        let flows = Arc::new(MemoryFlowStore::new());
        let store = Arc::new(MemoryExecutionStore::new());
        let runtime = Arc::new(FlowRuntime::new(
            registry,
            flows.clone(),
            store.clone(),
            config,
        ));

        Self {
            runtime,
            flows,
            store,
            seen,
            gate,
        }
    }

    pub async fn add(&self, flow: Flow) -> FlowId {
        self.flows.insert(flow).await
    }

    pub fn seen(&self) -> Vec<NodeId> {
        self.seen.lock().unwrap().clone()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn vars(pairs: &[(&str, Value)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Trigger followed by a chain of recording actions
pub fn linear(actions: &[&str]) -> Flow {
    let mut flow = Flow::new("linear");
    flow.add_node(flowcore::Node::trigger("start"));
    let mut previous = "start".to_string();
    for id in actions {
        flow.add_node(flowcore::Node::action(*id, "test.record"));
        flow.connect(previous.clone(), *id);
        previous = id.to_string();
    }
    flow
}

pub fn log_nodes(execution: &flowcore::Execution) -> Vec<&str> {
    execution
        .execution_log
        .iter()
        .map(|e| e.node_id.as_str())
        .collect()
}
