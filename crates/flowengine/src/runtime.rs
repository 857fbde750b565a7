use crate::config::RuntimeConfig;
use crate::registry::HandlerRegistry;
use crate::scheduler::Scheduler;
use crate::store::{ExecutionStore, FlowStore};
use crate::supervisor::Supervisor;
use chrono::Utc;
use flowcore::{
    CancelReason, EventBus, Execution, ExecutionEvent, ExecutionId, ExecutionStatus, Flow,
    FlowError, FlowId, StatusGuard, Transition, Variables,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Poll interval for `wait_for` between event wake-ups
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Caller-facing entry point: start, cancel, retry and inspect executions
pub struct FlowRuntime {
    registry: Arc<HandlerRegistry>,
    flows: Arc<dyn FlowStore>,
    store: Arc<dyn ExecutionStore>,
    event_bus: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    supervisor: Arc<Supervisor>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    pub fn new(
        registry: HandlerRegistry,
        flows: Arc<dyn FlowStore>,
        store: Arc<dyn ExecutionStore>,
        config: RuntimeConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&flows),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&event_bus),
            &config,
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            Arc::clone(&event_bus),
            config.supervisor.clone(),
        ));

        Self {
            registry,
            flows,
            store,
            event_bus,
            scheduler,
            supervisor,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Check a flow without running it
    pub fn validate_flow(&self, flow: &Flow) -> Result<(), FlowError> {
        self.scheduler.prepare_flow(flow.clone()).map(|_| ())
    }

    /// Create a root execution in `pending` and dispatch it in the background
    pub async fn start_execution(
        &self,
        flow_id: FlowId,
        context: Variables,
    ) -> Result<ExecutionId, FlowError> {
        let id = self.create_execution(flow_id, context).await?;
        self.dispatch(id);
        Ok(id)
    }

    /// Create a root execution and drive it to a terminal state in place
    pub async fn execute(&self, flow_id: FlowId, context: Variables) -> Result<Execution, FlowError> {
        let id = self.create_execution(flow_id, context).await?;
        Arc::clone(&self.scheduler).run(id).await?;
        self.store.get(id).await
    }

    async fn create_execution(&self, flow_id: FlowId, context: Variables) -> Result<ExecutionId, FlowError> {
        let flow = self.flows.get_flow(flow_id).await?;
        if !flow.active {
            return Err(FlowError::FlowInactive(flow_id));
        }
        self.scheduler.prepare_flow(flow)?;

        let execution = Execution::root(flow_id, context);
        let id = execution.id;
        self.store.insert(execution).await?;
        tracing::info!("Created execution {} for flow {}", id, flow_id);
        Ok(id)
    }

    fn dispatch(&self, id: ExecutionId) {
        let run = Arc::clone(&self.scheduler).run(id);
        tokio::spawn(async move {
            match run.await {
                Ok(status) => tracing::debug!("Execution {} settled as {}", id, status),
                Err(e) => tracing::error!("Execution {} could not be driven: {}", id, e),
            }
        });
    }

    /// Request cooperative cancellation
    ///
    /// A node already dispatched finishes but is not logged; nothing after
    /// it is scheduled.
    /// Children already spawned keep running.
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<Execution, FlowError> {
        let now = Utc::now();
        let cancelled = self
            .store
            .compare_and_set(
                id,
                &StatusGuard::any_of(&ExecutionStatus::ACTIVE),
                Transition::Cancel { at: now },
            )
            .await?;

        tracing::warn!("Execution {} cancelled on request", id);
        self.event_bus.emit(ExecutionEvent::ExecutionCancelled {
            execution_id: id,
            reason: CancelReason::Requested,
            timestamp: now,
        });
        Ok(cancelled)
    }

    /// Reset a failed or cancelled root execution and run it from the trigger
    pub async fn retry_execution(&self, id: ExecutionId) -> Result<Execution, FlowError> {
        let execution = self.store.get(id).await?;
        if !execution.is_root() {
            return Err(FlowError::NotRetryable {
                id,
                reason: "child executions cannot be retried".to_string(),
            });
        }
        let retryable = [ExecutionStatus::Failed, ExecutionStatus::Cancelled];
        if !retryable.contains(&execution.status) {
            return Err(FlowError::NotRetryable {
                id,
                reason: format!("execution is {}", execution.status),
            });
        }

        let reset = self
            .store
            .compare_and_set(id, &StatusGuard::any_of(&retryable), Transition::Reset)
            .await?;
        tracing::info!("Retrying execution {}", id);
        self.dispatch(id);
        Ok(reset)
    }

    /// Cancel every active execution older than `threshold`
    pub async fn kill_stuck(&self, threshold: Duration) -> Result<usize, FlowError> {
        self.supervisor.sweep(threshold).await
    }

    pub async fn get_execution(&self, id: ExecutionId) -> Result<Execution, FlowError> {
        self.store.get(id).await
    }

    pub async fn child_executions(&self, id: ExecutionId) -> Result<Vec<Execution>, FlowError> {
        self.store.get(id).await?;
        self.store.children(id).await
    }

    /// Wait until an execution reaches a terminal state
    pub async fn wait_for(&self, id: ExecutionId) -> Result<Execution, FlowError> {
        let mut events = self.event_bus.subscribe();
        loop {
            let execution = self.store.get(id).await?;
            if execution.is_terminal() {
                return Ok(execution);
            }
            // Any event is a hint to re-check; the timeout covers missed ones
            let _ = tokio::time::timeout(WAIT_POLL, events.recv()).await;
        }
    }

    /// Start the periodic stuck-execution sweep, if enabled
    pub fn spawn_supervisor(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.supervisor.enabled {
            tracing::info!("Supervisor disabled");
            return None;
        }
        Some(Arc::clone(&self.supervisor).spawn(shutdown))
    }
}
