//! Execution state machine
//!
//! One scheduler run drives one execution from `pending` to a terminal
//! state. Parallel and Loop nodes spawn child executions as independent
//! tokio tasks and wait for all of them before the parent moves on.
//!
//! Failure policy: a failed node stops only its own execution. Siblings
//! keep running; the parent fails after the join if any child did not
//! complete. Cancelling a parent leaves its children alone.

use crate::config::RuntimeConfig;
use crate::executor::NodeExecutor;
use crate::graph::FlowGraph;
use crate::registry::HandlerRegistry;
use crate::store::{ExecutionStore, FlowStore};
use chrono::Utc;
use flowcore::{
    lookup, ConditionSpec, EventBus, Execution, ExecutionEvent, ExecutionId, ExecutionStatus,
    Flow, FlowError, FlowId, LogEntry, LogStatus, Node, NodeError, NodeId, NodeKind,
    ResumeContext, StatusGuard, Transition, ValidationError, Value, Variables, LOOP_BODY_LABEL,
    LOOP_DONE_LABEL,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;

/// How a drive over the graph ended
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(String),
    /// The execution stopped being ours (cancelled or reaped)
    Interrupted,
}

/// What the frontier does after a node
enum Advance {
    Next(NodeId),
    Done,
    Stop(Outcome),
}

pub struct Scheduler {
    flows: Arc<dyn FlowStore>,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<HandlerRegistry>,
    executor: NodeExecutor,
    event_bus: Arc<EventBus>,
    max_steps: usize,
    max_loop_iterations: usize,
}

impl Scheduler {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        store: Arc<dyn ExecutionStore>,
        registry: Arc<HandlerRegistry>,
        event_bus: Arc<EventBus>,
        config: &RuntimeConfig,
    ) -> Self {
        let executor = NodeExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&event_bus),
        );
        Self {
            flows,
            store,
            registry,
            executor,
            event_bus,
            max_steps: config.max_steps,
            max_loop_iterations: config.max_loop_iterations,
        }
    }

    /// Load a flow snapshot and validate it
    pub async fn prepare(&self, flow_id: FlowId) -> Result<Arc<FlowGraph>, FlowError> {
        let flow = self.flows.get_flow(flow_id).await?;
        self.prepare_flow(flow)
    }

    /// Validate graph structure and every known handler's config
    pub fn prepare_flow(&self, flow: Flow) -> Result<Arc<FlowGraph>, FlowError> {
        let graph = FlowGraph::build(Arc::new(flow))?;
        for node in &graph.flow().nodes {
            // Unknown handlers are reported when the node is reached
            if let Ok(handler) = self.registry.resolve(&node.kind) {
                handler.validate_config(&node.config).map_err(|e| {
                    ValidationError::InvalidConfig {
                        node_id: node.id.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
        }
        Ok(Arc::new(graph))
    }

    /// Drive a pending execution to a terminal state
    pub fn run(self: Arc<Self>, id: ExecutionId) -> BoxFuture<'static, Result<ExecutionStatus, FlowError>> {
        async move { self.run_execution(id, None).await }.boxed()
    }

    fn run_child(
        self: Arc<Self>,
        id: ExecutionId,
        graph: Arc<FlowGraph>,
    ) -> BoxFuture<'static, Result<ExecutionStatus, FlowError>> {
        async move { self.run_execution(id, Some(graph)).await }.boxed()
    }

    async fn run_execution(
        self: &Arc<Self>,
        id: ExecutionId,
        graph: Option<Arc<FlowGraph>>,
    ) -> Result<ExecutionStatus, FlowError> {
        let claimed_at = Utc::now();
        let execution = match self
            .store
            .compare_and_set(
                id,
                &StatusGuard::any_of(&[ExecutionStatus::Pending]),
                Transition::Claim { at: claimed_at },
            )
            .await
        {
            Ok(execution) => execution,
            Err(FlowError::ConcurrencyConflict { actual, .. }) if actual.is_terminal() => {
                tracing::info!("Execution {} was {} before it could be claimed", id, actual);
                return Ok(actual);
            }
            Err(e) => return Err(e),
        };
        let guard = StatusGuard::claimed(claimed_at);

        tracing::info!("Starting execution {} of flow {}", id, execution.flow_id);
        self.event_bus.emit(ExecutionEvent::ExecutionStarted {
            execution_id: id,
            flow_id: execution.flow_id,
            parent_execution_id: execution.parent_execution_id,
            timestamp: claimed_at,
        });

        let graph = match graph {
            Some(graph) => graph,
            None => match self.prepare(execution.flow_id).await {
                Ok(graph) => graph,
                Err(e) => return self.finish(&execution, &guard, Err(e)).await,
            },
        };

        let outcome = self.drive(&execution, &guard, &graph).await;
        self.finish(&execution, &guard, outcome).await
    }

    async fn drive(
        self: &Arc<Self>,
        execution: &Execution,
        guard: &StatusGuard,
        graph: &Arc<FlowGraph>,
    ) -> Result<Outcome, FlowError> {
        let resume = execution.resume_context.as_ref();
        let mut frontier = match resume {
            Some(resume) => resume.node_id.clone(),
            None => graph.entry().id.clone(),
        };
        let stop_at = resume.and_then(|r| r.stop_at.as_deref());
        let mut context = execution.context.clone();
        let mut steps = 0;

        loop {
            if stop_at == Some(frontier.as_str()) {
                return Ok(Outcome::Completed);
            }

            // Cancellation is observed only between dispatches
            let current = self.store.get(execution.id).await?;
            if !guard.matches(&current) {
                return Ok(Outcome::Interrupted);
            }

            self.take_step(&mut steps)?;

            let node = graph
                .node(&frontier)
                .ok_or_else(|| ValidationError::InvalidConfig {
                    node_id: frontier.clone(),
                    reason: "resume node is not part of the flow".to_string(),
                })?;

            let dispatch = self
                .executor
                .execute(execution, guard, node, &context)
                .await?;
            context = dispatch.context;
            if dispatch.entry.is_failed() {
                return Ok(Outcome::Failed(dispatch.entry.error.unwrap_or_default()));
            }

            let advance = match &node.kind {
                NodeKind::Terminal => Advance::Done,
                NodeKind::Condition => {
                    Advance::Next(self.select_branch(execution, graph, node, &context)?)
                }
                NodeKind::Parallel => {
                    // The join entry is a step of its own
                    self.take_step(&mut steps)?;
                    self.fan_out_parallel(execution, guard, graph, node, &context)
                        .await?
                }
                NodeKind::Loop => {
                    self.take_step(&mut steps)?;
                    self.fan_out_loop(execution, guard, graph, node, &context)
                        .await?
                }
                NodeKind::Trigger | NodeKind::Action { .. } => {
                    match graph.outgoing(&node.id).first() {
                        Some(edge) => Advance::Next(edge.to_node_id.clone()),
                        None => Advance::Done,
                    }
                }
            };

            match advance {
                Advance::Next(next) => frontier = next,
                Advance::Done => return Ok(Outcome::Completed),
                Advance::Stop(outcome) => return Ok(outcome),
            }
        }
    }

    fn take_step(&self, steps: &mut usize) -> Result<(), FlowError> {
        *steps += 1;
        if *steps > self.max_steps {
            return Err(FlowError::StepLimitExceeded(self.max_steps));
        }
        Ok(())
    }

    /// Record the terminal state, unless another actor got there first
    async fn finish(
        &self,
        execution: &Execution,
        guard: &StatusGuard,
        outcome: Result<Outcome, FlowError>,
    ) -> Result<ExecutionStatus, FlowError> {
        let now = Utc::now();
        let transition = match outcome {
            Ok(Outcome::Completed) => Transition::Complete { at: now },
            Ok(Outcome::Failed(error)) => Transition::Fail { at: now, error },
            Ok(Outcome::Interrupted) | Err(FlowError::ConcurrencyConflict { .. }) => {
                let current = self.store.get(execution.id).await?;
                tracing::warn!(
                    "Execution {} stopped dispatching: status is now {}",
                    execution.id,
                    current.status
                );
                return Ok(current.status);
            }
            Err(e @ FlowError::Store(_)) => return Err(e),
            Err(e) => Transition::Fail {
                at: now,
                error: e.to_string(),
            },
        };

        match self
            .store
            .compare_and_set(execution.id, guard, transition)
            .await
        {
            Ok(done) => {
                match &done.error_message {
                    Some(error) => tracing::error!("Execution {} failed: {}", done.id, error),
                    None => tracing::info!("Execution {} completed", done.id),
                }
                self.event_bus.emit(ExecutionEvent::ExecutionFinished {
                    execution_id: done.id,
                    status: done.status,
                    error: done.error_message.clone(),
                    timestamp: now,
                });
                Ok(done.status)
            }
            Err(FlowError::ConcurrencyConflict { actual, .. }) => {
                tracing::warn!(
                    "Execution {} was {} before it could finish",
                    execution.id,
                    actual
                );
                Ok(actual)
            }
            Err(e) => Err(e),
        }
    }

    fn select_branch(
        &self,
        execution: &Execution,
        graph: &FlowGraph,
        node: &Node,
        context: &Variables,
    ) -> Result<NodeId, FlowError> {
        let spec = ConditionSpec::from_config(&node.config).map_err(|source| {
            FlowError::NodeExecution {
                node_id: node.id.clone(),
                source,
            }
        })?;
        let variables = execution.handler_variables(context);
        let label = spec
            .evaluate(&variables)
            .ok_or_else(|| FlowError::ConditionUnresolved {
                node_id: node.id.clone(),
                label: None,
            })?;
        let edge = graph
            .edge_labelled(&node.id, label)
            .ok_or_else(|| FlowError::ConditionUnresolved {
                node_id: node.id.clone(),
                label: Some(label.to_string()),
            })?;

        tracing::debug!("Condition {} took '{}' -> {}", node.id, label, edge.to_node_id);
        Ok(edge.to_node_id.clone())
    }

    async fn fan_out_parallel(
        self: &Arc<Self>,
        execution: &Execution,
        guard: &StatusGuard,
        graph: &Arc<FlowGraph>,
        node: &Node,
        context: &Variables,
    ) -> Result<Advance, FlowError> {
        let join = node.config_str("join").map(str::to_string);
        let branches = graph
            .outgoing(&node.id)
            .into_iter()
            .enumerate()
            .map(|(branch, edge)| ResumeContext {
                node_id: edge.to_node_id.clone(),
                branch,
                loop_item: None,
                stop_at: join.clone(),
            })
            .collect();

        Ok(
            match self
                .join_children(execution, guard, graph, node, branches, context)
                .await?
            {
                None => join.map_or(Advance::Done, Advance::Next),
                Some(outcome) => Advance::Stop(outcome),
            },
        )
    }

    async fn fan_out_loop(
        self: &Arc<Self>,
        execution: &Execution,
        guard: &StatusGuard,
        graph: &Arc<FlowGraph>,
        node: &Node,
        context: &Variables,
    ) -> Result<Advance, FlowError> {
        let items = loop_items(execution, node, context)?;
        let limit = node
            .config
            .get("max_iterations")
            .and_then(Value::as_f64)
            .map(|n| n as usize)
            .unwrap_or(self.max_loop_iterations);
        if items.len() > limit {
            return Err(FlowError::LoopLimitExceeded {
                node_id: node.id.clone(),
                items: items.len(),
                limit,
            });
        }

        let body = graph
            .edge_labelled(&node.id, LOOP_BODY_LABEL)
            .ok_or_else(|| ValidationError::InvalidConfig {
                node_id: node.id.clone(),
                reason: "loop node has no 'body' edge".to_string(),
            })?;
        let iterations = items
            .into_iter()
            .enumerate()
            .map(|(branch, item)| ResumeContext {
                node_id: body.to_node_id.clone(),
                branch,
                loop_item: Some(item),
                stop_at: Some(node.id.clone()),
            })
            .collect();
        let done = graph
            .edge_labelled(&node.id, LOOP_DONE_LABEL)
            .map(|e| e.to_node_id.clone());

        Ok(
            match self
                .join_children(execution, guard, graph, node, iterations, context)
                .await?
            {
                None => done.map_or(Advance::Done, Advance::Next),
                Some(outcome) => Advance::Stop(outcome),
            },
        )
    }

    /// Spawn one child per branch, wait for all of them and log the join
    ///
    /// Returns `None` when every child completed. A parent that stopped
    /// being ours during the wait gets no join entry.
    async fn join_children(
        self: &Arc<Self>,
        execution: &Execution,
        guard: &StatusGuard,
        graph: &Arc<FlowGraph>,
        node: &Node,
        branches: Vec<ResumeContext>,
        context: &Variables,
    ) -> Result<Option<Outcome>, FlowError> {
        let join_started = Utc::now();
        let mut ids = Vec::with_capacity(branches.len());

        for resume in branches {
            let child = Execution::child(execution, context.clone(), resume);
            let child_id = child.id;
            match self.store.insert_child(execution.id, guard, child).await {
                Ok(()) => ids.push(child_id),
                Err(FlowError::ConcurrencyConflict { .. }) => {
                    self.abandon(&ids).await;
                    return Ok(Some(Outcome::Interrupted));
                }
                Err(e) => {
                    self.abandon(&ids).await;
                    return Err(e);
                }
            }
        }

        tracing::info!("Node {} spawned {} child executions", node.id, ids.len());
        self.event_bus.emit(ExecutionEvent::ChildrenSpawned {
            execution_id: execution.id,
            node_id: node.id.clone(),
            children: ids.clone(),
            timestamp: Utc::now(),
        });

        let mut running: FuturesUnordered<_> = ids
            .iter()
            .map(|&child_id| {
                let handle = tokio::spawn(Arc::clone(self).run_child(child_id, Arc::clone(graph)));
                async move { (child_id, handle.await) }
            })
            .collect();

        let mut statuses = HashMap::new();
        while let Some((child_id, joined)) = running.next().await {
            let status = match joined {
                Ok(Ok(status)) if status.is_terminal() => status,
                Ok(Ok(status)) => {
                    tracing::warn!("Child execution {} returned while {}", child_id, status);
                    ExecutionStatus::Failed
                }
                Ok(Err(e)) => {
                    tracing::error!("Child execution {} errored: {}", child_id, e);
                    self.settle_child(child_id, e.to_string()).await
                }
                Err(join_error) => {
                    tracing::error!("Child execution {} panicked: {}", child_id, join_error);
                    self.settle_child(child_id, format!("child task panicked: {}", join_error))
                        .await
                }
            };
            statuses.insert(child_id, status);
        }

        let status_of = |id: &ExecutionId| {
            statuses
                .get(id)
                .copied()
                .unwrap_or(ExecutionStatus::Failed)
        };
        let summary: Vec<Value> = ids
            .iter()
            .map(|id| {
                let mut child = HashMap::new();
                child.insert("execution_id".to_string(), Value::from(id.to_string()));
                child.insert("status".to_string(), Value::from(status_of(id).as_str()));
                Value::Object(child)
            })
            .collect();
        let failed: Vec<String> = ids
            .iter()
            .filter(|id| status_of(id) != ExecutionStatus::Completed)
            .map(|id| format!("{} ({})", id, status_of(id)))
            .collect();
        let error = (!failed.is_empty()).then(|| {
            format!(
                "{} of {} child executions did not complete: {}",
                failed.len(),
                ids.len(),
                failed.join(", ")
            )
        });

        let mut input = HashMap::new();
        input.insert(
            "children".to_string(),
            Value::Array(ids.iter().map(|id| Value::from(id.to_string())).collect()),
        );
        let mut output = HashMap::new();
        output.insert("children".to_string(), Value::Array(summary));

        let entry = LogEntry {
            node_id: node.id.clone(),
            input: Value::Object(input),
            output: Value::Object(output),
            status: if error.is_some() {
                LogStatus::Failed
            } else {
                LogStatus::Completed
            },
            error: error.clone(),
            started_at: join_started,
            completed_at: Utc::now(),
        };
        match self
            .executor
            .record(execution.id, guard, entry, context.clone())
            .await
        {
            Ok(()) => {}
            Err(FlowError::ConcurrencyConflict { .. }) => return Ok(Some(Outcome::Interrupted)),
            Err(e) => return Err(e),
        }

        Ok(error.map(Outcome::Failed))
    }

    /// Cancel children that were persisted but never dispatched
    async fn abandon(&self, ids: &[ExecutionId]) {
        let guard = StatusGuard::any_of(&[ExecutionStatus::Pending]);
        for &id in ids {
            if let Err(e) = self
                .store
                .compare_and_set(id, &guard, Transition::Cancel { at: Utc::now() })
                .await
            {
                tracing::warn!("Could not cancel undispatched child {}: {}", id, e);
            }
        }
    }

    /// Force a child whose task died into `failed`
    async fn settle_child(&self, id: ExecutionId, error: String) -> ExecutionStatus {
        match self
            .store
            .compare_and_set(
                id,
                &StatusGuard::any_of(&ExecutionStatus::ACTIVE),
                Transition::Fail {
                    at: Utc::now(),
                    error,
                },
            )
            .await
        {
            Ok(done) => done.status,
            Err(FlowError::ConcurrencyConflict { actual, .. }) => actual,
            Err(_) => ExecutionStatus::Failed,
        }
    }
}

fn loop_items(execution: &Execution, node: &Node, context: &Variables) -> Result<Vec<Value>, FlowError> {
    match node.config.get("items") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::String(path)) => {
            let variables = execution.handler_variables(context);
            match lookup(&variables, path) {
                Some(Value::Array(items)) => Ok(items.clone()),
                Some(other) => Err(FlowError::NodeExecution {
                    node_id: node.id.clone(),
                    source: NodeError::InvalidInputType {
                        field: path.clone(),
                        expected: "array".to_string(),
                        actual: other.type_name().to_string(),
                    },
                }),
                None => Err(FlowError::NodeExecution {
                    node_id: node.id.clone(),
                    source: NodeError::MissingInput(path.clone()),
                }),
            }
        }
        _ => Err(ValidationError::InvalidConfig {
            node_id: node.id.clone(),
            reason: "items must be an array or a variable path".to_string(),
        }
        .into()),
    }
}
