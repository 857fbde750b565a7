use crate::registry::HandlerRegistry;
use crate::store::ExecutionStore;
use chrono::Utc;
use flowcore::{
    EventBus, Execution, ExecutionEvent, ExecutionId, FlowError, HandlerContext, LogEntry, LogStatus, Node,
    NodeError, StatusGuard, Value, Variables, LOOP_ITEM_VAR,
};
use std::sync::Arc;
use std::time::Instant;

/// Result of dispatching one node
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// The entry appended to the execution log
    pub entry: LogEntry,
    /// Execution context after merging the handler's output
    pub context: Variables,
}

/// Runs a single node and records it in the execution log
pub struct NodeExecutor {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn ExecutionStore>,
    event_bus: Arc<EventBus>,
}

impl NodeExecutor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn ExecutionStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            store,
            event_bus,
        }
    }

    /// Resolve the handler, invoke it and persist the resulting log entry
    ///
    /// Handler failures are not errors here: they produce a `failed` entry.
    /// An `Err` means the entry could not be recorded, e.g. the execution
    /// was cancelled while the handler ran.
    pub async fn execute(
        &self,
        execution: &Execution,
        guard: &StatusGuard,
        node: &Node,
        context: &Variables,
    ) -> Result<Dispatch, FlowError> {
        let variables = execution.handler_variables(context);
        let started_at = Utc::now();
        let start = Instant::now();

        tracing::debug!(
            "Dispatching node {} ({}) in execution {}",
            node.id,
            node.kind.handler_key(),
            execution.id
        );
        self.event_bus.emit(ExecutionEvent::NodeStarted {
            execution_id: execution.id,
            node_id: node.id.clone(),
            node_type: node.kind.handler_key().to_string(),
            timestamp: started_at,
        });

        let result = match self.registry.resolve(&node.kind) {
            Ok(handler) => {
                let ctx = HandlerContext {
                    execution_id: execution.id,
                    node_id: node.id.clone(),
                    variables: variables.clone(),
                    config: node.config.clone(),
                    events: self.event_bus.create_emitter(execution.id, node.id.clone()),
                };
                handler
                    .execute(ctx)
                    .await
                    .and_then(|output| validate_output(output.outputs))
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let completed_at = Utc::now();
        let mut next_context = context.clone();

        let entry = match result {
            Ok(outputs) => {
                next_context.extend(outputs.clone());
                LogEntry {
                    node_id: node.id.clone(),
                    input: Value::Object(variables),
                    output: Value::Object(outputs),
                    status: LogStatus::Completed,
                    error: None,
                    started_at,
                    completed_at,
                }
            }
            Err(error) => LogEntry {
                node_id: node.id.clone(),
                input: Value::Object(variables),
                output: Value::Null,
                status: LogStatus::Failed,
                error: Some(error),
                started_at,
                completed_at,
            },
        };

        if let Err(e) = self
            .record(execution.id, guard, entry.clone(), next_context.clone())
            .await
        {
            tracing::debug!(
                "Dropped entry for node {} in execution {}: {}",
                node.id,
                execution.id,
                e
            );
            return Err(e);
        }

        match &entry.error {
            None => {
                tracing::info!("Node {} completed in {}ms", node.id, duration_ms);
                self.event_bus.emit(ExecutionEvent::NodeCompleted {
                    execution_id: execution.id,
                    node_id: node.id.clone(),
                    duration_ms,
                    timestamp: completed_at,
                });
            }
            Some(error) => {
                tracing::error!("Node {} failed: {}", node.id, error);
                self.event_bus.emit(ExecutionEvent::NodeFailed {
                    execution_id: execution.id,
                    node_id: node.id.clone(),
                    error: error.clone(),
                    timestamp: completed_at,
                });
            }
        }

        Ok(Dispatch {
            entry,
            context: next_context,
        })
    }

    /// Append an entry under the run's claim
    ///
    /// Fails with a conflict once the execution is no longer `running` under
    /// this claim: a cancelled or retried run keeps its log as it was.
    pub async fn record(
        &self,
        execution_id: ExecutionId,
        guard: &StatusGuard,
        entry: LogEntry,
        context: Variables,
    ) -> Result<(), FlowError> {
        self.store
            .append_log(execution_id, guard, entry, context)
            .await
    }
}

/// Reject output that cannot be merged into the execution context
fn validate_output(outputs: Variables) -> Result<Variables, NodeError> {
    for (key, value) in &outputs {
        if key.is_empty() {
            return Err(NodeError::InvalidOutput("empty variable name".to_string()));
        }
        if key == LOOP_ITEM_VAR {
            return Err(NodeError::InvalidOutput(format!(
                "'{}' is reserved for loop items",
                LOOP_ITEM_VAR
            )));
        }
        if !is_finite(value) {
            return Err(NodeError::InvalidOutput(format!(
                "'{}' contains a non-finite number",
                key
            )));
        }
    }
    Ok(outputs)
}

fn is_finite(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_finite(),
        Value::Array(items) => items.iter().all(is_finite),
        Value::Object(map) => map.values().all(is_finite),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_validation() {
        let mut ok = Variables::new();
        ok.insert("label".to_string(), Value::from("politics"));
        assert!(validate_output(ok).is_ok());

        let mut reserved = Variables::new();
        reserved.insert(LOOP_ITEM_VAR.to_string(), Value::Null);
        assert!(validate_output(reserved).is_err());

        let mut nan = Variables::new();
        nan.insert(
            "scores".to_string(),
            Value::Array(vec![Value::Number(f64::NAN)]),
        );
        assert!(matches!(validate_output(nan), Err(NodeError::InvalidOutput(_))));
    }
}
