//! Execution and flow persistence
//!
//! The execution store is the single source of truth shared by the
//! scheduler, cancel requests and the supervisor. Every status change and
//! log append goes through a `StatusGuard` so concurrent actors cannot
//! overwrite each other's transitions.

use async_trait::async_trait;
use flowcore::{
    Execution, ExecutionId, ExecutionStatus, Flow, FlowError, FlowId, LogEntry, StatusGuard,
    Transition, Variables,
};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new execution
    async fn insert(&self, execution: Execution) -> Result<(), FlowError>;

    /// Persist a child execution; the parent must still satisfy `parent_guard`
    async fn insert_child(
        &self,
        parent_id: ExecutionId,
        parent_guard: &StatusGuard,
        child: Execution,
    ) -> Result<(), FlowError>;

    async fn get(&self, id: ExecutionId) -> Result<Execution, FlowError>;

    /// Apply `transition` only if the current record satisfies `guard`
    async fn compare_and_set(
        &self,
        id: ExecutionId,
        guard: &StatusGuard,
        transition: Transition,
    ) -> Result<Execution, FlowError>;

    /// Append one log entry and replace the context, under `guard`
    async fn append_log(
        &self,
        id: ExecutionId,
        guard: &StatusGuard,
        entry: LogEntry,
        context: Variables,
    ) -> Result<(), FlowError>;

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>, FlowError>;

    /// Children of an execution, ordered by branch
    async fn children(&self, parent_id: ExecutionId) -> Result<Vec<Execution>, FlowError>;
}

/// In-process execution store
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, execution: Execution) -> Result<(), FlowError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(FlowError::Store(format!(
                "Execution {} already exists",
                execution.id
            )));
        }
        executions.insert(execution.id, execution);
        Ok(())
    }

    async fn insert_child(
        &self,
        parent_id: ExecutionId,
        parent_guard: &StatusGuard,
        child: Execution,
    ) -> Result<(), FlowError> {
        let mut executions = self.executions.write().await;
        let parent = executions
            .get(&parent_id)
            .ok_or(FlowError::ExecutionNotFound(parent_id))?;
        if !parent_guard.matches(parent) {
            return Err(parent_guard.conflict(parent));
        }
        executions.insert(child.id, child);
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Execution, FlowError> {
        self.executions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(FlowError::ExecutionNotFound(id))
    }

    async fn compare_and_set(
        &self,
        id: ExecutionId,
        guard: &StatusGuard,
        transition: Transition,
    ) -> Result<Execution, FlowError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or(FlowError::ExecutionNotFound(id))?;
        if !guard.matches(execution) {
            return Err(guard.conflict(execution));
        }
        transition.apply(execution);
        Ok(execution.clone())
    }

    async fn append_log(
        &self,
        id: ExecutionId,
        guard: &StatusGuard,
        entry: LogEntry,
        context: Variables,
    ) -> Result<(), FlowError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or(FlowError::ExecutionNotFound(id))?;
        if !guard.matches(execution) {
            return Err(guard.conflict(execution));
        }
        execution.execution_log.push(entry);
        execution.context = context;
        Ok(())
    }

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<Execution>, FlowError> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect())
    }

    async fn children(&self, parent_id: ExecutionId) -> Result<Vec<Execution>, FlowError> {
        let mut children: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.parent_execution_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|e| e.resume_context.as_ref().map(|r| r.branch));
        Ok(children)
    }
}

/// Read-only source of flow definitions
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Snapshot of a flow
    async fn get_flow(&self, id: FlowId) -> Result<Flow, FlowError>;
}

/// In-process flow store
#[derive(Default)]
pub struct MemoryFlowStore {
    flows: RwLock<HashMap<FlowId, Flow>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, flow: Flow) -> FlowId {
        let id = flow.id;
        self.flows.write().await.insert(id, flow);
        id
    }

    pub async fn remove(&self, id: FlowId) -> Option<Flow> {
        self.flows.write().await.remove(&id)
    }

    pub async fn list(&self) -> Vec<Flow> {
        self.flows.read().await.values().cloned().collect()
    }

    /// Load a flow definition from a JSON file and store it
    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<FlowId, FlowError> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        let flow: Flow = serde_json::from_str(&json)?;
        Ok(self.insert(flow).await)
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn get_flow(&self, id: FlowId) -> Result<Flow, FlowError> {
        self.flows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(FlowError::FlowNotFound(id))
    }
}
