use crate::{FlowError, FlowId, NodeId, Value, Variables};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Variable name under which a loop child sees its item
pub const LOOP_ITEM_VAR: &str = "loopItem";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ACTIVE: [ExecutionStatus; 2] = [ExecutionStatus::Pending, ExecutionStatus::Running];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies which branch or loop item a child execution represents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeContext {
    /// First node the child dispatches
    pub node_id: NodeId,
    /// Position of this child among its siblings
    pub branch: usize,
    #[serde(rename = "loopItem", default, skip_serializing_if = "Option::is_none")]
    pub loop_item: Option<Value>,
    /// Node at which the child's path ends without being dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_at: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Completed,
    Failed,
}

/// One dispatched node, appended to `Execution::execution_log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub node_id: NodeId,
    pub input: Value,
    pub output: Value,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn is_failed(&self) -> bool {
        self.status == LogStatus::Failed
    }
}

/// Runtime state of one flow run (root) or one fan-out branch (child)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub flow_id: FlowId,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seed variables; restored when the execution is retried
    pub initial_context: Variables,
    pub context: Variables,
    pub execution_log: Vec<LogEntry>,
    pub error_message: Option<String>,
    pub parent_execution_id: Option<ExecutionId>,
    pub resume_context: Option<ResumeContext>,
}

impl Execution {
    /// New root execution in `pending`
    pub fn root(flow_id: FlowId, context: Variables) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            initial_context: context.clone(),
            context,
            execution_log: Vec::new(),
            error_message: None,
            parent_execution_id: None,
            resume_context: None,
        }
    }

    /// New child execution seeded from the parent's current context
    pub fn child(parent: &Execution, context: Variables, resume: ResumeContext) -> Self {
        let mut child = Self::root(parent.flow_id, context);
        child.parent_execution_id = Some(parent.id);
        child.resume_context = Some(resume);
        child
    }

    pub fn is_root(&self) -> bool {
        self.parent_execution_id.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Age used for stuck detection; pending executions count from creation
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at.unwrap_or(self.created_at)
    }

    /// Context a handler sees: execution context plus the loop item, if any
    pub fn handler_variables(&self, context: &Variables) -> Variables {
        let mut vars = context.clone();
        if let Some(item) = self.resume_context.as_ref().and_then(|r| r.loop_item.clone()) {
            vars.insert(LOOP_ITEM_VAR.to_string(), item);
        }
        vars
    }
}

/// A status change applied under a `StatusGuard`
#[derive(Debug, Clone)]
pub enum Transition {
    Claim { at: DateTime<Utc> },
    Complete { at: DateTime<Utc> },
    Fail { at: DateTime<Utc>, error: String },
    Cancel { at: DateTime<Utc> },
    /// Back to `pending` for a retry: log, error and timestamps are cleared
    Reset,
}

impl Transition {
    pub fn target(&self) -> ExecutionStatus {
        match self {
            Transition::Claim { .. } => ExecutionStatus::Running,
            Transition::Complete { .. } => ExecutionStatus::Completed,
            Transition::Fail { .. } => ExecutionStatus::Failed,
            Transition::Cancel { .. } => ExecutionStatus::Cancelled,
            Transition::Reset => ExecutionStatus::Pending,
        }
    }

    pub fn apply(self, execution: &mut Execution) {
        execution.status = self.target();
        match self {
            Transition::Claim { at } => {
                execution.started_at = Some(at);
            }
            Transition::Complete { at } | Transition::Cancel { at } => {
                execution.completed_at = Some(at);
            }
            Transition::Fail { at, error } => {
                execution.completed_at = Some(at);
                execution.error_message = Some(error);
            }
            Transition::Reset => {
                execution.started_at = None;
                execution.completed_at = None;
                execution.error_message = None;
                execution.execution_log.clear();
                execution.context = execution.initial_context.clone();
                execution.created_at = Utc::now();
            }
        }
    }
}

/// Compare-and-set precondition for a status transition or log append
#[derive(Debug, Clone)]
pub struct StatusGuard {
    pub expected: Vec<ExecutionStatus>,
    /// When set, the record must still carry this claim time
    pub started_at: Option<DateTime<Utc>>,
}

impl StatusGuard {
    pub fn any_of(statuses: &[ExecutionStatus]) -> Self {
        Self {
            expected: statuses.to_vec(),
            started_at: None,
        }
    }

    /// The run that claimed the execution at `started_at` still owns it
    pub fn claimed(started_at: DateTime<Utc>) -> Self {
        Self {
            expected: vec![ExecutionStatus::Running],
            started_at: Some(started_at),
        }
    }

    pub fn with_started_at(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.expected.contains(&execution.status)
            && self
                .started_at
                .map_or(true, |claimed| execution.started_at == Some(claimed))
    }

    pub fn conflict(&self, execution: &Execution) -> FlowError {
        FlowError::ConcurrencyConflict {
            execution_id: execution.id,
            expected: self.expected.clone(),
            actual: execution.status,
        }
    }
}
