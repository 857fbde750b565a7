use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type FlowId = Uuid;
pub type NodeId = String;

/// Edge label that starts each loop iteration
pub const LOOP_BODY_LABEL: &str = "body";
/// Edge label the parent follows once every loop iteration has joined
pub const LOOP_DONE_LABEL: &str = "done";

/// A stored automation definition
///
/// The engine reads a snapshot of the flow when an execution is claimed and
/// never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default = "Uuid::new_v4")]
    pub id: FlowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            active: true,
        }
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) {
        self.edges.push(Edge::new(from, to));
    }

    pub fn connect_labelled(
        &mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        label: impl Into<String>,
    ) {
        self.edges.push(Edge::new(from, to).with_label(label));
    }

    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node definition inside a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            config: HashMap::new(),
        }
    }

    pub fn trigger(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Trigger)
    }

    pub fn action(id: impl Into<NodeId>, handler: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Action {
                handler: handler.into(),
            },
        )
    }

    pub fn condition(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Condition)
    }

    pub fn parallel(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Parallel)
    }

    pub fn looping(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Loop)
    }

    pub fn terminal(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Terminal)
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Closed set of node kinds; `Action` names the handler that implements it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Action { handler: String },
    Condition,
    Parallel,
    Loop,
    Terminal,
}

impl NodeKind {
    /// Registry key used to resolve the handler for this node
    pub fn handler_key(&self) -> &str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Action { handler } => handler,
            NodeKind::Condition => "condition",
            NodeKind::Parallel => "parallel",
            NodeKind::Loop => "loop",
            NodeKind::Terminal => "terminal",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Action { .. } => "action",
            NodeKind::Condition => "condition",
            NodeKind::Parallel => "parallel",
            NodeKind::Loop => "loop",
            NodeKind::Terminal => "terminal",
        }
    }
}

/// Directed edge between two nodes of the same flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_label: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from_node_id: from.into(),
            to_node_id: to.into(),
            condition_label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.condition_label = Some(label.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_is_flattened_into_node() {
        let json = serde_json::json!({
            "id": "classify",
            "type": "action",
            "handler": "ai.classify",
            "config": {"model": "small"}
        });
        let node: Node = serde_json::from_value(json).unwrap();
        assert_eq!(node.kind.handler_key(), "ai.classify");
        assert_eq!(node.config_str("model"), Some("small"));

        let trigger: Node = serde_json::from_value(serde_json::json!({"id": "t", "type": "trigger"})).unwrap();
        assert_eq!(trigger.kind, NodeKind::Trigger);
        assert!(trigger.config.is_empty());
    }
}
