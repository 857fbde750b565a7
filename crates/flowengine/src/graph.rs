//! Structural validation and navigation of a flow snapshot

use flowcore::{
    ConditionSpec, Edge, Flow, Node, NodeKind, ValidationError, Value, LOOP_BODY_LABEL,
    LOOP_DONE_LABEL,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, NodeFiltered};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Validated, indexed view over a flow
///
/// Built once per root execution and shared with every child it spawns, so
/// all branches of a run see the same snapshot.
#[derive(Debug)]
pub struct FlowGraph {
    flow: Arc<Flow>,
    index: HashMap<String, usize>,
    /// Outgoing edge positions per node, in declaration order
    outgoing: Vec<Vec<usize>>,
    entry: usize,
}

impl FlowGraph {
    pub fn build(flow: Arc<Flow>) -> Result<Self, ValidationError> {
        let mut graph: DiGraph<usize, usize> = DiGraph::new();
        let mut index = HashMap::new();

        for (pos, node) in flow.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), pos).is_some() {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            graph.add_node(pos);
        }

        let mut outgoing = vec![Vec::new(); flow.nodes.len()];
        for (pos, edge) in flow.edges.iter().enumerate() {
            let from = lookup_endpoint(&index, edge, &edge.from_node_id)?;
            let to = lookup_endpoint(&index, edge, &edge.to_node_id)?;
            graph.add_edge(NodeIndex::new(from), NodeIndex::new(to), pos);
            outgoing[from].push(pos);
        }

        let triggers: Vec<usize> = flow
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Trigger)
            .map(|(pos, _)| pos)
            .collect();
        let entry = match triggers.as_slice() {
            [] => return Err(ValidationError::MissingTrigger),
            [only] => *only,
            many => {
                return Err(ValidationError::MultipleTriggers(
                    many.iter().map(|&p| flow.nodes[p].id.clone()).collect(),
                ))
            }
        };

        if flow
            .edges
            .iter()
            .any(|e| e.to_node_id == flow.nodes[entry].id)
        {
            return Err(ValidationError::TriggerHasIncoming(
                flow.nodes[entry].id.clone(),
            ));
        }

        let mut reached = HashSet::new();
        let mut dfs = Dfs::new(&graph, NodeIndex::new(entry));
        while let Some(nx) = dfs.next(&graph) {
            reached.insert(nx.index());
        }
        if let Some(node) = flow
            .nodes
            .iter()
            .enumerate()
            .find(|(pos, _)| !reached.contains(pos))
            .map(|(_, n)| n)
        {
            return Err(ValidationError::Unreachable(node.id.clone()));
        }

        // The only legal cycle is a Loop body returning to its own Loop node.
        // Such back-edges are dropped; whatever cycle remains is illegal.
        let bodies = loop_bodies(&flow, &index, &graph);
        let mut acyclic: DiGraph<usize, ()> = DiGraph::new();
        for pos in 0..flow.nodes.len() {
            acyclic.add_node(pos);
        }
        for edge in &flow.edges {
            let from = index[&edge.from_node_id];
            let to = index[&edge.to_node_id];
            if bodies.get(&to).is_some_and(|body| body.contains(&from)) {
                continue;
            }
            acyclic.add_edge(NodeIndex::new(from), NodeIndex::new(to), ());
        }
        if let Err(cycle) = toposort(&acyclic, None) {
            return Err(ValidationError::Cycle(
                flow.nodes[cycle.node_id().index()].id.clone(),
            ));
        }

        let built = Self {
            flow,
            index,
            outgoing,
            entry,
        };
        for node in &built.flow.nodes {
            built.check_node(node)?;
        }
        Ok(built)
    }

    fn check_node(&self, node: &Node) -> Result<(), ValidationError> {
        let edges = self.outgoing(&node.id);
        let too_many = |max: usize| ValidationError::TooManyEdges {
            node_id: node.id.clone(),
            max,
            found: edges.len(),
        };
        let invalid = |reason: &str| ValidationError::InvalidConfig {
            node_id: node.id.clone(),
            reason: reason.to_string(),
        };

        match &node.kind {
            NodeKind::Trigger | NodeKind::Action { .. } if edges.len() > 1 => Err(too_many(1)),
            NodeKind::Terminal if !edges.is_empty() => Err(too_many(0)),
            NodeKind::Condition => {
                let mut labels = HashSet::new();
                for edge in &edges {
                    let label = edge
                        .condition_label
                        .as_deref()
                        .ok_or_else(|| ValidationError::UnlabelledConditionEdge(node.id.clone()))?;
                    if !labels.insert(label) {
                        return Err(ValidationError::DuplicateLabel {
                            node_id: node.id.clone(),
                            label: label.to_string(),
                        });
                    }
                }
                let spec = ConditionSpec::from_config(&node.config)
                    .map_err(|e| invalid(&e.to_string()))?;
                if let Some(label) = spec.labels().find(|l| !labels.contains(l)) {
                    return Err(ValidationError::UnresolvedLabel {
                        node_id: node.id.clone(),
                        label: label.to_string(),
                    });
                }
                Ok(())
            }
            NodeKind::Parallel => {
                if edges.is_empty() {
                    return Err(invalid("parallel node has no branches"));
                }
                match node.config.get("join") {
                    None => Ok(()),
                    Some(Value::String(join)) if self.index.contains_key(join) => Ok(()),
                    Some(_) => Err(invalid("join must name a node of this flow")),
                }
            }
            NodeKind::Loop => {
                let body = edges
                    .iter()
                    .filter(|e| e.condition_label.as_deref() == Some(LOOP_BODY_LABEL))
                    .count();
                let done = edges
                    .iter()
                    .filter(|e| e.condition_label.as_deref() == Some(LOOP_DONE_LABEL))
                    .count();
                if body != 1 {
                    return Err(invalid("loop node needs exactly one 'body' edge"));
                }
                if done > 1 || body + done != edges.len() {
                    return Err(invalid("loop node edges must be labelled 'body' or 'done'"));
                }
                match node.config.get("items") {
                    Some(Value::Array(_)) | Some(Value::String(_)) => Ok(()),
                    _ => Err(invalid("items must be an array or a variable path")),
                }
            }
            _ => Ok(()),
        }
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    /// The single trigger node
    pub fn entry(&self) -> &Node {
        &self.flow.nodes[self.entry]
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&pos| &self.flow.nodes[pos])
    }

    /// Outgoing edges of a node, in declaration order
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.index
            .get(id)
            .map(|&pos| {
                self.outgoing[pos]
                    .iter()
                    .map(|&e| &self.flow.edges[e])
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn edge_labelled(&self, id: &str, label: &str) -> Option<&Edge> {
        self.outgoing(id)
            .into_iter()
            .find(|e| e.condition_label.as_deref() == Some(label))
    }
}

/// Nodes reachable from each Loop's `body` edge without passing through
/// that Loop again, keyed by the Loop's position
fn loop_bodies(
    flow: &Flow,
    index: &HashMap<String, usize>,
    graph: &DiGraph<usize, usize>,
) -> HashMap<usize, HashSet<usize>> {
    let mut bodies = HashMap::new();
    for (pos, node) in flow.nodes.iter().enumerate() {
        if node.kind != NodeKind::Loop {
            continue;
        }
        let looping = NodeIndex::new(pos);
        let without_loop = NodeFiltered::from_fn(graph, |nx| nx != looping);
        let mut body = HashSet::new();

        for edge in flow.edges.iter().filter(|e| {
            e.from_node_id == node.id && e.condition_label.as_deref() == Some(LOOP_BODY_LABEL)
        }) {
            let start = NodeIndex::new(index[&edge.to_node_id]);
            if start == looping {
                continue;
            }
            let mut dfs = Dfs::new(&without_loop, start);
            while let Some(nx) = dfs.next(&without_loop) {
                body.insert(nx.index());
            }
        }
        bodies.insert(pos, body);
    }
    bodies
}

fn lookup_endpoint(
    index: &HashMap<String, usize>,
    edge: &Edge,
    endpoint: &str,
) -> Result<usize, ValidationError> {
    index
        .get(endpoint)
        .copied()
        .ok_or_else(|| ValidationError::DanglingEdge {
            from: edge.from_node_id.clone(),
            to: edge.to_node_id.clone(),
            missing: endpoint.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::Node;

    fn linear() -> Flow {
        let mut flow = Flow::new("linear");
        flow.add_node(Node::trigger("start"));
        flow.add_node(Node::action("classify", "ai.classify"));
        flow.add_node(Node::action("notify", "notify.send"));
        flow.connect("start", "classify");
        flow.connect("classify", "notify");
        flow
    }

    fn build(flow: Flow) -> Result<FlowGraph, ValidationError> {
        FlowGraph::build(Arc::new(flow))
    }

    #[test]
    fn linear_flow_is_valid() {
        let graph = build(linear()).unwrap();
        assert_eq!(graph.entry().id, "start");
        assert_eq!(graph.outgoing("classify")[0].to_node_id, "notify");
        assert!(graph.outgoing("notify").is_empty());
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut flow = linear();
        flow.connect("notify", "ghost");
        assert!(matches!(
            build(flow),
            Err(ValidationError::DanglingEdge { missing, .. }) if missing == "ghost"
        ));
    }

    #[test]
    fn trigger_count_is_enforced() {
        let mut flow = linear();
        flow.nodes.retain(|n| n.id != "start");
        flow.edges.retain(|e| e.from_node_id != "start");
        assert_eq!(build(flow).unwrap_err(), ValidationError::MissingTrigger);

        let mut flow = linear();
        flow.add_node(Node::trigger("webhook"));
        assert!(matches!(build(flow), Err(ValidationError::MultipleTriggers(_))));
    }

    #[test]
    fn unreachable_node_is_rejected() {
        let mut flow = linear();
        flow.add_node(Node::terminal("orphan"));
        assert_eq!(
            build(flow).unwrap_err(),
            ValidationError::Unreachable("orphan".to_string())
        );
    }

    #[test]
    fn plain_cycle_is_rejected_but_loop_cycle_is_allowed() {
        let mut flow = linear();
        flow.add_node(Node::action("again", "noop"));
        flow.edges.clear();
        flow.connect("start", "classify");
        flow.connect("classify", "again");
        flow.connect("again", "classify");
        flow.nodes.retain(|n| n.id != "notify");
        assert!(matches!(build(flow), Err(ValidationError::Cycle(_))));

        let mut flow = Flow::new("loop");
        flow.add_node(Node::trigger("start"));
        flow.add_node(Node::looping("each").with_config("items", "articles"));
        flow.add_node(Node::action("score", "ai.score"));
        flow.add_node(Node::terminal("end"));
        flow.connect("start", "each");
        flow.connect_labelled("each", "score", LOOP_BODY_LABEL);
        flow.connect("score", "each");
        flow.connect_labelled("each", "end", LOOP_DONE_LABEL);
        assert!(build(flow).is_ok());
    }

    #[test]
    fn loop_reentered_through_done_is_a_cycle() {
        let mut flow = Flow::new("reenter");
        flow.add_node(Node::trigger("start"));
        flow.add_node(Node::looping("each").with_config("items", "articles"));
        flow.add_node(Node::action("score", "ai.score"));
        flow.add_node(Node::action("again", "noop"));
        flow.connect("start", "each");
        flow.connect_labelled("each", "score", LOOP_BODY_LABEL);
        flow.connect("score", "each");
        flow.connect_labelled("each", "again", LOOP_DONE_LABEL);
        flow.connect("again", "each");
        assert!(matches!(build(flow), Err(ValidationError::Cycle(_))));
    }

    #[test]
    fn loop_bodies_may_nest() {
        let mut flow = Flow::new("nested");
        flow.add_node(Node::trigger("start"));
        flow.add_node(Node::looping("outer").with_config("items", "feeds"));
        flow.add_node(Node::looping("inner").with_config("items", "articles"));
        flow.add_node(Node::action("score", "ai.score"));
        flow.add_node(Node::action("summarise", "ai.summarise"));
        flow.connect("start", "outer");
        flow.connect_labelled("outer", "inner", LOOP_BODY_LABEL);
        flow.connect_labelled("inner", "score", LOOP_BODY_LABEL);
        flow.connect("score", "inner");
        flow.connect_labelled("inner", "summarise", LOOP_DONE_LABEL);
        flow.connect("summarise", "outer");
        assert!(build(flow).is_ok());
    }

    #[test]
    fn action_fan_out_requires_parallel() {
        let mut flow = linear();
        flow.add_node(Node::terminal("end"));
        flow.connect("classify", "end");
        assert!(matches!(
            build(flow),
            Err(ValidationError::TooManyEdges { max: 1, found: 2, .. })
        ));
    }

    #[test]
    fn condition_labels_must_resolve() {
        let rules = Value::from(serde_json::json!([
            {"label": "urgent", "field": "severity", "op": "eq", "value": "high"}
        ]));
        let mut flow = Flow::new("branch");
        flow.add_node(Node::trigger("start"));
        flow.add_node(
            Node::condition("route")
                .with_config("rules", rules)
                .with_config("default", "normal"),
        );
        flow.add_node(Node::terminal("alert"));
        flow.connect("start", "route");
        flow.connect_labelled("route", "alert", "urgent");

        assert_eq!(
            build(flow.clone()).unwrap_err(),
            ValidationError::UnresolvedLabel {
                node_id: "route".to_string(),
                label: "normal".to_string()
            }
        );

        flow.add_node(Node::terminal("archive"));
        flow.connect_labelled("route", "archive", "normal");
        let graph = build(flow).unwrap();
        assert_eq!(graph.edge_labelled("route", "normal").unwrap().to_node_id, "archive");
    }

    #[test]
    fn parallel_join_must_exist() {
        let mut flow = Flow::new("fan");
        flow.add_node(Node::trigger("start"));
        flow.add_node(Node::parallel("fan").with_config("join", "missing"));
        flow.add_node(Node::action("a", "noop"));
        flow.connect("start", "fan");
        flow.connect("fan", "a");
        assert!(matches!(build(flow), Err(ValidationError::InvalidConfig { .. })));
    }
}
