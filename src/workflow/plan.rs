//! Executable plan produced by the compiler.
//!
//! The plan wraps the definition in a directed graph (petgraph) for
//! dependency lookups. It is immutable once built and shared by every run of
//! the workflow, so it carries no execution state: node run status lives in the
//! run itself.
//!
//! Loop bodies hang off their loop node through [`SourceHandle::Body`] edges.
//! The edges a definition draws from a body back to its loop are kept aside in
//! `back_edges` and never enter the graph, which therefore stays acyclic.

use std::collections::HashMap;

use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex},
};

use crate::{
    ExecutionMode,
    workflow::{
        edge::{Edge, SourceHandle},
        node::{Node, NodeId, NodeKind},
    },
};

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) mode: ExecutionMode,
    pub(crate) concurrency: Option<usize>,
    pub(crate) retention_secs: Option<u64>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) graph: DiGraph<Node, Edge>,
    pub(crate) index: HashMap<NodeId, NodeIndex>,
    /// node ids in definition order
    pub(crate) order: Vec<NodeId>,
    /// node ids in a dependency respecting order
    pub(crate) topo: Vec<NodeId>,
    pub(crate) back_edges: Vec<Edge>,
}

impl ExecutionPlan {
    /// workflow id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// per-run dispatch ceiling declared by the workflow
    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn retention_secs(&self) -> Option<u64> {
        self.retention_secs
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn node(
        &self,
        id: &str,
    ) -> Option<&Node> {
        self.index.get(id).map(|idx| &self.graph[*idx])
    }

    /// All nodes in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.node(id))
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Node ids sorted so that every node comes after all of its predecessors.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.topo
    }

    /// Edges pointing into `id`.
    pub fn incoming(
        &self,
        id: &str,
    ) -> Vec<&Edge> {
        self.edges_directed(id, Direction::Incoming)
    }

    /// Edges leaving `id`.
    pub fn outgoing(
        &self,
        id: &str,
    ) -> Vec<&Edge> {
        self.edges_directed(id, Direction::Outgoing)
    }

    fn edges_directed(
        &self,
        id: &str,
        dir: Direction,
    ) -> Vec<&Edge> {
        self.index.get(id).map(|idx| self.graph.edges_directed(*idx, dir).map(|e| e.weight()).collect()).unwrap_or_default()
    }

    pub fn predecessors(
        &self,
        id: &str,
    ) -> Vec<&NodeId> {
        self.incoming(id).into_iter().map(|e| &e.source).collect()
    }

    pub fn successors(
        &self,
        id: &str,
    ) -> Vec<&NodeId> {
        self.outgoing(id).into_iter().map(|e| &e.target).collect()
    }

    pub fn triggers(&self) -> Vec<&Node> {
        self.nodes().filter(|n| matches!(n.kind, NodeKind::Trigger)).collect()
    }

    /// Body members of a loop node, empty for any other node.
    pub fn body_of(
        &self,
        loop_id: &str,
    ) -> &[NodeId] {
        match self.node(loop_id).map(|n| &n.kind) {
            Some(NodeKind::Loop(config)) => &config.body,
            _ => &[],
        }
    }

    /// Body members that produce an iteration's output (no successor inside the body).
    pub fn body_sinks(
        &self,
        loop_id: &str,
    ) -> Vec<&NodeId> {
        self.body_of(loop_id).iter().filter(|id| self.successors(id).is_empty()).collect()
    }

    /// Top-level nodes with no successors; their outputs form the run output.
    pub fn sinks(&self) -> Vec<&NodeId> {
        self.order
            .iter()
            .filter(|id| self.node(id).is_some_and(|n| !n.in_loop_body()))
            .filter(|id| self.outgoing(id).iter().all(|e| e.source_handle == SourceHandle::Body))
            .collect()
    }

    /// Edges from loop bodies back to their loop node, dropped from the graph.
    pub fn back_edges(&self) -> &[Edge] {
        &self.back_edges
    }

    /// Output a human-readable representation of the plan graph
    pub fn schema(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("=== Plan {} ({}) ===", self.name, self.mode.as_ref()));
        lines.push(format!("Nodes: {}, Edges: {}", self.graph.node_count(), self.graph.edge_count()));
        lines.push(String::new());

        lines.push("--- Nodes ---".to_string());
        for node in self.nodes() {
            match &node.loop_owner {
                Some(owner) => lines.push(format!("[{}] {} (type: {}, loop: {})", node.id, node.title, node.node_type(), owner)),
                None => lines.push(format!("[{}] {} (type: {})", node.id, node.title, node.node_type())),
            }
        }
        lines.push(String::new());

        lines.push("--- Graph Structure ---".to_string());
        for node in self.nodes() {
            let outgoing: Vec<String> = self.outgoing(&node.id).iter().map(|e| format!("{}({})", e.target, e.source_handle.as_ref())).collect();
            if outgoing.is_empty() {
                lines.push(format!("{} -> (end)", node.id));
            } else {
                lines.push(format!("{} -> {}", node.id, outgoing.join(", ")));
            }
        }

        lines.join("\n")
    }
}
