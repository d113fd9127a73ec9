//! Workflow compiler: definition document in, executable plan out.
//!
//! # Compilation Process
//!
//! 1. **Nodes**: resolve each node type, validate its config against the type's
//!    JSON schema and build the typed [`NodeKind`]
//! 2. **Loop bodies**: assign body members to their loop node
//! 3. **Edges**: derive condition and merge edges from node configs, normalize
//!    declared edges and reject the ones that cross loop body boundaries
//! 4. **Graph**: build the petgraph structure and verify it is acyclic

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    time::Duration,
};

use petgraph::graph::DiGraph;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{
    CompileError,
    hitl::ApprovalPolicy,
    model::{NodeModel, WorkflowModel},
    workflow::{
        edge::{Edge, SourceHandle},
        eval::LoopBound,
        node::{
            AgentConfig, ConditionConfig, DelayConfig, FailurePolicy, FilterConfig, LoopConfig, LoopConfigDoc, MergeConfig, Node, NodeId, NodeKind, NodeType,
            config_schema,
        },
        plan::ExecutionPlan,
    },
};

/// Iteration cap for loops that declare no `max_iterations`.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 100;

type CompileResult<T> = std::result::Result<T, CompileError>;

/// Compile a definition with default limits.
pub fn compile(model: &WorkflowModel) -> CompileResult<ExecutionPlan> {
    Compiler::new(DEFAULT_MAX_LOOP_ITERATIONS).compile(model)
}

/// Workflow compiler that turns definitions into execution plans.
#[derive(Debug, Clone)]
pub struct Compiler {
    max_loop_iterations: u32,
}

impl Compiler {
    pub fn new(max_loop_iterations: u32) -> Self {
        Self {
            max_loop_iterations: max_loop_iterations.max(1),
        }
    }

    pub fn compile(
        &self,
        model: &WorkflowModel,
    ) -> CompileResult<ExecutionPlan> {
        let mut nodes = Vec::with_capacity(model.nodes.len());
        let mut ids = HashSet::new();
        for (index, node_model) in model.nodes.iter().enumerate() {
            if !ids.insert(node_model.id.clone()) {
                return Err(CompileError::DuplicateNode {
                    node: node_model.id.clone(),
                });
            }
            nodes.push(self.compile_node(index, node_model)?);
        }

        if !nodes.iter().any(|n| matches!(n.kind, NodeKind::Trigger)) {
            return Err(CompileError::MissingTrigger);
        }

        assign_loop_bodies(&mut nodes)?;

        let lookup: HashMap<NodeId, &Node> = nodes.iter().map(|n| (n.id.clone(), n)).collect();
        let mut edges = EdgeSet::default();

        // edges implied by node configs
        for node in &nodes {
            match &node.kind {
                NodeKind::Condition(config) => {
                    for target in [&config.if_true, &config.if_false] {
                        if !lookup.contains_key(target) {
                            return Err(CompileError::UnknownReference {
                                node: node.id.clone(),
                                reference: target.clone(),
                            });
                        }
                    }
                    if config.if_true == config.if_false {
                        return Err(CompileError::InvalidEdge {
                            from: node.id.clone(),
                            to: config.if_true.clone(),
                            reason: "if_true and if_false must name different nodes".into(),
                        });
                    }
                    edges.add(&lookup, Edge::new(node.id.clone(), config.if_true.clone(), SourceHandle::True))?;
                    edges.add(&lookup, Edge::new(node.id.clone(), config.if_false.clone(), SourceHandle::False))?;
                }
                NodeKind::Merge(config) => {
                    for input in &config.inputs {
                        if !lookup.contains_key(input) {
                            return Err(CompileError::UnknownReference {
                                node: node.id.clone(),
                                reference: input.clone(),
                            });
                        }
                        edges.add(&lookup, Edge::new(input.clone(), node.id.clone(), SourceHandle::Source))?;
                    }
                }
                _ => {}
            }
        }

        // declared edges
        for edge_model in &model.edges {
            if !lookup.contains_key(&edge_model.source) {
                return Err(CompileError::UnknownReference {
                    node: edge_model.target.clone(),
                    reference: edge_model.source.clone(),
                });
            }
            if !lookup.contains_key(&edge_model.target) {
                return Err(CompileError::UnknownReference {
                    node: edge_model.source.clone(),
                    reference: edge_model.target.clone(),
                });
            }
            let handle = match &edge_model.source_handle {
                None => SourceHandle::Source,
                Some(h) => SourceHandle::from_str(h).map_err(|_| CompileError::InvalidEdge {
                    from: edge_model.source.clone(),
                    to: edge_model.target.clone(),
                    reason: format!("unknown source handle '{}'", h),
                })?,
            };
            let mut edge = Edge::new(edge_model.source.clone(), edge_model.target.clone(), handle);
            if !edge_model.id.is_empty() {
                edge.id = edge_model.id.clone();
            }
            edges.add(&lookup, edge)?;
        }

        // every body member without a predecessor inside the body is an iteration entry
        for node in &nodes {
            let NodeKind::Loop(config) = &node.kind else {
                continue;
            };
            for member in &config.body {
                if !edges.has_incoming(member) {
                    edges.add(&lookup, Edge::new(node.id.clone(), member.clone(), SourceHandle::Body))?;
                }
            }
        }

        for node in &nodes {
            if !matches!(node.kind, NodeKind::Trigger) && !edges.has_incoming(&node.id) {
                return Err(CompileError::Unreachable {
                    node: node.id.clone(),
                });
            }
        }

        drop(lookup);
        build_plan(model, nodes, edges)
    }

    fn compile_node(
        &self,
        index: usize,
        model: &NodeModel,
    ) -> CompileResult<Node> {
        let node_type = NodeType::from_str(&model.node_type).map_err(|_| CompileError::UnknownNodeType {
            node: model.id.clone(),
            node_type: model.node_type.clone(),
        })?;

        let missing = |reason: String| CompileError::MissingConfig {
            node: model.id.clone(),
            reason,
        };

        let config = match (&model.config, node_type) {
            (Value::Null, NodeType::Trigger | NodeType::Delay) => Value::Object(Default::default()),
            (config, _) => config.clone(),
        };
        jsonschema::validate(&config_schema(node_type), &config).map_err(|e| missing(e.to_string()))?;

        let kind = match node_type {
            NodeType::Trigger => NodeKind::Trigger,
            NodeType::Agent => NodeKind::Agent(parse_config::<AgentConfig>(&model.id, &config)?),
            NodeType::Condition => NodeKind::Condition(parse_config::<ConditionConfig>(&model.id, &config)?),
            NodeType::Loop => NodeKind::Loop(self.loop_config(&model.id, parse_config::<LoopConfigDoc>(&model.id, &config)?)?),
            NodeType::Filter => NodeKind::Filter(parse_config::<FilterConfig>(&model.id, &config)?),
            NodeType::Merge => NodeKind::Merge(parse_config::<MergeConfig>(&model.id, &config)?),
            NodeType::Delay => {
                let delay = parse_config::<DelayConfig>(&model.id, &config)?;
                if delay.duration().is_zero() {
                    return Err(missing("delay needs a non-zero seconds or millis".into()));
                }
                NodeKind::Delay(delay)
            }
        };

        let timeout = match model.timeout {
            Some(0) => return Err(missing("timeout must be positive".into())),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };

        let failure_policy = match &model.failure_policy {
            Some(value) => serde_json::from_value::<FailurePolicy>(value.clone()).map_err(|e| missing(format!("invalid failure policy: {}", e)))?,
            None => FailurePolicy::default(),
        };
        if let FailurePolicy::Retry {
            max_attempts: 0,
            ..
        } = failure_policy
        {
            return Err(missing("retry policy needs max_attempts >= 1".into()));
        }

        let approval = match &model.approval {
            Some(_) if node_type != NodeType::Agent => {
                return Err(missing("approval gates are only supported on agent nodes".into()));
            }
            Some(value) => {
                let policy = serde_json::from_value::<ApprovalPolicy>(value.clone()).map_err(|e| missing(format!("invalid approval policy: {}", e)))?;
                policy.validate().map_err(missing)?;
                Some(policy)
            }
            None => None,
        };

        Ok(Node {
            id: model.id.clone(),
            title: if model.title.is_empty() { model.id.clone() } else { model.title.clone() },
            index,
            kind,
            timeout,
            failure_policy,
            approval,
            loop_owner: None,
        })
    }

    fn loop_config(
        &self,
        node: &str,
        doc: LoopConfigDoc,
    ) -> CompileResult<LoopConfig> {
        let conflict = |reason: String| CompileError::ConflictingLoopBound {
            node: node.to_string(),
            reason,
        };

        let mut bounds = Vec::new();
        if let Some(n) = doc.iterations {
            bounds.push(LoopBound::Count(n));
        }
        if let Some(path) = doc.collection {
            bounds.push(LoopBound::ForEach(path));
        }
        if let Some(predicate) = doc.while_predicate {
            bounds.push(LoopBound::While(predicate));
        }

        let bound = match bounds.len() {
            0 => {
                return Err(CompileError::MissingConfig {
                    node: node.to_string(),
                    reason: "loop needs one of iterations, collection or while".into(),
                });
            }
            1 => bounds.remove(0),
            _ => return Err(conflict("only one of iterations, collection or while may be set".into())),
        };

        let max_iterations = doc.max_iterations.unwrap_or(self.max_loop_iterations);
        if let LoopBound::Count(n) = bound {
            if n == 0 {
                return Err(conflict("iterations must be at least 1".into()));
            }
            if n > max_iterations {
                return Err(conflict(format!("iterations {} exceed max_iterations {}", n, max_iterations)));
            }
        }

        Ok(LoopConfig {
            body: doc.body,
            bound,
            max_iterations,
        })
    }
}

fn parse_config<T: DeserializeOwned>(
    node: &str,
    config: &Value,
) -> CompileResult<T> {
    serde_json::from_value(config.clone()).map_err(|e| CompileError::MissingConfig {
        node: node.to_string(),
        reason: e.to_string(),
    })
}

fn assign_loop_bodies(nodes: &mut [Node]) -> CompileResult<()> {
    let index: HashMap<NodeId, usize> = nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), i)).collect();

    let mut owners: Vec<(usize, NodeId)> = Vec::new();
    for node in nodes.iter() {
        let NodeKind::Loop(config) = &node.kind else {
            continue;
        };
        let invalid = |reason: String| CompileError::InvalidLoopBody {
            node: node.id.clone(),
            reason,
        };

        let mut seen = HashSet::new();
        for member in &config.body {
            let Some(&i) = index.get(member) else {
                return Err(CompileError::UnknownReference {
                    node: node.id.clone(),
                    reference: member.clone(),
                });
            };
            if !seen.insert(member) {
                return Err(invalid(format!("'{}' is listed twice", member)));
            }
            if *member == node.id {
                return Err(invalid("a loop cannot contain itself".into()));
            }
            match nodes[i].kind {
                NodeKind::Trigger => return Err(invalid(format!("trigger '{}' cannot be part of a loop body", member))),
                NodeKind::Loop(_) => return Err(invalid(format!("nested loop '{}' is not supported", member))),
                _ => {}
            }
            if let Some((_, other)) = owners.iter().find(|(j, _)| *j == i) {
                return Err(invalid(format!("'{}' already belongs to loop '{}'", member, other)));
            }
            owners.push((i, node.id.clone()));
        }
    }

    for (i, owner) in owners {
        nodes[i].loop_owner = Some(owner);
    }
    Ok(())
}

/// Normalized, deduplicated edge list plus the dropped loop back-edges.
#[derive(Default)]
struct EdgeSet {
    edges: Vec<Edge>,
    keys: HashSet<(NodeId, NodeId, SourceHandle)>,
    back_edges: Vec<Edge>,
}

impl EdgeSet {
    fn has_incoming(
        &self,
        id: &str,
    ) -> bool {
        self.edges.iter().any(|e| e.target == id)
    }

    fn add(
        &mut self,
        nodes: &HashMap<NodeId, &Node>,
        mut edge: Edge,
    ) -> CompileResult<()> {
        let invalid = |edge: &Edge, reason: &str| CompileError::InvalidEdge {
            from: edge.source.clone(),
            to: edge.target.clone(),
            reason: reason.to_string(),
        };

        let (Some(source), Some(target)) = (nodes.get(&edge.source), nodes.get(&edge.target)) else {
            return Err(CompileError::UnknownReference {
                node: edge.source.clone(),
                reference: edge.target.clone(),
            });
        };

        if source.id == target.id {
            return Err(CompileError::CycleDetected {
                node: source.id.clone(),
            });
        }
        if matches!(target.kind, NodeKind::Trigger) {
            return Err(invalid(&edge, "trigger nodes cannot have predecessors"));
        }

        // body -> own loop closes the iteration; it is implied, never a graph edge
        if target.loop_owner.is_none() && source.loop_owner.as_deref() == Some(target.id.as_str()) {
            debug!(from = %edge.source, to = %edge.target, "keeping loop back-edge out of the plan graph");
            self.back_edges.push(edge);
            return Ok(());
        }

        match &source.kind {
            NodeKind::Condition(config) => {
                edge.source_handle = match edge.source_handle {
                    SourceHandle::Source if target.id == config.if_true => SourceHandle::True,
                    SourceHandle::Source if target.id == config.if_false => SourceHandle::False,
                    SourceHandle::True if target.id == config.if_true => SourceHandle::True,
                    SourceHandle::False if target.id == config.if_false => SourceHandle::False,
                    _ => return Err(invalid(&edge, "condition edges must match the node's if_true/if_false targets")),
                };
            }
            NodeKind::Loop(_) if target.loop_owner.as_deref() == Some(source.id.as_str()) => {
                edge.source_handle = SourceHandle::Body;
            }
            _ if matches!(edge.source_handle, SourceHandle::True | SourceHandle::False) => {
                return Err(invalid(&edge, "true/false handles are only valid on condition nodes"));
            }
            _ if edge.source_handle == SourceHandle::Body => {
                return Err(invalid(&edge, "body handles must point from a loop node into its own body"));
            }
            _ => {}
        }

        if edge.source_handle != SourceHandle::Body && source.loop_owner != target.loop_owner {
            let owner = source.loop_owner.clone().or_else(|| target.loop_owner.clone()).unwrap_or_default();
            return Err(CompileError::InvalidLoopBody {
                node: owner,
                reason: format!("edge {} -> {} crosses the body boundary", edge.source, edge.target),
            });
        }

        if let NodeKind::Merge(config) = &target.kind {
            if !config.inputs.contains(&source.id) {
                return Err(invalid(&edge, "merge predecessors must be listed in the merge inputs"));
            }
        }

        if self.keys.insert((edge.source.clone(), edge.target.clone(), edge.source_handle)) {
            self.edges.push(edge);
        }
        Ok(())
    }
}

fn build_plan(
    model: &WorkflowModel,
    nodes: Vec<Node>,
    edges: EdgeSet,
) -> CompileResult<ExecutionPlan> {
    let mut graph: DiGraph<Node, Edge> = DiGraph::new();
    let mut index = HashMap::new();
    let mut order = Vec::with_capacity(nodes.len());

    for node in nodes {
        let nid = node.id.clone();
        order.push(nid.clone());
        index.insert(nid, graph.add_node(node));
    }
    for edge in edges.edges {
        let (Some(from), Some(to)) = (index.get(&edge.source), index.get(&edge.target)) else {
            return Err(CompileError::UnknownReference {
                node: edge.source.clone(),
                reference: edge.target.clone(),
            });
        };
        graph.add_edge(*from, *to, edge);
    }

    let topo = petgraph::algo::toposort(&graph, None)
        .map_err(|cycle| CompileError::CycleDetected {
            node: graph[cycle.node_id()].id.clone(),
        })?
        .into_iter()
        .map(|idx| graph[idx].id.clone())
        .collect();

    Ok(ExecutionPlan {
        id: model.id.clone(),
        name: model.name.clone(),
        mode: model.execution_mode,
        concurrency: model.concurrency,
        retention_secs: model.retention_secs,
        env: model.env.clone(),
        graph,
        index,
        order,
        topo,
        back_edges: edges.back_edges,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::WorkflowModel;

    fn model(value: Value) -> WorkflowModel {
        serde_json::from_value(value).unwrap()
    }

    fn branching() -> Value {
        json!({
            "id": "wf",
            "name": "branching",
            "execution_mode": "conditional",
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "a", "type": "agent", "config": { "agent_id": "scorer" } },
                { "id": "check", "type": "condition", "config": { "field": "score", "operator": "greater_than", "value": 0.8, "if_true": "b", "if_false": "c" } },
                { "id": "b", "type": "agent", "config": { "agent_id": "writer" } },
                { "id": "c", "type": "agent", "config": { "agent_id": "reviewer" } },
                { "id": "m", "type": "merge", "config": { "inputs": ["b", "c"] } }
            ],
            "edges": [
                { "source": "start", "target": "a" },
                { "source": "a", "target": "check" }
            ]
        })
    }

    #[test]
    fn test_compile_branching() {
        let plan = compile(&model(branching())).unwrap();
        assert_eq!(plan.node_count(), 6);
        let handles: Vec<_> = plan.outgoing("check").iter().map(|e| (e.target.clone(), e.source_handle)).collect();
        assert!(handles.contains(&("b".to_string(), SourceHandle::True)));
        assert!(handles.contains(&("c".to_string(), SourceHandle::False)));
        assert_eq!(plan.predecessors("m").len(), 2);
        assert_eq!(plan.sinks(), vec!["m"]);
        assert!(plan.schema().contains("check -> "));
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let plan = compile(&model(branching())).unwrap();
        let position = |id: &str| plan.topological_order().iter().position(|n| n == id).unwrap();
        for node in plan.nodes() {
            for succ in plan.successors(&node.id) {
                assert!(position(&node.id) < position(succ), "{} must precede {}", node.id, succ);
            }
        }
    }

    #[test]
    fn test_declared_condition_edges_are_normalized() {
        let mut doc = branching();
        doc["edges"].as_array_mut().unwrap().push(json!({ "source": "check", "target": "b" }));
        doc["edges"].as_array_mut().unwrap().push(json!({ "source": "check", "target": "c", "source_handle": "false" }));
        let plan = compile(&model(doc)).unwrap();
        assert_eq!(plan.outgoing("check").len(), 2);

        let mut doc = branching();
        doc["edges"].as_array_mut().unwrap().push(json!({ "source": "check", "target": "b", "source_handle": "false" }));
        assert!(matches!(compile(&model(doc)), Err(CompileError::InvalidEdge { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let doc = json!({
            "id": "wf", "name": "cycle",
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "a", "type": "agent", "config": { "agent_id": "x" } },
                { "id": "b", "type": "agent", "config": { "agent_id": "y" } }
            ],
            "edges": [
                { "source": "start", "target": "a" },
                { "source": "a", "target": "b" },
                { "source": "b", "target": "a" }
            ]
        });
        assert!(matches!(compile(&model(doc)), Err(CompileError::CycleDetected { .. })));
    }

    #[test]
    fn test_loop_back_edge_tolerated() {
        let doc = json!({
            "id": "wf", "name": "loop",
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "repeat", "type": "loop", "config": { "body": ["work", "tidy"], "iterations": 3 } },
                { "id": "work", "type": "agent", "config": { "agent_id": "x" } },
                { "id": "tidy", "type": "agent", "config": { "agent_id": "y" } },
                { "id": "done", "type": "agent", "config": { "agent_id": "z" } }
            ],
            "edges": [
                { "source": "start", "target": "repeat" },
                { "source": "repeat", "target": "work" },
                { "source": "work", "target": "tidy" },
                { "source": "tidy", "target": "repeat" },
                { "source": "repeat", "target": "done" }
            ]
        });
        let plan = compile(&model(doc)).unwrap();
        assert_eq!(plan.back_edges().len(), 1);
        assert_eq!(plan.body_of("repeat"), ["work".to_string(), "tidy".to_string()]);
        assert_eq!(plan.body_sinks("repeat"), vec!["tidy"]);
        assert_eq!(plan.node("work").unwrap().loop_owner.as_deref(), Some("repeat"));
        let body_edges: Vec<_> = plan.outgoing("repeat").iter().filter(|e| e.source_handle == SourceHandle::Body).map(|e| e.target.clone()).collect();
        assert_eq!(body_edges, vec!["work"]);
        assert_eq!(plan.sinks(), vec!["done"]);
    }

    #[test]
    fn test_body_entry_edges_are_implied() {
        let doc = json!({
            "id": "wf", "name": "loop",
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "each", "type": "loop", "config": { "body": ["work"], "collection": "items" } },
                { "id": "work", "type": "agent", "config": { "agent_id": "x" } }
            ],
            "edges": [{ "source": "start", "target": "each" }]
        });
        let plan = compile(&model(doc)).unwrap();
        assert_eq!(plan.predecessors("work"), vec!["each"]);
    }

    #[test]
    fn test_loop_bounds() {
        let base = |config: Value| {
            model(json!({
                "id": "wf", "name": "loop",
                "nodes": [
                    { "id": "start", "type": "trigger" },
                    { "id": "l", "type": "loop", "config": config },
                    { "id": "w", "type": "agent", "config": { "agent_id": "x" } }
                ],
                "edges": [{ "source": "start", "target": "l" }]
            }))
        };
        assert!(matches!(
            compile(&base(json!({ "body": ["w"], "iterations": 2, "collection": "items" }))),
            Err(CompileError::ConflictingLoopBound { .. })
        ));
        assert!(matches!(compile(&base(json!({ "body": ["w"], "iterations": 0 }))), Err(CompileError::ConflictingLoopBound { .. })));
        assert!(matches!(
            compile(&base(json!({ "body": ["w"], "iterations": 20, "max_iterations": 10 }))),
            Err(CompileError::ConflictingLoopBound { .. })
        ));
        assert!(matches!(compile(&base(json!({ "body": ["w"] }))), Err(CompileError::MissingConfig { .. })));
        assert!(matches!(compile(&base(json!({ "body": ["nope"], "iterations": 1 }))), Err(CompileError::UnknownReference { .. })));
        assert!(
            compile(&base(json!({ "body": ["w"], "while": { "field": "index", "operator": "less_than", "value": 3 } })))
                .is_ok()
        );
    }

    #[test]
    fn test_edge_leaving_body_rejected() {
        let doc = json!({
            "id": "wf", "name": "loop",
            "nodes": [
                { "id": "start", "type": "trigger" },
                { "id": "l", "type": "loop", "config": { "body": ["w"], "iterations": 2 } },
                { "id": "w", "type": "agent", "config": { "agent_id": "x" } },
                { "id": "after", "type": "agent", "config": { "agent_id": "y" } }
            ],
            "edges": [
                { "source": "start", "target": "l" },
                { "source": "w", "target": "after" }
            ]
        });
        assert!(matches!(compile(&model(doc)), Err(CompileError::InvalidLoopBody { .. })));
    }

    #[test]
    fn test_structural_errors() {
        let no_trigger = json!({ "id": "wf", "name": "x", "nodes": [{ "id": "a", "type": "agent", "config": { "agent_id": "x" } }] });
        assert_eq!(compile(&model(no_trigger)).unwrap_err(), CompileError::MissingTrigger);

        let unknown_type = json!({ "id": "wf", "name": "x", "nodes": [{ "id": "a", "type": "webhook" }] });
        assert!(matches!(compile(&model(unknown_type)), Err(CompileError::UnknownNodeType { .. })));

        let duplicate = json!({ "id": "wf", "name": "x", "nodes": [{ "id": "a", "type": "trigger" }, { "id": "a", "type": "trigger" }] });
        assert!(matches!(compile(&model(duplicate)), Err(CompileError::DuplicateNode { .. })));

        let missing_agent = json!({
            "id": "wf", "name": "x",
            "nodes": [{ "id": "s", "type": "trigger" }, { "id": "a", "type": "agent", "config": {} }],
            "edges": [{ "source": "s", "target": "a" }]
        });
        assert!(matches!(compile(&model(missing_agent)), Err(CompileError::MissingConfig { .. })));

        let dangling = json!({
            "id": "wf", "name": "x",
            "nodes": [{ "id": "s", "type": "trigger" }],
            "edges": [{ "source": "s", "target": "ghost" }]
        });
        assert!(matches!(compile(&model(dangling)), Err(CompileError::UnknownReference { .. })));

        let orphan = json!({
            "id": "wf", "name": "x",
            "nodes": [{ "id": "s", "type": "trigger" }, { "id": "a", "type": "agent", "config": { "agent_id": "x" } }]
        });
        assert!(matches!(compile(&model(orphan)), Err(CompileError::Unreachable { .. })));
    }

    #[test]
    fn test_policies_parsed() {
        let doc = json!({
            "id": "wf", "name": "x",
            "nodes": [
                { "id": "s", "type": "trigger" },
                {
                    "id": "a", "type": "agent", "timeout": 5000,
                    "config": { "agent_id": "x" },
                    "failure_policy": { "strategy": "retry", "max_attempts": 2, "backoff_ms": 10 },
                    "approval": { "mode": "threshold", "threshold": 0.7 }
                }
            ],
            "edges": [{ "source": "s", "target": "a" }]
        });
        let plan = compile(&model(doc)).unwrap();
        let node = plan.node("a").unwrap();
        assert_eq!(node.timeout, Some(Duration::from_secs(5)));
        assert!(matches!(node.failure_policy, FailurePolicy::Retry { max_attempts: 2, backoff_ms: 10 }));
        assert_eq!(node.approval.as_ref().unwrap().threshold, 0.7);

        let gated_delay = json!({
            "id": "wf", "name": "x",
            "nodes": [{ "id": "s", "type": "trigger" }, { "id": "d", "type": "delay", "config": { "seconds": 1 }, "approval": { "mode": "pre_approval" } }],
            "edges": [{ "source": "s", "target": "d" }]
        });
        assert!(matches!(compile(&model(gated_delay)), Err(CompileError::MissingConfig { .. })));
    }
}
