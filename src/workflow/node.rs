//! Compiled node definitions.
//!
//! Every node type carries a typed configuration payload. The raw `config`
//! object from the definition document is validated against the type's JSON
//! schema before it is deserialized, so a node that reaches the coordinator is
//! always well formed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    hitl::ApprovalPolicy,
    workflow::eval::{LoopBound, MergeStrategy, Predicate},
};

/// node id
pub type NodeId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Agent,
    Condition,
    Loop,
    Filter,
    Merge,
    Delay,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// agent the runtime should execute
    pub agent_id: String,
    /// input mapping template, resolved against run data at dispatch time
    #[serde(default)]
    pub inputs: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConditionConfig {
    #[serde(flatten)]
    pub predicate: Predicate,
    pub if_true: NodeId,
    pub if_false: NodeId,
}

/// Raw loop config as written in the definition; exactly one bound may be set.
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct LoopConfigDoc {
    pub body: Vec<NodeId>,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default, rename = "while")]
    pub while_predicate: Option<Predicate>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub body: Vec<NodeId>,
    pub bound: LoopBound,
    /// hard stop for the number of generations
    pub max_iterations: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilterConfig {
    /// path of the array inside the node input, the input itself when absent
    #[serde(default)]
    pub items: Option<String>,
    #[serde(flatten)]
    pub predicate: Predicate,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub inputs: Vec<NodeId>,
    #[serde(default)]
    pub strategy: MergeStrategy,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayConfig {
    #[serde(default)]
    pub seconds: u64,
    #[serde(default)]
    pub millis: u64,
}

impl DelayConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds) + Duration::from_millis(self.millis)
    }
}

/// Closed set of node kinds with their typed configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger,
    Agent(AgentConfig),
    Condition(ConditionConfig),
    Loop(LoopConfig),
    Filter(FilterConfig),
    Merge(MergeConfig),
    Delay(DelayConfig),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Trigger => NodeType::Trigger,
            NodeKind::Agent(_) => NodeType::Agent,
            NodeKind::Condition(_) => NodeType::Condition,
            NodeKind::Loop(_) => NodeType::Loop,
            NodeKind::Filter(_) => NodeType::Filter,
            NodeKind::Merge(_) => NodeType::Merge,
            NodeKind::Delay(_) => NodeType::Delay,
        }
    }

    /// Nodes evaluated synchronously inside the coordinator loop.
    pub fn is_inline(&self) -> bool {
        matches!(self, NodeKind::Trigger | NodeKind::Condition(_) | NodeKind::Filter(_) | NodeKind::Merge(_))
    }

    /// Nodes whose execution occupies a dispatch slot until an external event arrives.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, NodeKind::Agent(_) | NodeKind::Delay(_))
    }
}

/// Per-node failure policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Propagate the failure; nodes reachable only through this one are skipped.
    #[default]
    Fail,
    /// Re-run up to `max_attempts` attempts in total with exponential backoff.
    Retry {
        max_attempts: u32,
        #[serde(default)]
        backoff_ms: u64,
    },
    /// Substitute `default_value` as the output and continue as succeeded.
    Fallback {
        #[serde(default)]
        default_value: Value,
    },
}

impl FailurePolicy {
    /// Backoff before attempt `next_attempt` (2-based), or `None` if no attempts remain.
    pub fn retry_delay(
        &self,
        next_attempt: u32,
    ) -> Option<Duration> {
        match self {
            FailurePolicy::Retry {
                max_attempts,
                backoff_ms,
            } if next_attempt <= *max_attempts => {
                let exp = next_attempt.saturating_sub(2).min(10);
                Some(Duration::from_millis(backoff_ms.saturating_mul(1 << exp)))
            }
            _ => None,
        }
    }
}

/// A compiled workflow node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// node id
    pub id: NodeId,
    /// node title
    pub title: String,
    /// position in the definition document
    pub index: usize,
    /// typed node configuration
    pub kind: NodeKind,
    /// agent deadline
    pub timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    /// human approval gate, agent nodes only
    pub approval: Option<ApprovalPolicy>,
    /// loop node whose body contains this node
    pub loop_owner: Option<NodeId>,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn in_loop_body(&self) -> bool {
        self.loop_owner.is_some()
    }
}

/// JSON schema of the `config` object for each node type.
pub fn config_schema(node_type: NodeType) -> Value {
    let predicate_props = json!({
        "field": { "type": "string" },
        "operator": { "type": "string", "enum": ["equals", "not_equals", "greater_than", "less_than", "contains"] },
        "value": {}
    });

    match node_type {
        NodeType::Trigger => json!({ "type": ["object", "null"] }),
        NodeType::Agent => json!({
            "type": "object",
            "required": ["agent_id"],
            "properties": {
                "agent_id": { "type": "string", "minLength": 1 },
                "inputs": {}
            }
        }),
        NodeType::Condition => json!({
            "type": "object",
            "required": ["field", "operator", "if_true", "if_false"],
            "properties": {
                "field": predicate_props["field"],
                "operator": predicate_props["operator"],
                "value": {},
                "if_true": { "type": "string", "minLength": 1 },
                "if_false": { "type": "string", "minLength": 1 }
            }
        }),
        NodeType::Loop => json!({
            "type": "object",
            "required": ["body"],
            "properties": {
                "body": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "iterations": { "type": "integer", "minimum": 0 },
                "collection": { "type": "string" },
                "while": {
                    "type": "object",
                    "required": ["field", "operator"],
                    "properties": predicate_props
                },
                "max_iterations": { "type": "integer", "minimum": 1 }
            }
        }),
        NodeType::Filter => json!({
            "type": "object",
            "required": ["field", "operator"],
            "properties": {
                "items": { "type": "string" },
                "field": predicate_props["field"],
                "operator": predicate_props["operator"],
                "value": {}
            }
        }),
        NodeType::Merge => json!({
            "type": "object",
            "required": ["inputs"],
            "properties": {
                "inputs": { "type": "array", "items": { "type": "string" }, "minItems": 1 },
                "strategy": { "type": "string", "enum": ["concatenate", "last_wins", "keyed_merge"] }
            }
        }),
        NodeType::Delay => json!({
            "type": "object",
            "properties": {
                "seconds": { "type": "integer", "minimum": 0, "maximum": 3600 },
                "millis": { "type": "integer", "minimum": 0 }
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_backoff() {
        let policy = FailurePolicy::Retry {
            max_attempts: 3,
            backoff_ms: 100,
        };
        assert_eq!(policy.retry_delay(2), Some(Duration::from_millis(100)));
        assert_eq!(policy.retry_delay(3), Some(Duration::from_millis(200)));
        assert_eq!(policy.retry_delay(4), None);
        assert_eq!(FailurePolicy::Fail.retry_delay(2), None);
    }

    #[test]
    fn test_failure_policy_serde() {
        let policy: FailurePolicy = serde_json::from_value(json!({ "strategy": "fallback", "default_value": { "ok": false } })).unwrap();
        assert_eq!(
            policy,
            FailurePolicy::Fallback {
                default_value: json!({ "ok": false })
            }
        );
        let policy: FailurePolicy = serde_json::from_value(json!({ "strategy": "retry", "max_attempts": 2 })).unwrap();
        assert!(matches!(policy, FailurePolicy::Retry { max_attempts: 2, backoff_ms: 0 }));
    }

    #[test]
    fn test_delay_duration() {
        let delay = DelayConfig {
            seconds: 1,
            millis: 250,
        };
        assert_eq!(delay.duration(), Duration::from_millis(1250));
    }

    #[test]
    fn test_inline_kinds() {
        assert!(NodeKind::Trigger.is_inline());
        assert!(!NodeKind::Delay(DelayConfig { seconds: 1, millis: 0 }).is_inline());
        assert!(
            NodeKind::Agent(AgentConfig {
                agent_id: "a".into(),
                inputs: Value::Null
            })
            .occupies_slot()
        );
    }
}
