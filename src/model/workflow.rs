use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    OrchflowError, Result,
    model::{EdgeModel, NodeModel},
};

/// How the coordinator drains the ready-set of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionMode {
    /// One ready node at a time, in definition order.
    Sequential,
    /// The whole ready-set at once, bounded by the concurrency ceiling.
    #[default]
    Parallel,
    /// Like parallel; condition nodes pick exactly one successor branch.
    Conditional,
}

/// Workflow definition document as submitted by users.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// per-run dispatch ceiling, falls back to the engine config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// seconds a terminal run is kept before archiving, falls back to the engine config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_secs: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub nodes: Vec<NodeModel>,
    #[serde(default)]
    pub edges: Vec<EdgeModel>,
}

impl WorkflowModel {
    pub fn from_json(s: &str) -> Result<Self> {
        let workflow = serde_json::from_str::<WorkflowModel>(s);
        match workflow {
            Ok(v) => Ok(v),
            Err(e) => Err(OrchflowError::Validation(format!("invalid workflow document: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_defaults() {
        let model = WorkflowModel::from_json(
            r#"{
                "id": "wf",
                "name": "demo",
                "nodes": [{ "id": "start", "type": "trigger" }]
            }"#,
        )
        .unwrap();
        assert_eq!(model.execution_mode, ExecutionMode::Parallel);
        assert!(model.edges.is_empty());
        assert_eq!(model.nodes[0].node_type, "trigger");
        assert!(model.nodes[0].config.is_null());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(WorkflowModel::from_json("{"), Err(OrchflowError::Validation(_))));
    }
}
