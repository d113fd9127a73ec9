use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::node::NodeId;

/// How a merge node combines the outputs of its converging branches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeStrategy {
    /// Arrays are flattened in branch order, other outputs appended as elements.
    Concatenate,
    /// The output of the branch that finished last.
    #[default]
    LastWins,
    /// Object outputs merged key by key in branch order; later keys override.
    /// Non-object outputs are stored under their branch id.
    KeyedMerge,
}

/// Combine branch outputs.
///
/// `branches` holds only the branches that succeeded, ordered by completion
/// time for `last_wins` and by declaration for the other strategies.
pub fn merge(
    strategy: MergeStrategy,
    branches: &[(NodeId, Value)],
) -> Value {
    match strategy {
        MergeStrategy::Concatenate => {
            let mut out = Vec::new();
            for (_, value) in branches {
                match value {
                    Value::Array(items) => out.extend(items.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Value::Array(out)
        }
        MergeStrategy::LastWins => branches.last().map(|(_, v)| v.clone()).unwrap_or(Value::Null),
        MergeStrategy::KeyedMerge => {
            let mut out = Map::new();
            for (nid, value) in branches {
                match value {
                    Value::Object(map) => out.extend(map.iter().map(|(k, v)| (k.clone(), v.clone()))),
                    other => {
                        out.insert(nid.clone(), other.clone());
                    }
                }
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn branches() -> Vec<(NodeId, Value)> {
        vec![("b".to_string(), json!({"x": 1, "y": 1})), ("c".to_string(), json!({"y": 2}))]
    }

    #[test]
    fn test_last_wins() {
        assert_eq!(merge(MergeStrategy::LastWins, &branches()), json!({"y": 2}));
        assert_eq!(merge(MergeStrategy::LastWins, &[]), Value::Null);
    }

    #[test]
    fn test_keyed_merge() {
        assert_eq!(merge(MergeStrategy::KeyedMerge, &branches()), json!({"x": 1, "y": 2}));
        let mixed = vec![("b".to_string(), json!(5)), ("c".to_string(), json!({"k": true}))];
        assert_eq!(merge(MergeStrategy::KeyedMerge, &mixed), json!({"b": 5, "k": true}));
    }

    #[test]
    fn test_concatenate() {
        let arrays = vec![("b".to_string(), json!([1, 2])), ("c".to_string(), json!(3))];
        assert_eq!(merge(MergeStrategy::Concatenate, &arrays), json!([1, 2, 3]));
    }
}
