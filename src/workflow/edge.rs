//! Compiled edges connecting plan nodes.
//!
//! Edges define the execution flow between nodes. The source handle records
//! which output port the edge leaves from, so condition branches and loop
//! bodies can be told apart from plain sequential flow.

use serde::{Deserialize, Serialize};

use crate::workflow::node::NodeId;

/// Output port an edge originates from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceHandle {
    /// Default output handle for sequential flow.
    #[default]
    Source,
    /// True branch of a condition node.
    True,
    /// False branch of a condition node.
    False,
    /// Entry into the body of a loop node, taken once per iteration.
    Body,
}

impl SourceHandle {
    pub fn branch(value: bool) -> Self {
        if value { SourceHandle::True } else { SourceHandle::False }
    }
}

/// Compiled edge.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// edge id, derived from its endpoints when the document leaves it empty
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub source_handle: SourceHandle,
}

impl Edge {
    pub fn new(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        source_handle: SourceHandle,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}-{}-{}", source, source_handle.as_ref(), target),
            source,
            target,
            source_handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_handle_parse() {
        assert_eq!(SourceHandle::from_str("true").unwrap(), SourceHandle::True);
        assert_eq!(SourceHandle::from_str("body").unwrap(), SourceHandle::Body);
        assert!(SourceHandle::from_str("fail_branch").is_err());
        assert_eq!(SourceHandle::branch(false), SourceHandle::False);
    }

    #[test]
    fn test_edge_id() {
        let edge = Edge::new("a", "b", SourceHandle::Source);
        assert_eq!(edge.id, "a-source-b");
    }
}
