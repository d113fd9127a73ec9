use serde::{Deserialize, Serialize};

/// Persisted run or node event.
#[derive(Default, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub run_id: String,
    /// empty for run events
    pub node_id: String,
    pub generation: u32,
    pub name: String,
    /// the full event as JSON
    pub message: String,

    pub timestamp: i64,
}
