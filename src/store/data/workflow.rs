use serde::{Deserialize, Serialize};

/// Deployed workflow definition.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub desc: String,
    /// definition document as JSON
    pub data: String,
    pub create_time: i64,
    pub update_time: i64,
}
