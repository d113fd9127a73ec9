use std::collections::HashMap;

use serde_json::{Value as JsonValue, json};

use crate::{hitl::ApprovalRequest, store::db::mem::DbDocument};

impl DbDocument for ApprovalRequest {
    fn id(&self) -> &str {
        &self.id
    }

    fn doc(&self) -> HashMap<String, JsonValue> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), json!(self.id));
        map.insert("run_id".to_string(), json!(self.run_id));
        map.insert("node_id".to_string(), json!(self.node_id));
        map.insert("pending".to_string(), json!(self.is_pending()));
        map.insert("created_at".to_string(), json!(self.created_at));
        map
    }
}
