use std::collections::HashMap;

use serde_json::{Value as JsonValue, json};

use crate::{runtime::WorkflowRun, store::db::mem::DbDocument};

impl DbDocument for WorkflowRun {
    fn id(&self) -> &str {
        &self.id
    }

    fn doc(&self) -> HashMap<String, JsonValue> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), json!(self.id));
        map.insert("workflow_id".to_string(), json!(self.workflow_id));
        map.insert("status".to_string(), json!(self.status));
        map.insert("created_at".to_string(), json!(self.created_at));
        map.insert("terminal_at".to_string(), json!(self.terminal_at));
        map.insert("updated_at".to_string(), json!(self.updated_at));
        map
    }
}
