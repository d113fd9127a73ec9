use std::collections::HashMap;

use serde_json::{Value as JsonValue, json};

use crate::store::{data::WorkflowRecord, db::mem::DbDocument};

impl DbDocument for WorkflowRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn doc(&self) -> HashMap<String, JsonValue> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), json!(self.id));
        map.insert("name".to_string(), json!(self.name));
        map.insert("create_time".to_string(), json!(self.create_time));
        map.insert("update_time".to_string(), json!(self.update_time));
        map
    }
}
