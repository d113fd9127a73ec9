use std::collections::HashMap;

use serde_json::{Value as JsonValue, json};

use crate::store::{data::EventRecord, db::mem::DbDocument};

impl DbDocument for EventRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn doc(&self) -> HashMap<String, JsonValue> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), json!(self.id));
        map.insert("run_id".to_string(), json!(self.run_id));
        map.insert("node_id".to_string(), json!(self.node_id));
        map.insert("generation".to_string(), json!(self.generation));
        map.insert("name".to_string(), json!(self.name));
        map.insert("timestamp".to_string(), json!(self.timestamp));
        map
    }
}
