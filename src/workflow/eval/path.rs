use serde_json::Value;

/// Follow a dotted field path (`data.items.0.name`) into a JSON value.
///
/// An empty path or `$` selects the value itself. Numeric segments index arrays.
pub fn lookup<'a>(
    value: &'a Value,
    path: &str,
) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Some(value);
    }

    let mut current = value;
    for key in path.trim_start_matches("$.").split('.') {
        current = match current {
            Value::Object(map) => map.get(key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::lookup;

    #[test]
    fn test_lookup_nested() {
        let data = json!({"data": {"result": {"status": "ok"}, "items": [{"name": "a"}, {"name": "b"}]}});
        assert_eq!(lookup(&data, "data.result.status"), Some(&json!("ok")));
        assert_eq!(lookup(&data, "data.items.1.name"), Some(&json!("b")));
        assert_eq!(lookup(&data, "$.data.result.status"), Some(&json!("ok")));
        assert_eq!(lookup(&data, "data.missing"), None);
        assert_eq!(lookup(&data, "data.items.x"), None);
    }

    #[test]
    fn test_lookup_self() {
        let data = json!(3);
        assert_eq!(lookup(&data, ""), Some(&json!(3)));
        assert_eq!(lookup(&data, "$"), Some(&json!(3)));
    }
}
