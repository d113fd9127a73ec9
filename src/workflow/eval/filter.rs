use serde_json::Value;

use crate::{OrchflowError, Result, workflow::node::FilterConfig};

use super::path::lookup;

/// Keep the items of the input array that satisfy the predicate.
///
/// The predicate's field path is resolved relative to each item. An empty
/// result is a valid outcome; a non-array payload is a validation error.
pub fn apply_filter(
    config: &FilterConfig,
    input: &Value,
) -> Result<Value> {
    let items = match &config.items {
        Some(path) => lookup(input, path).ok_or_else(|| OrchflowError::Validation(format!("filter input has no field '{}'", path)))?,
        None => input,
    };

    let Value::Array(items) = items else {
        return Err(OrchflowError::Validation(format!("filter expects an array payload, got {}", type_name(items))));
    };

    let kept = items.iter().filter(|item| config.predicate.evaluate(item)).cloned().collect();
    Ok(Value::Array(kept))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::workflow::eval::{Operator, Predicate};

    fn active_filter(items: Option<&str>) -> FilterConfig {
        FilterConfig {
            items: items.map(str::to_string),
            predicate: Predicate::new("status", Operator::Equals, json!("active")),
        }
    }

    #[test]
    fn test_filter_drops_non_matching() {
        let input = json!([{"id": 1, "status": "active"}, {"id": 2, "status": "idle"}]);
        let out = apply_filter(&active_filter(None), &input).unwrap();
        assert_eq!(out, json!([{"id": 1, "status": "active"}]));
    }

    #[test]
    fn test_filter_nested_items_and_empty_result() {
        let input = json!({"data": {"items": [{"status": "idle"}]}});
        let out = apply_filter(&active_filter(Some("data.items")), &input).unwrap();
        assert_eq!(out, json!([]));
    }

    #[test]
    fn test_filter_rejects_non_array() {
        let err = apply_filter(&active_filter(None), &json!({"status": "active"})).unwrap_err();
        assert!(matches!(err, OrchflowError::Validation(_)));
    }

    #[test]
    fn test_filter_scalar_items() {
        let config = FilterConfig {
            items: None,
            predicate: Predicate::new("$", Operator::GreaterThan, json!(2)),
        };
        assert_eq!(apply_filter(&config, &json!([1, 2, 3, 4])).unwrap(), json!([3, 4]));
    }
}
