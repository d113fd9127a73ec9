//! Field-path comparisons used by condition, filter and while-loop nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::path::lookup;

/// Comparison operator
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
}

/// `field <operator> value`, evaluated against run data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Predicate {
    pub fn new(
        field: impl Into<String>,
        operator: Operator,
        value: Value,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate against a single JSON document.
    pub fn evaluate(
        &self,
        data: &Value,
    ) -> bool {
        self.evaluate_with(|path| lookup(data, path).cloned())
    }

    /// Evaluate with a caller-supplied field resolver.
    ///
    /// A field that cannot be resolved only satisfies `not_equals`.
    pub fn evaluate_with(
        &self,
        resolve: impl Fn(&str) -> Option<Value>,
    ) -> bool {
        let Some(actual) = resolve(&self.field) else {
            return self.operator == Operator::NotEquals;
        };
        compare(&actual, self.operator, &self.value)
    }
}

pub fn compare(
    actual: &Value,
    operator: Operator,
    expected: &Value,
) -> bool {
    match operator {
        Operator::Equals => loose_eq(actual, expected),
        Operator::NotEquals => !loose_eq(actual, expected),
        Operator::GreaterThan => order(actual, expected).is_some_and(|o| o.is_gt()),
        Operator::LessThan => order(actual, expected).is_some_and(|o| o.is_lt()),
        Operator::Contains => contains(actual, expected),
    }
}

/// Numbers given as strings (as form inputs usually are) compare as numbers.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loose_eq(
    a: &Value,
    b: &Value,
) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => s.trim() == x.to_string(),
        _ => false,
    }
}

fn order(
    a: &Value,
    b: &Value,
) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(
    haystack: &Value,
    needle: &Value,
) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            Value::Number(n) => s.contains(&n.to_string()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_greater_than_number_and_string() {
        let p = Predicate::new("score", Operator::GreaterThan, json!(0.8));
        assert!(p.evaluate(&json!({"score": 0.9})));
        assert!(!p.evaluate(&json!({"score": 0.8})));
        assert!(p.evaluate(&json!({"score": "0.95"})));

        let p = Predicate::new("score", Operator::GreaterThan, json!("0.8"));
        assert!(p.evaluate(&json!({"score": 1})));
    }

    #[test]
    fn test_less_than_strings() {
        let p = Predicate::new("name", Operator::LessThan, json!("m"));
        assert!(p.evaluate(&json!({"name": "alice"})));
        assert!(!p.evaluate(&json!({"name": "zed"})));
    }

    #[test]
    fn test_equals_loose() {
        let p = Predicate::new("data.result.status", Operator::Equals, json!("success"));
        assert!(p.evaluate(&json!({"data": {"result": {"status": "success"}}})));
        assert!(Predicate::new("n", Operator::Equals, json!("3")).evaluate(&json!({"n": 3})));
        assert!(Predicate::new("ok", Operator::Equals, json!("true")).evaluate(&json!({"ok": true})));
        assert!(Predicate::new("n", Operator::NotEquals, json!(4)).evaluate(&json!({"n": 3})));
    }

    #[test]
    fn test_contains() {
        assert!(Predicate::new("text", Operator::Contains, json!("ell")).evaluate(&json!({"text": "hello"})));
        assert!(Predicate::new("tags", Operator::Contains, json!("b")).evaluate(&json!({"tags": ["a", "b"]})));
        assert!(Predicate::new("obj", Operator::Contains, json!("k")).evaluate(&json!({"obj": {"k": 1}})));
        assert!(!Predicate::new("n", Operator::Contains, json!(1)).evaluate(&json!({"n": 1})));
    }

    #[test]
    fn test_missing_field() {
        let data = json!({});
        assert!(!Predicate::new("x", Operator::Equals, Value::Null).evaluate(&data));
        assert!(Predicate::new("x", Operator::NotEquals, json!(1)).evaluate(&data));
        assert!(!Predicate::new("x", Operator::GreaterThan, json!(1)).evaluate(&data));
    }

    #[test]
    fn test_deterministic() {
        let p = Predicate::new("v", Operator::LessThan, json!(10));
        let data = json!({"v": 3});
        let first = p.evaluate(&data);
        for _ in 0..10 {
            assert_eq!(p.evaluate(&data), first);
        }
    }
}
