use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::{OrchflowError, Result, workflow::eval::lookup};

/// Regex pattern for output template variables
/// Format: `{{#nodeId.key#}}` or `{{#nodeId.key.subkey#}}`
static OUTPUT_TEMPLATE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\{\{#([^.#]+)\.([^#]+)#\}\}").ok());
/// Regex pattern for environment variables
/// Format: `{{$VAR_NAME$}}`
static ENV_TEMPLATE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\{\{\$([^$]+)\$\}\}").ok());

/// Data a template can read: definition env and node outputs visible to the node being resolved.
pub trait TemplateScope {
    fn env(
        &self,
        name: &str,
    ) -> Option<String>;

    fn output(
        &self,
        node_id: &str,
    ) -> Option<&Value>;
}

fn patterns() -> Result<(&'static Regex, &'static Regex)> {
    match (OUTPUT_TEMPLATE.as_ref(), ENV_TEMPLATE.as_ref()) {
        (Some(output), Some(env)) => Ok((output, env)),
        _ => Err(OrchflowError::Engine("template patterns failed to compile".to_string())),
    }
}

fn output_value<'a>(
    scope: &'a impl TemplateScope,
    node_id: &str,
    key_path: &str,
) -> Option<&'a Value> {
    scope.output(node_id).and_then(|outputs| lookup(outputs, key_path))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        // numbers, bools, and JSON text for objects and arrays
        v => v.to_string(),
    }
}

/// Resolve template variables in the format `{{#nodeId.key#}}` and `{{$VAR_NAME$}}`
/// Returns error if any template variable cannot be resolved
pub fn resolve_template(
    scope: &impl TemplateScope,
    template: &str,
) -> Result<String> {
    let (output_re, env_re) = patterns()?;
    let mut result = template.to_string();
    let mut errors: Vec<String> = Vec::new();

    // First, resolve environment variables
    for caps in env_re.captures_iter(template) {
        let full_match = &caps[0];
        let var_name = &caps[1];

        match scope.env(var_name) {
            Some(value) => {
                result = result.replace(full_match, &value);
            }
            None => {
                errors.push(format!("env variable '{}' not found", var_name));
            }
        }
    }

    // Then, resolve output template variables
    for caps in output_re.captures_iter(template) {
        let full_match = &caps[0];

        match output_value(scope, &caps[1], &caps[2]) {
            Some(value) => {
                result = result.replace(full_match, &render(value));
            }
            None => {
                errors.push(format!("variable '{}' not found", full_match));
            }
        }
    }

    if !errors.is_empty() {
        return Err(OrchflowError::Validation(errors.join(", ")));
    }

    Ok(result)
}

/// Resolve template variables in a JSON Value recursively
///
/// A string that is exactly one output placeholder keeps the referenced value's JSON type.
pub fn resolve_json_value(
    scope: &impl TemplateScope,
    value: &Value,
) -> Result<Value> {
    match value {
        Value::String(s) => {
            let (output_re, _) = patterns()?;
            if let Some(caps) = output_re.captures(s).filter(|caps| &caps[0] == s.as_str()) {
                return output_value(scope, &caps[1], &caps[2]).cloned().ok_or_else(|| OrchflowError::Validation(format!("variable '{}' not found", s)));
            }
            Ok(Value::String(resolve_template(scope, s)?))
        }
        Value::Array(arr) => {
            let resolved: Result<Vec<Value>> = arr.iter().map(|v| resolve_json_value(scope, v)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(obj) => {
            let resolved: Result<serde_json::Map<String, Value>> = obj.iter().map(|(k, v)| resolve_json_value(scope, v).map(|rv| (k.clone(), rv))).collect();
            Ok(Value::Object(resolved?))
        }
        _ => Ok(value.clone()),
    }
}

/// Plain map-backed scope.
#[derive(Debug, Clone, Default)]
pub struct MapScope {
    pub env: HashMap<String, String>,
    pub outputs: HashMap<String, Value>,
}

impl TemplateScope for MapScope {
    fn env(
        &self,
        name: &str,
    ) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn output(
        &self,
        node_id: &str,
    ) -> Option<&Value> {
        self.outputs.get(node_id)
    }
}
