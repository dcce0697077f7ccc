//! `${name}` interpolation of step parameters against workflow variables.
//!
//! Resolution happens when a step is dispatched, so a step sees variables
//! written by earlier steps. A string that is exactly one reference (`"${n}"`)
//! is replaced by the raw value, keeping its JSON type; references embedded in
//! longer text are rendered as strings. Unknown references are left as-is.
//! Replaced text is not scanned again.

use std::collections::HashMap;

use serde_json::Value;

use super::expression::lookup;
use crate::action::ActionKind;

/// Render a value for embedding in text. Strings are inserted without quotes.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn resolve_reference(name: &str, vars: &HashMap<String, Value>) -> Option<Value> {
    let path: Vec<String> = name.trim().split('.').map(str::to_string).collect();
    lookup(&path, vars).ok()
}

/// Substitute every resolvable `${name}` in `template`.
pub fn interpolate_str(template: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match resolve_reference(name, vars) {
                    Some(value) => out.push_str(&value_to_string(&value)),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolve a single value, recursing into arrays and objects.
pub fn resolve_value(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(name) = trimmed
                .strip_prefix("${")
                .and_then(|r| r.strip_suffix('}'))
                .filter(|n| !n.contains('}') && !n.contains("${"))
            {
                if let Some(raw) = resolve_reference(name, vars) {
                    return raw;
                }
            }
            Value::String(interpolate_str(s, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve every parameter of a step.
pub fn resolve_params(
    params: &HashMap<String, Value>,
    vars: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
        .collect()
}

/// Resolve the parameters of an action, leaving its raw parameters untouched.
pub fn resolve_action_params(
    kind: ActionKind,
    params: &HashMap<String, Value>,
    vars: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    params
        .iter()
        .map(|(k, v)| {
            let value = if kind.raw_params().contains(&k.as_str()) {
                v.clone()
            } else {
                resolve_value(v, vars)
            };
            (k.clone(), value)
        })
        .collect()
}
