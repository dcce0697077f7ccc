//! Built-in control-flow actions handled by the registry itself.

use std::time::Duration;

use serde_json::{json, Value};

use super::capability::{ActionOutput, CapabilityError};
use super::registry::ActionRegistry;
use super::{ActionKind, Params, Variables};
use crate::monitor::LogLevel;
use crate::workflow::context::resolve_action_params;
use crate::workflow::expression::evaluate_condition;

fn invalid(msg: impl Into<String>) -> CapabilityError {
    CapabilityError::InvalidParams(msg.into())
}

fn required<'a>(params: &'a Params, name: &str) -> Result<&'a Value, CapabilityError> {
    params
        .get(name)
        .ok_or_else(|| invalid(format!("missing required parameter '{name}'")))
}

fn required_str<'a>(params: &'a Params, name: &str) -> Result<&'a str, CapabilityError> {
    required(params, name)?
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(format!("parameter '{name}' must be a non-empty string")))
}

fn object_param(params: &Params, name: &str) -> Result<Params, CapabilityError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(Params::new()),
        Some(Value::Object(map)) => Ok(map.clone().into_iter().collect()),
        Some(_) => Err(invalid(format!("parameter '{name}' must be a mapping"))),
    }
}

fn parse_kind(name: &str) -> Result<ActionKind, CapabilityError> {
    name.parse::<ActionKind>().map_err(|e| invalid(e.to_string()))
}

/// `wait(seconds)`: sleep without holding any device.
pub(super) async fn wait(params: &Params) -> Result<ActionOutput, CapabilityError> {
    let raw = required(params, "seconds")?;
    let seconds = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|s| s.is_finite() && *s >= 0.0)
    .ok_or_else(|| invalid(format!("'seconds' must be a non-negative number, got {raw}")))?;

    let duration = Duration::try_from_secs_f64(seconds)
        .map_err(|e| invalid(format!("'seconds' out of range: {e}")))?;
    tokio::time::sleep(duration).await;
    Ok(ActionOutput::value(json!(seconds)))
}

/// `set_variable(name, value)`: returns the value and schedules the update.
pub(super) fn set_variable(params: &Params) -> Result<ActionOutput, CapabilityError> {
    let name = required_str(params, "name")?;
    let value = params.get("value").cloned().unwrap_or(Value::Null);
    Ok(ActionOutput::value(value.clone()).with_update(name, value))
}

/// `log(message, level)`: forwards to the monitor.
pub(super) fn log(registry: &ActionRegistry, params: &Params) -> Result<ActionOutput, CapabilityError> {
    let message = match required(params, "message")? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let level = match params.get("level").and_then(Value::as_str) {
        Some(l) => l.parse::<LogLevel>().map_err(invalid)?,
        None => LogLevel::Info,
    };
    let details = params.get("details").cloned().unwrap_or(Value::Null);
    registry.monitor().log(&message, level, &details);
    Ok(ActionOutput::value(Value::String(message)))
}

/// `if_condition(condition, then_action?, else_action?)`.
///
/// Returns `{condition, result}` where `result` is the delegated action's
/// value, or null when no branch action ran.
pub(super) async fn if_condition(
    registry: &ActionRegistry,
    params: &Params,
    variables: &Variables,
) -> Result<ActionOutput, CapabilityError> {
    let outcome = match required(params, "condition")? {
        Value::Bool(b) => *b,
        Value::String(src) => evaluate_condition(src, variables).map_err(|e| invalid(e.to_string()))?,
        other => return Err(invalid(format!("'condition' must be a string, got {other}"))),
    };

    let (action_key, params_key) = if outcome {
        ("then_action", "then_params")
    } else {
        ("else_action", "else_params")
    };

    let mut output = ActionOutput::default();
    let mut result = Value::Null;
    if let Some(action) = params.get(action_key).and_then(Value::as_str) {
        let kind = parse_kind(action)?;
        let branch_params = resolve_action_params(kind, &object_param(params, params_key)?, variables);
        let branch = registry.invoke(kind, &branch_params, variables).await?;
        result = branch.value;
        output.variable_updates = branch.variable_updates;
    }

    output.value = json!({ "condition": outcome, "result": result });
    Ok(output)
}

/// `loop(items, action, action_params)`: invoke `action` once per item.
///
/// Each iteration sees `item` (and updates made by earlier iterations) as
/// variables, and receives `item` as a parameter.
pub(super) async fn run_loop(
    registry: &ActionRegistry,
    params: &Params,
    variables: &Variables,
) -> Result<ActionOutput, CapabilityError> {
    let items = required(params, "items")?
        .as_array()
        .ok_or_else(|| invalid("'items' must be a list"))?;
    let kind = parse_kind(required_str(params, "action")?)?;
    let template = object_param(params, "action_params")?;

    let mut local = variables.clone();
    let mut results = Vec::with_capacity(items.len());
    let mut updates = Vec::new();

    for item in items {
        local.insert("item".to_string(), item.clone());
        let mut iteration_params = resolve_action_params(kind, &template, &local);
        iteration_params.insert("item".to_string(), item.clone());

        let out = registry.invoke(kind, &iteration_params, &local).await?;
        for (name, value) in out.variable_updates {
            local.insert(name.clone(), value.clone());
            updates.push((name, value));
        }
        results.push(out.value);
    }

    Ok(ActionOutput {
        value: Value::Array(results),
        variable_updates: updates,
    })
}

/// Names of actions a built-in would delegate to, with their parameters.
pub(super) fn delegated_actions(kind: ActionKind, params: &Params) -> Vec<(String, Params)> {
    let pair = |action_key: &str, params_key: &str| -> Option<(String, Params)> {
        let name = params.get(action_key)?.as_str()?.to_string();
        let nested = match params.get(params_key) {
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            _ => Params::new(),
        };
        Some((name, nested))
    };
    match kind {
        ActionKind::IfCondition => [
            pair("then_action", "then_params"),
            pair("else_action", "else_params"),
        ]
        .into_iter()
        .flatten()
        .collect(),
        ActionKind::Loop => pair("action", "action_params").into_iter().collect(),
        _ => Vec::new(),
    }
}
