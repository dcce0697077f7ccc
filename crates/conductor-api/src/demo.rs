//! Simulated automation and vision capabilities.
//!
//! Real device drivers plug in through `Capability`; these stand-ins log the
//! call and return plausible values so workflows can be exercised end to end.
//! Any step can force a failure with `simulate_failure: true`.

use std::time::Duration;

use conductor_core::action::{
    ActionKind, ActionOutput, ActionRegistry, Capability, CapabilityError, Params, Variables,
};
use conductor_core::monitor::MonitorHandle;
use serde_json::{json, Value};

/// Pause imitating device latency.
const LATENCY: Duration = Duration::from_millis(25);

struct Simulated {
    kind: ActionKind,
}

fn text_param<'a>(params: &'a Params, name: &str) -> Result<&'a str, CapabilityError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| CapabilityError::InvalidParams(format!("'{name}' is required")))
}

impl Simulated {
    fn respond(&self, params: &Params) -> Result<Value, CapabilityError> {
        let value = match self.kind {
            ActionKind::OpenBrowser => {
                json!({ "browser": params.get("browser").and_then(Value::as_str).unwrap_or("chrome") })
            }
            ActionKind::NavigateTo => json!({ "url": text_param(params, "url")? }),
            ActionKind::ClickImage => json!({ "clicked": text_param(params, "image")?, "x": 640, "y": 360 }),
            ActionKind::ClickText => json!({ "clicked": text_param(params, "text")? }),
            ActionKind::TypeText => json!({ "typed": text_param(params, "text")?.chars().count() }),
            ActionKind::PressKey => json!({ "key": text_param(params, "key")? }),
            ActionKind::TakeScreenshot => {
                json!({ "path": params.get("filename").and_then(Value::as_str).unwrap_or("screenshot.png") })
            }
            ActionKind::FindImage => json!({ "found": true, "image": text_param(params, "image")?, "location": [640, 360] }),
            ActionKind::FindText => json!({ "found": true, "text": text_param(params, "text")? }),
            ActionKind::ExtractText => json!("Example Domain\nThis domain is for use in illustrative examples."),
            ActionKind::DetectUi => json!([
                { "type": "input", "label": "Search" },
                { "type": "button", "label": "Submit" },
            ]),
            other => {
                return Err(CapabilityError::Unavailable(format!("no simulation for '{other}'")));
            }
        };
        Ok(value)
    }
}

impl Capability for Simulated {
    async fn invoke(&self, params: &Params, _variables: &Variables) -> Result<ActionOutput, CapabilityError> {
        tracing::info!(action = %self.kind, ?params, "simulated device call");
        tokio::time::sleep(LATENCY).await;

        if params.get("simulate_failure").and_then(Value::as_bool) == Some(true) {
            return Err(CapabilityError::Failed(format!("simulated failure in {}", self.kind)));
        }
        self.respond(params).map(ActionOutput::value)
    }
}

/// Registry with every collaborator action simulated. Vision actions only
/// read the screen, so they are registered as concurrent.
pub fn registry(monitor: MonitorHandle) -> ActionRegistry {
    ActionKind::ALL
        .into_iter()
        .filter(|kind| !kind.is_builtin())
        .fold(ActionRegistry::builder().monitor(monitor), |builder, kind| {
            let capability = Simulated { kind };
            if is_vision(kind) {
                builder.register_concurrent(kind, capability)
            } else {
                builder.register(kind, capability)
            }
        })
        .build()
}

fn is_vision(kind: ActionKind) -> bool {
    matches!(
        kind,
        ActionKind::FindImage | ActionKind::FindText | ActionKind::ExtractText | ActionKind::DetectUi
    )
}
