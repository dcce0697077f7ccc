//! Actions: the closed set of things a step can do.
//!
//! - `capability` -- the `Capability` trait collaborators implement, plus its
//!   object-safe `BoxCapability` wrapper
//! - `registry` -- `ActionRegistry`, mapping `ActionKind` to capabilities and
//!   running the built-in control-flow actions
//! - `builtin` -- `wait`, `set_variable`, `if_condition`, `loop`, `log`

mod builtin;
pub mod capability;
pub mod registry;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

pub use capability::{ActionOutput, BoxCapability, Capability, CapabilityError};
pub use registry::{ActionRegistry, ActionRegistryBuilder};

/// Resolved step parameters.
pub type Params = HashMap<String, Value>;

/// Workflow variables as seen by an action.
pub type Variables = HashMap<String, Value>;

/// Every action a step may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    // Automation collaborator
    OpenBrowser,
    NavigateTo,
    ClickImage,
    ClickText,
    TypeText,
    PressKey,
    TakeScreenshot,
    // Vision collaborator
    FindImage,
    FindText,
    ExtractText,
    DetectUi,
    // Built-in
    Wait,
    SetVariable,
    IfCondition,
    Loop,
    Log,
}

impl ActionKind {
    pub const ALL: [ActionKind; 16] = [
        ActionKind::OpenBrowser,
        ActionKind::NavigateTo,
        ActionKind::ClickImage,
        ActionKind::ClickText,
        ActionKind::TypeText,
        ActionKind::PressKey,
        ActionKind::TakeScreenshot,
        ActionKind::FindImage,
        ActionKind::FindText,
        ActionKind::ExtractText,
        ActionKind::DetectUi,
        ActionKind::Wait,
        ActionKind::SetVariable,
        ActionKind::IfCondition,
        ActionKind::Loop,
        ActionKind::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::OpenBrowser => "open_browser",
            ActionKind::NavigateTo => "navigate_to",
            ActionKind::ClickImage => "click_image",
            ActionKind::ClickText => "click_text",
            ActionKind::TypeText => "type_text",
            ActionKind::PressKey => "press_key",
            ActionKind::TakeScreenshot => "take_screenshot",
            ActionKind::FindImage => "find_image",
            ActionKind::FindText => "find_text",
            ActionKind::ExtractText => "extract_text",
            ActionKind::DetectUi => "detect_ui",
            ActionKind::Wait => "wait",
            ActionKind::SetVariable => "set_variable",
            ActionKind::IfCondition => "if_condition",
            ActionKind::Loop => "loop",
            ActionKind::Log => "log",
        }
    }

    /// Handled by the registry itself rather than a collaborator.
    pub fn is_builtin(&self) -> bool {
        matches!(
            self,
            ActionKind::Wait
                | ActionKind::SetVariable
                | ActionKind::IfCondition
                | ActionKind::Loop
                | ActionKind::Log
        )
    }

    /// Parameters handed to the action without `${name}` interpolation.
    ///
    /// Conditions resolve variables themselves; nested action parameters are
    /// resolved by the built-in when it delegates.
    pub fn raw_params(&self) -> &'static [&'static str] {
        match self {
            ActionKind::IfCondition => &["condition", "then_params", "else_params"],
            ActionKind::Loop => &["action_params"],
            _ => &[],
        }
    }

    /// Drives the single pointer/keyboard/screen device and must not
    /// interleave with another device action.
    pub fn requires_device(&self) -> bool {
        !self.is_builtin()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action '{0}'")]
pub struct UnknownAction(pub String);

impl FromStr for ActionKind {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}
