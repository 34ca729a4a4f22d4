use serde_json::json;

use crate::executor::dispatcher::ActionKind;
use crate::llm::types::{FunctionDef, ToolDef};

/// Builds the browser action vocabulary declared to the model.
/// Names in `excluded` are left out (strict mode).
pub fn browser_tools(excluded: &[String]) -> Vec<ToolDef> {
    ActionKind::ALL
        .iter()
        .filter(|kind| !excluded.iter().any(|e| e == kind.as_str()))
        .map(|kind| ToolDef {
            def_type: "function".into(),
            function: FunctionDef {
                name: kind.as_str().into(),
                description: description(*kind).into(),
                parameters: parameters(*kind),
            },
        })
        .collect()
}

fn description(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Navigate => "Open a URL in the current tab.",
        ActionKind::Search => "Open the default search engine page.",
        ActionKind::ClickAt => "Click at a point. Coordinates are normalized to 0-999 on each axis.",
        ActionKind::HoverAt => "Move the mouse to a point (0-999 normalized) without clicking.",
        ActionKind::TypeTextAt => {
            "Click at a point (0-999 normalized), then type text. Clears the field and presses Enter by default."
        }
        ActionKind::ScrollDocument => "Scroll the whole page one screen in a direction.",
        ActionKind::ScrollAt => {
            "Scroll the element under a point (0-999 normalized). Magnitude is in normalized units, default 800."
        }
        ActionKind::Wait => "Wait for the page to settle (default 5 seconds).",
        ActionKind::GoBack => "Go back in browser history.",
        ActionKind::GoForward => "Go forward in browser history.",
        ActionKind::KeyCombination => "Press a key or chord such as \"Enter\" or \"Control+a\".",
        ActionKind::TakeScreenshot => "Capture the current viewport.",
        ActionKind::GetPageInfo => "Return the current URL and page title.",
    }
}

fn parameters(kind: ActionKind) -> serde_json::Value {
    let point = json!({"type": "integer", "minimum": 0, "maximum": 999});
    let direction = json!({"type": "string", "enum": ["up", "down", "left", "right"]});
    match kind {
        ActionKind::Navigate => json!({
            "type": "object",
            "properties": {"url": {"type": "string", "description": "Absolute http(s) URL"}},
            "required": ["url"]
        }),
        ActionKind::ClickAt | ActionKind::HoverAt => json!({
            "type": "object",
            "properties": {"x": point, "y": point},
            "required": ["x", "y"]
        }),
        ActionKind::TypeTextAt => json!({
            "type": "object",
            "properties": {
                "x": point,
                "y": point,
                "text": {"type": "string"},
                "clear_before_typing": {"type": "boolean", "default": true},
                "press_enter": {"type": "boolean", "default": true}
            },
            "required": ["x", "y", "text"]
        }),
        ActionKind::ScrollDocument => json!({
            "type": "object",
            "properties": {"direction": direction},
            "required": ["direction"]
        }),
        ActionKind::ScrollAt => json!({
            "type": "object",
            "properties": {
                "x": point,
                "y": point,
                "direction": direction,
                "magnitude": {"type": "integer", "minimum": 0, "maximum": 999, "default": 800}
            },
            "required": ["x", "y", "direction"]
        }),
        ActionKind::Wait => json!({
            "type": "object",
            "properties": {"seconds": {"type": "integer", "minimum": 0, "maximum": 60}}
        }),
        ActionKind::KeyCombination => json!({
            "type": "object",
            "properties": {"keys": {"type": "string"}},
            "required": ["keys"]
        }),
        ActionKind::Search
        | ActionKind::GoBack
        | ActionKind::GoForward
        | ActionKind::TakeScreenshot
        | ActionKind::GetPageInfo => json!({"type": "object", "properties": {}}),
    }
}
