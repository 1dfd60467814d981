//! Workflow stage — request-level mutations before vendor mapping.
//!
//! Covers streaming control, system-prompt injection, tool-call
//! normalization, and the User-Agent override. All knobs come from the
//! environment or the provider profile; the stage itself is stateless per
//! request.

use serde_json::{Value, json};

/// System-prompt injection behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PromptMode {
    Off,
    /// Replace any existing system message.
    Replace(String),
    /// Prepend before existing system content.
    Prepend(String),
}

#[derive(Debug, Clone)]
pub struct WorkflowStage {
    id: String,
    prompt: PromptMode,
    ua_mode: Option<String>,
}

impl WorkflowStage {
    /// Build from the environment (`ROUTECODEX_SYSTEM_PROMPT_ENABLE`,
    /// `ROUTECODEX_SYSTEM_PROMPT_SOURCE`, `ROUTECODEX_UA_MODE`).
    pub fn from_env(id: impl Into<String>) -> Self {
        let enabled = std::env::var("ROUTECODEX_SYSTEM_PROMPT_ENABLE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v == "replace" || v == "prepend")
            .unwrap_or(false);
        let mode_replace = std::env::var("ROUTECODEX_SYSTEM_PROMPT_ENABLE")
            .map(|v| v != "prepend")
            .unwrap_or(true);

        let prompt = if enabled {
            match std::env::var("ROUTECODEX_SYSTEM_PROMPT_SOURCE")
                .ok()
                .and_then(|path| std::fs::read_to_string(path).ok())
            {
                Some(text) if !text.trim().is_empty() => {
                    let text = text.trim().to_string();
                    if mode_replace {
                        PromptMode::Replace(text)
                    } else {
                        PromptMode::Prepend(text)
                    }
                }
                _ => PromptMode::Off,
            }
        } else {
            PromptMode::Off
        };

        Self {
            id: id.into(),
            prompt,
            ua_mode: std::env::var("ROUTECODEX_UA_MODE").ok().filter(|v| !v.is_empty()),
        }
    }

    #[cfg(test)]
    fn bare(id: &str) -> Self {
        Self {
            id: id.into(),
            prompt: PromptMode::Off,
            ua_mode: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Apply request-side mutations in place.
    pub fn on_request(&self, payload: &mut Value) {
        normalize_stream_flags(payload);
        normalize_tools(payload);
        self.inject_system_prompt(payload);
    }

    /// Responses pass through untouched; the stage only shapes requests.
    pub fn on_response(&self, payload: Value) -> Value {
        payload
    }

    /// The User-Agent to send upstream: provider override wins, then the
    /// `ROUTECODEX_UA_MODE` mapping.
    pub fn user_agent(&self, profile_override: Option<&str>) -> Option<String> {
        if let Some(ua) = profile_override {
            return Some(ua.to_string());
        }
        match self.ua_mode.as_deref() {
            None | Some("default") | Some("none") => None,
            Some("codex") => Some("codex_cli_rs/0.38.0".into()),
            Some("claude") => Some("claude-cli/1.0.58 (external, cli)".into()),
            Some(literal) => Some(literal.to_string()),
        }
    }

    fn inject_system_prompt(&self, payload: &mut Value) {
        let text = match &self.prompt {
            PromptMode::Off => return,
            PromptMode::Replace(t) | PromptMode::Prepend(t) => t.clone(),
        };
        let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
            return;
        };

        let existing = messages
            .iter()
            .position(|m| m.get("role").and_then(Value::as_str) == Some("system"));

        match (&self.prompt, existing) {
            (PromptMode::Replace(_), Some(idx)) => {
                messages[idx]["content"] = Value::String(text);
            }
            (PromptMode::Prepend(_), Some(idx)) => {
                let current = messages[idx]
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                messages[idx]["content"] = Value::String(format!("{text}\n\n{current}"));
            }
            (_, None) => {
                messages.insert(0, json!({"role": "system", "content": text}));
            }
            (PromptMode::Off, _) => {}
        }
    }
}

/// Make the `stream` flag explicit and drop `stream_options` on non-stream
/// requests (some vendors reject the combination).
fn normalize_stream_flags(payload: &mut Value) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    let streaming = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
    obj.insert("stream".into(), Value::Bool(streaming));
    if !streaming {
        obj.remove("stream_options");
    }
}

/// Tool-call hygiene: drop empty tool arrays and repair assistant tool calls
/// that arrived without ids (some clients omit them; most vendors require
/// them).
fn normalize_tools(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        let empty_tools = obj
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty);
        if empty_tools {
            obj.remove("tools");
            obj.remove("tool_choice");
        }
    }

    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    for message in messages {
        let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) else {
            continue;
        };
        for (i, call) in calls.iter_mut().enumerate() {
            let missing = call
                .get("id")
                .and_then(Value::as_str)
                .map_or(true, str::is_empty);
            if missing {
                call["id"] = Value::String(format!("call_{}", i + 1));
            }
        }
    }
}
