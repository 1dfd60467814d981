//! Compatibility stage — vendor-specific field mapping.
//!
//! Runs after the workflow stage, immediately before the protocol bridge
//! and adapter. Each variant knows the quirks of one vendor family; the
//! generic `field-mapping` variant only clamps limits.

use routecodex_config::PipelineLimits;
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Generic rename/clamp mapping.
    FieldMapping,
    /// LM Studio: no `stream_options`, no reasoning knobs, strict tools.
    LmStudio,
    /// Qwen/DashScope: `enable_thinking` mapping, no penalty fields.
    Qwen,
}

impl Compatibility {
    pub fn id(&self) -> &'static str {
        match self {
            Self::FieldMapping => "field-mapping",
            Self::LmStudio => "lmstudio-compatibility",
            Self::Qwen => "qwen-compatibility",
        }
    }

    /// Apply vendor mapping in place.
    pub fn on_request(&self, payload: &mut Value, limits: &PipelineLimits) {
        clamp_max_tokens(payload, limits.max_tokens);

        let Some(obj) = payload.as_object_mut() else {
            return;
        };

        match self {
            Self::FieldMapping => {}
            Self::LmStudio => {
                obj.remove("stream_options");
                obj.remove("reasoning");
                obj.remove("reasoning_effort");
                obj.remove("thinking");
                obj.remove("parallel_tool_calls");
            }
            Self::Qwen => {
                // Anthropic/OpenAI thinking controls → DashScope's switch.
                let thinking_enabled = obj
                    .remove("thinking")
                    .map(|t| t.get("type").and_then(Value::as_str) != Some("disabled"))
                    .unwrap_or(false)
                    || obj.remove("reasoning").is_some()
                    || obj.remove("reasoning_effort").is_some();
                if thinking_enabled {
                    obj.insert("enable_thinking".into(), Value::Bool(true));
                }
                obj.remove("frequency_penalty");
                obj.remove("presence_penalty");
            }
        }
    }

    /// Vendor response → canonical-shaped response.
    pub fn on_response(&self, mut payload: Value) -> Value {
        match self {
            Self::FieldMapping | Self::LmStudio => payload,
            Self::Qwen => {
                // Fold reasoning_content into the message extras OpenAI
                // clients understand, leaving content untouched.
                if let Some(message) = payload.pointer_mut("/choices/0/message") {
                    if let Some(obj) = message.as_object_mut() {
                        if let Some(reasoning) = obj.remove("reasoning_content") {
                            if !reasoning.is_null() {
                                obj.insert("reasoning".into(), reasoning);
                            }
                        }
                    }
                }
                payload
            }
        }
    }
}

fn clamp_max_tokens(payload: &mut Value, cap: u32) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    if let Some(requested) = obj.get("max_tokens").and_then(Value::as_u64) {
        if requested > cap as u64 {
            obj.insert("max_tokens".into(), json!(cap));
        }
    }
}
