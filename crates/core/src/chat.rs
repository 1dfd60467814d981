//! Canonical chat payload types.
//!
//! The canonical form is OpenAI Chat Completions shaped: the `anthropic-openai`
//! LLMSwitch converts Anthropic Messages payloads into this shape on the way
//! in and back on the way out. Unknown fields are preserved via
//! `#[serde(flatten)]` so vendor extensions survive the round trip.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tool the model may call, in OpenAI function shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: ToolFunction,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_tool_type() -> String {
    "function".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Message content: either a plain string or multimodal parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Approximate character length, for token estimation.
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| p.text.as_deref().map_or(0, str::len))
                .sum(),
        }
    }
}

/// One multimodal content part (`text`, `image_url`, `input_audio`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            extra: Map::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            ..Self::user(text)
        }
    }

    /// Whether any part of this message is an image.
    pub fn has_vision_part(&self) -> bool {
        match &self.content {
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .any(|p| p.kind == "image_url" || p.kind == "image" || p.kind == "input_image"),
            _ => false,
        }
    }
}

/// The canonical request flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// OpenRouter/OpenAI-style reasoning control.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    /// Anthropic/Qwen-style thinking control.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.as_ref().map_or(0, Vec::len)
    }

    pub fn has_vision_parts(&self) -> bool {
        self.messages.iter().any(ChatMessage::has_vision_part)
    }

    /// A thinking/reasoning flag anywhere on the request.
    pub fn wants_thinking(&self) -> bool {
        let thinking_enabled = self
            .thinking
            .as_ref()
            .is_some_and(|t| t.get("type").and_then(Value::as_str) != Some("disabled"));
        thinking_enabled || self.reasoning.is_some() || self.reasoning_effort.is_some()
    }

    /// Whether a web-search tool is attached (OpenAI `web_search`-family tool
    /// types or a function literally named so).
    pub fn has_web_search_tool(&self) -> bool {
        self.tools.as_ref().is_some_and(|tools| {
            tools.iter().any(|t| {
                t.kind.starts_with("web_search") || t.function.name.starts_with("web_search")
            })
        })
    }

    /// Names of all attached function tools.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools
            .as_ref()
            .map(|tools| tools.iter().map(|t| t.function.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Rough token estimate: chars/4 plus a small per-message overhead.
    /// Only used to compare against the long-context threshold, so precision
    /// does not matter.
    pub fn estimated_tokens(&self) -> u32 {
        let chars: usize = self
            .messages
            .iter()
            .map(|m| m.content.as_ref().map_or(0, MessageContent::char_len))
            .sum();
        (chars / 4 + self.messages.len() * 4) as u32
    }

    /// Explicit category hint from `metadata.category`, if the client set one.
    pub fn category_hint(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("category"))
            .and_then(Value::as_str)
    }
}
