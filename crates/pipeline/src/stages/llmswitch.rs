//! LLMSwitch — the declarative protocol bridge.
//!
//! The canonical in-pipeline shape is OpenAI Chat Completions. The
//! `anthropic-openai` switch bridges that against Anthropic's Messages
//! protocol in both directions: the front door uses it to normalize
//! `/v1/messages` clients into canonical form, and pipelines targeting
//! `anthropic-http` providers use it to speak Messages upstream.

use serde_json::{Map, Value, json};

use routecodex_core::error::ProxyError;

use crate::sse::SseFrame;

/// The configured switch for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmSwitch {
    /// Canonical in, canonical out.
    OpenAiPassthrough,
    /// Canonical (OpenAI) ↔ Anthropic Messages.
    AnthropicOpenAi,
}

impl LlmSwitch {
    /// Canonical request → provider-native request.
    pub fn to_provider(&self, canonical: &Value) -> Value {
        match self {
            Self::OpenAiPassthrough => canonical.clone(),
            Self::AnthropicOpenAi => canonical_request_to_anthropic(canonical),
        }
    }

    /// Provider-native response → canonical response.
    pub fn to_canonical(&self, response: Value) -> Value {
        match self {
            Self::OpenAiPassthrough => response,
            Self::AnthropicOpenAi => anthropic_response_to_canonical(&response),
        }
    }

    /// Stateful stream transform for provider-native SSE → canonical frames.
    pub fn stream_transform(&self) -> Box<dyn StreamTransform> {
        match self {
            Self::OpenAiPassthrough => Box::new(IdentityStream),
            Self::AnthropicOpenAi => Box::new(AnthropicToOpenAiStream::default()),
        }
    }
}

/// Frame-level stream rewriting. Stateful because protocol bridging needs
/// message/content-block bookkeeping.
pub trait StreamTransform: Send {
    fn on_frame(&mut self, frame: SseFrame) -> Vec<SseFrame>;
    /// Flush at upstream end-of-stream (may synthesize terminal frames).
    fn on_end(&mut self) -> Vec<SseFrame>;
}

/// Passthrough for upstreams already speaking the canonical protocol.
pub struct IdentityStream;

impl StreamTransform for IdentityStream {
    fn on_frame(&mut self, frame: SseFrame) -> Vec<SseFrame> {
        vec![frame]
    }
    fn on_end(&mut self) -> Vec<SseFrame> {
        Vec::new()
    }
}

// ── Anthropic Messages → canonical ──────────────────────────────────────────

/// Normalize an Anthropic Messages request into the canonical OpenAI shape.
/// Used by the front door on `/v1/messages`.
pub fn anthropic_request_to_canonical(request: &Value) -> Result<Value, ProxyError> {
    let obj = request
        .as_object()
        .ok_or_else(|| ProxyError::Internal("request body must be an object".into()))?;

    let mut messages = Vec::new();
    if let Some(system) = obj.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    for message in obj.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        match message.get("content") {
            Some(Value::String(text)) => {
                messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => {
                convert_anthropic_blocks(role, blocks, &mut messages);
            }
            _ => {}
        }
    }

    let mut out = Map::new();
    out.insert(
        "model".into(),
        obj.get("model").cloned().unwrap_or(Value::Null),
    );
    out.insert("messages".into(), Value::Array(messages));
    for key in ["max_tokens", "temperature", "stream", "top_p", "metadata", "thinking"] {
        if let Some(v) = obj.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(stop) = obj.get("stop_sequences") {
        out.insert("stop".into(), stop.clone());
    }
    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.get("name").cloned().unwrap_or(Value::Null),
                        "description": t.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": t.get("input_schema").cloned().unwrap_or(json!({})),
                    }
                })
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".into(), Value::Array(converted));
        }
    }

    Ok(Value::Object(out))
}

fn convert_anthropic_blocks(role: &str, blocks: &[Value], messages: &mut Vec<Value>) {
    let mut text_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                text_parts.push(json!({
                    "type": "text",
                    "text": block.get("text").cloned().unwrap_or(Value::Null),
                }));
            }
            Some("image") => {
                // Anthropic base64 source → OpenAI data-url part.
                let media = block
                    .pointer("/source/media_type")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                let data = block
                    .pointer("/source/data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                text_parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{media};base64,{data}")},
                }));
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": block
                            .get("input")
                            .map(|i| i.to_string())
                            .unwrap_or_else(|| "{}".into()),
                    }
                }));
            }
            Some("tool_result") => {
                let content = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "content": content,
                }));
            }
            _ => {}
        }
    }

    if !text_parts.is_empty() || !tool_calls.is_empty() {
        let content = if text_parts.len() == 1 && tool_calls.is_empty() {
            text_parts[0]
                .get("text")
                .cloned()
                .unwrap_or(Value::Array(text_parts.clone()))
        } else if text_parts.is_empty() {
            Value::String(String::new())
        } else {
            Value::Array(text_parts)
        };
        let mut msg = Map::new();
        msg.insert("role".into(), Value::String(role.into()));
        msg.insert("content".into(), content);
        if !tool_calls.is_empty() {
            msg.insert("tool_calls".into(), Value::Array(tool_calls));
        }
        messages.push(Value::Object(msg));
    }
}

// ── canonical → Anthropic Messages ──────────────────────────────────────────

/// Canonical request → Anthropic Messages request (for `anthropic-http`
/// upstreams).
pub fn canonical_request_to_anthropic(canonical: &Value) -> Value {
    let empty = Map::new();
    let obj = canonical.as_object().unwrap_or(&empty);

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in obj.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        match role {
            "system" => {
                if let Some(text) = message.get("content").and_then(Value::as_str) {
                    system_parts.push(text.to_string());
                }
            }
            "tool" => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                        "content": message.get("content").cloned().unwrap_or(Value::Null),
                    }]
                }));
            }
            "assistant" => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(text) = message.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                }
                for call in message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let arguments = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .and_then(|a| serde_json::from_str(a).ok())
                        .unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.get("id").cloned().unwrap_or(Value::Null),
                        "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
                        "input": arguments,
                    }));
                }
                if !blocks.is_empty() {
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            _ => {
                messages.push(json!({
                    "role": "user",
                    "content": message.get("content").cloned().unwrap_or(Value::Null),
                }));
            }
        }
    }

    let mut out = Map::new();
    out.insert("model".into(), obj.get("model").cloned().unwrap_or(Value::Null));
    out.insert("messages".into(), Value::Array(messages));
    out.insert(
        "max_tokens".into(),
        obj.get("max_tokens").cloned().unwrap_or(json!(4096)),
    );
    if !system_parts.is_empty() {
        out.insert("system".into(), Value::String(system_parts.join("\n\n")));
    }
    for key in ["temperature", "stream", "top_p", "thinking"] {
        if let Some(v) = obj.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(stop) = obj.get("stop") {
        out.insert("stop_sequences".into(), stop.clone());
    }
    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .filter_map(|t| {
                let function = t.get("function")?;
                Some(json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(json!("")),
                    "input_schema": function.get("parameters").cloned().unwrap_or(json!({})),
                }))
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".into(), Value::Array(converted));
        }
    }

    Value::Object(out)
}

/// Anthropic Messages response → canonical chat completion.
pub fn anthropic_response_to_canonical(response: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in response
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": block
                            .get("input")
                            .map(|i| i.to_string())
                            .unwrap_or_else(|| "{}".into()),
                    }
                }));
            }
            _ => {}
        }
    }

    let finish_reason = match response.get("stop_reason").and_then(Value::as_str) {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };

    let mut message = json!({"role": "assistant", "content": text});
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": response.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": response.pointer("/usage/input_tokens").cloned().unwrap_or(json!(0)),
            "completion_tokens": response.pointer("/usage/output_tokens").cloned().unwrap_or(json!(0)),
            "total_tokens": Value::Null,
        },
    })
}

/// Canonical chat completion → Anthropic Messages response (front door,
/// `/v1/messages` clients).
pub fn canonical_response_to_anthropic(response: &Value) -> Value {
    let choice = response
        .pointer("/choices/0")
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let input = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .and_then(|a| serde_json::from_str(a).ok())
            .unwrap_or(json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }

    let stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    };

    json!({
        "id": response.get("id").cloned().unwrap_or(json!("msg_proxy")),
        "type": "message",
        "role": "assistant",
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "content": content,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": response.pointer("/usage/prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": response.pointer("/usage/completion_tokens").cloned().unwrap_or(json!(0)),
        },
    })
}

// ── streaming bridges ───────────────────────────────────────────────────────

/// Anthropic SSE (provider side) → canonical OpenAI frames.
#[derive(Default)]
pub struct AnthropicToOpenAiStream {
    message_id: Option<String>,
    model: Option<String>,
    finished: bool,
}

impl AnthropicToOpenAiStream {
    fn chunk(&self, delta: Value, finish_reason: Value) -> SseFrame {
        SseFrame::data(
            json!({
                "id": self.message_id.clone().unwrap_or_else(|| "chatcmpl-proxy".into()),
                "object": "chat.completion.chunk",
                "model": self.model.clone().unwrap_or_default(),
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
            })
            .to_string(),
        )
    }
}

impl StreamTransform for AnthropicToOpenAiStream {
    fn on_frame(&mut self, frame: SseFrame) -> Vec<SseFrame> {
        let Ok(payload) = serde_json::from_str::<Value>(&frame.data) else {
            return Vec::new();
        };
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or("");

        match kind {
            "message_start" => {
                self.message_id = payload
                    .pointer("/message/id")
                    .and_then(Value::as_str)
                    .map(String::from);
                self.model = payload
                    .pointer("/message/model")
                    .and_then(Value::as_str)
                    .map(String::from);
                vec![self.chunk(json!({"role": "assistant", "content": ""}), Value::Null)]
            }
            "content_block_delta" => {
                let text = payload
                    .pointer("/delta/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if text.is_empty() {
                    return Vec::new();
                }
                vec![self.chunk(json!({"content": text}), Value::Null)]
            }
            "message_delta" => {
                let stop = payload.pointer("/delta/stop_reason").and_then(Value::as_str);
                match stop {
                    Some("max_tokens") => vec![self.chunk(json!({}), json!("length"))],
                    Some("tool_use") => vec![self.chunk(json!({}), json!("tool_calls"))],
                    Some(_) => vec![self.chunk(json!({}), json!("stop"))],
                    None => Vec::new(),
                }
            }
            "message_stop" => {
                self.finished = true;
                vec![SseFrame::data("[DONE]")]
            }
            // ping, content_block_start/stop carry nothing for OpenAI clients
            _ => Vec::new(),
        }
    }

    fn on_end(&mut self) -> Vec<SseFrame> {
        if self.finished {
            Vec::new()
        } else {
            self.finished = true;
            vec![SseFrame::data("[DONE]")]
        }
    }
}

/// Canonical OpenAI frames → Anthropic SSE (front door, `/v1/messages`).
#[derive(Default)]
pub struct OpenAiToAnthropicStream {
    started: bool,
    block_open: bool,
    finished: bool,
}

impl OpenAiToAnthropicStream {
    fn start_frames(&mut self, payload: &Value) -> Vec<SseFrame> {
        self.started = true;
        let message = json!({
            "type": "message_start",
            "message": {
                "id": payload.get("id").cloned().unwrap_or(json!("msg_proxy")),
                "type": "message",
                "role": "assistant",
                "model": payload.get("model").cloned().unwrap_or(json!("")),
                "content": [],
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }
        });
        vec![SseFrame::named("message_start", message.to_string())]
    }

    fn stop_frames(&mut self, stop_reason: &str) -> Vec<SseFrame> {
        self.finished = true;
        let mut frames = Vec::new();
        if self.block_open {
            frames.push(SseFrame::named(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}).to_string(),
            ));
            self.block_open = false;
        }
        frames.push(SseFrame::named(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason},
                "usage": {"output_tokens": 0},
            })
            .to_string(),
        ));
        frames.push(SseFrame::named(
            "message_stop",
            json!({"type": "message_stop"}).to_string(),
        ));
        frames
    }
}

impl StreamTransform for OpenAiToAnthropicStream {
    fn on_frame(&mut self, frame: SseFrame) -> Vec<SseFrame> {
        if frame.is_openai_done() {
            return if self.finished {
                Vec::new()
            } else {
                self.stop_frames("end_turn")
            };
        }
        let Ok(payload) = serde_json::from_str::<Value>(&frame.data) else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        if !self.started {
            frames.extend(self.start_frames(&payload));
        }

        if let Some(text) = payload
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                if !self.block_open {
                    self.block_open = true;
                    frames.push(SseFrame::named(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": 0,
                            "content_block": {"type": "text", "text": ""},
                        })
                        .to_string(),
                    ));
                }
                frames.push(SseFrame::named(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": text},
                    })
                    .to_string(),
                ));
            }
        }

        if let Some(reason) = payload
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
        {
            let stop_reason = match reason {
                "length" => "max_tokens",
                "tool_calls" => "tool_use",
                _ => "end_turn",
            };
            frames.extend(self.stop_frames(stop_reason));
        }

        frames
    }

    fn on_end(&mut self) -> Vec<SseFrame> {
        if self.finished {
            Vec::new()
        } else {
            self.stop_frames("end_turn")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_request_normalizes_system_and_messages() {
        let request = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "system": "Be terse.",
            "messages": [{"role": "user", "content": "hi"}],
            "stop_sequences": ["END"],
        });
        let canonical = anthropic_request_to_canonical(&request).unwrap();
        assert_eq!(canonical["messages"][0]["role"], "system");
        assert_eq!(canonical["messages"][0]["content"], "Be terse.");
        assert_eq!(canonical["messages"][1]["content"], "hi");
        assert_eq!(canonical["stop"][0], "END");
        assert_eq!(canonical["max_tokens"], 1024);
    }

    #[test]
    fn anthropic_tool_blocks_become_tool_calls() {
        let request = json!({
            "model": "claude-sonnet-4",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "toolu_1", "name": "web_search",
                     "input": {"query": "rust"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found it"}
                ]}
            ],
            "tools": [{"name": "web_search", "description": "search",
                       "input_schema": {"type": "object"}}]
        });
        let canonical = anthropic_request_to_canonical(&request).unwrap();
        let messages = canonical["messages"].as_array().unwrap();
        // tool_result surfaces as a role:tool message.
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "toolu_1");
        let calls = messages[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls[0]["function"]["name"], "web_search");
        assert_eq!(canonical["tools"][0]["function"]["name"], "web_search");
    }

    #[test]
    fn canonical_to_anthropic_roundtrips_structure() {
        let canonical = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 512,
            "messages": [
                {"role": "system", "content": "Be helpful."},
                {"role": "user", "content": "ping"},
            ],
            "stop": ["DONE"],
            "tools": [{"type": "function", "function": {
                "name": "calc", "description": "math", "parameters": {"type": "object"}}}],
        });
        let anthropic = canonical_request_to_anthropic(&canonical);
        assert_eq!(anthropic["system"], "Be helpful.");
        assert_eq!(anthropic["messages"][0]["role"], "user");
        assert_eq!(anthropic["stop_sequences"][0], "DONE");
        assert_eq!(anthropic["tools"][0]["input_schema"]["type"], "object");
        assert!(anthropic.get("stop").is_none());
    }

    #[test]
    fn anthropic_response_maps_to_choices() {
        let response = json!({
            "id": "msg_01",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "toolu_2", "name": "calc", "input": {"x": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let canonical = anthropic_response_to_canonical(&response);
        assert_eq!(canonical["choices"][0]["message"]["content"], "hello");
        assert_eq!(canonical["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            canonical["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "calc"
        );
        assert_eq!(canonical["usage"]["prompt_tokens"], 10);
    }

    #[test]
    fn canonical_response_maps_back_to_message() {
        let canonical = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "finish_reason": "length",
                         "message": {"role": "assistant", "content": "partial"}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3},
        });
        let anthropic = canonical_response_to_anthropic(&canonical);
        assert_eq!(anthropic["type"], "message");
        assert_eq!(anthropic["content"][0]["text"], "partial");
        assert_eq!(anthropic["stop_reason"], "max_tokens");
        assert_eq!(anthropic["usage"]["input_tokens"], 7);
    }

    #[test]
    fn anthropic_stream_bridges_to_openai_frames() {
        let mut transform = AnthropicToOpenAiStream::default();

        let start = transform.on_frame(SseFrame::named(
            "message_start",
            json!({"type": "message_start",
                   "message": {"id": "msg_01", "model": "claude-sonnet-4"}})
            .to_string(),
        ));
        assert_eq!(start.len(), 1);
        let first: Value = serde_json::from_str(&start[0].data).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["id"], "msg_01");

        let delta = transform.on_frame(SseFrame::named(
            "content_block_delta",
            json!({"type": "content_block_delta",
                   "delta": {"type": "text_delta", "text": "hi"}})
            .to_string(),
        ));
        let payload: Value = serde_json::from_str(&delta[0].data).unwrap();
        assert_eq!(payload["choices"][0]["delta"]["content"], "hi");

        let stop = transform.on_frame(SseFrame::named(
            "message_stop",
            json!({"type": "message_stop"}).to_string(),
        ));
        assert!(stop[0].is_openai_done());
        assert!(transform.on_end().is_empty());
    }

    #[test]
    fn openai_stream_bridges_to_anthropic_events() {
        let mut transform = OpenAiToAnthropicStream::default();

        let frames = transform.on_frame(SseFrame::data(
            json!({"id": "chatcmpl-1", "model": "gpt-4o-mini",
                   "choices": [{"index": 0, "delta": {"content": "hey"},
                                "finish_reason": Value::Null}]})
            .to_string(),
        ));
        let events: Vec<_> = frames.iter().filter_map(|f| f.event.clone()).collect();
        assert_eq!(
            events,
            vec!["message_start", "content_block_start", "content_block_delta"]
        );

        let done = transform.on_frame(SseFrame::data("[DONE]"));
        let events: Vec<_> = done.iter().filter_map(|f| f.event.clone()).collect();
        assert_eq!(events, vec!["content_block_stop", "message_delta", "message_stop"]);
        assert!(transform.on_end().is_empty());
    }

    #[test]
    fn truncated_openai_stream_still_terminates_anthropic_side() {
        let mut transform = OpenAiToAnthropicStream::default();
        transform.on_frame(SseFrame::data(
            json!({"choices": [{"index": 0, "delta": {"content": "cut"},
                                "finish_reason": Value::Null}]})
            .to_string(),
        ));
        // Upstream died without [DONE]; the bridge synthesizes the stop.
        let tail = transform.on_end();
        assert!(tail.iter().any(|f| f.is_anthropic_stop()));
    }
}
