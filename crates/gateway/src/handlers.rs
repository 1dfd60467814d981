//! Front-door request handlers.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::{Value, json};

use crate::SharedState;
use crate::bridge::{Surface, error_response, serve_chat};

/// `POST /v1/chat/completions` — the OpenAI surface.
pub async fn chat_completions(State(state): State<SharedState>, body: String) -> Response {
    match serde_json::from_str::<Value>(&body) {
        Ok(raw) if raw.is_object() => serve_chat(state, Surface::OpenAi, raw).await,
        _ => error_response(Surface::OpenAi, 400, "request body must be a JSON object"),
    }
}

/// `POST /v1/messages` — the Anthropic surface.
pub async fn messages(State(state): State<SharedState>, body: String) -> Response {
    match serde_json::from_str::<Value>(&body) {
        Ok(raw) if raw.is_object() => serve_chat(state, Surface::Anthropic, raw).await,
        _ => error_response(Surface::Anthropic, 400, "request body must be a JSON object"),
    }
}

/// `POST /v1/completions` — legacy text completions, bridged over chat.
pub async fn completions(State(state): State<SharedState>, body: String) -> Response {
    let raw = match serde_json::from_str::<Value>(&body) {
        Ok(v) if v.is_object() => v,
        _ => return error_response(Surface::OpenAi, 400, "request body must be a JSON object"),
    };

    let chat_request = completions_to_chat(&raw);
    let streaming = raw.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let response = serve_chat(state, Surface::OpenAi, chat_request).await;

    // Streaming and error responses pass through; successful JSON bodies are
    // mapped back to the text-completion shape.
    if streaming || response.status() != StatusCode::OK {
        return response;
    }
    let is_json = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, 32 * 1024 * 1024).await {
        Ok(bytes) => {
            let mapped = serde_json::from_slice::<Value>(&bytes)
                .map(|chat| chat_to_completions(&chat))
                .unwrap_or_else(|_| Value::Null);
            Response::from_parts(parts, axum::body::Body::from(mapped.to_string()))
        }
        Err(err) => error_response(Surface::OpenAi, 500, &format!("body read failed: {err}")),
    }
}

fn completions_to_chat(raw: &Value) -> Value {
    let prompt = match raw.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };

    let mut chat = json!({
        "model": raw.get("model").cloned().unwrap_or(Value::Null),
        "messages": [{"role": "user", "content": prompt}],
    });
    for key in ["max_tokens", "temperature", "stream", "stop", "top_p", "user"] {
        if let Some(v) = raw.get(key) {
            chat[key] = v.clone();
        }
    }
    chat
}

fn chat_to_completions(chat: &Value) -> Value {
    let text = chat
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    json!({
        "id": chat.get("id").cloned().unwrap_or(json!("cmpl-proxy")),
        "object": "text_completion",
        "model": chat.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "text": text,
            "index": 0,
            "finish_reason": chat.pointer("/choices/0/finish_reason").cloned()
                .unwrap_or(json!("stop")),
            "logprobs": Value::Null,
        }],
        "usage": chat.get("usage").cloned().unwrap_or(Value::Null),
    })
}

/// `GET /v1/models` — every `(provider, model)` the active config serves.
pub async fn list_models(State(state): State<SharedState>) -> Json<Value> {
    let engine = state.engine.load();
    let mut data = Vec::new();
    for (provider_id, profile) in &engine.config.providers {
        for model_id in profile.models.keys() {
            data.push(json!({
                "id": model_id,
                "object": "model",
                "owned_by": provider_id,
            }));
        }
    }
    Json(json!({"object": "list", "data": data}))
}

/// `GET /health` — liveness plus a health-tracker summary.
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    let engine = state.engine.load();
    let views = engine.health.all_views();
    let banned = views.iter().filter(|v| v.ban_remaining_ms.is_some()).count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "generation": engine.pipelines.generation(),
        "pipelines": engine.pipelines.len(),
        "targetsTracked": views.len(),
        "targetsBanned": banned,
    }))
}

/// `GET /ready` — 200 only when the engine can actually serve.
pub async fn ready(State(state): State<SharedState>) -> (StatusCode, Json<Value>) {
    let engine = state.engine.load();
    if engine.pipelines.is_empty() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ready": false})),
        )
    } else {
        (StatusCode::OK, Json(json!({"ready": true})))
    }
}

/// `POST /shutdown` — graceful drain. When `ROUTECODEX_STOP_PASSWORD` is
/// set, the request must present it (header or body); this gate applies to
/// both stop paths, CLI and HTTP.
pub async fn shutdown(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Ok(expected) = std::env::var("ROUTECODEX_STOP_PASSWORD") {
        if !expected.is_empty() {
            let presented = headers
                .get("x-rcc-stop-password")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .or_else(|| {
                    serde_json::from_str::<Value>(&body)
                        .ok()
                        .and_then(|v| v.get("password").and_then(Value::as_str).map(String::from))
                });
            if presented.as_deref() != Some(expected.as_str()) {
                return Err((
                    StatusCode::FORBIDDEN,
                    Json(json!({"error": "stop password required"})),
                ));
            }
        }
    }

    tracing::info!("shutdown requested via HTTP");
    state.request_shutdown();
    Ok(Json(json!({"stopping": true})))
}
