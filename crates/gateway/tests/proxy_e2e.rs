//! End-to-end proxy tests against a mock upstream.
//!
//! Spins up a small axum server playing the OpenAI-compatible upstream,
//! points a single-provider config at it, and drives requests through the
//! full front door: auth → router → pipeline → adapter → SSE bridge.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tower::ServiceExt;

use routecodex_core::event::EventBus;
use routecodex_credentials::CredentialStore;
use routecodex_gateway::{AppState, Engine, SharedState, build_app};
use routecodex_health::HealthTracker;
use routecodex_snapshot::SnapshotSink;

/// What the mock upstream should do per request.
#[derive(Clone)]
enum UpstreamScript {
    /// Always 200 with a fixed completion.
    Ok,
    /// Always 429.
    RateLimited,
    /// SSE stream with two deltas and a [DONE].
    Stream,
}

struct MockUpstream {
    base_url: String,
    hits: Arc<AtomicU32>,
}

async fn spawn_upstream(script: UpstreamScript) -> MockUpstream {
    let hits = Arc::new(AtomicU32::new(0));
    let hits_handler = hits.clone();

    let app = axum::Router::new().route(
        "/chat/completions",
        axum::routing::post(move |body: String| {
            let script = script.clone();
            let hits = hits_handler.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                match script {
                    UpstreamScript::Ok => axum::Json(json!({
                        "id": "chatcmpl-mock",
                        "object": "chat.completion",
                        "model": request["model"],
                        "choices": [{"index": 0, "finish_reason": "stop",
                                     "message": {"role": "assistant", "content": "pong"}}],
                        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
                    }))
                    .into_response(),
                    UpstreamScript::RateLimited => (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("retry-after", "1")],
                        axum::Json(json!({"error": {"message": "slow down"}})),
                    )
                        .into_response(),
                    UpstreamScript::Stream => {
                        let frames = concat!(
                            "data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"po\"},\"finish_reason\":null}]}\n\n",
                            "data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ng\"},\"finish_reason\":\"stop\"}]}\n\n",
                            "data: [DONE]\n\n",
                        );
                        (
                            StatusCode::OK,
                            [("content-type", "text/event-stream")],
                            frames,
                        )
                            .into_response()
                    }
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockUpstream {
        base_url: format!("http://127.0.0.1:{port}"),
        hits,
    }
}

fn proxy_state(base_url: &str, health_overrides: Option<Value>) -> SharedState {
    let dir = tempfile::tempdir().unwrap();
    let mut group = json!({
        "routing": {"default": [{"id": "p", "mode": "priority",
                                  "targets": ["openai.gpt-4o-mini"]}]}
    });
    if let Some(health) = health_overrides {
        group["health"] = health;
    }
    let config = json!({
        "version": "1.0.0",
        "httpserver": {"host": "127.0.0.1", "port": 5555},
        "virtualrouter": {
            "providers": {
                "openai": {
                    "type": "openai-http",
                    "baseUrl": base_url,
                    "apiKey": ["sk-test"],
                    "models": {"gpt-4o-mini": {"maxContext": 128000, "maxTokens": 16384}}
                }
            },
            "routingPolicyGroups": {"default": group}
        }
    });
    let path = dir.path().join("config.json");
    std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
    let resolved = routecodex_config::Loader::with_home(dir.path().to_path_buf())
        .load(Some(&path))
        .unwrap();

    let events = Arc::new(EventBus::default());
    let credentials = Arc::new(CredentialStore::new(events.clone()));
    credentials.load_profiles(&resolved.providers);
    let health = Arc::new(HealthTracker::new(Engine::health_policy_from_config(
        &resolved,
    )));
    let engine = Engine::build(resolved, health, 1).unwrap();
    let (state, _shutdown) = AppState::new(engine, credentials, SnapshotSink::disabled(), events);
    state
}

async fn post_chat(state: SharedState, body: Value) -> (StatusCode, Value, axum::http::HeaderMap) {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = build_app(state).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value, headers)
}

fn chat_body() -> Value {
    json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]})
}

#[tokio::test]
async fn openai_non_stream_happy_path() {
    let upstream = spawn_upstream(UpstreamScript::Ok).await;
    let state = proxy_state(&upstream.base_url, None);

    let (status, body, _) = post_chat(state.clone(), chat_body()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);

    let view = state.engine.load().health.view("openai", "key1");
    assert_eq!(view.consecutive_errors, 0);
    assert_eq!(view.last_status_code, Some(200));
}

#[tokio::test]
async fn anthropic_surface_bridges_to_openai_upstream() {
    let upstream = spawn_upstream(UpstreamScript::Ok).await;
    let state = proxy_state(&upstream.base_url, None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o-mini", "max_tokens": 64,
                   "system": "Be brief.",
                   "messages": [{"role": "user", "content": "ping"}]})
            .to_string(),
        ))
        .unwrap();
    let response = build_app(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "pong");
    assert_eq!(body["stop_reason"], "end_turn");
}

#[tokio::test]
async fn rate_limit_ladder_escalates_and_surfaces_retry_after() {
    let upstream = spawn_upstream(UpstreamScript::RateLimited).await;
    // First two ladder steps are tiny so consecutive 429s can actually reach
    // the upstream; the third is the 6 h step under test.
    let state = proxy_state(
        &upstream.base_url,
        Some(json!({"rateLimitScheduleMs": [1, 1, 21_600_000, 86_400_000]})),
    );

    for _ in 0..3 {
        let (status, body, _) = post_chat(state.clone(), chat_body()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["type"], "rate_limit_error");
        // Let the micro-bans of the early steps lapse.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 3);

    // Third 429 hit ladder index 2 → six-hour ban; the next request never
    // reaches the upstream.
    let (status, body, headers) = post_chat(state.clone(), chat_body()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "overloaded_error");
    let retry: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry >= 6 * 3600 - 5, "retry-after was {retry}");
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 3);

    let view = state.engine.load().health.view("openai", "key1");
    assert_eq!(view.rate_limit_step, 3);
}

#[tokio::test]
async fn streaming_frames_arrive_in_order_with_terminal_done() {
    let upstream = spawn_upstream(UpstreamScript::Stream).await;
    let state = proxy_state(&upstream.base_url, None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o-mini", "stream": true,
                   "messages": [{"role": "user", "content": "hi"}]})
            .to_string(),
        ))
        .unwrap();
    let response = build_app(state.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let transcript = String::from_utf8_lossy(&bytes);
    let po = transcript.find("\"po\"").expect("first delta present");
    let ng = transcript.find("\"ng\"").expect("second delta present");
    let done = transcript.find("data: [DONE]").expect("terminal frame present");
    assert!(po < ng && ng < done, "frames out of order: {transcript}");

    // Stream completion counts as success.
    let view = state.engine.load().health.view("openai", "key1");
    assert_eq!(view.consecutive_errors, 0);
}

#[tokio::test]
async fn completions_surface_maps_to_text_completion() {
    let upstream = spawn_upstream(UpstreamScript::Ok).await;
    let state = proxy_state(&upstream.base_url, None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "gpt-4o-mini", "prompt": "say pong", "max_tokens": 8}).to_string(),
        ))
        .unwrap();
    let response = build_app(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], "pong");
}
