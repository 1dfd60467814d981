//! The routing/pipeline bridge: retry loop, health reporting, SSE fan-out,
//! and client-protocol error envelopes.

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;

use routecodex_core::chat::ChatRequest;
use routecodex_core::error::ProxyError;
use routecodex_health::{HealthTracker, Outcome, Permit, QuotaUpdate};
use routecodex_pipeline::stages::llmswitch::{
    self, OpenAiToAnthropicStream, StreamTransform,
};
use routecodex_pipeline::{PipelineContext, PipelineOutcome, PipelineStream, UpstreamQuota};
use routecodex_snapshot::SnapshotEvent;

use crate::SharedState;

/// Total wall-clock cap on one streaming response (16.6 min).
const STREAM_TOTAL_CAP: Duration = Duration::from_millis(996_000);

/// Which client protocol the response must speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    OpenAi,
    Anthropic,
}

/// Serve one chat-shaped request end to end.
pub async fn serve_chat(state: SharedState, surface: Surface, raw: Value) -> Response {
    // Pin the engine generation for the whole request.
    let engine = state.engine.load_full();
    let request_id = format!("req-{}", uuid::Uuid::new_v4());

    state.snapshot.record(SnapshotEvent::RequestEnvelope {
        request_id: request_id.clone(),
        payload: raw.clone(),
    });

    // Inbound half of the protocol bridge: everything past this point is
    // canonical (OpenAI-shaped).
    let canonical = match surface {
        Surface::OpenAi => raw,
        Surface::Anthropic => match llmswitch::anthropic_request_to_canonical(&raw) {
            Ok(v) => v,
            Err(err) => return error_response(surface, 400, &err.to_string()),
        },
    };

    let chat: ChatRequest = match serde_json::from_value(canonical.clone()) {
        Ok(c) => c,
        Err(err) => {
            return error_response(surface, 400, &format!("invalid request: {err}"));
        }
    };

    state.snapshot.record(SnapshotEvent::Canonical {
        request_id: request_id.clone(),
        payload: canonical.clone(),
    });

    let ctx = PipelineContext {
        credentials: state.credentials.clone(),
        snapshot: state.snapshot.clone(),
    };

    let mut exclude: Vec<(String, String)> = Vec::new();
    let mut last_error: Option<ProxyError> = None;

    for attempt in 1..=engine.router.max_attempts {
        let mut success = match engine.router.route(&request_id, &chat, &exclude, attempt) {
            Ok(s) => s,
            Err(err) => {
                // Nothing admissible. If an earlier attempt already failed
                // upstream, that error is the more truthful one to surface.
                let err = last_error.take().unwrap_or(err);
                return proxy_error_response(&state, surface, &request_id, err);
            }
        };
        success.decision.credential_version = state
            .credentials
            .version(
                &success.decision.target.provider,
                &success.decision.target.key_alias,
            )
            .unwrap_or(0);

        let target = success.decision.target.clone();
        let Some(pipeline) = engine.pipelines.get(&target) else {
            // Routing table and pipeline set are built from the same config;
            // a miss means the engine is inconsistent.
            drop(success.permit);
            return proxy_error_response(
                &state,
                surface,
                &request_id,
                ProxyError::Internal(format!("no pipeline for target {target}")),
            );
        };

        tracing::info!(
            request_id,
            attempt,
            category = %success.decision.category,
            target = %target,
            "routing decision"
        );

        match pipeline.execute(canonical.clone(), &success.decision, &ctx).await {
            Ok(PipelineOutcome::Complete { body, quota }) => {
                engine.health.report(
                    success.permit,
                    Outcome::Success {
                        quota: quota.map(to_quota_update),
                    },
                );
                let body = finalize_body(surface, body);
                state.snapshot.record(SnapshotEvent::FinalResponse {
                    request_id: request_id.clone(),
                    payload: body.clone(),
                });
                return json_response(StatusCode::OK, &body);
            }
            Ok(PipelineOutcome::Stream { stream, quota }) => {
                return stream_response(
                    state.clone(),
                    engine.health.clone(),
                    surface,
                    request_id,
                    stream,
                    success.permit,
                    quota,
                );
            }
            Err(err) => {
                report_failure(&engine.health, success.permit, &err);
                let retryable = err.is_retryable() && attempt < engine.router.max_attempts;
                tracing::warn!(
                    request_id,
                    attempt,
                    target = %target,
                    error = %err,
                    retryable,
                    "pipeline attempt failed"
                );
                if !retryable {
                    return proxy_error_response(&state, surface, &request_id, err);
                }
                exclude.push((target.provider.clone(), target.key_alias.clone()));
                last_error = Some(err);
            }
        }
    }

    let err = last_error
        .unwrap_or_else(|| ProxyError::Internal("retry loop exhausted without error".into()));
    proxy_error_response(&state, surface, &request_id, err)
}

fn to_quota_update(q: UpstreamQuota) -> QuotaUpdate {
    QuotaUpdate {
        remaining: q.remaining,
        resets_in_secs: q.resets_in_secs,
    }
}

/// Map a pipeline failure onto the health tracker's outcome vocabulary.
fn report_failure(health: &Arc<HealthTracker>, permit: Permit, err: &ProxyError) {
    let status = match err {
        ProxyError::Upstream { status, .. } => *status,
        ProxyError::CredentialUnavailable { .. } => 401,
        ProxyError::StreamTimeout { .. } => 0,
        _ => 0,
    };
    let retry_after = err.retry_after_secs().map(Duration::from_secs);
    health.report(
        permit,
        Outcome::Error {
            status,
            retry_after,
            quota: None,
        },
    );
}

/// Outbound half of the protocol bridge for complete responses.
fn finalize_body(surface: Surface, body: Value) -> Value {
    match surface {
        Surface::OpenAi => body,
        Surface::Anthropic => llmswitch::canonical_response_to_anthropic(&body),
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

/// Build the SSE response: spawn a forwarder that pulls pipeline frames,
/// applies the surface bridge, enforces the total cap, reports the health
/// outcome at stream end, and emits a protocol-appropriate terminal frame on
/// error. Client disconnect drops the receiver, which tears the whole chain
/// down to the upstream connection.
fn stream_response(
    state: SharedState,
    health: Arc<HealthTracker>,
    surface: Surface,
    request_id: String,
    mut stream: PipelineStream,
    permit: Permit,
    quota: Option<UpstreamQuota>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, std::convert::Infallible>>(64);

    tokio::spawn(async move {
        let deadline = Instant::now() + STREAM_TOTAL_CAP;
        let mut bridge: Box<dyn StreamTransform> = match surface {
            Surface::OpenAi => Box::new(llmswitch::IdentityStream),
            Surface::Anthropic => Box::new(OpenAiToAnthropicStream::default()),
        };
        let mut failed: Option<ProxyError> = None;

        loop {
            let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    failed = Some(ProxyError::StreamTimeout {
                        kind: routecodex_core::error::StreamTimeoutKind::Idle,
                    });
                    break;
                }
            };
            match next {
                None => break,
                Some(Ok(frame)) => {
                    for out in bridge.on_frame(frame) {
                        if tx.send(Ok(out.to_wire())).await.is_err() {
                            // Client went away: cancel upstream, no health
                            // penalty.
                            tracing::debug!(request_id, "client disconnected mid-stream");
                            drop(stream);
                            health.report(permit, Outcome::Success { quota: None });
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    failed = Some(err);
                    break;
                }
            }
        }

        match failed {
            None => {
                for out in bridge.on_end() {
                    let _ = tx.send(Ok(out.to_wire())).await;
                }
                health.report(
                    permit,
                    Outcome::Success {
                        quota: quota.map(to_quota_update),
                    },
                );
                state.snapshot.record(SnapshotEvent::Lifecycle {
                    kind: "stream-complete".into(),
                    detail: json!({"requestId": request_id}),
                });
            }
            Some(err) => {
                tracing::warn!(request_id, error = %err, "stream terminated with error");
                for frame in terminal_error_frames(surface, &err) {
                    let _ = tx.send(Ok(frame)).await;
                }
                report_failure(&health, permit, &err);
                state.snapshot.record(SnapshotEvent::Lifecycle {
                    kind: "stream-error".into(),
                    detail: json!({"requestId": request_id, "error": err.to_string()}),
                });
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_default()
}

/// The synthetic frames that terminate a broken stream in each protocol.
fn terminal_error_frames(surface: Surface, err: &ProxyError) -> Vec<String> {
    match surface {
        Surface::OpenAi => vec![
            format!(
                "data: {}\n\n",
                json!({"error": {"message": err.to_string(), "type": error_type(err)}})
            ),
            "data: [DONE]\n\n".to_string(),
        ],
        Surface::Anthropic => vec![
            format!(
                "event: error\ndata: {}\n\n",
                json!({"type": "error",
                       "error": {"type": error_type(err), "message": err.to_string()}})
            ),
            format!(
                "event: message_stop\ndata: {}\n\n",
                json!({"type": "message_stop"})
            ),
        ],
    }
}

fn error_type(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::NoHealthyTarget { .. }
        | ProxyError::TargetBanned { .. }
        | ProxyError::TargetRateLimited { .. }
        | ProxyError::TargetQuotaExhausted { .. } => "overloaded_error",
        ProxyError::Upstream { status: 429, .. } => "rate_limit_error",
        ProxyError::Upstream { status, .. } if *status == 401 || *status == 403 => {
            "authentication_error"
        }
        ProxyError::Upstream { .. } => "api_error",
        ProxyError::StreamTimeout { .. } => "timeout_error",
        ProxyError::CredentialUnavailable { .. } => "authentication_error",
        ProxyError::ClientCanceled => "client_canceled",
        ProxyError::ConfigInvalid(_) | ProxyError::Internal(_) => "internal_error",
    }
}

/// Error response in the client's protocol, with `Retry-After` when the
/// error carries a deadline.
pub fn proxy_error_response(
    state: &SharedState,
    surface: Surface,
    request_id: &str,
    err: ProxyError,
) -> Response {
    state.snapshot.record(SnapshotEvent::Lifecycle {
        kind: "request-error".into(),
        detail: json!({"requestId": request_id, "error": err.to_string()}),
    });

    let status = err.http_status();
    // 499 has no axum constant; clients that vanished get nothing anyway.
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match &err {
        ProxyError::Internal(detail) => {
            tracing::error!(request_id, detail, "internal error");
            "internal server error".to_string()
        }
        other => other.to_string(),
    };

    let body = match surface {
        Surface::OpenAi => json!({
            "error": {"message": message, "type": error_type(&err), "code": status}
        }),
        Surface::Anthropic => json!({
            "type": "error",
            "error": {"type": error_type(&err), "message": message}
        }),
    };

    let mut response = json_response(status_code, &body);
    if let Some(secs) = err.retry_after_secs() {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

pub fn error_response(surface: Surface, status: u16, message: &str) -> Response {
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
    let body = match surface {
        Surface::OpenAi => json!({
            "error": {"message": message, "type": "invalid_request_error", "code": status}
        }),
        Surface::Anthropic => json!({
            "type": "error",
            "error": {"type": "invalid_request_error", "message": message}
        }),
    };
    json_response(status_code, &body)
}
