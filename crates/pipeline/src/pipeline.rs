//! The per-target pipeline: stages in order, caps enforced, snapshot taps.
//!
//! `execute` runs Workflow → Compatibility → LLMSwitch(provider side) →
//! ProviderAdapter and back. The inbound half of the protocol bridge (client
//! protocol → canonical) runs at the front door; pipelines always receive
//! canonical payloads. Credentials are re-resolved at the start of every
//! upstream call so refreshes take effect between requests, never within
//! one.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

use routecodex_config::PipelineSpec;
use routecodex_core::error::{AdapterError, ProxyError, StreamTimeoutKind};
use routecodex_core::profile::AuthMode;
use routecodex_core::target::RoutingDecision;
use routecodex_credentials::CredentialStore;
use routecodex_snapshot::{SnapshotEvent, SnapshotSink};

use crate::adapter::{ProviderAdapter, UpstreamContext, UpstreamQuota, UpstreamResponse};
use crate::sse::SseFrame;
use crate::stages::compat::Compatibility;
use crate::stages::llmswitch::{LlmSwitch, StreamTransform};
use crate::stages::workflow::WorkflowStage;

/// Per-call dependencies handed in by the front door.
pub struct PipelineContext {
    pub credentials: Arc<CredentialStore>,
    pub snapshot: SnapshotSink,
}

/// What one pipeline execution produced.
pub enum PipelineOutcome {
    Complete {
        body: Value,
        quota: Option<UpstreamQuota>,
    },
    Stream {
        stream: PipelineStream,
        quota: Option<UpstreamQuota>,
    },
}

/// One immutable pipeline for one `(provider, model, alias)` target.
pub struct Pipeline {
    spec: PipelineSpec,
    llm_switch: LlmSwitch,
    workflow: WorkflowStage,
    compatibility: Compatibility,
    adapter: Arc<dyn ProviderAdapter>,
    auth_mode: AuthMode,
    user_agent_override: Option<String>,
}

impl Pipeline {
    pub(crate) fn new(
        spec: PipelineSpec,
        llm_switch: LlmSwitch,
        workflow: WorkflowStage,
        compatibility: Compatibility,
        adapter: Arc<dyn ProviderAdapter>,
        auth_mode: AuthMode,
        user_agent_override: Option<String>,
    ) -> Self {
        Self {
            spec,
            llm_switch,
            workflow,
            compatibility,
            adapter,
            auth_mode,
            user_agent_override,
        }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Run one canonical request through the stage chain.
    pub async fn execute(
        &self,
        canonical: Value,
        decision: &RoutingDecision,
        ctx: &PipelineContext,
    ) -> Result<PipelineOutcome, ProxyError> {
        let target = &self.spec.target;

        // Credential pinned for the duration of this call.
        let secret = if self.auth_mode == AuthMode::None {
            None
        } else {
            let record = ctx
                .credentials
                .resolve(&target.provider, &target.key_alias)
                .map_err(|e| ProxyError::CredentialUnavailable {
                    provider: target.provider.clone(),
                    alias: target.key_alias.clone(),
                    reason: e.to_string(),
                })?;
            Some(record.secret.clone())
        };

        let mut payload = canonical;
        // The router decided the target; the pipeline pins the model id.
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("model".into(), Value::String(target.model.clone()));
        }
        self.workflow.on_request(&mut payload);
        self.compatibility.on_request(&mut payload, &self.spec.limits);

        let streaming = payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let provider_payload = self.llm_switch.to_provider(&payload);

        ctx.snapshot.record(SnapshotEvent::UpstreamRequest {
            request_id: decision.request_id.clone(),
            payload: provider_payload.clone(),
        });

        let upstream_ctx = UpstreamContext {
            secret,
            auth_mode: self.auth_mode,
            user_agent: self
                .workflow
                .user_agent(self.user_agent_override.as_deref()),
        };

        // Non-streaming calls get the whole-call deadline; streaming calls
        // cap only the pre-headers phase here — the idle cap takes over once
        // frames flow.
        let deadline = if streaming {
            Duration::from_millis(self.spec.limits.stream_headers_cap_ms)
        } else {
            Duration::from_millis(self.spec.limits.provider_timeout_ms)
        };

        let response = match tokio::time::timeout(
            deadline,
            self.adapter.execute(&provider_payload, streaming, &upstream_ctx),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) if streaming => {
                return Err(ProxyError::StreamTimeout {
                    kind: StreamTimeoutKind::Headers,
                });
            }
            Err(_) => {
                return Err(ProxyError::Upstream {
                    status: 504,
                    message: format!(
                        "upstream call exceeded {}ms",
                        self.spec.limits.provider_timeout_ms
                    ),
                });
            }
        };

        match response {
            UpstreamResponse::Json { body, quota } => {
                ctx.snapshot.record(SnapshotEvent::UpstreamResponse {
                    request_id: decision.request_id.clone(),
                    payload: body.clone(),
                });
                let body = self.llm_switch.to_canonical(body);
                let body = self.compatibility.on_response(body);
                let body = self.workflow.on_response(body);
                Ok(PipelineOutcome::Complete { body, quota })
            }
            UpstreamResponse::Stream { frames, quota } => {
                let stream = PipelineStream {
                    frames,
                    transform: self.llm_switch.stream_transform(),
                    idle_cap: Duration::from_millis(self.spec.limits.stream_idle_cap_ms),
                    pending: VecDeque::new(),
                    snapshot: ctx.snapshot.clone(),
                    request_id: decision.request_id.clone(),
                    done: false,
                };
                Ok(PipelineOutcome::Stream { stream, quota })
            }
        }
    }
}

/// Canonical SSE frames with the idle cap enforced. Dropping the stream
/// closes the channel, which aborts the upstream forwarder and with it the
/// upstream connection.
pub struct PipelineStream {
    frames: mpsc::Receiver<Result<SseFrame, AdapterError>>,
    transform: Box<dyn StreamTransform>,
    idle_cap: Duration,
    pending: VecDeque<SseFrame>,
    snapshot: SnapshotSink,
    request_id: String,
    done: bool,
}

impl PipelineStream {
    #[cfg(test)]
    pub(crate) fn for_tests(
        frames: mpsc::Receiver<Result<SseFrame, AdapterError>>,
        transform: Box<dyn StreamTransform>,
        idle_cap: Duration,
    ) -> Self {
        Self {
            frames,
            transform,
            idle_cap,
            pending: VecDeque::new(),
            snapshot: SnapshotSink::disabled(),
            request_id: "test".into(),
            done: false,
        }
    }

    /// Next canonical frame; `None` at end of stream. Errors are terminal.
    pub async fn next(&mut self) -> Option<Result<SseFrame, ProxyError>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            if self.done {
                return None;
            }

            match tokio::time::timeout(self.idle_cap, self.frames.recv()).await {
                Err(_) => {
                    self.done = true;
                    self.frames.close();
                    return Some(Err(ProxyError::StreamTimeout {
                        kind: StreamTimeoutKind::Idle,
                    }));
                }
                Ok(None) => {
                    self.done = true;
                    self.pending.extend(self.transform.on_end());
                }
                Ok(Some(Err(err))) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
                Ok(Some(Ok(frame))) => {
                    self.snapshot.record(SnapshotEvent::SseChunk {
                        request_id: self.request_id.clone(),
                        data: frame.data.clone(),
                    });
                    self.pending.extend(self.transform.on_frame(frame));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::llmswitch::IdentityStream;

    fn stream_of(
        frames: Vec<Result<SseFrame, AdapterError>>,
        idle_cap: Duration,
    ) -> PipelineStream {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        });
        PipelineStream::for_tests(rx, Box::new(IdentityStream), idle_cap)
    }

    #[tokio::test]
    async fn passthrough_stream_preserves_order() {
        let mut stream = stream_of(
            vec![
                Ok(SseFrame::data("a")),
                Ok(SseFrame::data("b")),
                Ok(SseFrame::data("[DONE]")),
            ],
            Duration::from_secs(5),
        );
        assert_eq!(stream.next().await.unwrap().unwrap().data, "a");
        assert_eq!(stream.next().await.unwrap().unwrap().data, "b");
        assert!(stream.next().await.unwrap().unwrap().is_openai_done());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn adapter_error_terminates_stream() {
        let mut stream = stream_of(
            vec![
                Ok(SseFrame::data("a")),
                Err(AdapterError::StreamInterrupted("conn reset".into())),
            ],
            Duration::from_secs(5),
        );
        assert!(stream.next().await.unwrap().is_ok());
        match stream.next().await.unwrap() {
            Err(ProxyError::Upstream { status, .. }) => assert_eq!(status, 502),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_cap_closes_stream() {
        let (tx, rx) = mpsc::channel::<Result<SseFrame, AdapterError>>(4);
        let mut stream =
            PipelineStream::for_tests(rx, Box::new(IdentityStream), Duration::from_secs(10));

        tx.send(Ok(SseFrame::data("first"))).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        // Keep the sender alive but silent.
        let hold = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(tx);
        });
        match stream.next().await.unwrap() {
            Err(ProxyError::StreamTimeout { kind }) => assert_eq!(kind, StreamTimeoutKind::Idle),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.next().await.is_none());
        hold.abort();
    }

    #[tokio::test]
    async fn bridge_transform_synthesizes_terminal_frame() {
        // An Anthropic-upstream stream that dies before message_stop still
        // hands OpenAI clients a [DONE].
        let (tx, rx) = mpsc::channel(4);
        let mut stream = PipelineStream::for_tests(
            rx,
            Box::new(crate::stages::llmswitch::AnthropicToOpenAiStream::default()),
            Duration::from_secs(5),
        );
        tx.send(Ok(SseFrame::named(
            "content_block_delta",
            serde_json::json!({"type": "content_block_delta",
                               "delta": {"type": "text_delta", "text": "hi"}})
            .to_string(),
        )))
        .await
        .unwrap();
        drop(tx);

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.data.contains("hi"));
        let last = stream.next().await.unwrap().unwrap();
        assert!(last.is_openai_done());
        assert!(stream.next().await.is_none());
    }
}
