//! Provider adapters — the outbound HTTP clients.
//!
//! Every upstream family implements [`ProviderAdapter`]. Adapters receive
//! the fully transformed payload plus an [`UpstreamContext`] carrying the
//! credential pinned for this call; they never resolve credentials
//! themselves. Streaming responses come back as whole SSE frames.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;

use routecodex_core::error::AdapterError;
use routecodex_core::profile::AuthMode;

use crate::sse::{FrameParser, SseFrame};

/// Per-call context: credential material and caps, pinned at call start.
#[derive(Debug, Clone)]
pub struct UpstreamContext {
    pub secret: Option<String>,
    pub auth_mode: AuthMode,
    pub user_agent: Option<String>,
}

/// Quota view parsed from upstream rate-limit headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamQuota {
    pub remaining: Option<u64>,
    pub resets_in_secs: Option<u64>,
}

impl UpstreamQuota {
    fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.resets_in_secs.is_none()
    }
}

/// What an adapter hands back.
pub enum UpstreamResponse {
    Json {
        body: Value,
        quota: Option<UpstreamQuota>,
    },
    Stream {
        frames: mpsc::Receiver<Result<SseFrame, AdapterError>>,
        quota: Option<UpstreamQuota>,
    },
}

/// The outbound seam every upstream family implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry identifier (`openai-http`, `anthropic-http`, …).
    fn id(&self) -> &str;

    /// Send one request. `stream` selects SSE mode. Completes once the
    /// response headers are in; the caller caps the wait.
    async fn execute(
        &self,
        payload: &Value,
        stream: bool,
        ctx: &UpstreamContext,
    ) -> Result<UpstreamResponse, AdapterError>;
}

fn build_client() -> reqwest::Client {
    // No total-request timeout here: streaming responses outlive any sane
    // fixed deadline. Callers cap the phases they care about.
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

/// Parse `Retry-After` (delta-seconds form) from response headers.
fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Parse the OpenAI- and Anthropic-style rate-limit headers.
fn parse_quota(headers: &HeaderMap) -> Option<UpstreamQuota> {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let remaining = get("x-ratelimit-remaining-requests")
        .or_else(|| get("anthropic-ratelimit-requests-remaining"))
        .and_then(|v| v.trim().parse().ok());

    let resets_in_secs = get("x-ratelimit-reset-requests")
        .and_then(parse_reset_interval)
        .or_else(|| {
            get("anthropic-ratelimit-requests-reset")
                .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                .map(|t| (t.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_seconds())
                .map(|s| s.max(0) as u64)
        });

    let quota = UpstreamQuota {
        remaining,
        resets_in_secs,
    };
    (!quota.is_empty()).then_some(quota)
}

/// OpenAI encodes reset intervals like `12s`, `1m30s`, `250ms`.
fn parse_reset_interval(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs);
    }
    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        let unit_ms = match c {
            'h' => 3_600_000,
            's' => 1_000,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    1
                } else {
                    60_000
                }
            }
            _ => return None,
        };
        total_ms += value * unit_ms;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total_ms.div_ceil(1000))
}

/// Shared request/response handling for the OpenAI-compatible families
/// (`openai-http`, `lmstudio-http`, `qwen-provider`, `generic-http`).
pub struct OpenAiHttpAdapter {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiHttpAdapter {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(),
        }
    }

    fn request(&self, stream: bool, ctx: &UpstreamContext) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).header("Content-Type", "application/json");
        if stream {
            req = req.header("Accept", "text/event-stream");
        }
        match (&ctx.auth_mode, &ctx.secret) {
            (AuthMode::None, _) | (_, None) => {}
            (_, Some(secret)) => {
                req = req.header("Authorization", format!("Bearer {secret}"));
            }
        }
        if let Some(ua) = &ctx.user_agent {
            req = req.header("User-Agent", ua.clone());
        }
        req
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiHttpAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        payload: &Value,
        stream: bool,
        ctx: &UpstreamContext,
    ) -> Result<UpstreamResponse, AdapterError> {
        tracing::debug!(adapter = %self.id, stream, "sending upstream request");
        let response = self
            .request(stream, ctx)
            .json(payload)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        handle_response(response, stream).await
    }
}

/// Anthropic's native Messages API: `x-api-key` auth and versioned header.
pub struct AnthropicHttpAdapter {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

impl AnthropicHttpAdapter {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicHttpAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        payload: &Value,
        stream: bool,
        ctx: &UpstreamContext,
    ) -> Result<UpstreamResponse, AdapterError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if stream {
            req = req.header("Accept", "text/event-stream");
        }
        match (&ctx.auth_mode, &ctx.secret) {
            (AuthMode::Bearer | AuthMode::OAuth, Some(secret)) => {
                req = req.header("Authorization", format!("Bearer {secret}"));
            }
            (_, Some(secret)) => {
                req = req.header("x-api-key", secret.clone());
            }
            (_, None) => {}
        }
        if let Some(ua) = &ctx.user_agent {
            req = req.header("User-Agent", ua.clone());
        }

        tracing::debug!(adapter = %self.id, stream, "sending upstream request");
        let response = req
            .json(payload)
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        handle_response(response, stream).await
    }
}

/// Common status handling and body/stream adoption.
async fn handle_response(
    response: reqwest::Response,
    stream: bool,
) -> Result<UpstreamResponse, AdapterError> {
    let status = response.status().as_u16();
    let quota = parse_quota(response.headers());
    let retry_after = parse_retry_after(response.headers());

    if status == 429 {
        return Err(AdapterError::RateLimited {
            retry_after_secs: retry_after,
        });
    }
    if !(200..300).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status, body = %truncate(&body, 512), "upstream error");
        return Err(AdapterError::Api {
            status,
            message: body,
            retry_after_secs: retry_after,
        });
    }

    if !stream {
        let body: Value = response.json().await.map_err(|e| AdapterError::Api {
            status,
            message: format!("unparseable upstream body: {e}"),
            retry_after_secs: None,
        })?;
        return Ok(UpstreamResponse::Json { body, quota });
    }

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut bytes = response.bytes_stream();
        let mut parser = FrameParser::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in parser.feed(&bytes) {
                        if tx.send(Ok(frame)).await.is_err() {
                            return; // receiver closed (client gone or idle cap)
                        }
                    }
                }
                Err(err) => {
                    let _ = tx
                        .send(Err(AdapterError::StreamInterrupted(err.to_string())))
                        .await;
                    return;
                }
            }
        }
        if let Some(frame) = parser.finish() {
            let _ = tx.send(Ok(frame)).await;
        }
    });

    Ok(UpstreamResponse::Stream { frames: rx, quota })
}

fn truncate(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        s
    } else {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_interval_forms() {
        assert_eq!(parse_reset_interval("12"), Some(12));
        assert_eq!(parse_reset_interval("12s"), Some(12));
        assert_eq!(parse_reset_interval("1m30s"), Some(90));
        assert_eq!(parse_reset_interval("250ms"), Some(1));
        assert_eq!(parse_reset_interval("2h"), Some(7200));
        assert_eq!(parse_reset_interval("soon"), None);
        assert_eq!(parse_reset_interval("12x"), None);
    }

    #[test]
    fn quota_from_openai_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining-requests", "42".parse().unwrap());
        headers.insert("x-ratelimit-reset-requests", "1m0s".parse().unwrap());
        let quota = parse_quota(&headers).unwrap();
        assert_eq!(quota.remaining, Some(42));
        assert_eq!(quota.resets_in_secs, Some(60));
    }

    #[test]
    fn quota_from_anthropic_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "anthropic-ratelimit-requests-remaining",
            "0".parse().unwrap(),
        );
        let quota = parse_quota(&headers).unwrap();
        assert_eq!(quota.remaining, Some(0));
    }

    #[test]
    fn no_quota_headers_means_none() {
        assert_eq!(parse_quota(&HeaderMap::new()), None);
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(120));
    }

    #[test]
    fn adapter_base_url_is_normalized() {
        let adapter = OpenAiHttpAdapter::new("openai-http", "https://api.openai.com/v1/");
        assert_eq!(adapter.base_url, "https://api.openai.com/v1");
        assert_eq!(adapter.id(), "openai-http");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
