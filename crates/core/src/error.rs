//! Error types for the RouteCodex domain.
//!
//! Uses `thiserror` for ergonomic error definitions. [`ProxyError`] is the
//! request-serving taxonomy the front door translates into client-protocol
//! envelopes; [`AdapterError`] is what provider adapters raise and what the
//! health tracker consumes.

use thiserror::Error;

/// Which streaming cap was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTimeoutKind {
    /// No response headers before `streamHeadersCapMs`.
    Headers,
    /// No chunk for longer than `streamIdleCapMs`.
    Idle,
}

impl std::fmt::Display for StreamTimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Headers => write!(f, "headers"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// The top-level error type for request serving.
///
/// Each variant maps to one semantic kind from the error-handling design;
/// the gateway decides the HTTP status and protocol envelope from these.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Fatal at startup or reload; the old config is retained.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// The selected target's credential could not be resolved.
    #[error("credential unavailable for {provider}.{alias}: {reason}")]
    CredentialUnavailable {
        provider: String,
        alias: String,
        reason: String,
    },

    /// Target excluded by an active ban.
    #[error("target banned ({reason}), retry after {retry_after_ms}ms")]
    TargetBanned { reason: String, retry_after_ms: u64 },

    /// Target excluded by the rate-limit ladder.
    #[error("target rate limited, retry after {retry_after_ms}ms")]
    TargetRateLimited { retry_after_ms: u64 },

    /// Target excluded because its upstream quota is exhausted.
    #[error("target quota exhausted, retry after {retry_after_ms}ms")]
    TargetQuotaExhausted { retry_after_ms: u64 },

    /// Every pool of every applicable category came up empty.
    #[error("no healthy target for category '{category}'")]
    NoHealthyTarget {
        category: String,
        /// Soonest ban expiry among the targets that were considered.
        retry_after_ms: Option<u64>,
    },

    /// The upstream answered with a non-success status.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// A streaming cap was exceeded; the upstream connection was closed.
    #[error("stream timeout ({kind})")]
    StreamTimeout { kind: StreamTimeoutKind },

    /// The client went away. Not an error for health accounting.
    #[error("client canceled")]
    ClientCanceled,

    /// Anything else. Logged with full context; clients see a generic 500.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// The HTTP status the front door should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ConfigInvalid(_) => 500,
            Self::CredentialUnavailable { .. } => 503,
            Self::TargetBanned { .. }
            | Self::TargetRateLimited { .. }
            | Self::TargetQuotaExhausted { .. }
            | Self::NoHealthyTarget { .. } => 503,
            Self::Upstream { status, .. } => *status,
            Self::StreamTimeout { .. } => 504,
            Self::ClientCanceled => 499,
            Self::Internal(_) => 500,
        }
    }

    /// `Retry-After` seconds, when the error carries a deadline.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let ms = match self {
            Self::TargetBanned { retry_after_ms, .. }
            | Self::TargetRateLimited { retry_after_ms }
            | Self::TargetQuotaExhausted { retry_after_ms } => Some(*retry_after_ms),
            Self::NoHealthyTarget { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }?;
        Some(ms.div_ceil(1000))
    }

    /// Whether the router may retry this request on another target.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CredentialUnavailable { .. }
                | Self::Upstream { .. }
                | Self::StreamTimeout {
                    kind: StreamTimeoutKind::Headers
                }
        )
    }
}

/// Result type alias using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors raised by provider adapters when talking to an upstream.
///
/// `Clone` so the router can carry the last error across fallback attempts.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("upstream request failed: {message} (status: {status})")]
    Api {
        status: u16,
        message: String,
        /// Parsed `Retry-After` header, if the upstream sent one.
        retry_after_secs: Option<u64>,
    },

    #[error("rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream call timed out: {0}")]
    Timeout(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("adapter not configured: {0}")]
    NotConfigured(String),
}

impl AdapterError {
    /// The upstream status code this error corresponds to, for health
    /// accounting. Network/timeout failures report as 0.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Api { status, .. } => *status,
            Self::RateLimited { .. } => 429,
            Self::Auth(_) => 401,
            Self::Network(_) | Self::Timeout(_) | Self::StreamInterrupted(_) => 0,
            Self::NotConfigured(_) => 0,
        }
    }

    /// Parsed retry-after hint, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Api {
                retry_after_secs, ..
            }
            | Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<AdapterError> for ProxyError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Api {
                status, message, ..
            } => ProxyError::Upstream { status, message },
            AdapterError::RateLimited { retry_after_secs } => ProxyError::Upstream {
                status: 429,
                message: match retry_after_secs {
                    Some(s) => format!("upstream rate limited, retry after {s}s"),
                    None => "upstream rate limited".into(),
                },
            },
            AdapterError::Auth(msg) => ProxyError::Upstream {
                status: 401,
                message: msg,
            },
            AdapterError::Network(msg) => ProxyError::Upstream {
                status: 502,
                message: msg,
            },
            AdapterError::Timeout(msg) => ProxyError::Upstream {
                status: 504,
                message: msg,
            },
            AdapterError::StreamInterrupted(msg) => ProxyError::Upstream {
                status: 502,
                message: msg,
            },
            AdapterError::NotConfigured(msg) => ProxyError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_error_http_statuses() {
        assert_eq!(
            ProxyError::NoHealthyTarget {
                category: "default".into(),
                retry_after_ms: Some(1500),
            }
            .http_status(),
            503
        );
        assert_eq!(
            ProxyError::Upstream {
                status: 429,
                message: "slow down".into()
            }
            .http_status(),
            429
        );
        assert_eq!(
            ProxyError::StreamTimeout {
                kind: StreamTimeoutKind::Idle
            }
            .http_status(),
            504
        );
    }

    #[test]
    fn retry_after_rounds_up() {
        let err = ProxyError::TargetRateLimited {
            retry_after_ms: 1001,
        };
        assert_eq!(err.retry_after_secs(), Some(2));
    }

    #[test]
    fn headers_timeout_is_retryable_idle_is_not() {
        assert!(
            ProxyError::StreamTimeout {
                kind: StreamTimeoutKind::Headers
            }
            .is_retryable()
        );
        // Once bytes flowed to the client we cannot transparently retry.
        assert!(
            !ProxyError::StreamTimeout {
                kind: StreamTimeoutKind::Idle
            }
            .is_retryable()
        );
    }

    #[test]
    fn adapter_error_status_mapping() {
        let err = AdapterError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.retry_after_secs(), Some(30));

        let proxied: ProxyError = err.into();
        assert_eq!(proxied.http_status(), 429);
    }
}
