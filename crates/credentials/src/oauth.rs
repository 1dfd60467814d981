//! OAuth token-file model.
//!
//! Token files live under `~/.routecodex/auth/` and are owned by the token
//! daemon (single writer per path). The store reads them; the daemon rewrites
//! them atomically on refresh. Unknown fields survive the rewrite.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// The on-disk OAuth token shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry as unix milliseconds. Some writers use `expired_at`; both are
    /// accepted, `expires_at` is written back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "expired_at")]
    pub expired_at_alias: Option<i64>,
    /// Refresh endpoint override; defaults are per provider family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenFile {
    pub fn read(path: &Path) -> Result<Self, TokenFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| TokenFileError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| TokenFileError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Write atomically: temp file in the same directory, then rename.
    /// Readers observe either the old or the new token, never a partial one.
    pub fn write_atomic(&self, path: &Path) -> Result<(), TokenFileError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TokenFileError::Write {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(|e| TokenFileError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(|e| TokenFileError::Write {
            path: tmp.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::rename(&tmp, path).map_err(|e| TokenFileError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Effective expiry instant, honoring the `expired_at` alias.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.expires_at.or(self.expired_at_alias)?;
        Utc.timestamp_millis_opt(ms).single()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|exp| now >= exp)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenFileError {
    #[error("failed to read token file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse token file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("failed to write token file {path}: {reason}")]
    Write { path: String, reason: String },
}
