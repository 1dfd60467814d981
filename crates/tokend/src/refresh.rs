//! The token-refresh HTTP exchange.
//!
//! Standard `grant_type=refresh_token` form POST against the provider
//! family's token endpoint (or a `token_url` recorded in the file itself).
//! The refreshed material is merged back into the existing [`TokenFile`] so
//! unknown fields survive.

use chrono::Utc;
use routecodex_credentials::TokenFile;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh_token in credential file")]
    NoRefreshToken,

    #[error("no token endpoint known for provider '{0}'")]
    NoEndpoint(String),

    #[error("token endpoint request failed: {0}")]
    Network(String),

    #[error("token endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("token endpoint response unparseable: {0}")]
    Parse(String),
}

/// Wire shape of a refresh-grant response.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    /// Lifetime in seconds.
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Default token endpoints per provider family.
pub fn default_token_url(provider: &str) -> Option<&'static str> {
    match provider {
        "qwen" => Some("https://chat.qwen.ai/api/v1/oauth2/token"),
        "gemini-cli" => Some("https://oauth2.googleapis.com/token"),
        "iflow" => Some("https://iflow.cn/oauth/token"),
        "antigravity" => Some("https://oauth2.googleapis.com/token"),
        _ => None,
    }
}

/// Providers that need a periodic metadata refresh even while the token is
/// still valid.
pub fn needs_metadata_refresh(provider: &str) -> bool {
    provider == "antigravity"
}

/// Perform the refresh exchange and merge the result into `current`.
pub async fn refresh_token(
    client: &reqwest::Client,
    provider: &str,
    current: &TokenFile,
) -> Result<TokenFile, RefreshError> {
    let refresh_token = current
        .refresh_token
        .as_deref()
        .ok_or(RefreshError::NoRefreshToken)?;

    let url = current
        .token_url
        .clone()
        .or_else(|| default_token_url(provider).map(String::from))
        .ok_or_else(|| RefreshError::NoEndpoint(provider.to_string()))?;

    let mut form: Vec<(&str, &str)> = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if let Some(client_id) = current.client_id.as_deref() {
        form.push(("client_id", client_id));
    }

    let response = client
        .post(&url)
        .form(&form)
        .send()
        .await
        .map_err(|e| RefreshError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(RefreshError::Endpoint { status, body });
    }

    let parsed: RefreshResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::Parse(e.to_string()))?;

    Ok(merge_response(current, parsed))
}

fn merge_response(current: &TokenFile, response: RefreshResponse) -> TokenFile {
    let mut next = current.clone();
    next.access_token = response.access_token;
    if response.refresh_token.is_some() {
        next.refresh_token = response.refresh_token;
    }
    if response.token_type.is_some() {
        next.token_type = response.token_type;
    }
    let lifetime_ms = response.expires_in.unwrap_or(3600) as i64 * 1000;
    next.expires_at = Some(Utc::now().timestamp_millis() + lifetime_ms);
    next.expired_at_alias = None;
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(json: &str) -> TokenFile {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn merge_updates_access_token_and_expiry() {
        let current = token(
            r#"{"access_token":"old","refresh_token":"rt","expires_at":1,"resource_url":"x"}"#,
        );
        let merged = merge_response(
            &current,
            RefreshResponse {
                access_token: "new".into(),
                refresh_token: None,
                token_type: Some("Bearer".into()),
                expires_in: Some(7200),
            },
        );
        assert_eq!(merged.access_token, "new");
        // Old refresh token is retained when the endpoint omits one.
        assert_eq!(merged.refresh_token.as_deref(), Some("rt"));
        assert_eq!(merged.token_type.as_deref(), Some("Bearer"));
        assert!(merged.expires_at.unwrap() > Utc::now().timestamp_millis());
        // Unknown fields survive the merge.
        assert!(merged.extra.contains_key("resource_url"));
    }

    #[test]
    fn merge_rotates_refresh_token_when_provided() {
        let current = token(r#"{"access_token":"old","refresh_token":"rt-old"}"#);
        let merged = merge_response(
            &current,
            RefreshResponse {
                access_token: "new".into(),
                refresh_token: Some("rt-new".into()),
                token_type: None,
                expires_in: None,
            },
        );
        assert_eq!(merged.refresh_token.as_deref(), Some("rt-new"));
    }

    #[test]
    fn known_provider_families_have_endpoints() {
        assert!(default_token_url("qwen").is_some());
        assert!(default_token_url("gemini-cli").is_some());
        assert!(default_token_url("unknown-provider").is_none());
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails_fast() {
        let client = reqwest::Client::new();
        let current = token(r#"{"access_token":"only"}"#);
        assert!(matches!(
            refresh_token(&client, "qwen", &current).await,
            Err(RefreshError::NoRefreshToken)
        ));
    }

    #[tokio::test]
    async fn refresh_without_endpoint_fails_fast() {
        let client = reqwest::Client::new();
        let current = token(r#"{"access_token":"x","refresh_token":"rt"}"#);
        assert!(matches!(
            refresh_token(&client, "mystery", &current).await,
            Err(RefreshError::NoEndpoint(_))
        ));
    }
}
