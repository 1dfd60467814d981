//! Provider profiles — the resolved description of one upstream family.
//!
//! Profiles are produced by the config resolver and consumed read-only by
//! the credential store, pipeline factory, and router.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which adapter family serves this provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai-http")]
    OpenAiHttp,
    #[serde(rename = "lmstudio-http")]
    LmStudioHttp,
    #[serde(rename = "qwen-provider")]
    QwenProvider,
    #[serde(rename = "anthropic-http")]
    AnthropicHttp,
    #[serde(rename = "generic-http")]
    GenericHttp,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAiHttp => "openai-http",
            Self::LmStudioHttp => "lmstudio-http",
            Self::QwenProvider => "qwen-provider",
            Self::AnthropicHttp => "anthropic-http",
            Self::GenericHttp => "generic-http",
        }
    }

    /// The compatibility stage used when the provider config names none.
    pub fn default_compatibility(&self) -> &'static str {
        match self {
            Self::LmStudioHttp => "lmstudio-compatibility",
            Self::QwenProvider => "qwen-compatibility",
            _ => "field-mapping",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How requests to this provider authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    ApiKey,
    Bearer,
    OAuth,
    None,
}

/// Where one credential alias gets its secret from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum CredentialSpec {
    /// Literal key material from config (already env-expanded).
    Inline { value: String },
    /// Re-read from the environment on every resolve.
    Env { var: String },
    /// A plain auth file; contents are the secret.
    File { path: String },
    /// An OAuth token file owned by the token daemon.
    OAuth { token_file: String },
}

/// Per-model limits and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default = "default_max_context")]
    pub max_context: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Free-form capability tags (`vision`, `tools`, `thinking`, …).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_max_context() -> u32 {
    128_000
}
fn default_max_tokens() -> u32 {
    8_192
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            max_context: default_max_context(),
            max_tokens: default_max_tokens(),
            capabilities: Vec::new(),
        }
    }
}

/// One upstream family, fully resolved: base URL, auth, credentials in
/// declared order, models, and optional per-provider stage overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent_override: Option<String>,
    /// Ordered alias → source map (`key1` is the first declared credential).
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialSpec>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelSpec>,
    /// Stage overrides; model-level overrides (merged by the resolver) win
    /// over these.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_switch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<String>,
}

impl ProviderProfile {
    /// First declared credential alias, used as the default for targets that
    /// omit one.
    pub fn first_alias(&self) -> Option<&str> {
        // BTreeMap orders key1 < key10 < key2 lexicographically, so pick the
        // numerically smallest alias instead of the first map entry.
        self.credentials
            .keys()
            .min_by_key(|k| alias_ordinal(k))
            .map(String::as_str)
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    pub fn has_credential(&self, alias: &str) -> bool {
        self.credentials.contains_key(alias)
    }
}

fn alias_ordinal(alias: &str) -> u32 {
    alias
        .strip_prefix("key")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}
