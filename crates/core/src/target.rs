//! Route targets, categories, and routing decisions.
//!
//! A `RouteTarget` is the `(providerId, modelId, keyAlias)` tuple every other
//! subsystem keys on: the health tracker tracks per-target records, the
//! pipeline factory builds one pipeline per target, and routing pools list
//! targets by their string form `provider.model.keyN`.

use serde::{Deserialize, Serialize};

/// The routing categories a request can classify into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteCategory {
    Default,
    Thinking,
    Tools,
    LongContext,
    Vision,
    WebSearch,
    Background,
    Coding,
}

impl RouteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Thinking => "thinking",
            Self::Tools => "tools",
            Self::LongContext => "longcontext",
            Self::Vision => "vision",
            Self::WebSearch => "websearch",
            Self::Background => "background",
            Self::Coding => "coding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "thinking" => Some(Self::Thinking),
            "tools" => Some(Self::Tools),
            "longcontext" => Some(Self::LongContext),
            "vision" => Some(Self::Vision),
            "websearch" => Some(Self::WebSearch),
            "background" => Some(Self::Background),
            "coding" => Some(Self::Coding),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable `(providerId, modelId, keyAlias)` tuple.
///
/// Invariant: every `RouteTarget` held by a routing table references an
/// existing provider, model, and credential — the config resolver rejects
/// unresolvable targets at load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
    /// Credential alias (`key1`, `key2`, …), never the secret itself.
    pub key_alias: String,
}

impl RouteTarget {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        key_alias: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            key_alias: key_alias.into(),
        }
    }

    /// Parse a target string from config.
    ///
    /// Accepted forms: `provider.model` and `provider.model.keyN`. Model ids
    /// may themselves contain dots (`qwen.qwen3-coder.plus`): the first
    /// segment is the provider, the last segment is the alias only when it
    /// looks like `key<digits>`, everything in between is the model.
    pub fn parse(s: &str, default_alias: &str) -> Option<Self> {
        let segments: Vec<&str> = s.split('.').collect();
        if segments.len() < 2 || segments.iter().any(|p| p.is_empty()) {
            return None;
        }

        let provider = segments[0];
        let last = segments[segments.len() - 1];
        let (model_segments, alias) = if segments.len() > 2 && is_key_alias(last) {
            (&segments[1..segments.len() - 1], last)
        } else {
            (&segments[1..], default_alias)
        };

        Some(Self::new(provider, model_segments.join("."), alias))
    }

    /// The `provider.model.alias` key pipelines and health records use.
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.provider, self.model, self.key_alias)
    }

    /// The `(provider, alias)` pair the health tracker and retry-exclusion
    /// logic key on.
    pub fn credential_key(&self) -> (String, String) {
        (self.provider.clone(), self.key_alias.clone())
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.provider, self.model, self.key_alias)
    }
}

fn is_key_alias(s: &str) -> bool {
    s.len() > 3 && s.starts_with("key") && s[3..].bytes().all(|b| b.is_ascii_digit())
}

/// The outcome of routing one request: which target, which credential
/// version, which attempt. Used for attribution across logs, snapshots, and
/// retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub category: RouteCategory,
    pub target: RouteTarget,
    /// Credential version pinned at the moment of the decision.
    pub credential_version: u64,
    /// 1-based attempt number within this request.
    pub attempt: u32,
    /// Which pool the target came from.
    pub pool_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_target() {
        let t = RouteTarget::parse("openai.gpt-4o-mini", "key1").unwrap();
        assert_eq!(t.provider, "openai");
        assert_eq!(t.model, "gpt-4o-mini");
        assert_eq!(t.key_alias, "key1");
    }

    #[test]
    fn parse_target_with_alias() {
        let t = RouteTarget::parse("openai.gpt-4o-mini.key2", "key1").unwrap();
        assert_eq!(t.model, "gpt-4o-mini");
        assert_eq!(t.key_alias, "key2");
    }

    #[test]
    fn parse_dotted_model_id() {
        let t = RouteTarget::parse("qwen.qwen3-coder.plus", "key1").unwrap();
        assert_eq!(t.provider, "qwen");
        // "plus" is not a keyN alias, so it belongs to the model id.
        assert_eq!(t.model, "qwen3-coder.plus");
        assert_eq!(t.key_alias, "key1");

        let t = RouteTarget::parse("qwen.qwen3-coder.plus.key3", "key1").unwrap();
        assert_eq!(t.model, "qwen3-coder.plus");
        assert_eq!(t.key_alias, "key3");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(RouteTarget::parse("openai", "key1").is_none());
        assert!(RouteTarget::parse("openai..gpt", "key1").is_none());
        assert!(RouteTarget::parse("", "key1").is_none());
    }

    #[test]
    fn target_key_roundtrip() {
        let t = RouteTarget::new("lmstudio", "llama-3.1-8b", "key1");
        assert_eq!(t.key(), "lmstudio.llama-3.1-8b.key1");
        assert_eq!(t.to_string(), t.key());
    }

    #[test]
    fn category_parse_roundtrip() {
        for cat in [
            RouteCategory::Default,
            RouteCategory::Thinking,
            RouteCategory::Tools,
            RouteCategory::LongContext,
            RouteCategory::Vision,
            RouteCategory::WebSearch,
            RouteCategory::Background,
            RouteCategory::Coding,
        ] {
            assert_eq!(RouteCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(RouteCategory::parse("nonsense"), None);
    }
}
