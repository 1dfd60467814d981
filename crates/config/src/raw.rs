//! Raw on-disk config schema.
//!
//! These types mirror the JSON files verbatim; resolution into
//! [`crate::ResolvedConfig`] happens in `lib.rs`. Strict v2 key checking
//! operates on `serde_json::Value` before typed deserialization so legacy
//! keys can be stripped (with one warning per config path) while genuinely
//! unknown keys fail the load.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::ConfigError;

/// Top-level keys the v2 schema accepts.
const V2_ROOT_KEYS: &[&str] = &["version", "httpserver", "virtualrouter", "virtualrouterMode"];
/// Known v1 leftovers that are stripped (once, with a warning) rather than
/// rejected.
const V2_ROOT_LEGACY: &[&str] = &[
    "providers",
    "routing",
    "pipeline",
    "modules",
    "logging",
    "debug",
    "auth",
    "apikey",
    "schemaVersion",
];

const HTTPSERVER_KEYS: &[&str] = &["host", "port", "apikeys"];
const HTTPSERVER_LEGACY: &[&str] = &["cors", "timeout", "bodyLimit", "ssl"];

const VIRTUALROUTER_V2_KEYS: &[&str] = &["routingPolicyGroups", "activeRoutingPolicyGroup"];
const VIRTUALROUTER_LEGACY: &[&str] = &["routing", "providers", "inputProtocol", "outputProtocol"];

#[derive(Debug, Clone, Deserialize)]
pub struct RawRoot {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "virtualrouterMode")]
    pub virtualrouter_mode: Option<String>,
    #[serde(default)]
    pub httpserver: RawHttpServer,
    #[serde(default)]
    pub virtualrouter: RawVirtualRouter,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHttpServer {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub apikeys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVirtualRouter {
    #[serde(default, rename = "activeRoutingPolicyGroup")]
    pub active_routing_policy_group: Option<String>,
    #[serde(default, rename = "routingPolicyGroups")]
    pub routing_policy_groups: BTreeMap<String, RawPolicyGroup>,
    /// Legacy (non-v2) inline routing table.
    #[serde(default)]
    pub routing: BTreeMap<String, Vec<RawPool>>,
    /// Legacy (non-v2) inline providers.
    #[serde(default)]
    pub providers: BTreeMap<String, RawProvider>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPolicyGroup {
    #[serde(default)]
    pub routing: BTreeMap<String, Vec<RawPool>>,
    #[serde(default, rename = "loadBalancing")]
    pub load_balancing: Option<RawLoadBalancing>,
    #[serde(default)]
    pub classifier: Option<RawClassifier>,
    #[serde(default)]
    pub health: Option<RawHealth>,
    #[serde(default, rename = "contextRouting")]
    pub context_routing: Option<RawContextRouting>,
    #[serde(default, rename = "webSearch")]
    pub web_search: Option<Value>,
    #[serde(default, rename = "execCommandGuard")]
    pub exec_command_guard: Option<Value>,
    #[serde(default)]
    pub clock: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPool {
    pub id: String,
    #[serde(default = "default_pool_mode")]
    pub mode: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub weights: Vec<u32>,
}

fn default_pool_mode() -> String {
    "priority".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLoadBalancing {
    #[serde(default, rename = "defaultMode")]
    pub default_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClassifier {
    #[serde(default, rename = "longContextThreshold")]
    pub long_context_threshold: Option<u32>,
    #[serde(default, rename = "toolThreshold")]
    pub tool_threshold: Option<usize>,
    #[serde(default, rename = "backgroundModels")]
    pub background_models: Vec<String>,
    #[serde(default, rename = "codingTools")]
    pub coding_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHealth {
    #[serde(default)]
    pub fatal_status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub consecutive_error_threshold: Option<u32>,
    #[serde(default)]
    pub fatal_ms: Option<u64>,
    #[serde(default)]
    pub default_ms: Option<u64>,
    #[serde(default)]
    pub rate_limit_schedule_ms: Option<Vec<u64>>,
    #[serde(default)]
    pub reset_window_ms: Option<u64>,
    #[serde(default)]
    pub blacklist_window_ms: Option<u64>,
    #[serde(default)]
    pub blacklist_threshold: Option<u32>,
    #[serde(default)]
    pub blacklist_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawContextRouting {
    #[serde(default, rename = "longContextThreshold")]
    pub long_context_threshold: Option<u32>,
}

/// One provider, as declared inline (legacy) or in
/// `provider/<id>/config.v2.json` under the `provider` key.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProvider {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "baseUrl", default)]
    pub base_url: Option<String>,
    #[serde(rename = "authMode", default)]
    pub auth_mode: Option<String>,
    #[serde(rename = "userAgent", default)]
    pub user_agent: Option<String>,
    /// Ordered credential entries; aliases `key1..keyN` are generated from
    /// declaration order.
    #[serde(rename = "apiKey", default)]
    pub api_key: Vec<String>,
    #[serde(default)]
    pub models: BTreeMap<String, RawModel>,
    #[serde(rename = "llmSwitch", default)]
    pub llm_switch: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub compatibility: Option<String>,
    #[serde(default)]
    pub limits: Option<RawLimits>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawModel {
    #[serde(rename = "maxContext", default)]
    pub max_context: Option<u32>,
    #[serde(rename = "maxTokens", default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(rename = "llmSwitch", default)]
    pub llm_switch: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub compatibility: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLimits {
    #[serde(default)]
    pub provider_timeout_ms: Option<u64>,
    #[serde(default)]
    pub stream_idle_cap_ms: Option<u64>,
    #[serde(default)]
    pub stream_headers_cap_ms: Option<u64>,
}

/// The envelope of `provider/<id>/config.v2.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProviderFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "providerId")]
    pub provider_id: String,
    pub provider: RawProvider,
}

/// Applies the strict v2 key policy to the root object in place.
///
/// Known legacy keys are removed; `warn_legacy` controls whether removal is
/// logged (one batch per config path — the caller dedups across reloads).
/// Unknown keys fail the load. Returns the legacy keys that were stripped.
pub fn enforce_v2_schema(
    root: &mut Map<String, Value>,
    config_path: &str,
    warn_legacy: bool,
) -> Result<Vec<String>, ConfigError> {
    let mut stripped = Vec::new();

    check_section(root, "root", V2_ROOT_KEYS, V2_ROOT_LEGACY, &mut stripped)?;

    if let Some(Value::Object(http)) = root.get_mut("httpserver") {
        check_section(http, "httpserver", HTTPSERVER_KEYS, HTTPSERVER_LEGACY, &mut stripped)?;
    }

    if let Some(Value::Object(vr)) = root.get_mut("virtualrouter") {
        check_section(
            vr,
            "virtualrouter",
            VIRTUALROUTER_V2_KEYS,
            VIRTUALROUTER_LEGACY,
            &mut stripped,
        )?;
    }

    if warn_legacy && !stripped.is_empty() {
        tracing::warn!(
            config = %config_path,
            keys = ?stripped,
            "legacy v1 keys ignored under virtualrouterMode=v2"
        );
    }

    Ok(stripped)
}

fn check_section(
    section: &mut Map<String, Value>,
    name: &str,
    allowed: &[&str],
    legacy: &[&str],
    stripped: &mut Vec<String>,
) -> Result<(), ConfigError> {
    let keys: Vec<String> = section.keys().cloned().collect();
    for key in keys {
        if allowed.contains(&key.as_str()) {
            continue;
        }
        if legacy.contains(&key.as_str()) {
            section.remove(&key);
            stripped.push(format!("{name}.{key}"));
            continue;
        }
        return Err(ConfigError::UnknownField {
            section: name.to_string(),
            field: key,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn v2_schema_accepts_minimal_config() {
        let mut root = obj(json!({
            "version": "2.0.0",
            "virtualrouterMode": "v2",
            "httpserver": {"host": "127.0.0.1", "port": 5555},
            "virtualrouter": {"routingPolicyGroups": {}}
        }));
        let stripped = enforce_v2_schema(&mut root, "test.json", false).unwrap();
        assert!(stripped.is_empty());
    }

    #[test]
    fn v2_schema_strips_legacy_keys() {
        let mut root = obj(json!({
            "version": "2.0.0",
            "virtualrouterMode": "v2",
            "providers": {"openai": {}},
            "httpserver": {"host": "127.0.0.1", "port": 5555, "cors": true},
            "virtualrouter": {"routingPolicyGroups": {}, "routing": {}}
        }));
        let stripped = enforce_v2_schema(&mut root, "test.json", false).unwrap();
        assert!(stripped.contains(&"root.providers".to_string()));
        assert!(stripped.contains(&"httpserver.cors".to_string()));
        assert!(stripped.contains(&"virtualrouter.routing".to_string()));
        assert!(!root.contains_key("providers"));
    }

    #[test]
    fn v2_schema_rejects_unknown_keys() {
        let mut root = obj(json!({
            "version": "2.0.0",
            "virtualrouterMode": "v2",
            "frobnicate": 1,
            "virtualrouter": {"routingPolicyGroups": {}}
        }));
        let err = enforce_v2_schema(&mut root, "test.json", false).unwrap_err();
        match err {
            ConfigError::UnknownField { section, field } => {
                assert_eq!(section, "root");
                assert_eq!(field, "frobnicate");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn raw_pool_defaults_to_priority() {
        let pool: RawPool =
            serde_json::from_value(json!({"id": "primary", "targets": ["openai.gpt-4o-mini"]}))
                .unwrap();
        assert_eq!(pool.mode, "priority");
        assert!(pool.weights.is_empty());
    }

    #[test]
    fn provider_file_envelope_parses() {
        let file: RawProviderFile = serde_json::from_value(json!({
            "version": "2.0.0",
            "providerId": "openai",
            "provider": {
                "type": "openai-http",
                "baseUrl": "https://api.openai.com/v1",
                "apiKey": ["${OPENAI_API_KEY}"],
                "models": {"gpt-4o-mini": {"maxContext": 128000}}
            }
        }))
        .unwrap();
        assert_eq!(file.provider_id, "openai");
        assert_eq!(file.provider.kind, "openai-http");
        assert_eq!(file.provider.api_key.len(), 1);
    }
}
