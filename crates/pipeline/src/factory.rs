//! The pipeline factory: config specs → immutable pipeline set.
//!
//! Builds one [`Pipeline`] per route target, sharing one adapter per
//! provider. The resulting [`PipelineSet`] is immutable; reload builds a new
//! set and swaps it atomically at the holder.

use std::collections::HashMap;
use std::sync::Arc;

use routecodex_config::ResolvedConfig;
use routecodex_core::error::ProxyError;
use routecodex_core::profile::ProviderKind;
use routecodex_core::target::RouteTarget;

use crate::adapter::{AnthropicHttpAdapter, OpenAiHttpAdapter, ProviderAdapter};
use crate::pipeline::Pipeline;
use crate::registry;

/// Immutable map of pipelines keyed `provider.model.alias`.
pub struct PipelineSet {
    pipelines: HashMap<String, Arc<Pipeline>>,
    generation: u64,
}

impl PipelineSet {
    pub fn get(&self, target: &RouteTarget) -> Option<Arc<Pipeline>> {
        self.pipelines.get(&target.key()).cloned()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Build the pipeline set for one resolved config.
pub fn build(config: &ResolvedConfig, generation: u64) -> Result<PipelineSet, ProxyError> {
    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    let mut pipelines = HashMap::new();

    for spec in &config.pipelines {
        let profile = config
            .providers
            .get(&spec.target.provider)
            .ok_or_else(|| {
                ProxyError::ConfigInvalid(format!(
                    "pipeline spec references unknown provider '{}'",
                    spec.target.provider
                ))
            })?;

        let adapter = adapters
            .entry(profile.id.clone())
            .or_insert_with(|| build_adapter(profile.kind, &profile.id, &profile.base_url))
            .clone();

        let llm_switch = registry::llm_switch(&spec.llm_switch)
            .map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;
        let workflow = registry::workflow(&spec.workflow)
            .map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;
        let compatibility = registry::compatibility(&spec.compatibility)
            .map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;

        let pipeline = Pipeline::new(
            spec.clone(),
            llm_switch,
            workflow,
            compatibility,
            adapter,
            profile.auth_mode,
            profile.user_agent_override.clone(),
        );
        pipelines.insert(spec.target.key(), Arc::new(pipeline));
    }

    tracing::info!(
        pipelines = pipelines.len(),
        providers = adapters.len(),
        generation,
        "pipeline set built"
    );

    Ok(PipelineSet {
        pipelines,
        generation,
    })
}

fn build_adapter(kind: ProviderKind, id: &str, base_url: &str) -> Arc<dyn ProviderAdapter> {
    match kind {
        ProviderKind::AnthropicHttp => Arc::new(AnthropicHttpAdapter::new(id, base_url)),
        ProviderKind::OpenAiHttp
        | ProviderKind::LmStudioHttp
        | ProviderKind::QwenProvider
        | ProviderKind::GenericHttp => Arc::new(OpenAiHttpAdapter::new(id, base_url)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routecodex_config::Loader;
    use serde_json::json;

    fn config_with(routing_targets: serde_json::Value) -> ResolvedConfig {
        let dir = tempfile::tempdir().unwrap();
        let config = json!({
            "version": "1.0.0",
            "httpserver": {"host": "127.0.0.1", "port": 5555},
            "virtualrouter": {
                "providers": {
                    "openai": {
                        "type": "openai-http",
                        "apiKey": ["sk-a", "sk-b"],
                        "models": {"gpt-4o-mini": {}}
                    },
                    "anthropic": {
                        "type": "anthropic-http",
                        "apiKey": ["sk-ant"],
                        "models": {"claude-sonnet-4": {}}
                    }
                },
                "routing": {"default": [{"id": "p", "mode": "priority",
                                          "targets": routing_targets}]}
            }
        });
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        Loader::with_home(dir.path().to_path_buf())
            .load(Some(&path))
            .unwrap()
    }

    #[test]
    fn builds_one_pipeline_per_target() {
        let config = config_with(json!([
            "openai.gpt-4o-mini.key1",
            "openai.gpt-4o-mini.key2",
            "anthropic.claude-sonnet-4"
        ]));
        let set = build(&config, 1).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.generation(), 1);

        let target = RouteTarget::new("openai", "gpt-4o-mini", "key2");
        assert!(set.get(&target).is_some());
        assert!(set.get(&RouteTarget::new("openai", "gpt-4o-mini", "key9")).is_none());
    }

    #[test]
    fn anthropic_targets_get_the_protocol_bridge() {
        let config = config_with(json!(["anthropic.claude-sonnet-4"]));
        let set = build(&config, 1).unwrap();
        let pipeline = set
            .get(&RouteTarget::new("anthropic", "claude-sonnet-4", "key1"))
            .unwrap();
        assert_eq!(pipeline.spec().llm_switch, "anthropic-openai");
    }

    #[test]
    fn adapters_are_shared_per_provider() {
        let config = config_with(json!([
            "openai.gpt-4o-mini.key1",
            "openai.gpt-4o-mini.key2"
        ]));
        // Two pipelines, one provider — builds fine and both resolve.
        let set = build(&config, 7).unwrap();
        assert_eq!(set.len(), 2);
    }
}
