//! Stage registry — config identifier strings to stage constructors.
//!
//! Pipeline specs carry stage names (`"openai-passthrough"`,
//! `"qwen-compatibility"`, …); the factory resolves them here so an unknown
//! name fails the build instead of surfacing mid-request.

use crate::stages::compat::Compatibility;
use crate::stages::llmswitch::LlmSwitch;
use crate::stages::workflow::WorkflowStage;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} stage '{name}'")]
pub struct UnknownStage {
    pub kind: &'static str,
    pub name: String,
}

pub fn llm_switch(name: &str) -> Result<LlmSwitch, UnknownStage> {
    match name {
        "openai-passthrough" | "openai-openai" => Ok(LlmSwitch::OpenAiPassthrough),
        "anthropic-openai" => Ok(LlmSwitch::AnthropicOpenAi),
        other => Err(UnknownStage {
            kind: "llmSwitch",
            name: other.to_string(),
        }),
    }
}

pub fn workflow(name: &str) -> Result<WorkflowStage, UnknownStage> {
    match name {
        // Both named workflows share the same mutation set; streaming-control
        // is the historical default name.
        "streaming-control" | "passthrough" => Ok(WorkflowStage::from_env(name)),
        other => Err(UnknownStage {
            kind: "workflow",
            name: other.to_string(),
        }),
    }
}

pub fn compatibility(name: &str) -> Result<Compatibility, UnknownStage> {
    match name {
        "field-mapping" | "passthrough-compatibility" => Ok(Compatibility::FieldMapping),
        "lmstudio-compatibility" => Ok(Compatibility::LmStudio),
        "qwen-compatibility" => Ok(Compatibility::Qwen),
        other => Err(UnknownStage {
            kind: "compatibility",
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_stage_names_resolve() {
        assert_eq!(llm_switch("openai-passthrough").unwrap(), LlmSwitch::OpenAiPassthrough);
        assert_eq!(llm_switch("anthropic-openai").unwrap(), LlmSwitch::AnthropicOpenAi);
        assert_eq!(compatibility("qwen-compatibility").unwrap(), Compatibility::Qwen);
        assert_eq!(
            compatibility("lmstudio-compatibility").unwrap(),
            Compatibility::LmStudio
        );
        assert_eq!(workflow("streaming-control").unwrap().id(), "streaming-control");
    }

    #[test]
    fn unknown_stage_names_error() {
        let err = llm_switch("grpc-bridge").unwrap_err();
        assert_eq!(err.kind, "llmSwitch");
        assert!(compatibility("mystery").is_err());
        assert!(workflow("mystery").is_err());
    }
}
