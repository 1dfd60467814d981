//! Per-target request pipelines for RouteCodex.
//!
//! A pipeline is the immutable `(llmswitch, workflow, compatibility,
//! provider-adapter)` chain for one `(provider, model, keyAlias)` target.
//! The factory builds the full set from resolved config; the front door
//! looks pipelines up by target key and executes them.

pub mod adapter;
pub mod factory;
pub mod pipeline;
pub mod registry;
pub mod sse;
pub mod stages;

pub use adapter::{ProviderAdapter, UpstreamContext, UpstreamQuota, UpstreamResponse};
pub use factory::{PipelineSet, build};
pub use pipeline::{Pipeline, PipelineContext, PipelineOutcome, PipelineStream};
pub use sse::{FrameParser, SseFrame};
