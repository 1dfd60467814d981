//! # RouteCodex Core
//!
//! Domain types and error definitions for the RouteCodex LLM proxy.
//! This crate has **zero framework dependencies** — it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Cross-component references go by stable string id (`providerId`,
//! `keyAlias`) rather than direct pointers: the router, health tracker, and
//! pipeline factory all key their state on the `RouteTarget` tuple defined
//! here. Every operation that can fail returns a typed error from
//! [`error`] — no control flow uses unwinding.

pub mod chat;
pub mod error;
pub mod event;
pub mod profile;
pub mod target;

// Re-export key types at crate root for ergonomics
pub use chat::{ChatMessage, ChatRequest, ContentPart, MessageContent, ToolDefinition};
pub use error::{AdapterError, ProxyError, Result, StreamTimeoutKind};
pub use event::{EventBus, ProxyEvent};
pub use profile::{AuthMode, CredentialSpec, ModelSpec, ProviderKind, ProviderProfile};
pub use target::{RouteCategory, RouteTarget, RoutingDecision};
