//! The request classifier.
//!
//! Infers the routing category deterministically from request shape. Ties
//! break in a fixed priority order: explicit hint, tools, vision, thinking,
//! long context, web search, background, coding. The web-search and coding
//! signals are presence checks and fire regardless of the tool-count
//! threshold. A category the routing table does not carry still classifies;
//! the pool walk falls back to `default`.

use routecodex_config::ClassifierSettings;
use routecodex_core::chat::ChatRequest;
use routecodex_core::target::RouteCategory;

pub fn classify(request: &ChatRequest, settings: &ClassifierSettings) -> RouteCategory {
    // An explicit, valid hint from the client wins outright.
    if let Some(category) = request.category_hint().and_then(RouteCategory::parse) {
        return category;
    }

    if settings.tool_threshold > 0 && request.tool_count() >= settings.tool_threshold {
        return RouteCategory::Tools;
    }
    if request.has_vision_parts() {
        return RouteCategory::Vision;
    }
    if request.wants_thinking() {
        return RouteCategory::Thinking;
    }
    if request.estimated_tokens() > settings.long_context_threshold {
        return RouteCategory::LongContext;
    }
    if request.has_web_search_tool() {
        return RouteCategory::WebSearch;
    }
    if settings
        .background_models
        .iter()
        .any(|m| m == &request.model)
    {
        return RouteCategory::Background;
    }
    if request
        .tool_names()
        .iter()
        .any(|name| settings.coding_tools.iter().any(|t| t == name))
    {
        return RouteCategory::Coding;
    }

    RouteCategory::Default
}
