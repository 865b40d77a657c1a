//! Model-callable tools for Parley.
//!
//! Two tools are exposed to the model: `web_search` and `extract_webpage`.
//! Both run against a [`SearchProvider`]; [`TavilyClient`] is the production one.

pub mod extract_webpage;
pub mod tavily;
pub mod web_search;

use std::sync::Arc;

use parley_config::ToolsConfig;
use parley_core::tool::ToolRegistry;

pub use extract_webpage::ExtractWebpageTool;
pub use tavily::{SearchHit, SearchProvider, TavilyClient};
pub use web_search::WebSearchTool;

/// Create the tool registry for a turn: search plus page extraction.
pub fn default_registry(provider: Arc<dyn SearchProvider>, config: &ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(WebSearchTool::new(
        provider.clone(),
        config.search_max_results,
    )));
    registry.register(Arc::new(ExtractWebpageTool::new(
        provider,
        config.max_extract_chars,
    )));
    registry
}
