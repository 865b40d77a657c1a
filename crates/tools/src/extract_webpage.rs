//! Page extraction tool.
//!
//! URLs pointing at private or loopback hosts are refused before any request
//! leaves the process.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::{Tool, ToolResult};
use parley_security::UrlPolicy;

use crate::tavily::SearchProvider;

pub struct ExtractWebpageTool {
    provider: Arc<dyn SearchProvider>,
    max_chars: usize,
}

impl ExtractWebpageTool {
    pub fn new(provider: Arc<dyn SearchProvider>, max_chars: usize) -> Self {
        Self { provider, max_chars }
    }
}

#[async_trait]
impl Tool for ExtractWebpageTool {
    fn name(&self) -> &str {
        "extract_webpage"
    }

    fn description(&self) -> &str {
        "Extract and read the full content from a webpage URL. Use this when you need \
         to read the content of a specific webpage."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL of the webpage to extract content from"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let url = arguments["url"]
            .as_str()
            .map(str::trim)
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'url' argument".into()))?;

        UrlPolicy::check(url).map_err(|e| ToolError::PermissionDenied {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })?;

        let content = self.provider.extract(url).await?;
        let (content, truncated) = truncate_chars(&content, self.max_chars);

        Ok(ToolResult {
            call_id: String::new(),
            success: true,
            output: serde_json::json!({
                "url": url,
                "content": content,
                "truncated": truncated,
            }),
        })
    }
}

/// Cut to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> (&str, bool) {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => (&text[..byte_idx], true),
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tavily::SearchHit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingExtract {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for CountingExtract {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, _query: &str, _max_results: u32) -> Result<Vec<SearchHit>, ToolError> {
            Ok(vec![])
        }

        async fn extract(&self, url: &str) -> Result<String, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Contents of {url}. Ünïcödé tail."))
        }
    }

    #[tokio::test]
    async fn extracts_public_page() {
        let tool = ExtractWebpageTool::new(Arc::new(CountingExtract::default()), 10_000);
        let result = tool
            .execute(serde_json::json!({"url": "https://example.com/a"}))
            .await
            .unwrap();
        assert!(result.output["content"].as_str().unwrap().starts_with("Contents of https://example.com/a"));
        assert_eq!(result.output["truncated"], false);
    }

    #[tokio::test]
    async fn private_url_is_refused_without_fetching() {
        let provider = Arc::new(CountingExtract::default());
        let tool = ExtractWebpageTool::new(provider.clone(), 10_000);
        let err = tool
            .execute(serde_json::json!({"url": "http://169.254.169.254/latest"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn long_pages_are_truncated() {
        let tool = ExtractWebpageTool::new(Arc::new(CountingExtract::default()), 12);
        let result = tool
            .execute(serde_json::json!({"url": "https://example.com"}))
            .await
            .unwrap();
        assert_eq!(result.output["content"].as_str().unwrap().chars().count(), 12);
        assert_eq!(result.output["truncated"], true);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("ünï", 2), ("ün", true));
        assert_eq!(truncate_chars("ab", 5), ("ab", false));
    }
}
