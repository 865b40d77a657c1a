//! Web search tool.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::error::ToolError;
use parley_core::tool::{Tool, ToolResult};

use crate::tavily::SearchProvider;

pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
    max_results: u32,
}

impl WebSearchTool {
    pub fn new(provider: Arc<dyn SearchProvider>, max_results: u32) -> Self {
        Self {
            provider,
            max_results: max_results.max(1),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Use this when you need up-to-date \
         information about events, news, or topics."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query to find relevant information"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = arguments["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;

        let hits = self.provider.search(query, self.max_results).await?;
        let results: Vec<serde_json::Value> = hits
            .into_iter()
            .take(self.max_results as usize)
            .map(|h| serde_json::json!({ "title": h.title, "url": h.url, "snippet": h.snippet }))
            .collect();

        Ok(ToolResult {
            call_id: String::new(),
            success: true,
            output: serde_json::json!({ "query": query, "results": results }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tavily::SearchHit;

    struct CannedSearch(usize);

    #[async_trait]
    impl SearchProvider for CannedSearch {
        fn name(&self) -> &str {
            "canned"
        }

        async fn search(&self, query: &str, _max_results: u32) -> Result<Vec<SearchHit>, ToolError> {
            Ok((0..self.0)
                .map(|i| SearchHit {
                    title: format!("{query} #{i}"),
                    url: format!("https://example.com/{i}"),
                    snippet: "snippet".into(),
                })
                .collect())
        }

        async fn extract(&self, _url: &str) -> Result<String, ToolError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn search_returns_structured_results() {
        let tool = WebSearchTool::new(Arc::new(CannedSearch(3)), 5);
        let result = tool
            .execute(serde_json::json!({"query": "paris weather"}))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output["query"], "paris weather");
        let results = result.output["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["url"], "https://example.com/0");
    }

    #[tokio::test]
    async fn search_caps_result_count() {
        let tool = WebSearchTool::new(Arc::new(CannedSearch(10)), 2);
        let result = tool.execute(serde_json::json!({"query": "x"})).await.unwrap();
        assert_eq!(result.output["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_query_returns_error() {
        let tool = WebSearchTool::new(Arc::new(CannedSearch(1)), 5);
        assert!(matches!(
            tool.execute(serde_json::json!({"query": "  "})).await,
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[test]
    fn tool_definition() {
        let tool = WebSearchTool::new(Arc::new(CannedSearch(0)), 5);
        let def = tool.to_definition();
        assert_eq!(def.name, "web_search");
        assert_eq!(def.parameters["required"][0], "query");
    }
}
