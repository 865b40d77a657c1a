//! Tavily search/extract client.
//!
//! [`SearchProvider`] is the seam the tools are written against, so tests can
//! substitute a canned provider and a different search API can be dropped in.

use std::time::Duration;

use async_trait::async_trait;
use parley_config::ToolsConfig;
use parley_core::error::ToolError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A web search and page extraction backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Ranked results, best first.
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, ToolError>;

    /// Readable text of the page at `url`.
    async fn extract(&self, url: &str) -> Result<String, ToolError>;
}

/// Client for the Tavily REST API.
///
/// One `reqwest::Client` (and its connection pool) is shared by every call.
pub struct TavilyClient {
    base_url: String,
    api_key: String,
    search_depth: String,
    client: reqwest::Client,
}

impl TavilyClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        search_depth: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "tavily".into(),
                reason: format!("HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            search_depth: search_depth.into(),
            client,
        })
    }

    pub fn from_config(config: &ToolsConfig) -> Result<Self, ToolError> {
        let api_key = config.tavily_api_key.clone().ok_or_else(|| ToolError::ExecutionFailed {
            tool_name: "tavily".into(),
            reason: "tools.tavily_api_key / TAVILY_API_KEY is not set".into(),
        })?;
        Self::new(
            config.tavily_base_url.clone(),
            api_key,
            config.search_depth.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        tool_name: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ToolError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: tool_name.into(),
                reason: if e.is_timeout() {
                    "search provider timed out".into()
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "Tavily returned an error");
            return Err(ToolError::ExecutionFailed {
                tool_name: tool_name.into(),
                reason: format!("search provider returned HTTP {}", status.as_u16()),
            });
        }

        response.json().await.map_err(|e| ToolError::ExecutionFailed {
            tool_name: tool_name.into(),
            reason: format!("unreadable search provider response: {e}"),
        })
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<SearchHit>, ToolError> {
        debug!(query, max_results, "Tavily search");
        let body = serde_json::json!({
            "query": query,
            "max_results": max_results,
            "search_depth": self.search_depth,
        });
        let response: TavilySearchResponse = self.post("web_search", "search", body).await?;
        Ok(response.into_hits())
    }

    async fn extract(&self, url: &str) -> Result<String, ToolError> {
        debug!(url, "Tavily extract");
        let body = serde_json::json!({ "urls": [url] });
        let response: TavilyExtractResponse = self.post("extract_webpage", "extract", body).await?;
        response.into_content(url)
    }
}

// --- Tavily API types (internal) ---

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    results: Vec<TavilySearchResult>,
}

#[derive(Debug, Deserialize)]
struct TavilySearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

impl TavilySearchResponse {
    fn into_hits(self) -> Vec<SearchHit> {
        self.results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct TavilyExtractResponse {
    #[serde(default)]
    results: Vec<TavilyExtractResult>,
    #[serde(default)]
    failed_results: Vec<TavilyFailedResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyExtractResult {
    #[serde(default)]
    raw_content: String,
}

#[derive(Debug, Deserialize)]
struct TavilyFailedResult {
    #[serde(default)]
    error: String,
}

impl TavilyExtractResponse {
    fn into_content(self, url: &str) -> Result<String, ToolError> {
        if let Some(first) = self.results.into_iter().next() {
            return Ok(first.raw_content);
        }
        let reason = self
            .failed_results
            .into_iter()
            .next()
            .map(|f| f.error)
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("no content extracted from {url}"));
        Err(ToolError::ExecutionFailed {
            tool_name: "extract_webpage".into(),
            reason,
        })
    }
}
