//! Provider trait — the abstraction over LLM backends.
//!
//! A Provider takes a prompt and streams back text, reasoning and tool-call
//! requests over an mpsc channel. The consumer drives the conversation; the
//! provider only ever produces one streaming segment per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "moonshotai/kimi-k2.5")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Ask the backend to stream its reasoning trace
    #[serde(default)]
    pub include_reasoning: bool,
}

fn default_temperature() -> f32 {
    0.7
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: None,
            tools: Vec::new(),
            include_reasoning: false,
        }
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One event out of a streaming segment.
///
/// Backend failures travel on the same channel as `Err(ProviderError)`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// A fully assembled tool call. Emitted in index order before `Done`.
    ToolCallRequest(MessageToolCall),
    /// A tool result the backend executed itself (server-side tools).
    ToolCallResult {
        call_id: String,
        output: serde_json::Value,
        is_error: bool,
    },
    Done { usage: Option<Usage> },
}

pub type EventStream = mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>;

/// The core Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter").
    fn name(&self) -> &str;

    /// Start one streaming segment.
    ///
    /// Errors before the first byte (auth, bad request) are returned directly;
    /// later failures arrive as `Err` items on the receiver. A receiver that
    /// closes without a `Done` event means the stream was cut off.
    async fn stream(&self, request: ProviderRequest) -> std::result::Result<EventStream, ProviderError>;

    /// Health check — can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_request_defaults() {
        let req = ProviderRequest::new("moonshotai/kimi-k2.5", vec![]);
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!req.include_reasoning);
        assert!(req.tools.is_empty());
    }

    #[test]
    fn usage_accumulates_across_segments() {
        let mut total = Usage::default();
        total.add(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 });
        total.add(Usage { prompt_tokens: 20, completion_tokens: 1, total_tokens: 21 });
        assert_eq!(total.prompt_tokens, 30);
        assert_eq!(total.total_tokens, 36);
    }

    #[test]
    fn tool_definition_serialization() {
        let tool = ToolDefinition {
            name: "web_search".into(),
            description: "Search the web".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"]
            }),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("web_search"));
        assert!(json.contains("query"));
    }
}
