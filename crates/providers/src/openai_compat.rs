//! OpenAI-compatible streaming provider.
//!
//! Works with OpenRouter (the default), OpenAI, Ollama, vLLM and any other
//! endpoint that speaks `/v1/chat/completions` with SSE streaming.
//!
//! Supports:
//! - Streaming text, reasoning (`delta.reasoning`) and tool-call deltas
//! - Multimodal user messages (image URLs and base64 file parts)
//! - Health checks via `/models`

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parley_config::ProviderConfig;
use parley_core::error::ProviderError;
use parley_core::message::{MediaPart, Message, MessageToolCall};
use parley_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// No overall request timeout is set: a streaming answer may legitimately
    /// run for minutes and the caller owns the wall-clock budget.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(
            "openrouter",
            "https://openrouter.ai/api/v1",
            api_key,
            Duration::from_secs(15),
        )
    }

    /// Build from the `[provider]` config section.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::NotConfigured("provider.api_key / OPENROUTER_API_KEY is not set".into()))?;
        let name = if config.base_url.contains("openrouter.ai") {
            "openrouter"
        } else {
            "openai_compat"
        };
        Self::new(
            name,
            config.base_url.clone(),
            api_key,
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: Self::to_api_content(m),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    /// Plain string content, or a parts array when media is attached.
    fn to_api_content(message: &Message) -> Option<serde_json::Value> {
        if message.media.is_empty() {
            if message.content.is_empty() && !message.tool_calls.is_empty() {
                return None;
            }
            return Some(serde_json::Value::String(message.content.clone()));
        }

        let mut parts = Vec::with_capacity(message.media.len() + 1);
        if !message.content.is_empty() {
            parts.push(serde_json::json!({ "type": "text", "text": message.content }));
        }
        for media in &message.media {
            parts.push(match media {
                MediaPart::Image { url } => serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": url },
                }),
                MediaPart::Document { filename, data_url } => serde_json::json!({
                    "type": "file",
                    "file": { "filename": filename, "file_data": data_url },
                }),
            });
        }
        Some(serde_json::Value::Array(parts))
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        if request.include_reasoning {
            body["reasoning"] = serde_json::json!({ "exclude": false });
        }

        body
    }
}

/// Map a non-200 response to a provider error.
async fn status_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();

    if status == 429 {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(5);
        return ProviderError::RateLimited { retry_after_secs };
    }

    if status == 401 || status == 403 {
        return ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        );
    }

    let error_body = response.text().await.unwrap_or_default();
    if status == 404 {
        return ProviderError::ModelNotFound(error_body);
    }
    warn!(status, body = %error_body, "Provider streaming error");
    ProviderError::ApiError {
        status_code: status,
        message: error_body,
    }
}

#[async_trait]
impl parley_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ProviderRequest) -> std::result::Result<EventStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        if response.status().as_u16() != 200 {
            return Err(status_error(response).await);
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Read the SSE byte stream on its own task; dropping the receiver
        // stops it at the next send.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        debug!(provider = %provider_name, error = %e, "SSE transport error");
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for event in decoder.push(&bytes) {
                    if tx.send(event).await.is_err() {
                        return; // receiver dropped
                    }
                }
                if decoder.is_closed() {
                    return;
                }
            }

            for event in decoder.finish() {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

/// Incremental SSE parser for one streaming segment.
///
/// Bytes are buffered until a full line is available so multi-byte UTF-8
/// sequences split across network chunks decode correctly. Tool-call deltas
/// are accumulated by index and released, in index order, when the choice
/// reports a `finish_reason`.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finished: bool,
    usage: Option<Usage>,
    closed: bool,
}

type DecodedEvent = std::result::Result<StreamEvent, ProviderError>;

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Once closed (done or errored), further input is ignored.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            self.handle_line(line, &mut events);
            if self.closed {
                break;
            }
        }
        events
    }

    /// The byte stream ended. Completes the segment if the model finished,
    /// otherwise reports the cut-off.
    pub(crate) fn finish(&mut self) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim().to_string();
            self.handle_line(&line, &mut events);
            if self.closed {
                return events;
            }
        }
        if self.finished {
            self.complete(&mut events);
        } else {
            self.closed = true;
            events.push(Err(ProviderError::StreamInterrupted(
                "connection closed before the model finished".into(),
            )));
        }
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<DecodedEvent>) {
        // Skip empty lines and SSE comments (OpenRouter keep-alives)
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return; // event:/id:/retry: fields carry nothing we use
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.complete(events);
            return;
        }

        let chunk: StreamResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!(data = %data, error = %e, "Unparseable SSE chunk");
                self.closed = true;
                events.push(Err(ProviderError::MalformedStream(e.to_string())));
                return;
            }
        };

        if let Some(error) = chunk.error {
            self.closed = true;
            events.push(Err(ProviderError::ApiError {
                status_code: error.code.unwrap_or(200),
                message: error.message,
            }));
            return;
        }

        if let Some(choice) = chunk.choices.into_iter().next() {
            let delta = choice.delta;

            if let Some(reasoning) = delta.reasoning.filter(|r| !r.is_empty()) {
                events.push(Ok(StreamEvent::ReasoningDelta(reasoning)));
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                events.push(Ok(StreamEvent::TextDelta(content)));
            }

            for tc_delta in delta.tool_calls.unwrap_or_default() {
                let acc = self.tool_calls.entry(tc_delta.index).or_default();
                if let Some(id) = tc_delta.id {
                    acc.id = id;
                }
                if let Some(func) = tc_delta.function {
                    if let Some(name) = func.name {
                        acc.name = name;
                    }
                    if let Some(args) = func.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }

            if choice.finish_reason.is_some() && !self.finished {
                self.finished = true;
                self.release_tool_calls(events);
            }
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }
    }

    fn release_tool_calls(&mut self, events: &mut Vec<DecodedEvent>) {
        for (index, acc) in std::mem::take(&mut self.tool_calls) {
            events.push(Ok(StreamEvent::ToolCallRequest(acc.into_tool_call(index))));
        }
    }

    fn complete(&mut self, events: &mut Vec<DecodedEvent>) {
        self.release_tool_calls(events);
        self.closed = true;
        events.push(Ok(StreamEvent::Done { usage: self.usage }));
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    /// Mid-stream error (OpenRouter reports upstream failures this way)
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    code: Option<u16>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning_content")]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta — arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    /// Some backends omit the id; fall back to a positional one that is still
    /// unique across the tool rounds of a turn.
    fn into_tool_call(self, index: u32) -> MessageToolCall {
        MessageToolCall {
            id: if self.id.is_empty() {
                format!("call_{index}_{}", Uuid::new_v4().simple())
            } else {
                self.id
            },
            name: self.name,
            arguments: self.arguments,
        }
    }
}
