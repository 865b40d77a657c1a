//! Tool Executor — runs one batch of tool calls concurrently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parley_core::error::ToolError;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::{ContentBlock, ConversationId, MessageToolCall};
use parley_core::tool::{ToolCall, ToolRegistry};
use tracing::{debug, warn};

/// The result of one call, success or not. Failures are data for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub output: serde_json::Value,
    pub is_error: bool,
    pub latency_ms: u64,
}

impl ToolOutcome {
    fn failed(call: &ToolCall, error: &ToolError, latency_ms: u64) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output: serde_json::json!({ "error": error.to_string() }),
            is_error: true,
            latency_ms,
        }
    }

    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::ToolCallResult {
            call_id: self.call_id.clone(),
            name: self.name.clone(),
            output: self.output.clone(),
            is_error: self.is_error,
            latency_ms: self.latency_ms,
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    events: Arc<EventBus>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            timeout,
            events,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute every call in `calls` concurrently.
    ///
    /// Outcomes come back in request order whatever order the calls finish
    /// in. Each call has its own timeout; a slow call never fails its
    /// neighbours.
    pub async fn execute_batch(
        &self,
        conversation_id: &ConversationId,
        calls: &[MessageToolCall],
    ) -> Vec<ToolOutcome> {
        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                let call = ToolCall::from_message(call);
                async move { (index, self.execute_one(&call).await) }
            })
            .collect();

        let mut slots: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
        while let Some((index, outcome)) = pending.next().await {
            self.events.publish(DomainEvent::ToolExecuted {
                conversation_id: conversation_id.to_string(),
                tool_name: outcome.name.clone(),
                success: !outcome.is_error,
                duration_ms: outcome.latency_ms,
                timestamp: Utc::now(),
            });
            slots[index] = Some(outcome);
        }
        slots.into_iter().flatten().collect()
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolOutcome {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.registry.execute(call)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(result)) => {
                debug!(tool = %call.name, latency_ms, "Tool call finished");
                ToolOutcome {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: result.output,
                    is_error: !result.success,
                    latency_ms,
                }
            }
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "Tool call failed");
                ToolOutcome::failed(call, &e, latency_ms)
            }
            Err(_) => {
                let e = ToolError::Timeout {
                    tool_name: call.name.clone(),
                    timeout_secs: self.timeout.as_secs(),
                };
                warn!(tool = %call.name, latency_ms, "Tool call timed out");
                ToolOutcome::failed(call, &e, latency_ms)
            }
        }
    }
}
