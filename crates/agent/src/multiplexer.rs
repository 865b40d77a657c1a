//! Stream Multiplexer — drives streaming segments and tool rounds.
//!
//! ```text
//! Idle → Streaming → (AwaitingTool → Streaming)* → Done | Failed
//! ```
//!
//! Each streaming segment is one `Provider::stream` call. Text and reasoning
//! deltas go to the renderer as they arrive; tool-call requests are collected
//! until the segment completes. If any are unanswered the whole batch runs
//! concurrently, the results are appended to the prompt and a new segment
//! starts. Cancellation and the turn deadline are checked at every
//! suspension point.

use std::sync::Arc;

use parley_core::error::ProviderError;
use parley_core::message::{ContentBlock, ConversationId, Message, MessageToolCall, Role};
use parley_core::provider::{Provider, ProviderRequest, StreamEvent, ToolDefinition, Usage};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::ToolExecutor;
use crate::renderer::IncrementalRenderer;

/// Where the multiplexer is in a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    Streaming,
    AwaitingTool,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MuxFailure {
    /// Connection error, malformed stream or backend error response.
    Backend(ProviderError),
    /// The per-turn wall-clock budget ran out.
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MuxEnd {
    /// `truncated` is set when the tool-round limit forced the end.
    Done { truncated: bool },
    Failed(MuxFailure),
    Cancelled,
}

/// Everything the model produced in one turn, in order.
#[derive(Debug, Clone)]
pub struct MuxOutcome {
    pub blocks: Vec<(Role, ContentBlock)>,
    pub usage: Usage,
    /// Tool batches executed.
    pub rounds: u32,
    pub end: MuxEnd,
}

#[derive(Debug, Clone)]
pub struct MuxSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_tool_rounds: u32,
    pub include_reasoning: bool,
}

pub struct StreamMultiplexer {
    provider: Arc<dyn Provider>,
    executor: Arc<ToolExecutor>,
    tools: Vec<ToolDefinition>,
    settings: MuxSettings,
}

/// How a streaming segment ended.
enum Segment {
    Complete,
    Failed(MuxFailure),
    Cancelled,
}

/// Accumulates one turn's blocks, merging consecutive deltas.
#[derive(Default)]
struct Transcript {
    blocks: Vec<(Role, ContentBlock)>,
}

impl Transcript {
    fn push_text(&mut self, delta: &str) {
        if let Some((Role::Assistant, ContentBlock::Text { text })) = self.blocks.last_mut() {
            text.push_str(delta);
        } else {
            self.blocks.push((Role::Assistant, ContentBlock::text(delta)));
        }
    }

    /// Paragraph break for text resuming after a tool round, if the earlier
    /// text would otherwise run straight into it.
    fn segment_separator(&self, delta: &str) -> &'static str {
        if matches!(self.blocks.last(), Some((Role::Assistant, ContentBlock::Text { .. })) | None) {
            return "";
        }
        let earlier = self.blocks.iter().rev().find_map(|(role, block)| match block {
            ContentBlock::Text { text } if *role == Role::Assistant => Some(text.as_str()),
            _ => None,
        });
        match earlier {
            Some(text)
                if !text.ends_with(char::is_whitespace) && !delta.starts_with(char::is_whitespace) =>
            {
                "\n\n"
            }
            _ => "",
        }
    }

    fn push_reasoning(&mut self, delta: &str) {
        if let Some((Role::Assistant, ContentBlock::Reasoning { text })) = self.blocks.last_mut() {
            text.push_str(delta);
        } else {
            self.blocks.push((
                Role::Assistant,
                ContentBlock::Reasoning {
                    text: delta.to_string(),
                },
            ));
        }
    }

    fn push(&mut self, role: Role, block: ContentBlock) {
        self.blocks.push((role, block));
    }
}

impl StreamMultiplexer {
    pub fn new(provider: Arc<dyn Provider>, executor: Arc<ToolExecutor>, settings: MuxSettings) -> Self {
        let tools = executor.registry().definitions();
        Self {
            provider,
            executor,
            tools,
            settings,
        }
    }

    /// Run one turn from `messages` until done, failed, cancelled or out of time.
    pub async fn run(
        &self,
        conversation_id: &ConversationId,
        mut messages: Vec<Message>,
        renderer: &mut IncrementalRenderer,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> MuxOutcome {
        let mut transcript = Transcript::default();
        let mut usage = Usage::default();
        let mut rounds = 0u32;
        let mut state = MuxState::Idle;

        let end = loop {
            transition(conversation_id, &mut state, MuxState::Streaming);
            let mut segment_text = String::new();
            let mut requested: Vec<MessageToolCall> = Vec::new();
            let mut answered: Vec<(String, serde_json::Value, bool)> = Vec::new();

            let segment = self
                .stream_segment(
                    &messages,
                    renderer,
                    cancel,
                    deadline,
                    &mut transcript,
                    &mut usage,
                    &mut segment_text,
                    &mut requested,
                    &mut answered,
                )
                .await;

            match segment {
                Segment::Complete => {}
                Segment::Failed(failure) => {
                    transition(conversation_id, &mut state, MuxState::Failed);
                    break MuxEnd::Failed(failure);
                }
                Segment::Cancelled => break MuxEnd::Cancelled,
            }

            let pending: Vec<MessageToolCall> = requested
                .iter()
                .filter(|c| !answered.iter().any(|(id, _, _)| id == &c.id))
                .cloned()
                .collect();

            if pending.is_empty() {
                transition(conversation_id, &mut state, MuxState::Done);
                break MuxEnd::Done { truncated: false };
            }
            if rounds >= self.settings.max_tool_rounds {
                warn!(
                    conversation_id = %conversation_id,
                    rounds,
                    "Tool round limit reached, ending turn"
                );
                transition(conversation_id, &mut state, MuxState::Done);
                break MuxEnd::Done { truncated: true };
            }

            transition(conversation_id, &mut state, MuxState::AwaitingTool);
            rounds += 1;
            messages.push(Message::assistant(segment_text).with_tool_calls(requested.clone()));
            for (call_id, output, _) in &answered {
                messages.push(Message::tool_result(call_id.clone(), output.to_string()));
            }

            let names: Vec<&str> = pending.iter().map(|c| c.name.as_str()).collect();
            debug!(conversation_id = %conversation_id, round = rounds, tools = ?names, "Dispatching tool batch");
            let batch = async {
                let (_, outcomes) = tokio::join!(
                    renderer.show_status(&names),
                    self.executor.execute_batch(conversation_id, &pending)
                );
                outcomes
            };

            let outcomes = tokio::select! {
                biased;
                _ = cancel.cancelled() => break MuxEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    transition(conversation_id, &mut state, MuxState::Failed);
                    break MuxEnd::Failed(MuxFailure::Timeout);
                }
                outcomes = batch => outcomes,
            };

            for outcome in outcomes {
                messages.push(Message::tool_result(outcome.call_id.clone(), outcome.output.to_string()));
                transcript.push(Role::Tool, outcome.to_block());
            }
        };

        MuxOutcome {
            blocks: transcript.blocks,
            usage,
            rounds,
            end,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_segment(
        &self,
        messages: &[Message],
        renderer: &mut IncrementalRenderer,
        cancel: &CancellationToken,
        deadline: Instant,
        transcript: &mut Transcript,
        usage: &mut Usage,
        segment_text: &mut String,
        requested: &mut Vec<MessageToolCall>,
        answered: &mut Vec<(String, serde_json::Value, bool)>,
    ) -> Segment {
        let mut request = ProviderRequest::new(self.settings.model.clone(), messages.to_vec());
        request.temperature = self.settings.temperature;
        request.max_tokens = self.settings.max_tokens;
        request.tools = self.tools.clone();
        request.include_reasoning = self.settings.include_reasoning;

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Segment::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return Segment::Failed(MuxFailure::Timeout),
            started = self.provider.stream(request) => match started {
                Ok(rx) => rx,
                Err(e) => return Segment::Failed(MuxFailure::Backend(e)),
            },
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Segment::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return Segment::Failed(MuxFailure::Timeout),
                event = rx.recv() => event,
            };

            match event {
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    segment_text.push_str(&delta);
                    let shown = format!("{}{delta}", transcript.segment_separator(&delta));
                    transcript.push_text(&shown);
                    renderer.push_text(&shown).await;
                }
                Some(Ok(StreamEvent::ReasoningDelta(delta))) => {
                    transcript.push_reasoning(&delta);
                    renderer.push_reasoning(&delta).await;
                }
                Some(Ok(StreamEvent::ToolCallRequest(call))) => {
                    let arguments = parley_core::tool::ToolCall::from_message(&call).arguments;
                    transcript.push(
                        Role::Assistant,
                        ContentBlock::ToolCallRequest {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            arguments,
                        },
                    );
                    requested.push(call);
                }
                Some(Ok(StreamEvent::ToolCallResult { call_id, output, is_error })) => {
                    // Results only count for calls requested in this segment.
                    let Some(name) = requested.iter().find(|c| c.id == call_id).map(|c| c.name.clone()) else {
                        warn!(call_id = %call_id, "Backend tool result without a request, ignoring");
                        continue;
                    };
                    transcript.push(
                        Role::Tool,
                        ContentBlock::ToolCallResult {
                            call_id: call_id.clone(),
                            name,
                            output: output.clone(),
                            is_error,
                            latency_ms: 0,
                        },
                    );
                    answered.push((call_id, output, is_error));
                }
                Some(Ok(StreamEvent::Done { usage: segment_usage })) => {
                    if let Some(segment_usage) = segment_usage {
                        usage.add(segment_usage);
                    }
                    return Segment::Complete;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Backend stream failed");
                    return Segment::Failed(MuxFailure::Backend(e));
                }
                None => {
                    return Segment::Failed(MuxFailure::Backend(ProviderError::StreamInterrupted(
                        "stream ended without completion".into(),
                    )));
                }
            }
        }
    }
}

fn transition(conversation_id: &ConversationId, state: &mut MuxState, next: MuxState) {
    debug!(conversation_id = %conversation_id, from = ?*state, to = ?next, "Multiplexer transition");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::RenderSettings;
    use crate::testing::{RecordingSink, ScriptStep, ScriptedProvider, StubSearch};
    use parley_core::event::EventBus;
    use parley_core::tool::ToolRegistry;
    use std::time::Duration;

    fn settings(max_tool_rounds: u32) -> MuxSettings {
        MuxSettings {
            model: "test-model".into(),
            temperature: 0.7,
            max_tokens: None,
            max_tool_rounds,
            include_reasoning: false,
        }
    }

    fn mux(provider: Arc<ScriptedProvider>, max_tool_rounds: u32) -> StreamMultiplexer {
        let registry = parley_tools::default_registry(
            Arc::new(StubSearch::weather()),
            &parley_config::ToolsConfig::default(),
        );
        let executor = ToolExecutor::new(Arc::new(registry), Duration::from_secs(30), Arc::new(EventBus::default()));
        StreamMultiplexer::new(provider, Arc::new(executor), settings(max_tool_rounds))
    }

    fn renderer(sink: &Arc<RecordingSink>) -> IncrementalRenderer {
        IncrementalRenderer::new(
            sink.clone(),
            ConversationId::from("c1"),
            RenderSettings {
                min_interval: Duration::ZERO,
                show_reasoning: false,
            },
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(300)
    }

    #[tokio::test]
    async fn plain_answer_is_done_in_one_segment() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_segment(&["Hel", "lo"])]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);

        let outcome = mux(provider.clone(), 8)
            .run(&ConversationId::from("c1"), vec![Message::user("hi")], &mut r, &CancellationToken::new(), far_deadline())
            .await;

        assert_eq!(outcome.end, MuxEnd::Done { truncated: false });
        assert_eq!(outcome.blocks, vec![(Role::Assistant, ContentBlock::text("Hello"))]);
        assert_eq!(outcome.rounds, 0);
        assert_eq!(provider.calls(), 1);
        assert_eq!(sink.pushes(), vec!["Hel".to_string(), "Hello".to_string()]);
    }

    #[tokio::test]
    async fn tool_round_feeds_results_into_next_segment() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_segment("call_1", "web_search", r#"{"query":"paris weather"}"#),
            ScriptedProvider::text_segment(&["Sunny in Paris."]),
        ]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);

        let outcome = mux(provider.clone(), 8)
            .run(&ConversationId::from("c1"), vec![Message::user("weather?")], &mut r, &CancellationToken::new(), far_deadline())
            .await;

        assert_eq!(outcome.end, MuxEnd::Done { truncated: false });
        assert_eq!(outcome.rounds, 1);
        let kinds: Vec<&str> = outcome.blocks.iter().map(|(_, b)| b.kind()).collect();
        assert_eq!(kinds, vec!["tool_call_request", "tool_call_result", "text"]);

        let second = &provider.requests()[1];
        let roles: Vec<Role> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
        assert_eq!(second.messages[1].tool_calls[0].id, "call_1");
        assert_eq!(second.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn text_after_a_tool_round_starts_a_new_paragraph() {
        let mut first = vec![ScriptStep::Event(StreamEvent::TextDelta("Let me check.".into()))];
        first.extend(ScriptedProvider::tool_segment("call_1", "web_search", r#"{"query":"paris weather"}"#));
        let provider = Arc::new(ScriptedProvider::new(vec![
            first,
            ScriptedProvider::text_segment(&["It is sunny."]),
        ]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);

        let outcome = mux(provider.clone(), 8)
            .run(&ConversationId::from("c1"), vec![Message::user("weather?")], &mut r, &CancellationToken::new(), far_deadline())
            .await;

        let text: String = outcome
            .blocks
            .iter()
            .filter_map(|(_, b)| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Let me check.\n\nIt is sunny.");
        assert_eq!(sink.pushes().last().map(String::as_str), Some("Let me check.\n\nIt is sunny."));

        // The model gets its own text back unchanged.
        assert_eq!(provider.requests()[1].messages[1].content, "Let me check.");
    }

    #[tokio::test]
    async fn endless_tool_requests_stop_after_max_rounds() {
        let provider = Arc::new(ScriptedProvider::repeating(ScriptedProvider::tool_segment(
            "call_x",
            "web_search",
            r#"{"query":"again"}"#,
        )));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);

        let outcome = mux(provider.clone(), 3)
            .run(&ConversationId::from("c1"), vec![Message::user("loop")], &mut r, &CancellationToken::new(), far_deadline())
            .await;

        assert_eq!(outcome.end, MuxEnd::Done { truncated: true });
        assert_eq!(outcome.rounds, 3);
        assert_eq!(provider.calls(), 4);
        let results = outcome.blocks.iter().filter(|(_, b)| b.kind() == "tool_call_result").count();
        assert_eq!(results, 3);
    }

    #[tokio::test]
    async fn connection_drop_keeps_partial_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            ScriptStep::Event(StreamEvent::TextDelta("Hello, the capi".into())),
            ScriptStep::Close,
        ]]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);

        let outcome = mux(provider, 8)
            .run(&ConversationId::from("c1"), vec![Message::user("hi")], &mut r, &CancellationToken::new(), far_deadline())
            .await;

        assert!(matches!(outcome.end, MuxEnd::Failed(MuxFailure::Backend(ProviderError::StreamInterrupted(_)))));
        assert_eq!(outcome.blocks, vec![(Role::Assistant, ContentBlock::text("Hello, the capi"))]);
    }

    #[tokio::test]
    async fn backend_error_event_fails_the_segment() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            ScriptStep::Event(StreamEvent::TextDelta("par".into())),
            ScriptStep::Error(ProviderError::MalformedStream("bad json".into())),
        ]]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);
        let outcome = mux(provider, 8)
            .run(&ConversationId::from("c1"), vec![Message::user("hi")], &mut r, &CancellationToken::new(), far_deadline())
            .await;
        assert_eq!(
            outcome.end,
            MuxEnd::Failed(MuxFailure::Backend(ProviderError::MalformedStream("bad json".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_a_hung_stream() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            ScriptStep::Event(StreamEvent::TextDelta("thinking about it".into())),
            ScriptStep::Hang,
        ]]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = mux(provider, 8)
            .run(&ConversationId::from("c1"), vec![Message::user("hi")], &mut r, &CancellationToken::new(), deadline)
            .await;
        assert_eq!(outcome.end, MuxEnd::Failed(MuxFailure::Timeout));
        assert_eq!(outcome.blocks.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            ScriptStep::Event(StreamEvent::TextDelta("partial".into())),
            ScriptStep::Hang,
        ]]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = mux(provider, 8)
            .run(&ConversationId::from("c1"), vec![Message::user("hi")], &mut r, &cancel, far_deadline())
            .await;
        canceller.await.unwrap();

        assert_eq!(outcome.end, MuxEnd::Cancelled);
        assert_eq!(outcome.blocks, vec![(Role::Assistant, ContentBlock::text("partial"))]);
    }

    #[tokio::test]
    async fn backend_answered_tools_are_not_dispatched() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            ScriptStep::Event(StreamEvent::ToolCallRequest(MessageToolCall {
                id: "srv_1".into(),
                name: "web_search".into(),
                arguments: "{}".into(),
            })),
            ScriptStep::Event(StreamEvent::ToolCallResult {
                call_id: "srv_1".into(),
                output: serde_json::json!({"results": []}),
                is_error: false,
            }),
            ScriptStep::Event(StreamEvent::TextDelta("done".into())),
            ScriptStep::Event(StreamEvent::Done { usage: None }),
        ]]));
        let sink = Arc::new(RecordingSink::new(3900));
        let mut r = renderer(&sink);
        let outcome = mux(provider.clone(), 8)
            .run(&ConversationId::from("c1"), vec![Message::user("hi")], &mut r, &CancellationToken::new(), far_deadline())
            .await;
        assert_eq!(outcome.end, MuxEnd::Done { truncated: false });
        assert_eq!(outcome.rounds, 0);
        assert_eq!(provider.calls(), 1);
    }
}
