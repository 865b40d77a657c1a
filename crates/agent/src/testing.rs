//! Scripted fakes for exercising the orchestrator without a network.
//!
//! Compiled for unit tests and behind the `testing` feature for the
//! integration tests of downstream crates.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::channel::{MediaResolver, RenderSink};
use parley_core::error::{ChannelError, ProviderError, StoreError, ToolError};
use parley_core::message::{ContentBlock, ConversationId, MediaPart, MessageToolCall, Turn, TurnId};
use parley_core::provider::{EventStream, Provider, ProviderRequest, StreamEvent, Usage};
use parley_core::store::{CommitStatus, TurnStore};
use parley_store::InMemoryTurnStore;
use parley_tools::{SearchHit, SearchProvider};
use tokio::sync::mpsc;

/// One step of a scripted streaming segment.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(StreamEvent),
    /// Sent as an `Err` item on the stream.
    Error(ProviderError),
    /// Fail `Provider::stream` itself. Only meaningful as the first step.
    Reject(ProviderError),
    Delay(Duration),
    /// Keep the stream open without sending anything more.
    Hang,
    /// Close the stream without `Done`.
    Close,
}

/// A provider that plays back one script per `stream` call.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    repeat: Option<Vec<ScriptStep>>,
    requests: Mutex<Vec<ProviderRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Plays the same script for every call.
    pub fn repeating(script: Vec<ScriptStep>) -> Self {
        Self {
            repeat: Some(script),
            ..Self::new(Vec::new())
        }
    }

    /// Text deltas followed by `Done`.
    pub fn text_segment(deltas: &[&str]) -> Vec<ScriptStep> {
        let mut steps: Vec<ScriptStep> = deltas
            .iter()
            .map(|d| ScriptStep::Event(StreamEvent::TextDelta((*d).to_string())))
            .collect();
        steps.push(ScriptStep::Event(StreamEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: deltas.len() as u32,
                total_tokens: 10 + deltas.len() as u32,
            }),
        }));
        steps
    }

    /// One tool-call request followed by `Done`.
    pub fn tool_segment(call_id: &str, name: &str, arguments: &str) -> Vec<ScriptStep> {
        vec![
            ScriptStep::Event(StreamEvent::ToolCallRequest(MessageToolCall {
                id: call_id.into(),
                name: name.into(),
                arguments: arguments.into(),
            })),
            ScriptStep::Event(StreamEvent::Done { usage: None }),
        ]
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let script = match &self.repeat {
            Some(script) => script.clone(),
            None => self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))?,
        };
        if let Some(ScriptStep::Reject(e)) = script.first() {
            return Err(e.clone());
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in script {
                match step {
                    ScriptStep::Event(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Error(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                    ScriptStep::Reject(_) => {}
                    ScriptStep::Delay(d) => tokio::time::sleep(d).await,
                    ScriptStep::Hang => {
                        tx.closed().await;
                        return;
                    }
                    ScriptStep::Close => return,
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    Push(String),
    Seal,
}

/// A render sink that records every accepted operation.
pub struct RecordingSink {
    max_payload: usize,
    ops: Mutex<Vec<(ConversationId, SinkOp)>>,
    failures: Mutex<VecDeque<ChannelError>>,
}

impl RecordingSink {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            ops: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Fail the next push with `error`. Failed pushes are not recorded.
    pub fn fail_next(&self, error: ChannelError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn ops(&self) -> Vec<SinkOp> {
        self.ops.lock().unwrap().iter().map(|(_, op)| op.clone()).collect()
    }

    pub fn ops_for(&self, conversation_id: &ConversationId) -> Vec<SinkOp> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == conversation_id)
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SinkOp::Push(text) => Some(text),
                SinkOp::Seal => None,
            })
            .collect()
    }
}

#[async_trait]
impl RenderSink for RecordingSink {
    async fn push_update(&self, conversation_id: &ConversationId, text: &str) -> Result<(), ChannelError> {
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.ops
            .lock()
            .unwrap()
            .push((conversation_id.clone(), SinkOp::Push(text.to_string())));
        Ok(())
    }

    async fn seal(&self, conversation_id: &ConversationId) -> Result<(), ChannelError> {
        self.ops.lock().unwrap().push((conversation_id.clone(), SinkOp::Seal));
        Ok(())
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

/// A search backend with canned hits.
pub struct StubSearch {
    hits: Vec<SearchHit>,
    delay: Duration,
}

impl StubSearch {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            delay: Duration::ZERO,
        }
    }

    /// Three weather forecast hits.
    pub fn weather() -> Self {
        Self::new(
            ["Paris", "Lyon", "Nice"]
                .iter()
                .enumerate()
                .map(|(i, city)| SearchHit {
                    title: format!("{city} weather forecast"),
                    url: format!("https://weather.example.com/{i}"),
                    snippet: format!("{city}: sunny, 21°C"),
                })
                .collect(),
        )
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SearchProvider for StubSearch {
    fn name(&self) -> &str {
        "stub"
    }

    async fn search(&self, _query: &str, max_results: u32) -> Result<Vec<SearchHit>, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.hits.iter().take(max_results as usize).cloned().collect())
    }

    async fn extract(&self, url: &str) -> Result<String, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(format!("Contents of {url}"))
    }
}

/// A store whose reads, commits, or both fail.
pub struct FailingStore {
    inner: InMemoryTurnStore,
    fail_reads: bool,
    fail_commits: bool,
}

impl FailingStore {
    /// Every operation fails.
    pub fn unreachable() -> Self {
        Self {
            inner: InMemoryTurnStore::new(),
            fail_reads: true,
            fail_commits: true,
        }
    }

    /// Reads work; commits fail.
    pub fn read_only(inner: InMemoryTurnStore) -> Self {
        Self {
            inner,
            fail_reads: false,
            fail_commits: true,
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("database is locked".into())
    }
}

#[async_trait]
impl TurnStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn recent_turns(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<Turn>, StoreError> {
        if self.fail_reads {
            return Err(Self::unavailable());
        }
        self.inner.recent_turns(conversation_id, limit).await
    }

    async fn commit_turn(&self, turn: &Turn) -> Result<CommitStatus, StoreError> {
        if self.fail_commits {
            return Err(Self::unavailable());
        }
        self.inner.commit_turn(turn).await
    }

    async fn get_turn(&self, id: &TurnId) -> Result<Option<Turn>, StoreError> {
        if self.fail_reads {
            return Err(Self::unavailable());
        }
        self.inner.get_turn(id).await
    }

    async fn count_turns(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        if self.fail_reads {
            return Err(Self::unavailable());
        }
        self.inner.count_turns(conversation_id).await
    }
}

/// Resolves every image to a fixed data URL.
pub struct StaticMedia;

#[async_trait]
impl MediaResolver for StaticMedia {
    async fn resolve(&self, block: &ContentBlock) -> Result<MediaPart, ChannelError> {
        match block {
            ContentBlock::Image { mime_type, .. } => Ok(MediaPart::Image {
                url: format!("data:{mime_type};base64,AAAA"),
            }),
            ContentBlock::Document { file_id, .. } => Err(ChannelError::MediaUnavailable(file_id.clone())),
            _ => Err(ChannelError::InvalidPayload("not media".into())),
        }
    }
}

/// A resolver that takes `delay` per block, then gives up.
pub struct StallingMedia {
    pub delay: Duration,
}

#[async_trait]
impl MediaResolver for StallingMedia {
    async fn resolve(&self, block: &ContentBlock) -> Result<MediaPart, ChannelError> {
        tokio::time::sleep(self.delay).await;
        Err(ChannelError::MediaUnavailable(format!("{} timed out", block.kind())))
    }
}
