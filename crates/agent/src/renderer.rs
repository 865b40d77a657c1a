//! Incremental Renderer — throttled snapshots of a growing answer.
//!
//! The renderer owns the text of the live message and pushes full snapshots
//! to a [`RenderSink`], no more often than `min_interval` and never longer
//! than the sink's payload limit. When the answer outgrows one message it is
//! split at a paragraph, line or word boundary, the full message is sealed
//! and rendering continues in a new one.
//!
//! Mid-stream push failures are logged and dropped; the next snapshot
//! carries the full text anyway. Only the final flush reports failure.

use std::sync::Arc;
use std::time::Duration;

use parley_core::channel::RenderSink;
use parley_core::error::ChannelError;
use parley_core::message::ConversationId;
use tokio::time::Instant;
use tracing::{debug, warn};

const REASONING_PREFIX: &str = "💭 ";
const EMPTY_ANSWER: &str = "(no response)";

#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    pub min_interval: Duration,
    pub show_reasoning: bool,
}

/// What the live message currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Empty,
    Reasoning,
    Answer,
}

pub struct IncrementalRenderer {
    sink: Arc<dyn RenderSink>,
    conversation_id: ConversationId,
    settings: RenderSettings,
    max_payload: usize,
    section: Section,
    live: String,
    status: Option<String>,
    searches: u32,
    extracts: u32,
    /// Last snapshot the sink accepted for the live message.
    shown: String,
    last_push: Option<Instant>,
}

impl IncrementalRenderer {
    pub fn new(sink: Arc<dyn RenderSink>, conversation_id: ConversationId, settings: RenderSettings) -> Self {
        let max_payload = sink.max_payload().max(64);
        Self {
            sink,
            conversation_id,
            settings,
            max_payload,
            section: Section::Empty,
            live: String::new(),
            status: None,
            searches: 0,
            extracts: 0,
            shown: String::new(),
            last_push: None,
        }
    }

    pub async fn push_text(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if self.section == Section::Reasoning {
            // Reasoning keeps its own message; the answer starts a new one.
            self.seal_live().await;
        }
        self.section = Section::Answer;
        self.status = None;
        self.live.push_str(delta);
        self.split_overflow().await;
        self.maybe_push().await;
    }

    /// Show reasoning, if enabled, ahead of the answer.
    pub async fn push_reasoning(&mut self, delta: &str) {
        if !self.settings.show_reasoning || delta.is_empty() || self.section == Section::Answer {
            return;
        }
        if self.section == Section::Empty {
            self.section = Section::Reasoning;
            self.live.push_str(REASONING_PREFIX);
        }
        self.live.push_str(delta);
        self.split_overflow().await;
        self.maybe_push().await;
    }

    /// Show a status line for a tool batch, unless answer text is already on
    /// screen.
    ///
    /// Waits out the throttle interval rather than dropping the update, since
    /// nothing else is pushed while tools run.
    pub async fn show_status(&mut self, tool_names: &[&str]) {
        if self.section == Section::Answer && !self.live.is_empty() {
            return;
        }
        for name in tool_names {
            match *name {
                "web_search" => self.searches += 1,
                "extract_webpage" => self.extracts += 1,
                _ => {}
            }
        }
        self.status = Some(self.status_line(tool_names));

        if let Some(wait) = self.throttle_remaining() {
            tokio::time::sleep(wait).await;
        }
        self.push_snapshot().await;
    }

    /// Final flush: the complete answer plus an optional notice.
    ///
    /// A rate-limited flush is retried once after the advertised delay; any
    /// other failure is returned.
    pub async fn finish(&mut self, notice: Option<&str>) -> Result<(), ChannelError> {
        self.status = None;
        if let Some(notice) = notice {
            if self.section == Section::Reasoning {
                self.seal_live().await;
            }
            self.section = Section::Answer;
            if !self.live.is_empty() {
                self.live.push_str("\n\n");
            }
            self.live.push_str(notice);
            self.split_overflow().await;
        }

        if self.live.is_empty() {
            if self.shown.is_empty() {
                return Ok(());
            }
            // Replace a lingering status line.
            self.live.push_str(EMPTY_ANSWER);
        }

        let snapshot = self.live.clone();
        if snapshot != self.shown {
            match self.sink.push_update(&self.conversation_id, &snapshot).await {
                Err(ChannelError::RateLimited { retry_after_secs, .. }) => {
                    debug!(retry_after_secs, "Final flush rate limited, retrying once");
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                    self.sink.push_update(&self.conversation_id, &snapshot).await?;
                }
                other => other?,
            }
            self.shown = snapshot;
        }
        self.sink.seal(&self.conversation_id).await?;
        self.reset_live();
        Ok(())
    }

    /// Stop rendering without a final snapshot (cancellation).
    pub async fn abandon(&mut self) {
        if let Err(e) = self.sink.seal(&self.conversation_id).await {
            debug!(error = %e, "Seal after cancellation failed");
        }
        self.reset_live();
        self.status = None;
    }

    fn status_line(&self, tool_names: &[&str]) -> String {
        let mut parts = Vec::new();
        if self.searches > 0 {
            parts.push(counted("🔍 Searching the web...", self.searches));
        }
        if self.extracts > 0 {
            parts.push(counted("📄 Reading a webpage...", self.extracts));
        }
        if parts.is_empty() {
            parts.push(format!("🔧 Running {}...", tool_names.join(", ")));
        }
        parts.join("\n")
    }

    fn snapshot(&self) -> String {
        match (&self.status, self.live.is_empty()) {
            (Some(status), true) => status.clone(),
            (Some(status), false) => {
                let combined = format!("{}\n\n{status}", self.live);
                if combined.chars().count() > self.max_payload {
                    status.clone()
                } else {
                    combined
                }
            }
            (None, _) => self.live.clone(),
        }
    }

    fn throttle_remaining(&self) -> Option<Duration> {
        let last = self.last_push?;
        let elapsed = last.elapsed();
        (elapsed < self.settings.min_interval).then(|| self.settings.min_interval - elapsed)
    }

    async fn maybe_push(&mut self) {
        if self.throttle_remaining().is_none() {
            self.push_snapshot().await;
        }
    }

    async fn push_snapshot(&mut self) {
        let snapshot = self.snapshot();
        if snapshot.is_empty() || snapshot == self.shown {
            return;
        }
        self.last_push = Some(Instant::now());
        match self.sink.push_update(&self.conversation_id, &snapshot).await {
            Ok(()) => self.shown = snapshot,
            Err(e) => warn!(conversation_id = %self.conversation_id, error = %e, "Render update failed"),
        }
    }

    /// Push whatever the live message holds and close it.
    async fn seal_live(&mut self) {
        let text = std::mem::take(&mut self.live);
        if !text.is_empty() && text != self.shown {
            self.last_push = Some(Instant::now());
            if let Err(e) = self.sink.push_update(&self.conversation_id, &text).await {
                warn!(conversation_id = %self.conversation_id, error = %e, "Render update failed");
            }
        }
        if let Err(e) = self.sink.seal(&self.conversation_id).await {
            warn!(conversation_id = %self.conversation_id, error = %e, "Seal failed");
        }
        self.reset_live();
    }

    /// Move full messages out of `live` until the rest fits one payload.
    async fn split_overflow(&mut self) {
        while self.live.chars().count() > self.max_payload {
            let at = split_point(&self.live, self.max_payload);
            let rest = self.live[at..].trim_start().to_string();
            self.live.truncate(at);
            let head = self.live.trim_end().len();
            self.live.truncate(head);
            debug!(conversation_id = %self.conversation_id, "Live message full, continuing in a new one");
            self.seal_live().await;
            self.live = rest;
        }
    }

    fn reset_live(&mut self) {
        self.live.clear();
        self.shown.clear();
    }
}

fn counted(label: &str, count: u32) -> String {
    if count > 1 {
        format!("{label} ({count})")
    } else {
        label.to_string()
    }
}

/// Byte index to split `text` so the head holds at most `max_chars` chars.
///
/// Prefers a paragraph break, then a line break, then a space; falls back to
/// a hard cut. Breaks in the first half are ignored so messages stay full.
fn split_point(text: &str, max_chars: usize) -> usize {
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let window = &text[..limit];
    let floor = limit / 2;

    for sep in ["\n\n", "\n", " "] {
        if let Some(i) = window.rfind(sep) {
            if i > floor {
                return i;
            }
        }
    }
    limit
}
