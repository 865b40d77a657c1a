//! Turn, content block and message domain types.
//!
//! A [`Turn`] is the durable unit: one user input paired with everything the
//! assistant produced in response. [`Message`] is the wire-neutral shape sent
//! to a provider; turns are replayed into messages when building a prompt.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Usage;

/// Unique identifier for a conversation (one chat, or one thread in a chat).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a turn. Also the idempotency key for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// What a [`ContentBlock::Notice`] is telling the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Generation failed; preceding text is partial.
    Failure,
    /// The tool-round limit was hit.
    Truncation,
    /// The turn was cancelled by the user or by a newer message.
    Cancelled,
}

/// One piece of a turn.
///
/// Notices are shown to the user but are never replayed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        file_id: String,
        mime_type: String,
    },
    Document {
        file_id: String,
        filename: String,
        mime_type: String,
    },
    Reasoning {
        text: String,
    },
    ToolCallRequest {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallResult {
        call_id: String,
        name: String,
        output: serde_json::Value,
        is_error: bool,
        latency_ms: u64,
    },
    Notice {
        kind: NoticeKind,
        text: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn notice(kind: NoticeKind, text: impl Into<String>) -> Self {
        ContentBlock::Notice {
            kind,
            text: text.into(),
        }
    }

    /// Stable discriminant used as the storage `kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::Image { .. } => "image",
            ContentBlock::Document { .. } => "document",
            ContentBlock::Reasoning { .. } => "reasoning",
            ContentBlock::ToolCallRequest { .. } => "tool_call_request",
            ContentBlock::ToolCallResult { .. } => "tool_call_result",
            ContentBlock::Notice { .. } => "notice",
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, ContentBlock::Image { .. } | ContentBlock::Document { .. })
    }
}

/// A content block with its position inside a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub ordinal: u32,
    pub role: Role,
    pub content: ContentBlock,
}

/// Lifecycle state of a persisted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The model finished normally (possibly with a truncation notice).
    Complete,
    /// Cancelled before the model finished.
    Incomplete,
    /// Generation failed; blocks hold the partial output and a notice.
    Failed,
    /// Replaced by a later regeneration of the same input.
    Superseded,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Complete => "complete",
            TurnStatus::Incomplete => "incomplete",
            TurnStatus::Failed => "failed",
            TurnStatus::Superseded => "superseded",
        }
    }
}

impl FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(TurnStatus::Complete),
            "incomplete" => Ok(TurnStatus::Incomplete),
            "failed" => Ok(TurnStatus::Failed),
            "superseded" => Ok(TurnStatus::Superseded),
            other => Err(format!("unknown turn status '{other}'")),
        }
    }
}

/// A media block resolved into something a provider can consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaPart {
    Image { url: String },
    Document { filename: String, data_url: String },
}

/// One user input and the assistant's complete response to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub status: TurnStatus,
    pub blocks: Vec<Block>,
    /// Estimated prompt cost of replaying this turn.
    pub token_count: u32,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<TurnId>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn builder(conversation_id: ConversationId, user_id: impl Into<String>) -> TurnBuilder {
        TurnBuilder::new(conversation_id, user_id)
    }

    /// The user's input blocks, in order.
    pub fn user_input(&self) -> Vec<ContentBlock> {
        self.blocks
            .iter()
            .filter(|b| b.role == Role::User)
            .map(|b| b.content.clone())
            .collect()
    }

    /// Everything the user saw as the answer: assistant text and notices.
    pub fn rendered_text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            match &block.content {
                ContentBlock::Text { text } if block.role == Role::Assistant => out.push_str(text),
                ContentBlock::Notice { text, .. } => {
                    if !out.is_empty() {
                        out.push_str("\n\n");
                    }
                    out.push_str(text);
                }
                _ => {}
            }
        }
        out
    }

    pub fn count_blocks(&self, kind: &str) -> usize {
        self.blocks.iter().filter(|b| b.content.kind() == kind).count()
    }

    /// Check ordinal ordering and that every tool result answers an earlier request.
    pub fn validate(&self) -> Result<(), String> {
        let mut requested = HashSet::new();
        for (expected, block) in self.blocks.iter().enumerate() {
            if block.ordinal as usize != expected {
                return Err(format!(
                    "block ordinal {} at position {expected}",
                    block.ordinal
                ));
            }
            match &block.content {
                ContentBlock::ToolCallRequest { call_id, .. } => {
                    requested.insert(call_id.as_str());
                }
                ContentBlock::ToolCallResult { call_id, .. } => {
                    if !requested.contains(call_id.as_str()) {
                        return Err(format!("tool result '{call_id}' has no earlier request"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reconstruct the provider messages this turn contributed.
    ///
    /// `media` resolves image/document blocks; unresolved media degrades to a
    /// bracketed placeholder in the user text. Reasoning, notices and tool
    /// requests that never got a result are not replayed.
    pub fn replay(&self, media: &dyn Fn(&ContentBlock) -> Option<MediaPart>) -> Vec<Message> {
        let answered: HashSet<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match &b.content {
                ContentBlock::ToolCallResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();

        let mut messages = Vec::new();
        let mut user_text: Vec<String> = Vec::new();
        let mut user_media = Vec::new();
        let mut text = String::new();
        let mut calls: Vec<MessageToolCall> = Vec::new();

        for block in &self.blocks {
            match (&block.role, &block.content) {
                (Role::User, ContentBlock::Text { text }) => user_text.push(text.clone()),
                (Role::User, content @ ContentBlock::Image { .. }) => match media(content) {
                    Some(part) => user_media.push(part),
                    None => user_text.push("[image]".into()),
                },
                (Role::User, content @ ContentBlock::Document { filename, .. }) => {
                    match media(content) {
                        Some(part) => user_media.push(part),
                        None => user_text.push(format!("[document: {filename}]")),
                    }
                }
                (_, ContentBlock::Text { text: delta }) => text.push_str(delta),
                (_, ContentBlock::ToolCallRequest { call_id, name, arguments }) => {
                    if answered.contains(call_id.as_str()) {
                        calls.push(MessageToolCall {
                            id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.to_string(),
                        });
                    }
                }
                (_, ContentBlock::ToolCallResult { call_id, output, .. }) => {
                    if !text.is_empty() || !calls.is_empty() {
                        messages.push(
                            Message::assistant(std::mem::take(&mut text))
                                .with_tool_calls(std::mem::take(&mut calls)),
                        );
                    }
                    messages.push(Message::tool_result(call_id.clone(), output.to_string()));
                }
                _ => {}
            }
            if block.role != Role::User && (!user_text.is_empty() || !user_media.is_empty()) {
                messages.insert(
                    0,
                    Message::user(user_text.join("\n"))
                        .with_media(std::mem::take(&mut user_media)),
                );
                user_text.clear();
            }
        }

        if !user_text.is_empty() || !user_media.is_empty() {
            messages.insert(
                0,
                Message::user(user_text.join("\n")).with_media(user_media),
            );
        }
        if !text.is_empty() {
            messages.push(Message::assistant(text));
        }
        messages
    }
}

/// Assembles a [`Turn`], assigning consecutive ordinals as blocks are pushed.
#[derive(Debug, Clone)]
pub struct TurnBuilder {
    turn: Turn,
}

impl TurnBuilder {
    pub fn new(conversation_id: ConversationId, user_id: impl Into<String>) -> Self {
        Self {
            turn: Turn {
                id: TurnId::new(),
                conversation_id,
                user_id: user_id.into(),
                status: TurnStatus::Complete,
                blocks: Vec::new(),
                token_count: 0,
                usage: Usage::default(),
                supersedes: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn with_id(mut self, id: TurnId) -> Self {
        self.turn.id = id;
        self
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.turn.status = status;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.turn.usage = usage;
        self
    }

    pub fn with_token_count(mut self, token_count: u32) -> Self {
        self.turn.token_count = token_count;
        self
    }

    pub fn with_supersedes(mut self, previous: Option<TurnId>) -> Self {
        self.turn.supersedes = previous;
        self
    }

    pub fn push(mut self, role: Role, content: ContentBlock) -> Self {
        let ordinal = self.turn.blocks.len() as u32;
        self.turn.blocks.push(Block {
            ordinal,
            role,
            content,
        });
        self
    }

    pub fn extend(mut self, role: Role, blocks: impl IntoIterator<Item = ContentBlock>) -> Self {
        for content in blocks {
            self = self.push(role, content);
        }
        self
    }

    /// Append already role-tagged blocks, renumbering their ordinals.
    pub fn extend_blocks(mut self, blocks: impl IntoIterator<Item = (Role, ContentBlock)>) -> Self {
        for (role, content) in blocks {
            self = self.push(role, content);
        }
        self
    }

    pub fn id(&self) -> &TurnId {
        &self.turn.id
    }

    pub fn build(self) -> Turn {
        self.turn
    }
}

/// A single message sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Images and documents attached to a user message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaPart>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            media: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_media(mut self, media: Vec<MediaPart>) -> Self {
        self.media = media;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<MessageToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}
