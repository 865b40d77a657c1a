//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley conversation
//! orchestrator. This crate has **no I/O** — it defines the domain model that
//! every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external dependency of a turn (model backend, tools, storage, the
//! chat surface, access control) is a trait here. Implementations live in
//! their respective crates and are injected into the orchestrator.

pub mod access;
pub mod channel;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use access::{AccessGate, AllowAll};
pub use channel::{Attachment, AttachmentKind, Channel, ChannelId, ChannelMessage, MediaResolver, RenderSink};
pub use error::{ChannelError, ProviderError, StoreError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{
    Block, ContentBlock, ConversationId, MediaPart, Message, MessageToolCall, NoticeKind, Role, Turn,
    TurnBuilder, TurnId, TurnStatus,
};
pub use provider::{EventStream, Provider, ProviderRequest, StreamEvent, ToolDefinition, Usage};
pub use store::{CommitStatus, TurnStore};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
