//! Turn orchestration — the heart of Parley.
//!
//! A turn moves through five components:
//!
//! 1. **Context Builder** ([`context`]) selects prior turns that fit the token budget
//! 2. **Stream Multiplexer** ([`multiplexer`]) drives the streaming call and tool rounds
//! 3. **Tool Executor** ([`executor`]) runs each tool batch concurrently
//! 4. **Incremental Renderer** ([`renderer`]) shows the growing answer through a throttled sink
//! 5. **Turn Persistence** commits the finished turn atomically through a `TurnStore`
//!
//! [`Orchestrator`] wires them together and enforces one active turn per
//! conversation.

pub mod context;
pub mod executor;
pub mod multiplexer;
pub mod orchestrator;
pub mod prompt;
pub mod renderer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::{ContextBudget, ContextBuilder, ContextWindow, HeuristicCounter, TokenCounter};
pub use executor::{ToolExecutor, ToolOutcome};
pub use multiplexer::{MuxEnd, MuxFailure, MuxOutcome, MuxSettings, MuxState, StreamMultiplexer};
pub use orchestrator::{Orchestrator, OrchestratorSettings, RedoRequest, TurnFailure, TurnOutcome, TurnRequest};
pub use prompt::{PromptVars, SystemPrompt};
pub use renderer::{IncrementalRenderer, RenderSettings};
