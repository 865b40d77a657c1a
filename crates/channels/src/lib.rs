//! Chat channel implementations for Parley.
//!
//! Each channel connects to a chat platform, yields incoming messages and
//! renders streamed answers through [`parley_core::RenderSink`].
//!
//! Available channels:
//! - **Telegram** — Bot API long polling, answers edited in place
//! - **CLI** — Interactive terminal chat (stdin/stdout)

pub mod cli;
pub mod telegram;

pub use cli::CliChannel;
pub use telegram::TelegramChannel;
