//! LLM provider implementations for Parley.
//!
//! All providers implement the `parley_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
