//! Security policies for Parley.
//!
//! Provides:
//! - **Allowlists**: which users may start a turn
//! - **URL policy**: SSRF protection for tools that fetch pages

pub mod allowlist;

pub use allowlist::{AllowlistGate, SenderCheckResult, UrlPolicy, UrlRejection};
