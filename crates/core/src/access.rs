//! Access gate consumed by the orchestrator.

/// Decides whether a user may start a turn.
pub trait AccessGate: Send + Sync {
    fn is_authorized(&self, user_id: &str) -> bool;
}

/// Lets everyone through. Used by the terminal chat and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn is_authorized(&self, _user_id: &str) -> bool {
        true
    }
}
