//! Domain event system — decoupled communication between bounded contexts.
//!
//! The orchestrator publishes turn lifecycle events; the binary and tests
//! subscribe to them. Generation failures and persistence failures are
//! separate variants so they can never be confused downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A turn began processing
    TurnStarted {
        conversation_id: String,
        turn_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        conversation_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A turn finished and was persisted
    TurnCompleted {
        conversation_id: String,
        turn_id: String,
        tool_rounds: u32,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A turn was cancelled
    TurnCancelled {
        conversation_id: String,
        turn_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Generation failed (context, backend, timeout, render)
    TurnFailed {
        conversation_id: String,
        turn_id: String,
        stage: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// The user saw a response but it could not be stored
    PersistenceFailed {
        conversation_id: String,
        turn_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            conversation_id: "tg:1".into(),
            tool_name: "web_search".into(),
            success: true,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "web_search");
                assert!(success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::PersistenceFailed {
            conversation_id: "tg:1".into(),
            turn_id: "t".into(),
            error_message: "disk full".into(),
            timestamp: Utc::now(),
        });
    }
}
