//! Engine event bus
//!
//! Aggregates coordinate through events rather than shared state. Every
//! manager publishes onto one [`EventBus`]; embedders subscribe to drive UI
//! and logging.

use crate::peer::ConnectionEvent;
use crate::session::SessionEvent;
use crate::transfer::TransferEvent;
use remotedesk_network_quality::QualityEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Any event emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Connection state machine transition
    Connection(ConnectionEvent),
    /// Session lifecycle change
    Session(SessionEvent),
    /// Transfer task progress or state change
    Transfer(TransferEvent),
    /// Network quality change for a session
    Quality {
        /// Session the sample belongs to
        session_id: String,
        /// Monitor output
        event: QualityEvent,
    },
}

/// Broadcast bus shared by every component of one engine instance
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; events with no subscribers are dropped
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotedesk_network_quality::ConnectionQuality;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::Quality {
            session_id: "s1".into(),
            event: QualityEvent::QualityChanged {
                from: None,
                to: ConnectionQuality::Good,
            },
        });

        match rx.recv().await.unwrap() {
            EngineEvent::Quality { session_id, .. } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(EngineEvent::Quality {
            session_id: "s1".into(),
            event: QualityEvent::BitrateChanged {
                from_kbps: 2000,
                to_kbps: 1600,
            },
        });
    }
}
