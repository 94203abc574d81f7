//! Progress event bus.
//!
//! A thin wrapper over `tokio::sync::broadcast` used to push catalog scan
//! and download-queue snapshots to subscribers. Delivery is best-effort and
//! at-most-once: a subscriber that falls behind the channel capacity loses
//! the oldest messages, and publishing never blocks the publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default per-subscriber buffer before old events are dropped.
const DEFAULT_CAPACITY: usize = 64;

/// One published event: a topic plus an opaque JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Fire-and-forget pub/sub channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Succeeds vacuously when nobody is subscribed.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let _ = self.sender.send(Event {
            topic: topic.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish("queue", serde_json::json!({"n": 1}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, "queue");
        assert_eq!(event.payload["n"], 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        bus.publish("scan", serde_json::json!({}));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish("queue", serde_json::json!({ "i": i }));
        }

        // The first recv reports the lag, subsequent ones yield the newest
        // retained events.
        match rx.recv().await {
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                assert!(skipped >= 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["i"], 3);
    }
}
