//! Internal pub/sub for lifecycle events (spec §4.8). Subscribers must be
//! non-blocking; a lagging subscriber drops old events rather than
//! back-pressuring the publisher, matching the teacher's broadcast-channel
//! idiom for fanning out events without coupling producers to consumers.

use crate::job::Job;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "item.added")]
    ItemAdded { job: Job },
    #[serde(rename = "item.processing")]
    ItemProcessing { job: Job },
    #[serde(rename = "item.completed")]
    ItemCompleted { job: Job },
    #[serde(rename = "item.retry")]
    ItemRetry { job: Job },
    #[serde(rename = "item.dlq")]
    ItemDlq { job: Job },
    #[serde(rename = "item.cancelled")]
    ItemCancelled { job: Job },
    #[serde(rename = "item.dlq.retry")]
    ItemDlqRetry { job: Job },
    #[serde(rename = "extension.connected")]
    ExtensionConnected { extension_id: String },
    #[serde(rename = "extension.disconnected")]
    ExtensionDisconnected { extension_id: String },
    #[serde(rename = "extension.heartbeat")]
    ExtensionHeartbeat { extension_id: String },
    #[serde(rename = "metrics.updated")]
    MetricsUpdated,
    #[serde(rename = "capacity.reached")]
    CapacityReached,
}

pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish. No subscribers is not an error — the bus
    /// doesn't know or care whether anyone is listening.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, Priority};

    fn job() -> Job {
        Job::new(
            JobPayload {
                url: "https://ex/1.jpg".into(),
                headers: Default::default(),
                metadata: Default::default(),
                addon_id: None,
                callback_url: None,
                ai_tool: None,
            },
            Priority::Normal,
            3,
        )
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::ItemAdded { job: job() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::ItemAdded { .. }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::CapacityReached);
    }
}
