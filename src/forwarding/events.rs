//! Forward Event System
//!
//! Lifecycle notifications from the forward manager. Listeners are called
//! synchronously after the registry lock is released.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::types::ForwardEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ForwardEvent {
    /// Forward registered and active
    Added,
    /// Forward stopped and evicted
    Removed,
    StatusChanged,
    /// Setup or runtime failure; the entry carries the message
    Error,
}

/// Observer of forward lifecycle events
pub trait ForwardListener: Send + Sync {
    fn on_forward_event(&self, event: ForwardEvent, entry: &ForwardEntry);
}

/// An event together with the entry it concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardNotification {
    pub event: ForwardEvent,
    pub entry: ForwardEntry,
}

/// Forwards events into a tokio channel for async consumers
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ForwardNotification>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ForwardNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ForwardListener for ChannelListener {
    fn on_forward_event(&self, event: ForwardEvent, entry: &ForwardEntry) {
        let notification = ForwardNotification {
            event,
            entry: entry.clone(),
        };
        if self.tx.send(notification).is_err() {
            debug!("Forward event receiver dropped, discarding {:?}", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{ForwardSpec, ForwardStatus};

    #[tokio::test]
    async fn test_channel_listener() {
        let (listener, mut rx) = ChannelListener::new();
        let entry = ForwardEntry::new(ForwardSpec::dynamic(1080), ForwardStatus::Active);

        listener.on_forward_event(ForwardEvent::Added, &entry);

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event, ForwardEvent::Added);
        assert_eq!(notification.entry.id, "D:1080");
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        let entry = ForwardEntry::new(ForwardSpec::dynamic(1080), ForwardStatus::Active);
        listener.on_forward_event(ForwardEvent::Removed, &entry);
    }

    #[test]
    fn test_notification_serialization() {
        let entry = ForwardEntry::new(ForwardSpec::local(8080, "localhost", 80), ForwardStatus::Active);
        let json = serde_json::to_value(ForwardNotification {
            event: ForwardEvent::StatusChanged,
            entry,
        })
        .unwrap();
        assert_eq!(json["event"], "statusChanged");
        assert_eq!(json["entry"]["status"], "active");
        assert_eq!(json["entry"]["spec"]["type"], "local");
    }
}
