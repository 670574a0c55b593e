use tokio::sync::mpsc;

use crate::store::MessageId;

/// Receives immutable snapshots of a streaming reply.
///
/// Notifications are fire-and-forget: implementations must not block, and a
/// lost snapshot is harmless because the next one carries the full text.
pub trait DisplayTarget: Send + Sync {
    fn show_snapshot(&self, message_id: MessageId, text: &str);
    fn complete(&self, message_id: MessageId, text: &str);
    fn error(&self, message_id: MessageId, message: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    Snapshot { message_id: MessageId, text: String },
    Completed { message_id: MessageId, text: String },
    Failed { message_id: MessageId, error: String },
}

/// Publishes [`DisplayEvent`]s to the UI loop over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDisplay {
    sender: mpsc::Sender<DisplayEvent>,
}

impl ChannelDisplay {
    pub fn new(sender: mpsc::Sender<DisplayEvent>) -> Self {
        Self { sender }
    }

    fn publish(&self, event: DisplayEvent) {
        if let Err(e) = self.sender.try_send(event) {
            tracing::trace!("Dropped display event: {}", e);
        }
    }

    /// Terminal events are not superseded by a later one, so a full channel
    /// hands them to a task that waits for room.
    fn publish_final(&self, event: DisplayEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let sender = self.sender.clone();
                    handle.spawn(async move {
                        let _ = sender.send(event).await;
                    });
                } else {
                    tracing::warn!("Dropped final display event: no runtime");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Display channel closed");
            }
        }
    }
}

impl DisplayTarget for ChannelDisplay {
    fn show_snapshot(&self, message_id: MessageId, text: &str) {
        self.publish(DisplayEvent::Snapshot { message_id, text: text.to_string() });
    }

    fn complete(&self, message_id: MessageId, text: &str) {
        self.publish_final(DisplayEvent::Completed { message_id, text: text.to_string() });
    }

    fn error(&self, message_id: MessageId, message: &str) {
        self.publish_final(DisplayEvent::Failed { message_id, error: message.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let display = ChannelDisplay::new(tx);

        display.show_snapshot(MessageId(1), "He");
        display.show_snapshot(MessageId(1), "Hello");

        assert_eq!(
            rx.recv().await,
            Some(DisplayEvent::Snapshot { message_id: MessageId(1), text: "He".into() })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn completion_survives_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let display = ChannelDisplay::new(tx);

        display.show_snapshot(MessageId(3), "Hel");
        display.complete(MessageId(3), "Hello");

        assert!(matches!(rx.recv().await, Some(DisplayEvent::Snapshot { .. })));
        assert_eq!(
            rx.recv().await,
            Some(DisplayEvent::Completed { message_id: MessageId(3), text: "Hello".into() })
        );
    }
}
