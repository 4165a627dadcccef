use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 4096;

/// Broadcast feed of committed events. The expiry scheduler subscribes to it
/// to learn about new holds; anything else interested in state changes can too.
///
/// Delivery is best-effort: a slow subscriber sees `Lagged` and must recover
/// on its own (the polling sweep covers anything the scheduler missed).
pub struct NotifyHub {
    sender: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let _ = self.sender.send(event.clone());
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        let event = Event::HoldReleased {
            id: Ulid::new(),
            resource_id: Ulid::new(),
        };
        hub.send(&event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::ReservationCanceled {
            id: Ulid::new(),
            resource_id: Ulid::new(),
        });
        assert_eq!(hub.subscriber_count(), 0);
    }
}
