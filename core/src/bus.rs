//! Notification bus for pricing-context transitions
//!
//! Single-process pub/sub over a Tokio broadcast channel. Publishers never
//! block; each subscriber owns a bounded queue and is dropped after two
//! consecutive overflows, receiving one terminal `lagged` notice first.
//! Subscribers are scoped to a session id. Ordering is FIFO per publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Queue bound per subscriber
const DEFAULT_CAPACITY: usize = 64;

/// Terminal state of a URL transformation, as published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformPhase {
    Done,
    Failed,
}

/// Payload of a `url_transform` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlTransformEvent {
    /// Session the waiting context item belongs to
    pub session_id: Uuid,
    /// Context item id
    pub id: Uuid,
    pub pricing_url: String,
    pub state: TransformPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaml_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a subscriber sees
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(UrlTransformEvent),
    /// The subscriber's queue overflowed twice in a row; this is the last
    /// message it will receive.
    Lagged { skipped: u64 },
}

/// Broadcast bus for transformation notifications
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<UrlTransformEvent>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; never blocks, a bus with no subscribers is fine.
    pub fn publish(&self, event: UrlTransformEvent) {
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "url_transform published"),
            Err(_) => debug!("url_transform published (no subscribers)"),
        }
    }

    /// Subscribe to events for one session.
    pub fn subscribe(&self, session_id: Uuid) -> SessionSubscriber {
        SessionSubscriber {
            receiver: self.sender.subscribe(),
            session_id,
            consecutive_lags: 0,
            dropped: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that yields only events for its session and enforces the
/// slow-consumer policy.
pub struct SessionSubscriber {
    receiver: broadcast::Receiver<UrlTransformEvent>,
    session_id: Uuid,
    consecutive_lags: u8,
    dropped: bool,
}

impl SessionSubscriber {
    /// Next message for this session; `None` once the bus is closed or the
    /// subscriber has been dropped for lagging.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        if self.dropped {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    // The counter resets only on events actually handed to
                    // the caller; skipping foreign-session events is not
                    // evidence the consumer caught up.
                    if event.session_id == self.session_id {
                        self.consecutive_lags = 0;
                        return Some(BusMessage::Event(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.consecutive_lags += 1;
                    if self.consecutive_lags >= 2 {
                        self.dropped = true;
                        return Some(BusMessage::Lagged { skipped });
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(session_id: Uuid, url: &str) -> UrlTransformEvent {
        UrlTransformEvent {
            session_id,
            id: Uuid::new_v4(),
            pricing_url: url.to_string(),
            state: TransformPhase::Done,
            yaml_content: Some("saasName: X".into()),
            error: None,
        }
    }

    #[tokio::test]
    async fn subscriber_only_sees_its_session() {
        let bus = NotificationBus::new();
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut subscriber = bus.subscribe(mine);

        bus.publish(event(other, "https://other.example/pricing"));
        bus.publish(event(mine, "https://mine.example/pricing"));

        match subscriber.recv().await {
            Some(BusMessage::Event(ev)) => {
                assert_eq!(ev.session_id, mine);
                assert_eq!(ev.pricing_url, "https://mine.example/pricing");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = NotificationBus::new();
        let session = Uuid::new_v4();
        let mut subscriber = bus.subscribe(session);

        for n in 0..5 {
            bus.publish(event(session, &format!("https://example.com/p{n}")));
        }
        for n in 0..5 {
            match subscriber.recv().await {
                Some(BusMessage::Event(ev)) => {
                    assert_eq!(ev.pricing_url, format!("https://example.com/p{n}"));
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_gets_lagged_then_nothing() {
        let bus = NotificationBus::with_capacity(2);
        let session = Uuid::new_v4();
        let foreign = Uuid::new_v4();
        let mut subscriber = bus.subscribe(session);

        // First overflow happens while the subscriber is parked; the second
        // one, triggered before any event reaches it, drops it.
        for n in 0..8 {
            bus.publish(event(foreign, &format!("https://example.com/a{n}")));
        }
        let waiter = tokio::spawn(async move {
            let message = subscriber.recv().await;
            (message, subscriber)
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        for n in 0..8 {
            bus.publish(event(foreign, &format!("https://example.com/b{n}")));
        }

        let (message, mut subscriber) = waiter.await.unwrap();
        match message {
            Some(BusMessage::Lagged { skipped }) => assert!(skipped > 0),
            other => panic!("expected lagged notice, got {other:?}"),
        }
        assert!(subscriber.recv().await.is_none());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = NotificationBus::new();
        bus.publish(event(Uuid::new_v4(), "https://example.com/pricing"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
