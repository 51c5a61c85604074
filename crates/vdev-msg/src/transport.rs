//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Wire codec helpers and transport abstractions."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

/// Receiver for events raised by a connected transport.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Acknowledgement that a publish left the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryAck {
    /// Per-client publish sequence number.
    pub id: u64,
}

/// Events delivered by a transport after [`Transport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established; subscriptions may be issued.
    Connected,
    /// Inbound publish on a subscribed topic.
    Message {
        /// Topic the message arrived on.
        topic: String,
        /// Raw payload.
        payload: Vec<u8>,
    },
    /// A previous publish was delivered.
    Published(DeliveryAck),
    /// Session ended, locally or by the peer.
    Disconnected {
        /// Reason when the session ended unexpectedly.
        reason: Option<String>,
    },
}

/// Transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Operation requires an established session.
    #[error("transport is not connected")]
    NotConnected,
    /// The broker refused the session.
    #[error("connection refused: {0}")]
    Refused(String),
    /// Unexpected or malformed packet.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed while an operation was in flight.
    #[error("connection closed")]
    Closed,
    /// Waited too long for a broker response.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Publish/subscribe client driven by the protocol engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session; the first event on the returned stream is
    /// [`TransportEvent::Connected`].
    async fn connect(&self) -> Result<TransportEvents, TransportError>;
    /// Subscribe to `topic` at most-once delivery.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<DeliveryAck, TransportError>;
    /// Close the session. Closing a closed transport is not an error.
    async fn disconnect(&self) -> Result<(), TransportError>;
    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

/// One message that passed through an [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Publishing client, or `injected` for [`InMemoryBroker::inject`].
    pub client: String,
    /// Topic.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

struct Subscription {
    client: u64,
    topic: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    subscriptions: Vec<Subscription>,
    history: Vec<PublishedMessage>,
    next_client: u64,
}

#[derive(Default)]
struct BrokerShared {
    state: Mutex<BrokerState>,
    published: Notify,
}

/// In-process broker with exact topic matching; keeps a history of every publish.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// New client attached to this broker.
    pub fn client(&self, name: impl Into<String>) -> InMemoryTransport {
        let id = {
            let mut state = self.shared.state.lock();
            state.next_client += 1;
            state.next_client
        };
        InMemoryTransport {
            broker: self.clone(),
            id,
            name: name.into(),
            events: Mutex::new(None),
            next_ack: AtomicU64::new(1),
        }
    }

    /// Publish as an outside party (e.g. the platform). Returns the number of
    /// subscribers reached.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        self.route("injected", topic, payload.into())
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().history.clone()
    }

    /// Messages published on `topic`, in order.
    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.shared
            .state
            .lock()
            .history
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|sub| sub.topic == topic && !sub.events.is_closed())
            .count()
    }

    /// Wait until at least `count` messages were published on `topic`, or
    /// `timeout` elapses. Returns whatever has been published by then.
    pub async fn wait_for(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<PublishedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.published.notified();
            let found = self.published_on(topic);
            if found.len() >= count {
                return found;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.published_on(topic);
            }
        }
    }

    /// Wait until `topic` has at least one subscriber.
    pub async fn wait_for_subscriber(&self, topic: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.subscriber_count(topic) == 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn route(&self, client: &str, topic: &str, payload: Vec<u8>) -> usize {
        let reached = {
            let mut state = self.shared.state.lock();
            state.subscriptions.retain(|sub| !sub.events.is_closed());
            let reached = state
                .subscriptions
                .iter()
                .filter(|sub| sub.topic == topic)
                .filter(|sub| {
                    sub.events
                        .send(TransportEvent::Message {
                            topic: topic.to_owned(),
                            payload: payload.clone(),
                        })
                        .is_ok()
                })
                .count();
            state.history.push(PublishedMessage {
                client: client.to_owned(),
                topic: topic.to_owned(),
                payload,
            });
            reached
        };
        self.shared.published.notify_waiters();
        reached
    }

    fn add_subscription(
        &self,
        client: u64,
        topic: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut state = self.shared.state.lock();
        let exists = state
            .subscriptions
            .iter()
            .any(|sub| sub.client == client && sub.topic == topic);
        if !exists {
            state.subscriptions.push(Subscription {
                client,
                topic: topic.to_owned(),
                events,
            });
        }
    }

    fn drop_client(&self, client: u64) {
        self.shared
            .state
            .lock()
            .subscriptions
            .retain(|sub| sub.client != client);
    }
}

/// [`Transport`] handle onto an [`InMemoryBroker`].
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    id: u64,
    name: String,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    next_ack: AtomicU64,
}

impl InMemoryTransport {
    /// Client name used in the broker history.
    pub fn client_name(&self) -> &str {
        &self.name
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.events.lock().is_some()
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<TransportEvent>, TransportError> {
        self.events
            .lock()
            .as_ref()
            .cloned()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<TransportEvents, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::Connected)
            .map_err(|_| TransportError::Closed)?;
        if self.events.lock().replace(tx).is_some() {
            self.broker.drop_client(self.id);
        }
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let events = self.sender()?;
        self.broker.add_subscription(self.id, topic, events);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<DeliveryAck, TransportError> {
        let events = self.sender()?;
        self.broker.route(&self.name, topic, payload);
        let ack = DeliveryAck {
            id: self.next_ack.fetch_add(1, Ordering::Relaxed),
        };
        // The owner may have dropped its event stream; the ack is still valid.
        let _ = events.send(TransportEvent::Published(ack));
        Ok(ack)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker.drop_client(self.id);
        if let Some(events) = self.events.lock().take() {
            let _ = events.send(TransportEvent::Disconnected { reason: None });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_exact_topic_and_acks() {
        let broker = InMemoryBroker::new();
        let device = broker.client("device");
        let mut events = device.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        device.subscribe("/d/p2d").await.unwrap();
        device.subscribe("/d/p2d").await.unwrap();
        assert_eq!(broker.subscriber_count("/d/p2d"), 1);

        assert_eq!(broker.inject("/d/p2d", b"hello".to_vec()), 1);
        assert_eq!(broker.inject("/other/p2d", b"ignored".to_vec()), 0);
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Message {
                topic: "/d/p2d".into(),
                payload: b"hello".to_vec()
            })
        );

        let ack = device.publish("/d/d2p", b"reply".to_vec()).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Published(ack)));
        let sent = broker.published_on("/d/d2p");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].client, "device");
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn operations_require_a_session() {
        let broker = InMemoryBroker::new();
        let client = broker.client("c");
        assert!(matches!(
            client.publish("/t", Vec::new()).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            client.subscribe("/t").await,
            Err(TransportError::NotConnected)
        ));
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_removes_subscriptions() {
        let broker = InMemoryBroker::new();
        let client = broker.client("c");
        let mut events = client.connect().await.unwrap();
        client.subscribe("/t").await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        assert_eq!(broker.subscriber_count("/t"), 0);
        assert_eq!(broker.inject("/t", "x"), 0);
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected { reason: None })
        );
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn wait_for_returns_once_published() {
        let broker = InMemoryBroker::new();
        let publisher = broker.client("p");
        let _events = publisher.connect().await.unwrap();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_for("/t", 2, Duration::from_secs(5)).await })
        };
        publisher.publish("/t", b"1".to_vec()).await.unwrap();
        publisher.publish("/t", b"2".to_vec()).await.unwrap();
        let seen = waiter.await.unwrap();
        assert_eq!(seen.len(), 2);

        let nothing = broker.wait_for("/empty", 1, Duration::from_millis(20)).await;
        assert!(nothing.is_empty());
    }
}
