use chat_api::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{
    error::TryRecvError, unbounded_channel, UnboundedReceiver, UnboundedSender,
};

/// Human readable connection status shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => f.write_str("Connecting..."),
            ConnectionStatus::Connected => f.write_str("Connected"),
            ConnectionStatus::Reconnecting => f.write_str("Reconnecting..."),
            ConnectionStatus::Disconnected => f.write_str("Disconnected"),
            ConnectionStatus::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// A received message annotated for the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message: Message,
    pub is_current_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StatusChanged(ConnectionStatus),
    MessageReceived(ChatMessage),
}

/// Fans client events out to every live subscription, preserving publish
/// order per subscriber.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, UnboundedSender<ClientEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    pub fn publish(&self, event: ClientEvent) {
        self.subscribers
            .lock()
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: UnboundedReceiver<ClientEvent>,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Next event, or `None` once the client has been dropped.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().remove(&self.id);
        }
    }
}
