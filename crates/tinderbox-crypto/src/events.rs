use tokio::sync::broadcast;

use crate::prekey::SerializedPreKey;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications published by a [`Cryptobox`](crate::Cryptobox).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoboxEvent {
    /// Fresh prekeys that should be uploaded for peers.
    NewPreKeys(Vec<SerializedPreKey>),
    /// A peer started a session with us.
    NewSession(String),
}

/// Fire-and-forget event fan-out.
pub struct EventPublisher {
    tx: broadcast::Sender<CryptoboxEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CryptoboxEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`. Having no subscribers is not an error.
    pub fn publish(&self, event: CryptoboxEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            tracing::debug!(?event, "no subscribers for cryptobox event");
        }
    }
}
