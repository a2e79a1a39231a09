//! Observable session events.

use tokio::sync::broadcast;

use crate::ProtocolError;

/// Events emitted by a [`Session`](crate::Session) over its broadcast
/// channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Every extension ran its init hook and the init gate is about to be
    /// consulted.
    ExtensionsInitialized,
    /// The init gate passed on both sides and all handshake hooks ran; the
    /// session is running.
    Handshake,
    /// A failure was observed. Fatal errors are followed by `Closed`;
    /// non-fatal ones (such as a missing message handler) are not.
    Error(ProtocolError),
    /// The session reached its terminal state.
    Closed,
}

const EVENT_CHANNEL_SIZE: usize = 64;

/// Broadcast fan-out for session events. Emitting never fails; with no
/// subscribers the event is dropped.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSender {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { tx }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}
