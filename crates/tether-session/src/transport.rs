//! Transport abstraction consumed by the session.
//!
//! The session does not implement framing, authentication, or encryption; it
//! expects a transport that multiplexes named extension payloads between two
//! endpoints and reports a handshake once keys are established. This is the
//! narrow surface the session drives.
//!
//! Implementations: [`memory::MemoryTransport`](crate::memory::MemoryTransport)
//! for tests and demos; production transports live in downstream crates.

use std::future::Future;
use std::io;
use std::pin::Pin;

/// Events surfaced by a transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Keys are established; `remote_id` and `remote_user_data` are now
    /// readable. Fired once.
    Handshake,
    /// The peer referenced a feed by its discovery key.
    Feed { discovery_key: [u8; 32] },
    /// A payload arrived on a named extension channel. Only names advertised
    /// by both peers produce events.
    Extension { name: String, payload: Vec<u8> },
}

/// A duplex transport endpoint carrying named extension channels.
///
/// Methods taking `&mut self` are driven from a single task; the session
/// serializes all access through its internal driver.
pub trait Transport: Send + 'static {
    /// This endpoint's id (random 32 bytes unless configured otherwise).
    fn local_id(&self) -> [u8; 32];

    /// The peer's id, available after the handshake.
    fn remote_id(&self) -> Option<[u8; 32]>;

    /// Opaque bytes carried to the peer during the handshake. Must be set
    /// before [`start`](Transport::start).
    fn set_user_data(&mut self, data: Vec<u8>);

    /// The peer's user data, available after the handshake.
    fn remote_user_data(&self) -> Option<Vec<u8>>;

    /// Append a name to the ordered advertised-extensions list. Both peers'
    /// lists are intersected; only names in the intersection deliver frames.
    fn advertise(&mut self, name: &str);

    /// Begin the transport handshake.
    fn start(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Open the channel for a feed key. The first fed key seeds the
    /// handshake; later keys are announced to the peer.
    fn feed(&mut self, key: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Send a payload on a named extension channel.
    fn send_extension(
        &mut self,
        name: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Pull the next event. `Ok(None)` signals end of stream.
    fn next_event(&mut self) -> impl Future<Output = io::Result<Option<TransportEvent>>> + Send;

    /// Tear the stream down. Idempotent.
    fn destroy(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

// ============================================================================
// Object-safe adapter
// ============================================================================

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe mirror of [`Transport`] so the session driver does not need a
/// type parameter. Blanket-implemented for every `Transport`.
pub(crate) trait DynTransport: Send {
    fn local_id(&self) -> [u8; 32];
    fn remote_id(&self) -> Option<[u8; 32]>;
    fn set_user_data(&mut self, data: Vec<u8>);
    fn remote_user_data(&self) -> Option<Vec<u8>>;
    fn advertise(&mut self, name: &str);
    fn start(&mut self) -> BoxFuture<'_, io::Result<()>>;
    fn feed<'a>(&'a mut self, key: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;
    fn send_extension<'a>(
        &'a mut self,
        name: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, io::Result<()>>;
    fn next_event(&mut self) -> BoxFuture<'_, io::Result<Option<TransportEvent>>>;
    fn destroy(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

impl<T: Transport> DynTransport for T {
    fn local_id(&self) -> [u8; 32] {
        Transport::local_id(self)
    }

    fn remote_id(&self) -> Option<[u8; 32]> {
        Transport::remote_id(self)
    }

    fn set_user_data(&mut self, data: Vec<u8>) {
        Transport::set_user_data(self, data);
    }

    fn remote_user_data(&self) -> Option<Vec<u8>> {
        Transport::remote_user_data(self)
    }

    fn advertise(&mut self, name: &str) {
        Transport::advertise(self, name);
    }

    fn start(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(Transport::start(self))
    }

    fn feed<'a>(&'a mut self, key: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(Transport::feed(self, key))
    }

    fn send_extension<'a>(
        &'a mut self,
        name: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(Transport::send_extension(self, name, payload))
    }

    fn next_event(&mut self) -> BoxFuture<'_, io::Result<Option<TransportEvent>>> {
        Box::pin(Transport::next_event(self))
    }

    fn destroy(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(Transport::destroy(self))
    }
}
