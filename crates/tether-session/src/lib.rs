#![deny(unsafe_code)]

//! Session core of the tether peer-to-peer stack.
//!
//! Two processes hold a long-lived duplex stream; a [`Session`] on each end
//! negotiates a set of named [`Extension`] channels over it and drives a
//! deterministic lifecycle: open → init → init-gate → handshake → running →
//! closed. Extensions exchange request/response messages correlated by
//! random 32-byte ids, plus one-way events.
//!
//! The underlying framed transport is a collaborator, not part of this
//! crate's job: anything implementing [`Transport`] works. An in-memory
//! implementation for tests and demos lives in [`memory`].
//!
//! ```no_run
//! use tether_session::{memory::MemoryTransport, Extension, Session, SessionOptions};
//!
//! # async fn run() {
//! let (near, far) = MemoryTransport::pair();
//! let topic = [7u8; 32];
//!
//! let session = Session::new(near, SessionOptions::default());
//! session.set_extension(Extension::builder("chat").build());
//! session.init(Some(topic));
//! session.ready().await.unwrap();
//!
//! let chat = session.extension("chat").unwrap();
//! let reply = chat.call(&b"hello"[..]).await.unwrap();
//! # let _ = (far, reply);
//! # }
//! ```

mod context;
mod errors;
mod events;
mod extension;
mod init;
mod registry;
mod session;

pub mod memory;
pub mod transport;

pub use context::Context;
pub use errors::{codes, ProtocolError};
pub use events::SessionEvent;
pub use extension::{
    Extension, ExtensionBuilder, ExtensionState, ExtensionStats, HandlerResult, MessageOptions,
};
pub use init::INIT_EXTENSION_NAME;
pub use session::{Session, SessionData, SessionOptions, SessionState, Topic};
pub use transport::{Transport, TransportEvent};

pub use tether_wire::{discovery_key, Payload, Schema};

use std::time::Duration;

/// Default response timeout for [`Extension::call`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default bound on the init-gate wait for the remote verdict.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(5000);

pub(crate) const OUTBOUND_CHANNEL_SIZE: usize = 1024;
pub(crate) const INBOX_CHANNEL_SIZE: usize = 1024;

#[cfg(test)]
mod tests;
