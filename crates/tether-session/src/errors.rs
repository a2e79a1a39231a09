//! Tagged errors shared across the session core.
//!
//! Every failure carries a stable code string so callers (and the remote
//! peer, for error responses) can branch on the kind without parsing
//! messages.

use std::fmt;

/// Stable error codes carried by [`ProtocolError`].
pub mod codes {
    /// A user handshake callback failed.
    pub const ERR_PROTOCOL_HANDSHAKE_FAILED: &str = "ERR_PROTOCOL_HANDSHAKE_FAILED";
    /// The init gate vetoed the connection, or no public key matched a
    /// discovery key.
    pub const ERR_PROTOCOL_CONNECTION_INVALID: &str = "ERR_PROTOCOL_CONNECTION_INVALID";
    /// A frame arrived for an extension nobody registered.
    pub const ERR_PROTOCOL_EXTENSION_MISSING: &str = "ERR_PROTOCOL_EXTENSION_MISSING";
    /// An extension's `open` or `on_init` failed locally.
    pub const ERR_PROTOCOL_INIT_FAILED: &str = "ERR_PROTOCOL_INIT_FAILED";
    /// A pending call exceeded its timeout.
    pub const ERR_REQUEST_TIMEOUT: &str = "ERR_REQUEST_TIMEOUT";
    /// Generic handler failure surfaced to the remote peer.
    pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
    /// An incoming request found no handler installed.
    pub const ERR_NO_HANDLER: &str = "ERR_NO_HANDLER";
    /// A malformed local call.
    pub const ERR_INVALID_ARGUMENT: &str = "ERR_INVALID_ARGUMENT";
    /// The extension or session closed underneath the operation.
    pub const ERR_CLOSE: &str = "ERR_CLOSE";
    /// An extension was bound twice.
    pub const ERR_ALREADY_OPEN: &str = "ERR_ALREADY_OPEN";
}

/// Error type shared by every fallible operation in the core.
///
/// Remote error responses and local rejections use the same type, so a
/// caller can match on [`code`](ProtocolError::code) regardless of where the
/// failure originated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    code: String,
    message: String,
}

impl ProtocolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Generic handler failure (`ERR_SYSTEM`).
    pub fn system(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_SYSTEM, message)
    }

    pub fn timeout() -> Self {
        Self::new(codes::ERR_REQUEST_TIMEOUT, "request timed out")
    }

    pub fn closed() -> Self {
        Self::new(codes::ERR_CLOSE, "extension closed")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_INVALID_ARGUMENT, message)
    }

    pub fn connection_invalid(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_PROTOCOL_CONNECTION_INVALID, message)
    }

    pub fn extension_missing(name: &str) -> Self {
        Self::new(
            codes::ERR_PROTOCOL_EXTENSION_MISSING,
            format!("no extension registered for '{name}'"),
        )
    }

    pub fn init_failed(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_PROTOCOL_INIT_FAILED, message)
    }

    pub fn handshake_failed(message: impl Into<String>) -> Self {
        Self::new(codes::ERR_PROTOCOL_HANDSHAKE_FAILED, message)
    }

    pub fn no_handler(name: &str) -> Self {
        Self::new(
            codes::ERR_NO_HANDLER,
            format!("no message handler installed on '{name}'"),
        )
    }

    pub fn already_open(name: &str) -> Self {
        Self::new(
            codes::ERR_ALREADY_OPEN,
            format!("extension '{name}' is already bound to a session"),
        )
    }

    /// The stable code string.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error carries the given code.
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_for_branching() {
        let err = ProtocolError::timeout();
        assert!(err.is(codes::ERR_REQUEST_TIMEOUT));
        assert_eq!(err.code(), "ERR_REQUEST_TIMEOUT");
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = ProtocolError::system("boom");
        assert_eq!(err.to_string(), "ERR_SYSTEM: boom");
    }

    #[test]
    fn remote_codes_round_trip_as_strings() {
        let err = ProtocolError::new("ERR_CUSTOM", "application defined");
        assert!(err.is("ERR_CUSTOM"));
    }
}
