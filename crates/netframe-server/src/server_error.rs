//! Top-level server error taxonomy (§7).
//!
//! Hand-written `Display`/`Error` rather than `thiserror`, matching the
//! variance already present between `netframe-core`'s `thiserror` enum and
//! this crate's own style.
//!
//! Propagation policy: everything below `Fatal` is recoverable at the
//! per-connection task boundary — a bad frame, a rate limit, a handler
//! panic-turned-error never unwinds past `handle_connection`. Only `Fatal`
//! (bad startup config) is allowed to abort the process.

use std::fmt;

/// Errors surfaced by the listener, dispatcher, and transport layers.
#[derive(Debug)]
pub enum ServerError {
    /// Malformed header, length, checksum, or signature. The frame is
    /// dropped; the connection stays open.
    InvalidPacket(String),

    /// A compression middleware stage failed. Frame dropped, connection
    /// stays open.
    CompressionError(String),

    /// A decryption middleware stage failed (including AEAD authentication
    /// failure). Frame dropped, connection stays open.
    DecryptError(String),

    /// Token bucket for this `(connection, opcode)` pair was empty.
    /// Dispatcher rejects the frame before the handler runs.
    RateLimited {
        /// Opcode the rejected frame targeted.
        opcode: u16,
    },

    /// The connection's or opcode's concurrency limit was already at
    /// capacity.
    Overloaded {
        /// Opcode the rejected frame targeted.
        opcode: u16,
    },

    /// The session's role does not have permission for this opcode.
    Forbidden {
        /// Opcode the rejected frame targeted.
        opcode: u16,
    },

    /// A handler exceeded its deadline. Its result, if any, is discarded.
    Timeout {
        /// Opcode whose handler timed out.
        opcode: u16,
    },

    /// A handler returned an error or panicked. Logged with opcode and
    /// remote endpoint, never rethrown.
    HandlerException {
        /// Opcode whose handler failed.
        opcode: u16,
        /// Failure description.
        reason: String,
    },

    /// Transport-level failure (reset, read timeout). The session is closed.
    ConnectionError(String),

    /// Startup configuration error: duplicate opcode registration, invalid
    /// bind address, bad pool/limiter config. The only variant allowed to
    /// abort the process.
    Fatal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacket(msg) => write!(f, "invalid packet: {msg}"),
            Self::CompressionError(msg) => write!(f, "compression error: {msg}"),
            Self::DecryptError(msg) => write!(f, "decrypt error: {msg}"),
            Self::RateLimited { opcode } => write!(f, "rate limited: opcode {opcode:#06x}"),
            Self::Overloaded { opcode } => write!(f, "overloaded: opcode {opcode:#06x}"),
            Self::Forbidden { opcode } => write!(f, "forbidden: opcode {opcode:#06x}"),
            Self::Timeout { opcode } => write!(f, "timeout: opcode {opcode:#06x}"),
            Self::HandlerException { opcode, reason } => {
                write!(f, "handler exception on opcode {opcode:#06x}: {reason}")
            },
            Self::ConnectionError(msg) => write!(f, "connection error: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<netframe_proto::ProtocolError> for ServerError {
    fn from(err: netframe_proto::ProtocolError) -> Self {
        use netframe_proto::ProtocolError as P;
        match err {
            P::CompressionError(msg) => Self::CompressionError(msg),
            P::DecryptError(msg) => Self::DecryptError(msg),
            other => Self::InvalidPacket(other.to_string()),
        }
    }
}

impl From<netframe_core::CoreError> for ServerError {
    fn from(err: netframe_core::CoreError) -> Self {
        Self::ConnectionError(err.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::ConnectionError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_opcode() {
        let err = ServerError::RateLimited { opcode: 0x0101 };
        assert_eq!(err.to_string(), "rate limited: opcode 0x0101");
    }

    #[test]
    fn protocol_error_compression_variant_maps_through() {
        let err: ServerError = netframe_proto::ProtocolError::CompressionError("bad stream".to_string()).into();
        assert!(matches!(err, ServerError::CompressionError(_)));
    }

    #[test]
    fn protocol_error_other_variants_become_invalid_packet() {
        let err: ServerError = netframe_proto::ProtocolError::InvalidMagic.into();
        assert!(matches!(err, ServerError::InvalidPacket(_)));
    }
}
