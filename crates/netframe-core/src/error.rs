//! Core-layer errors: session lifecycle, buffer pool, connection admission.
//!
//! We avoid using `std::io::Error` for session logic to keep transient
//! transport failures distinguishable from protocol/config failures.

use std::{io, time::Duration};

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised by [`crate::session::Session`] and [`crate::session_manager::SessionManager`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when the error occurred.
        state: SessionState,
        /// Operation that was attempted.
        operation: String,
    },

    /// Session timed out (handshake or idle), after exhausting reconnect attempts.
    #[error("session timeout after {elapsed:?}")]
    Timeout {
        /// How long the session was idle or pending.
        elapsed: Duration,
    },

    /// `SessionManager::add` was refused by the connection limiter.
    #[error("connection rejected: {reason}")]
    ConnectionRejected {
        /// Why the limiter refused admission.
        reason: String,
    },

    /// No session exists for a given id.
    #[error("unknown session: {0}")]
    UnknownSession(u64),

    /// Clock moved backwards while generating a `UniqueId`.
    #[error("clock moved backwards: observed {observed_ms}ms, last seen {last_seen_ms}ms")]
    ClockBackwards {
        /// Millisecond timestamp just observed.
        observed_ms: i64,
        /// Millisecond timestamp previously recorded.
        last_seen_ms: i64,
    },

    /// Underlying transport error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CoreError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Protocol violations (invalid state, unknown session) are never
    /// transient — they indicate a programming error or a malicious peer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<netframe_proto::ProtocolError> for CoreError {
    fn from(err: netframe_proto::ProtocolError) -> Self {
        Self::Transport(err.to_string())
    }
}
