//! Protocol-level errors.

use thiserror::Error;

/// Errors raised while parsing, serializing or transforming a packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too short to contain a header of the expected layout.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum required length.
        expected: usize,
        /// Actual buffer length.
        actual: usize,
    },

    /// Buffer declared a longer payload than it actually contains.
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Declared payload length.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Header magic did not match the configured layout.
    #[error("invalid magic number")]
    InvalidMagic,

    /// `length` field is inconsistent with header size or payload length.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// `length` (or the computed total size) exceeds the 65535-byte wire limit.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Attempted size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Destination buffer passed to `TrySerialize` was too small.
    #[error("destination buffer too small: need {needed} bytes, have {available}")]
    DestinationTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    CompressionError(String),

    /// The packet is not in the state an operation requires (e.g.
    /// `Decompress` called without `Compressed` set).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Encryption or decryption failed, including AEAD authentication failure.
    #[error("decrypt error: {0}")]
    DecryptError(String),

    /// Signature verification failed or signature payload was malformed.
    #[error("signature error: {0}")]
    SignatureError(String),

    /// Symmetric key length did not match the selected algorithm.
    #[error("invalid key length: algorithm {algo} requires {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Algorithm name.
        algo: &'static str,
        /// Required key length.
        expected: usize,
        /// Supplied key length.
        actual: usize,
    },
}

/// Convenience alias used throughout `netframe-proto`.
pub type Result<T> = std::result::Result<T, ProtocolError>;
