//! Shared error types: the OOB codec's local error enum and the top-level
//! `RangingError` union that backs the caller-facing API (§6.5).

use thiserror::Error;

use crate::model::TechnologyTag;

/// Errors raised while encoding or decoding an OOB message (§4.A).
///
/// Every variant here is a decode-time validation failure; none of them can
/// occur on encode of a value that was itself constructed through the
/// `model` types, since those already enforce their own invariants
/// (session-key length, country-code bytes, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("truncated message: needed {needed} more byte(s), had {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unsupported protocol version {0:#04x}")]
    UnknownVersion(u8),

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unknown bit set in technology bitmap: {0:#06b}")]
    UnknownBits(u16),

    #[error("tech block declared size {declared} but body parsing consumed {consumed}")]
    BlockSizeMismatch { declared: u8, consumed: u8 },

    #[error("tech block payload of {0} byte(s) does not fit the one-byte block-size field")]
    PayloadTooLarge(usize),

    #[error("unexpected session-key length {0} (expected 8, 16, or 32)")]
    UnexpectedKeyLength(u8),

    #[error("country code is not two uppercase ASCII letters")]
    InvalidCountryCode,

    #[error("RTT service name is not valid UTF-8")]
    InvalidUtf8,

    #[error("RTT service name of {0} byte(s) does not fit the one-byte length field")]
    NameTooLong(usize),
}

/// Top-level error union, the concrete type behind the caller-facing
/// error enum (§6.5).
#[derive(Debug, Clone, Error)]
pub enum RangingError {
    #[error("operation failed for an unspecified internal reason")]
    Unknown,

    #[error("session closed at local request")]
    LocalRequest,

    #[error("session closed at the remote peer's request")]
    RemoteRequest,

    #[error("{technology} is not supported on this device")]
    Unsupported { technology: TechnologyTag },

    #[error("blocked by system policy")]
    SystemPolicy,

    #[error("no ranging peers were found")]
    NoPeersFound,

    #[error("no technology in common with the peer's capabilities")]
    NoCompatibleCapabilities,

    #[error("out-of-band negotiation timed out")]
    OobTimeout,

    #[error("out-of-band protocol error: {0}")]
    OobProtocolError(String),

    #[error("malformed out-of-band message: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(String),
}
