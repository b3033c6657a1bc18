//! Error taxonomy for the engine core.
//!
//! Every failure the engines, pool, or selector can surface is one of
//! these variants. Each carries a stable machine-readable tag
//! (see [`Error::tag`]) and, where useful, a diagnostic string.

use thiserror::Error;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engines, pool and selector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    // Transport
    /// TCP or UDP connect failed before any protocol bytes moved.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// TLS or QUIC handshake did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer certificate was rejected (trust, name, or pin mismatch).
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    /// The transport closed underneath an active exchange.
    #[error("network closed")]
    NetworkClosed,

    /// A response body measured by `Content-Length` ended early.
    #[error("response truncated")]
    Truncated,

    // Protocol framing
    /// Input violated the message grammar.
    #[error("bad syntax: {0}")]
    BadSyntax(String),

    /// A line, field count, or header block exceeded a configured limit.
    #[error("too large: {0}")]
    TooLarge(String),

    /// Conflicting or invalid body length information.
    #[error("bad framing: {0}")]
    BadFraming(String),

    /// Malformed chunked transfer coding.
    #[error("bad chunk: {0}")]
    BadChunk(String),

    /// A frame arrived that the stream or connection state forbids.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// A flow-control window went negative or past 2^31-1.
    #[error("flow control violation: {0}")]
    FlowControlViolation(String),

    /// HPACK or QPACK state could not be decoded; connection-fatal.
    #[error("compression error: {0}")]
    CompressionError(String),

    // Protocol semantics
    /// Message is well-framed but semantically invalid.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Peer spoke an HTTP version this engine does not handle.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    /// Peer refused the stream before processing it (retriable).
    #[error("stream refused")]
    Refused,

    /// The stream was closed and its entry dropped; the handle is stale.
    #[error("stream gone")]
    StreamGone,

    /// The connection is busy with a previous exchange (H1 pipelining).
    #[error("connection busy")]
    Busy,

    // Pool policy
    /// The global or per-host connection cap is reached.
    #[error("pool exhausted")]
    PoolExhausted,

    /// The origin's connection is draining after GOAWAY.
    #[error("origin draining")]
    OriginDraining,

    // Cancellation
    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,

    /// A configured deadline expired.
    #[error("timeout")]
    Timeout,

    // Resource
    /// An allocation budget was exceeded.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Configuration rejected at build time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Stable machine-readable tag for this error.
    ///
    /// Tags never change across releases; diagnostic strings may.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Error::ConnectFailed(_) => "connect_failed",
            Error::HandshakeFailed(_) => "handshake_failed",
            Error::CertificateInvalid(_) => "certificate_invalid",
            Error::NetworkClosed => "network_closed",
            Error::Truncated => "truncated",
            Error::BadSyntax(_) => "bad_syntax",
            Error::TooLarge(_) => "too_large",
            Error::BadFraming(_) => "bad_framing",
            Error::BadChunk(_) => "bad_chunk",
            Error::UnexpectedFrame(_) => "unexpected_frame",
            Error::FlowControlViolation(_) => "flow_control_violation",
            Error::CompressionError(_) => "compression_error",
            Error::MalformedMessage(_) => "malformed_message",
            Error::UnsupportedVersion(_) => "unsupported_version",
            Error::Refused => "refused",
            Error::StreamGone => "stream_gone",
            Error::Busy => "busy",
            Error::PoolExhausted => "pool_exhausted",
            Error::OriginDraining => "origin_draining",
            Error::Cancelled => "cancelled",
            Error::Timeout => "timeout",
            Error::OutOfMemory(_) => "out_of_memory",
            Error::InvalidConfig(_) => "invalid_config",
        }
    }

    /// True for errors that tear down the whole connection rather than
    /// a single stream.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::CompressionError(_)
                | Error::FlowControlViolation(_)
                | Error::UnexpectedFrame(_)
                | Error::NetworkClosed
        )
    }
}
