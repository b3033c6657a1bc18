//! HTTP/2 engine (RFC 9113).
//!
//! [`frame`] covers the 9-byte frame header and per-type payload
//! codecs; [`flow`] the two-level credit windows; [`stream`] the
//! per-stream state machine; [`connection`] ties them together with
//! the preface, SETTINGS exchange, HPACK contexts and the DATA
//! scheduler.

pub mod connection;
pub mod flow;
pub mod frame;
pub mod stream;

pub use connection::{Event, H2Connection};
pub use frame::{ErrorCode, Settings};

pub use crate::protocols::message::PeerHead;

/// The 24-byte client connection preface.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
