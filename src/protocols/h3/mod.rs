//! HTTP/3 engine (RFC 9114).
//!
//! Flow control belongs to QUIC, so the engine here is thinner than
//! HTTP/2's: [`frame`] covers the varint-framed wire format and
//! stream-type multiplexing, [`connection`] the SETTINGS exchange,
//! request streams and the QPACK encoder/decoder stream plumbing.

pub mod connection;
pub mod frame;

pub use connection::{Event, H3Connection};
pub use frame::ErrorCode;

/// Unidirectional stream type codes (RFC 9114 §6.2).
pub mod stream_type {
    pub const CONTROL: u64 = 0x00;
    pub const PUSH: u64 = 0x01;
    pub const QPACK_ENCODER: u64 = 0x02;
    pub const QPACK_DECODER: u64 = 0x03;
}
