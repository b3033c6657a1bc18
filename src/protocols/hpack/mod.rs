//! HPACK header compression for HTTP/2 (RFC 7541).
//!
//! One [`Encoder`] and one [`Decoder`] exist per connection direction.
//! Table mutations are atomic per header block: the decoder either
//! applies every insertion in a block or fails, and a failure is
//! connection-fatal (`COMPRESSION_ERROR`).

pub mod decoder;
pub mod encoder;
pub mod table;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// Fixed per-entry overhead charged against the table budget
/// (RFC 7541 §4.1; QPACK reuses the same constant).
pub const ENTRY_OVERHEAD: usize = 32;

/// Default dynamic table capacity before SETTINGS change it.
pub const DEFAULT_TABLE_CAPACITY: usize = 4096;
