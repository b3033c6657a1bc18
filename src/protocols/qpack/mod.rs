//! QPACK header compression for HTTP/3 (RFC 9204).
//!
//! Unlike HPACK, dynamic-table updates travel on a dedicated
//! unidirectional encoder stream and are acknowledged on a decoder
//! stream, so header blocks can reference entries the peer has not
//! seen yet. Each encoded field section starts with the required
//! insert count the decoder must have reached plus a base for
//! relative indexing; sections that outrun the table block until the
//! encoder stream catches up.

pub mod decoder;
pub mod encoder;
pub mod table;

pub use decoder::{Decoder, SectionOutcome};
pub use encoder::Encoder;

/// Fixed per-entry overhead, identical to HPACK's.
pub const ENTRY_OVERHEAD: usize = 32;
