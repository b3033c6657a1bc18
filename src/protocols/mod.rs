//! Protocol engines and their shared wire machinery.
//!
//! Each engine is an input-driven state machine with no I/O of its
//! own: `recv*` methods consume transport bytes and return events,
//! `poll_output`/`poll_transmit` drain bytes to write (along with any
//! stream-closure events produced while draining), and explicit
//! methods inject application inputs (requests, body chunks,
//! responses, cancellations, timer expiry).

pub mod h1;
pub mod h2;
pub mod h3;
pub mod hpack;
pub mod message;
pub mod qpack;
pub mod wire;
