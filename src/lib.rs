//! # Trireme
//!
//! Multi-protocol HTTP engine library: native wire implementations of
//! HTTP/1.1, HTTP/2 (with HPACK) and HTTP/3-over-QUIC (with QPACK),
//! usable in both client and server roles.
//!
//! The engines are input-driven state machines: feed them transport
//! bytes and application inputs, drain the bytes they want written.
//! Nothing here performs I/O, so the same engines run under a blocking
//! thread-per-connection integration or a cooperative reactor.
//!
//! ## Layout
//!
//! - [`http`] — message model: methods, status codes, ordered field
//!   sections, body framing descriptors
//! - [`protocols`] — the three engines plus their shared wire
//!   primitives (varint, prefix integers, Huffman) and the HPACK/QPACK
//!   codecs
//! - [`pool`] — per-origin connection pool
//! - [`selector`] — ALPN-driven engine selection and fallback
//! - [`session`] — 0-RTT session ticket cache
//! - [`transport`] — contracts the TLS and QUIC collaborators fulfill

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod http;
pub mod pool;
pub mod protocols;
pub mod selector;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use http::{BodyLength, FieldSection, Method, Request, Response, StatusCode};
pub use selector::{Alpn, EngineSelector};
