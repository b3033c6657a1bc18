//! Contracts the transport collaborators fulfill.
//!
//! TLS and QUIC are deliberately not implemented here: the engines
//! only require the shapes below. A TLS stack plugs in by implementing
//! [`tls::TlsConnector`]/[`tls::TlsAcceptor`]; a QUIC stack by
//! implementing [`quic::QuicConnection`].

pub mod quic;
pub mod tls;

pub use quic::QuicConnection;
pub use tls::{TlsAcceptor, TlsConnector, TlsSession};
