//! TLS collaborator contract.

use crate::config::TlsConfig;
use crate::error::Error;
use crate::selector::Alpn;
use crate::session::SessionTicket;

/// Result of a completed handshake: the secured channel plus what was
/// negotiated.
#[derive(Debug)]
pub struct TlsSession<C> {
    /// The secured byte channel, ready for protocol bytes.
    pub channel: C,
    /// Negotiated ALPN identifier; `None` when the peer offered none.
    pub alpn: Option<Alpn>,
    /// Session ticket for later resumption, when the stack issued one.
    pub ticket: Option<SessionTicket>,
    /// True when early data was accepted on a resumed session.
    pub early_data_accepted: bool,
}

/// Client-side handshake provider.
///
/// Implementations perform the handshake over `transport` (an already
/// connected byte stream), offering `alpn` in order, and may fail with
/// [`Error::HandshakeFailed`] or [`Error::CertificateInvalid`]
/// (including SPKI pin mismatches when `config.spki_pins` is
/// non-empty).
pub trait TlsConnector {
    type Transport;
    type Channel;

    fn connect(
        &self,
        transport: Self::Transport,
        server_name: &str,
        alpn: &[Alpn],
        config: &TlsConfig,
        resumption: Option<&SessionTicket>,
    ) -> Result<TlsSession<Self::Channel>, Error>;
}

/// Server-side handshake provider, configured with its certificate and
/// key out of band.
pub trait TlsAcceptor {
    type Transport;
    type Channel;

    fn accept(
        &self,
        transport: Self::Transport,
        alpn_accept: &[Alpn],
    ) -> Result<TlsSession<Self::Channel>, Error>;
}
