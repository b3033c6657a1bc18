//! QUIC collaborator contract.
//!
//! The HTTP/3 engine never touches packets: it consumes per-stream
//! bytes and produces per-stream bytes, and relies on the transport
//! for flow control, retransmission and stream lifecycle. This trait
//! is the surface a QUIC stack exposes to the driver gluing it to
//! [`crate::protocols::h3::H3Connection`].

use crate::error::Error;
use crate::session::SessionTicket;

/// One QUIC connection, client or server side.
pub trait QuicConnection {
    /// Opens a bidirectional stream, returning its id.
    fn open_bidi(&mut self) -> Result<u64, Error>;

    /// Opens a unidirectional stream, returning its id.
    fn open_uni(&mut self) -> Result<u64, Error>;

    /// Next peer-opened bidirectional stream, if any arrived.
    fn accept_bidi(&mut self) -> Result<Option<u64>, Error>;

    /// Next peer-opened unidirectional stream, if any arrived.
    fn accept_uni(&mut self) -> Result<Option<u64>, Error>;

    /// Reads available bytes from a stream. `Ok(None)` means nothing
    /// is ready; the `bool` reports FIN.
    fn read(&mut self, stream_id: u64, buf: &mut [u8]) -> Result<Option<(usize, bool)>, Error>;

    /// Writes bytes to a stream, optionally finishing it. A short
    /// write is back-pressure, not an error.
    fn write(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize, Error>;

    /// Asks the peer to stop sending on a stream.
    fn stop_sending(&mut self, stream_id: u64, error_code: u64) -> Result<(), Error>;

    /// Abruptly terminates the sending side of a stream.
    fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> Result<(), Error>;

    /// Closes the connection with an application error code.
    fn close(&mut self, error_code: u64, reason: &[u8]);

    /// The ALPN identifier the handshake selected.
    fn alpn(&self) -> Option<&[u8]>;

    /// Takes a session ticket issued by the peer, when one arrived.
    fn take_session_ticket(&mut self) -> Option<SessionTicket>;

    /// Early-data budget of the resumed session, if resumption with
    /// early data was negotiated.
    fn max_early_data(&self) -> Option<u64>;
}
