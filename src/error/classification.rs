//! Retriability classification.
//!
//! Implements the propagation policy: transport errors before the first
//! response byte are retriable for idempotent methods; refusals and
//! drains are always retriable; anything after a response byte is
//! surfaced as-is.

use crate::http::Method;

use super::types::Error;

impl Error {
    /// Returns true if the error is a transport-level failure.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(_)
                | Error::HandshakeFailed(_)
                | Error::CertificateInvalid(_)
                | Error::NetworkClosed
                | Error::Timeout
        )
    }

    /// Returns true if the error is a cancellation (caller or deadline).
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout)
    }

    /// Whether a request that failed with this error may be retried on a
    /// fresh connection.
    ///
    /// `response_started` must be true once any response byte for the
    /// request has been observed; after that point nothing is retriable.
    #[must_use]
    pub fn is_retriable(&self, method: &Method, response_started: bool) -> bool {
        if response_started {
            return false;
        }
        match self {
            // The peer told us it never processed the stream.
            Error::Refused | Error::OriginDraining => true,
            // Certificate problems will not improve on retry.
            Error::CertificateInvalid(_) => false,
            e if e.is_transport() => method.is_idempotent(),
            _ => false,
        }
    }
}
