//! ALPN-driven engine selection.
//!
//! The selector owns the protocol policy: which ALPN identifiers to
//! offer for an origin, which engine to build from the negotiated
//! identifier, and the deterministic H3 → H2/H1 fallback when UDP to
//! an origin keeps failing (memoized per origin for a short TTL).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use url::Url;

use crate::config::Config;
use crate::error::Error;
use crate::http::Scheme;
use crate::pool::OriginKey;
use crate::protocols::h1::ClientConnection as H1Client;
use crate::protocols::h2::H2Connection;
use crate::protocols::h3::H3Connection;

/// How long a UDP/QUIC failure keeps an origin off H3.
const H3_FAILURE_TTL: Duration = Duration::from_secs(5 * 60);

/// Supported ALPN identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alpn {
    H3,
    H2,
    Http11,
}

impl Alpn {
    /// Wire identifier as offered in the TLS extension.
    #[must_use]
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Alpn::H3 => b"h3",
            Alpn::H2 => b"h2",
            Alpn::Http11 => b"http/1.1",
        }
    }

    /// Parses a negotiated identifier.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"h3" => Some(Alpn::H3),
            b"h2" => Some(Alpn::H2),
            b"http/1.1" => Some(Alpn::Http11),
            _ => None,
        }
    }

    /// Multiplexed protocols share one connection across requests.
    #[must_use]
    pub fn is_multiplexed(self) -> bool {
        !matches!(self, Alpn::Http11)
    }
}

/// An origin extracted from a request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Origin {
    /// Parses scheme/host/port out of `url`.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(Error::MalformedMessage(format!("unsupported scheme {other}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::MalformedMessage("url without host".into()))?
            .to_ascii_lowercase();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Ok(Origin { scheme, host, port })
    }

    /// The pool key for this origin under a negotiated protocol.
    #[must_use]
    pub fn pool_key(&self, alpn: Alpn) -> OriginKey {
        OriginKey::new(self.scheme, &self.host, self.port, alpn)
    }

    fn memo_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A freshly built client engine for a negotiated protocol.
#[derive(Debug)]
pub enum ClientEngine {
    H1(Box<H1Client>),
    H2(Box<H2Connection>),
    H3(Box<H3Connection>),
}

/// The engine selector.
#[derive(Debug)]
pub struct EngineSelector {
    config: Config,
    /// Origins where QUIC recently failed, with the failure instant.
    h3_failures: DashMap<String, Instant>,
}

impl EngineSelector {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(EngineSelector {
            config,
            h3_failures: DashMap::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The ALPN list to offer when dialing `origin`.
    ///
    /// Plaintext origins never negotiate (H1 only, h2c being out of
    /// scope); https origins get the configured order, minus H3 while
    /// a recent QUIC failure is memoized.
    #[must_use]
    pub fn alpn_offer(&self, origin: &Origin, now: Instant) -> Vec<Alpn> {
        if origin.scheme == Scheme::Http {
            return vec![Alpn::Http11];
        }
        let mut offer = self.config.effective_alpn();
        if offer.contains(&Alpn::H3) && self.h3_recently_failed(origin, now) {
            offer.retain(|alpn| *alpn != Alpn::H3);
            tracing::debug!(
                target: "trireme::selector",
                origin = %origin.memo_key(),
                "h3 suppressed by recent QUIC failure"
            );
        }
        offer
    }

    /// Records a QUIC connect failure so the next attempts go straight
    /// to TCP.
    pub fn record_h3_failure(&self, origin: &Origin, now: Instant) {
        self.h3_failures.insert(origin.memo_key(), now);
    }

    /// Clears the memo after a successful QUIC connect.
    pub fn record_h3_success(&self, origin: &Origin) {
        self.h3_failures.remove(&origin.memo_key());
    }

    fn h3_recently_failed(&self, origin: &Origin, now: Instant) -> bool {
        match self.h3_failures.get(&origin.memo_key()) {
            Some(at) => now.duration_since(*at) < H3_FAILURE_TTL,
            None => false,
        }
    }

    /// Builds the client engine for what the handshake negotiated.
    ///
    /// `negotiated` of `None` (no ALPN extension) falls back to
    /// HTTP/1.1, the only protocol usable without negotiation.
    pub fn client_engine(&self, negotiated: Option<&[u8]>) -> Result<ClientEngine, Error> {
        let alpn = match negotiated {
            Some(bytes) => Alpn::from_bytes(bytes).ok_or_else(|| {
                Error::HandshakeFailed(format!(
                    "peer selected unknown protocol {:?}",
                    String::from_utf8_lossy(bytes)
                ))
            })?,
            None => Alpn::Http11,
        };
        self.engine_for(alpn)
    }

    /// Builds the engine for an already-known protocol (pool hits).
    pub fn engine_for(&self, alpn: Alpn) -> Result<ClientEngine, Error> {
        let enabled = match alpn {
            Alpn::H3 => self.config.enable_h3,
            Alpn::H2 => self.config.enable_h2,
            Alpn::Http11 => self.config.enable_h1,
        };
        if !enabled {
            return Err(Error::HandshakeFailed(format!(
                "peer selected disabled protocol {:?}",
                String::from_utf8_lossy(alpn.as_bytes())
            )));
        }
        Ok(match alpn {
            Alpn::Http11 => ClientEngine::H1(Box::new(H1Client::new(
                self.config.h1.limits,
                self.config.h1.lenient_lf,
            ))),
            Alpn::H2 => ClientEngine::H2(Box::new(H2Connection::new_client(&self.config.h2))),
            Alpn::H3 => ClientEngine::H3(Box::new(H3Connection::new_client(&self.config.h3))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin {
            scheme: Scheme::Https,
            host: "example.com".into(),
            port: 443,
        }
    }

    #[test]
    fn origin_parsing_defaults_ports() {
        let url = Url::parse("https://Example.com/a/b?q=1").unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.port, 443);

        let url = Url::parse("http://example.com:8080/").unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin.port, 8080);
        assert_eq!(origin.scheme, Scheme::Http);
    }

    #[test]
    fn default_offer_order() {
        let selector = EngineSelector::new(Config::default()).unwrap();
        let offer = selector.alpn_offer(&origin(), Instant::now());
        assert_eq!(offer, vec![Alpn::H3, Alpn::H2, Alpn::Http11]);
    }

    #[test]
    fn plaintext_origins_skip_negotiation() {
        let selector = EngineSelector::new(Config::default()).unwrap();
        let mut plain = origin();
        plain.scheme = Scheme::Http;
        assert_eq!(selector.alpn_offer(&plain, Instant::now()), vec![Alpn::Http11]);
    }

    #[test]
    fn quic_failure_memo_suppresses_h3_until_ttl() {
        let selector = EngineSelector::new(Config::default()).unwrap();
        let now = Instant::now();
        selector.record_h3_failure(&origin(), now);

        let offer = selector.alpn_offer(&origin(), now + Duration::from_secs(1));
        assert!(!offer.contains(&Alpn::H3));

        // Past the TTL the origin gets another chance.
        let offer = selector.alpn_offer(&origin(), now + H3_FAILURE_TTL + Duration::from_secs(1));
        assert!(offer.contains(&Alpn::H3));

        // Success clears the memo immediately.
        selector.record_h3_failure(&origin(), now);
        selector.record_h3_success(&origin());
        let offer = selector.alpn_offer(&origin(), now + Duration::from_secs(1));
        assert!(offer.contains(&Alpn::H3));
    }

    #[test]
    fn negotiated_protocol_picks_the_engine() {
        let selector = EngineSelector::new(Config::default()).unwrap();
        assert!(matches!(selector.client_engine(Some(b"h2")).unwrap(), ClientEngine::H2(_)));
        assert!(matches!(selector.client_engine(Some(b"h3")).unwrap(), ClientEngine::H3(_)));
        assert!(matches!(
            selector.client_engine(Some(b"http/1.1")).unwrap(),
            ClientEngine::H1(_)
        ));
        assert!(matches!(selector.client_engine(None).unwrap(), ClientEngine::H1(_)));
        assert!(selector.client_engine(Some(b"spdy/3")).is_err());
    }

    #[test]
    fn disabled_engine_is_a_mismatch() {
        let mut config = Config::default();
        config.enable_h3 = false;
        let selector = EngineSelector::new(config).unwrap();
        assert!(selector.client_engine(Some(b"h3")).is_err());
    }
}
