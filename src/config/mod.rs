//! Engine configuration.
//!
//! [`Config`] carries every option the engines, pool and selector
//! recognize; the per-protocol sub-configs validate themselves against
//! their RFC bounds before a connection is built from them.

pub mod protocol;
pub mod timeouts;

pub use protocol::{H1Config, H2Config, H3Config};
pub use timeouts::TimeoutConfig;

use std::time::Duration;

use crate::error::Error;
use crate::selector::Alpn;

/// Minimum TLS protocol version handed to the TLS collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

/// TLS-facing options (consumed by the handshake collaborator).
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Certificate verification; disabling is for test rigs only.
    pub verify: bool,
    pub min_version: TlsVersion,
    /// SPKI pin set; non-empty means strict failure on mismatch.
    pub spki_pins: Vec<Vec<u8>>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            verify: true,
            min_version: TlsVersion::V1_2,
            spki_pins: Vec::new(),
        }
    }
}

/// 0-RTT policy.
#[derive(Debug, Clone)]
pub struct ZeroRttConfig {
    pub enabled: bool,
    /// Permit non-safe methods (POST/PUT/DELETE) in early data.
    pub allow_unsafe_methods: bool,
    /// Tickets older than this are discarded.
    pub ticket_lifetime: Duration,
}

impl Default for ZeroRttConfig {
    fn default() -> Self {
        ZeroRttConfig {
            enabled: true,
            allow_unsafe_methods: false,
            ticket_lifetime: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub timeouts: TimeoutConfig,
    /// Redirect hop limit for the convenience layer above the engines;
    /// the core itself never follows redirects.
    pub max_redirects: usize,
    /// Idle H1 connections kept per origin.
    pub max_per_host: usize,
    /// Hard cap across every origin.
    pub max_total_connections: usize,
    /// Idle connections older than this are reaped.
    pub idle_timeout: Duration,
    pub user_agent: Option<String>,
    pub tls: TlsConfig,
    /// ALPN offer order; trimmed to the enabled engines.
    pub alpn_offer: Vec<Alpn>,
    pub enable_h1: bool,
    pub enable_h2: bool,
    pub enable_h3: bool,
    pub h1: H1Config,
    pub h2: H2Config,
    pub h3: H3Config,
    pub zero_rtt: ZeroRttConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeouts: TimeoutConfig::default(),
            max_redirects: 10,
            max_per_host: 8,
            max_total_connections: 128,
            idle_timeout: Duration::from_secs(90),
            user_agent: None,
            tls: TlsConfig::default(),
            alpn_offer: vec![Alpn::H3, Alpn::H2, Alpn::Http11],
            enable_h1: true,
            enable_h2: true,
            enable_h3: true,
            h1: H1Config::default(),
            h2: H2Config::default(),
            h3: H3Config::default(),
            zero_rtt: ZeroRttConfig::default(),
        }
    }
}

impl Config {
    /// Validates the whole tree; called before the first connection.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_per_host == 0 {
            return Err(Error::InvalidConfig("max_per_host must be at least 1".into()));
        }
        if self.max_total_connections < self.max_per_host {
            return Err(Error::InvalidConfig(
                "max_total_connections below max_per_host".into(),
            ));
        }
        if !(self.enable_h1 || self.enable_h2 || self.enable_h3) {
            return Err(Error::InvalidConfig("no protocol engine enabled".into()));
        }
        self.h2.validate()?;
        self.h3.validate()?;
        Ok(())
    }

    /// The ALPN identifiers actually offered, respecting both the
    /// configured order and the enabled engines.
    #[must_use]
    pub fn effective_alpn(&self) -> Vec<Alpn> {
        self.alpn_offer
            .iter()
            .copied()
            .filter(|alpn| match alpn {
                Alpn::H3 => self.enable_h3,
                Alpn::H2 => self.enable_h2,
                Alpn::Http11 => self.enable_h1,
            })
            .collect()
    }
}
