//! 0-RTT session ticket cache.
//!
//! Tickets are keyed by server name and single-use. Early-data use is
//! gated twice: the ticket must be young enough, and the request must
//! be safe (or the caller must have opted into unsafe methods) and fit
//! the ticket's early-data budget.

use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;

use crate::config::ZeroRttConfig;
use crate::http::Method;

/// An opaque resumption ticket plus the metadata gating its use.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub ticket: Bytes,
    pub issued_at: Instant,
    pub server_name: String,
    /// Bytes of application data the server will accept in the first
    /// flight; zero disables early data for this ticket.
    pub max_early_data: u64,
}

impl SessionTicket {
    /// True while the ticket is young enough under `config`.
    #[must_use]
    pub fn is_valid(&self, config: &ZeroRttConfig, now: Instant) -> bool {
        now.duration_since(self.issued_at) < config.ticket_lifetime
    }
}

/// Why a request was kept out of early data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyDataVerdict {
    /// Send in the first flight.
    Allowed,
    /// 0-RTT disabled or no usable ticket.
    NoTicket,
    /// The method is unsafe under the current policy.
    UnsafeMethod,
    /// The encoded request would overrun the ticket's budget.
    TooLarge,
}

/// In-memory, per-process ticket store.
#[derive(Debug)]
pub struct TicketCache {
    tickets: DashMap<String, SessionTicket>,
    config: ZeroRttConfig,
}

impl TicketCache {
    #[must_use]
    pub fn new(config: ZeroRttConfig) -> Self {
        TicketCache {
            tickets: DashMap::new(),
            config,
        }
    }

    /// Stores a ticket, replacing any previous one for the name.
    pub fn store(&self, ticket: SessionTicket) {
        if !self.config.enabled {
            return;
        }
        self.tickets.insert(ticket.server_name.clone(), ticket);
    }

    /// Takes the ticket for `server_name` if it is still valid.
    /// Tickets are single-use; expired ones are dropped on the way.
    pub fn take(&self, server_name: &str, now: Instant) -> Option<SessionTicket> {
        if !self.config.enabled {
            return None;
        }
        let (_, ticket) = self.tickets.remove(server_name)?;
        if ticket.is_valid(&self.config, now) {
            Some(ticket)
        } else {
            tracing::debug!(target: "trireme::session", server_name, "expired ticket dropped");
            None
        }
    }

    /// Decides whether a request may ride in early data on a session
    /// resumed from `ticket`. `encoded_size` must be the actual size
    /// of the encoded request (header block plus frame overhead), not
    /// an estimate.
    #[must_use]
    pub fn early_data_verdict(
        &self,
        ticket: &SessionTicket,
        method: &Method,
        encoded_size: u64,
        now: Instant,
    ) -> EarlyDataVerdict {
        if !self.config.enabled
            || ticket.max_early_data == 0
            || !ticket.is_valid(&self.config, now)
        {
            return EarlyDataVerdict::NoTicket;
        }
        if !method.is_safe() && !self.config.allow_unsafe_methods {
            return EarlyDataVerdict::UnsafeMethod;
        }
        if encoded_size > ticket.max_early_data {
            return EarlyDataVerdict::TooLarge;
        }
        EarlyDataVerdict::Allowed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ticket(now: Instant) -> SessionTicket {
        SessionTicket {
            ticket: Bytes::from_static(b"opaque"),
            issued_at: now,
            server_name: "example.com".into(),
            max_early_data: 16 * 1024,
        }
    }

    #[test]
    fn tickets_are_single_use() {
        let now = Instant::now();
        let cache = TicketCache::new(ZeroRttConfig::default());
        cache.store(ticket(now));
        assert!(cache.take("example.com", now).is_some());
        assert!(cache.take("example.com", now).is_none());
    }

    #[test]
    fn expired_tickets_are_refused() {
        let now = Instant::now();
        let mut config = ZeroRttConfig::default();
        config.ticket_lifetime = Duration::from_secs(60);
        let cache = TicketCache::new(config);
        cache.store(ticket(now));
        assert!(cache.take("example.com", now + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn post_stays_out_of_early_data_by_default() {
        let now = Instant::now();
        let cache = TicketCache::new(ZeroRttConfig::default());
        let ticket = ticket(now);
        assert_eq!(
            cache.early_data_verdict(&ticket, &Method::Post, 512, now),
            EarlyDataVerdict::UnsafeMethod
        );
        assert_eq!(
            cache.early_data_verdict(&ticket, &Method::Get, 512, now),
            EarlyDataVerdict::Allowed
        );
    }

    #[test]
    fn unsafe_override_is_honored() {
        let now = Instant::now();
        let mut config = ZeroRttConfig::default();
        config.allow_unsafe_methods = true;
        let cache = TicketCache::new(config);
        let ticket = ticket(now);
        assert_eq!(
            cache.early_data_verdict(&ticket, &Method::Post, 512, now),
            EarlyDataVerdict::Allowed
        );
    }

    #[test]
    fn oversized_requests_are_refused() {
        let now = Instant::now();
        let cache = TicketCache::new(ZeroRttConfig::default());
        let ticket = ticket(now);
        assert_eq!(
            cache.early_data_verdict(&ticket, &Method::Get, 64 * 1024, now),
            EarlyDataVerdict::TooLarge
        );
    }
}
