//! Pool, selector and 0-RTT policy behavior.

use std::time::{Duration, Instant};

use bytes::Bytes;
use trireme::config::{Config, ZeroRttConfig};
use trireme::http::{Method, Scheme};
use trireme::pool::{OriginKey, Pool, Poolable};
use trireme::selector::{Alpn, ClientEngine, EngineSelector, Origin};
use trireme::session::{EarlyDataVerdict, SessionTicket, TicketCache};

#[derive(Debug)]
struct FakeH1 {
    alive: bool,
}

impl Poolable for FakeH1 {
    fn is_reusable(&self) -> bool {
        self.alive
    }
    fn try_share(&self) -> Option<Self> {
        None
    }
}

#[test]
fn pool_key_separates_protocols_of_one_origin() {
    let h2_key = OriginKey::new(Scheme::Https, "example.com", 443, Alpn::H2);
    let h1_key = OriginKey::new(Scheme::Https, "example.com", 443, Alpn::Http11);
    assert_ne!(h2_key, h1_key);

    let pool: Pool<FakeH1> = Pool::new(4, 16, Duration::from_secs(90));
    let now = Instant::now();
    pool.register(h1_key.clone(), FakeH1 { alive: true }, now).unwrap();
    pool.release(h1_key.clone(), FakeH1 { alive: true }, now);

    // The other protocol's key sees nothing.
    assert!(pool.acquire(&h2_key, now).unwrap().is_none());
    assert!(pool.acquire(&h1_key, now).unwrap().is_some());
}

#[test]
fn selector_falls_back_after_quic_failure_and_recovers() {
    let selector = EngineSelector::new(Config::default()).unwrap();
    let origin = Origin {
        scheme: Scheme::Https,
        host: "origin.test".into(),
        port: 443,
    };
    let now = Instant::now();

    assert_eq!(selector.alpn_offer(&origin, now)[0], Alpn::H3);

    // UDP failed: the offer drops to TCP protocols deterministically.
    selector.record_h3_failure(&origin, now);
    let offer = selector.alpn_offer(&origin, now + Duration::from_secs(1));
    assert_eq!(offer, vec![Alpn::H2, Alpn::Http11]);

    // The negotiated TCP protocol builds the matching engine.
    assert!(matches!(selector.client_engine(Some(b"h2")).unwrap(), ClientEngine::H2(_)));

    // After the memo expires, H3 is offered again.
    let later = now + Duration::from_secs(6 * 60);
    assert_eq!(selector.alpn_offer(&origin, later)[0], Alpn::H3);
}

#[test]
fn zero_rtt_post_rides_after_handshake_not_early() {
    // Scenario: resumed ticket allows 16 KiB of early data, policy is
    // default. A POST must never ride in early data; a GET may.
    let now = Instant::now();
    let cache = TicketCache::new(ZeroRttConfig::default());
    cache.store(SessionTicket {
        ticket: Bytes::from_static(b"resume-me"),
        issued_at: now,
        server_name: "api.test".into(),
        max_early_data: 16 * 1024,
    });

    let ticket = cache.take("api.test", now).unwrap();
    assert_eq!(
        cache.early_data_verdict(&ticket, &Method::Post, 300, now),
        EarlyDataVerdict::UnsafeMethod
    );
    assert_eq!(
        cache.early_data_verdict(&ticket, &Method::Get, 300, now),
        EarlyDataVerdict::Allowed
    );
}

#[test]
fn zero_rtt_respects_actual_encoded_size() {
    let now = Instant::now();
    let cache = TicketCache::new(ZeroRttConfig::default());
    let ticket = SessionTicket {
        ticket: Bytes::from_static(b"small-budget"),
        issued_at: now,
        server_name: "api.test".into(),
        max_early_data: 128,
    };
    assert_eq!(
        cache.early_data_verdict(&ticket, &Method::Get, 127, now),
        EarlyDataVerdict::Allowed
    );
    assert_eq!(
        cache.early_data_verdict(&ticket, &Method::Get, 129, now),
        EarlyDataVerdict::TooLarge
    );
}
