//! Per-origin connection pool.
//!
//! Keys are (scheme, host, port, alpn). HTTP/1.1 connections are
//! exclusive: checked out, used, returned. HTTP/2 and HTTP/3
//! connection handles are shared: the pool keeps one or two per key
//! and hands out clones while stream budget remains. A global atomic
//! cap bounds the total; idle reaping and LRU eviction keep the H1
//! side tidy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::Error;
use crate::http::Scheme;
use crate::selector::Alpn;

/// Pool key: one origin over one negotiated protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub alpn: Alpn,
}

impl OriginKey {
    #[must_use]
    pub fn new(scheme: Scheme, host: &str, port: u16, alpn: Alpn) -> Self {
        OriginKey {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            alpn,
        }
    }
}

/// What the pool needs to know about a connection handle.
///
/// H1 handles are exclusive and return `None` from
/// [`Poolable::try_share`]; H2/H3 handles are cheap clones over a
/// shared connection and return `Some`.
pub trait Poolable: Sized {
    /// False once the connection saw an error or is draining.
    fn is_reusable(&self) -> bool;

    /// Clone-out for multiplexed connections, `None` for exclusive
    /// ones.
    fn try_share(&self) -> Option<Self>;

    /// True while a shared connection can take another stream.
    fn has_stream_budget(&self) -> bool {
        true
    }

    /// Liveness probe run at checkout (H1: zero-byte read / staleness
    /// check). Returning false discards the entry.
    fn probe_alive(&mut self) -> bool {
        self.is_reusable()
    }
}

/// Shared connections kept per key; more than this is waste because a
/// multiplexed connection already carries concurrent streams.
const SHARED_PER_KEY: usize = 2;

#[derive(Debug)]
struct Entry<C> {
    conn: C,
    last_used: Instant,
}

/// The pool.
#[derive(Debug)]
pub struct Pool<C> {
    entries: DashMap<OriginKey, Vec<Entry<C>>>,
    total: AtomicUsize,
    max_per_host: usize,
    max_total: usize,
    idle_timeout: Duration,
}

impl<C: Poolable> Pool<C> {
    #[must_use]
    pub fn new(max_per_host: usize, max_total: usize, idle_timeout: Duration) -> Self {
        Pool {
            entries: DashMap::new(),
            total: AtomicUsize::new(0),
            max_per_host,
            max_total,
            idle_timeout,
        }
    }

    /// Total live connections across all keys.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Attempts to satisfy a request from the pool.
    ///
    /// `Ok(Some(conn))` hands out a connection (exclusive or shared);
    /// `Ok(None)` means the caller should dial a new one;
    /// `Err(PoolExhausted)` means the global cap forbids that too.
    pub fn acquire(&self, key: &OriginKey, now: Instant) -> Result<Option<C>, Error> {
        self.reap_idle(now);

        if let Some(mut entries) = self.entries.get_mut(key) {
            // Shared connections first: newest entry with budget.
            for entry in entries.iter_mut() {
                if entry.conn.is_reusable() && entry.conn.has_stream_budget() {
                    if let Some(shared) = entry.conn.try_share() {
                        entry.last_used = now;
                        return Ok(Some(shared));
                    }
                }
            }
            // Exclusive (H1): most recently used first, probing each.
            // The connection stays counted: it lives on with the
            // caller until released or discarded.
            while let Some(mut entry) = entries.pop() {
                if entry.conn.probe_alive() {
                    return Ok(Some(entry.conn));
                }
                self.total.fetch_sub(1, Ordering::Relaxed);
                tracing::debug!(target: "trireme::pool", "stale idle connection discarded");
            }
        }

        if self.total.load(Ordering::Relaxed) >= self.max_total {
            return Err(Error::PoolExhausted);
        }
        Ok(None)
    }

    /// Registers a freshly dialed connection against the global cap.
    /// Shared connections stay resident in the pool; the returned
    /// clone (if any) is what the caller uses.
    pub fn register(&self, key: OriginKey, conn: C, now: Instant) -> Result<Option<C>, Error> {
        if self.total.fetch_add(1, Ordering::Relaxed) >= self.max_total {
            self.total.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::PoolExhausted);
        }
        let shared = conn.try_share();
        if shared.is_some() {
            let mut entries = self.entries.entry(key).or_default();
            if entries.len() >= SHARED_PER_KEY {
                // Enough parallel pipes already; drop the oldest.
                entries.remove(0);
                self.total.fetch_sub(1, Ordering::Relaxed);
            }
            entries.push(Entry { conn, last_used: now });
        } else {
            // Exclusive connections live with the caller until
            // released; only the count is tracked here.
        }
        Ok(shared)
    }

    /// Returns an exclusive connection after its exchange finished.
    /// Dead or close-marked connections are dropped (and leave the
    /// count); live ones go back idle, still counted from when they
    /// were dialed.
    pub fn release(&self, key: OriginKey, conn: C, now: Instant) {
        if !conn.is_reusable() {
            self.total.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        let mut entries = self.entries.entry(key).or_default();
        if entries.len() >= self.max_per_host {
            // LRU out the oldest idle entry.
            entries.remove(0);
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        entries.push(Entry { conn, last_used: now });
    }

    /// Accounts the end of an exclusive connection's life outside the
    /// pool (not reusable, or the caller dropped it).
    pub fn discard(&self) {
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    /// Removes a shared connection that turned bad.
    pub fn evict(&self, key: &OriginKey) {
        if let Some(mut entries) = self.entries.get_mut(key) {
            let before = entries.len();
            entries.retain(|e| e.conn.is_reusable());
            let dropped = before - entries.len();
            if dropped > 0 {
                self.total.fetch_sub(dropped, Ordering::Relaxed);
                tracing::debug!(target: "trireme::pool", dropped, "evicted broken connections");
            }
        }
    }

    /// Drops idle entries past the idle timeout. Runs on every
    /// acquire; callers with timers may also invoke it directly.
    pub fn reap_idle(&self, now: Instant) {
        for mut shard in self.entries.iter_mut() {
            let before = shard.len();
            shard.retain(|entry| {
                entry.conn.is_reusable()
                    && now.duration_since(entry.last_used) < self.idle_timeout
            });
            let dropped = before - shard.len();
            if dropped > 0 {
                self.total.fetch_sub(dropped, Ordering::Relaxed);
            }
        }
        self.entries.retain(|_, entries| !entries.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;

    /// Exclusive test connection (H1-shaped).
    #[derive(Debug)]
    struct Excl {
        alive: bool,
    }

    impl Poolable for Excl {
        fn is_reusable(&self) -> bool {
            self.alive
        }
        fn try_share(&self) -> Option<Self> {
            None
        }
    }

    /// Shared test connection (H2/H3-shaped).
    #[derive(Debug, Clone)]
    struct Shared {
        alive: Arc<AtomicBool>,
    }

    impl Poolable for Shared {
        fn is_reusable(&self) -> bool {
            self.alive.load(Ordering::Relaxed)
        }
        fn try_share(&self) -> Option<Self> {
            Some(self.clone())
        }
    }

    fn key() -> OriginKey {
        OriginKey::new(Scheme::Https, "Example.COM", 443, Alpn::Http11)
    }

    #[test]
    fn keys_normalize_host_case() {
        assert_eq!(key(), OriginKey::new(Scheme::Https, "example.com", 443, Alpn::Http11));
    }

    #[test]
    fn exclusive_checkout_and_release_cycle() {
        let pool: Pool<Excl> = Pool::new(2, 8, Duration::from_secs(90));
        let now = Instant::now();

        assert!(pool.acquire(&key(), now).unwrap().is_none());
        pool.register(key(), Excl { alive: true }, now).unwrap();
        assert_eq!(pool.total_connections(), 1);

        // The exchange finished; the connection goes back idle.
        pool.release(key(), Excl { alive: true }, now);
        assert_eq!(pool.total_connections(), 1);

        let conn = pool.acquire(&key(), now).unwrap().expect("idle conn");
        assert!(conn.alive);
        assert_eq!(pool.total_connections(), 1);
    }

    #[test]
    fn dead_connections_leave_the_pool_and_the_count() {
        let pool: Pool<Excl> = Pool::new(2, 8, Duration::from_secs(90));
        let now = Instant::now();
        pool.register(key(), Excl { alive: true }, now).unwrap();
        pool.release(key(), Excl { alive: true }, now);
        let _conn = pool.acquire(&key(), now).unwrap().unwrap();

        // The exchange broke the connection; releasing it drops it.
        pool.release(key(), Excl { alive: false }, now);
        assert_eq!(pool.total_connections(), 0);
        assert!(pool.acquire(&key(), now).unwrap().is_none());
    }

    #[test]
    fn idle_reaping_honors_the_timeout() {
        let pool: Pool<Excl> = Pool::new(2, 8, Duration::from_secs(10));
        let now = Instant::now();
        pool.register(key(), Excl { alive: true }, now).unwrap();
        pool.release(key(), Excl { alive: true }, now);
        assert_eq!(pool.total_connections(), 1);

        let later = now + Duration::from_secs(11);
        pool.reap_idle(later);
        assert_eq!(pool.total_connections(), 0);
    }

    #[test]
    fn shared_connections_stay_resident() {
        let pool: Pool<Shared> = Pool::new(2, 8, Duration::from_secs(90));
        let now = Instant::now();
        let alive = Arc::new(AtomicBool::new(true));
        let conn = Shared { alive: alive.clone() };

        let handle = pool.register(key(), conn, now).unwrap();
        assert!(handle.is_some());
        // Subsequent acquires share rather than dial.
        assert!(pool.acquire(&key(), now).unwrap().is_some());
        assert!(pool.acquire(&key(), now).unwrap().is_some());
        assert_eq!(pool.total_connections(), 1);

        // A broken connection stops being handed out.
        alive.store(false, Ordering::Relaxed);
        pool.evict(&key());
        assert!(pool.acquire(&key(), now).unwrap().is_none());
        assert_eq!(pool.total_connections(), 0);
    }

    #[test]
    fn global_cap_is_enforced() {
        let pool: Pool<Excl> = Pool::new(8, 2, Duration::from_secs(90));
        let now = Instant::now();
        pool.register(key(), Excl { alive: true }, now).unwrap();
        pool.register(key(), Excl { alive: true }, now).unwrap();
        assert!(matches!(
            pool.register(key(), Excl { alive: true }, now),
            Err(Error::PoolExhausted)
        ));
        assert!(matches!(pool.acquire(&key(), now), Err(Error::PoolExhausted)));
    }
}
