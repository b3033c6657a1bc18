//! QPACK static and dynamic index tables.
//!
//! QPACK indexes the static table from zero and addresses dynamic
//! entries by absolute insert index (the count of insertions when the
//! entry was added), so references stay stable as old entries are
//! evicted.

use std::collections::VecDeque;

use bytes::Bytes;
use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::error::Error;

use super::ENTRY_OVERHEAD;

/// The 99 static entries of RFC 9204 Appendix A, index 0 first.
pub const STATIC_TABLE: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    ("strict-transport-security", "max-age=31536000; includesubdomains; preload"),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    ("content-security-policy", "script-src 'none'; object-src 'none'; base-uri 'none'"),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

static STATIC_NAME_INDEX: Lazy<HashMap<&'static [u8], usize>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (i, (name, _)) in STATIC_TABLE.iter().enumerate() {
        map.entry(name.as_bytes()).or_insert(i);
    }
    map
});

/// Looks up index `i` in the static table (0-based).
pub fn static_entry(index: usize) -> Result<(&'static [u8], &'static [u8]), Error> {
    STATIC_TABLE
        .get(index)
        .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
        .ok_or_else(|| Error::CompressionError(format!("qpack static index {index} out of range")))
}

/// Exact-match search of the static table.
#[must_use]
pub fn static_find(name: &[u8], value: &[u8]) -> Option<usize> {
    let first = *STATIC_NAME_INDEX.get(name)?;
    STATIC_TABLE
        .iter()
        .enumerate()
        .skip(first)
        .take_while(|(_, (n, _))| n.as_bytes() == name)
        .find(|(_, (_, v))| v.as_bytes() == value)
        .map(|(i, _)| i)
}

/// Name-only search of the static table.
#[must_use]
pub fn static_find_name(name: &[u8]) -> Option<usize> {
    STATIC_NAME_INDEX.get(name).copied()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: Bytes,
    pub value: Bytes,
}

impl Entry {
    #[must_use]
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// The absolute-indexed dynamic table.
///
/// `dropped` counts evicted entries; the entry with absolute index `a`
/// lives at `entries[a - dropped]`. `insert_count` is always
/// `dropped + entries.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicTable {
    entries: VecDeque<Entry>,
    size: usize,
    capacity: usize,
    max_capacity: usize,
    dropped: u64,
}

impl DynamicTable {
    #[must_use]
    pub fn new(max_capacity: usize) -> Self {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            // QPACK dynamic tables start at capacity zero until a Set
            // Dynamic Table Capacity instruction arrives.
            capacity: 0,
            max_capacity,
            dropped: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn insert_count(&self) -> u64 {
        self.dropped + self.entries.len() as u64
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Maximum entry count the capacity admits; drives the modulo in
    /// required-insert-count coding.
    #[inline]
    #[must_use]
    pub fn max_entries(&self) -> u64 {
        (self.max_capacity / ENTRY_OVERHEAD) as u64
    }

    /// Applies Set Dynamic Table Capacity.
    ///
    /// `evictable` bounds how far eviction may proceed: entries at
    /// absolute index >= `evictable` are pinned by outstanding
    /// references and shrinking into them fails.
    pub fn set_capacity(&mut self, capacity: usize, evictable: u64) -> Result<(), Error> {
        if capacity > self.max_capacity {
            return Err(Error::CompressionError(format!(
                "table capacity {capacity} exceeds bound {}",
                self.max_capacity
            )));
        }
        self.capacity = capacity;
        self.evict_to(capacity, evictable)
    }

    /// Inserts at the head, evicting unreferenced tail entries to fit.
    pub fn insert(&mut self, name: Bytes, value: Bytes, evictable: u64) -> Result<u64, Error> {
        let entry = Entry { name, value };
        let entry_size = entry.size();
        if entry_size > self.capacity {
            return Err(Error::CompressionError(
                "qpack insertion larger than table capacity".into(),
            ));
        }
        self.evict_to(self.capacity - entry_size, evictable)?;
        self.size += entry_size;
        self.entries.push_back(entry);
        Ok(self.insert_count() - 1)
    }

    /// Entry by absolute index.
    pub fn get_abs(&self, abs: u64) -> Result<&Entry, Error> {
        if abs < self.dropped {
            return Err(Error::CompressionError(format!("qpack entry {abs} evicted")));
        }
        usize::try_from(abs - self.dropped)
            .ok()
            .and_then(|i| self.entries.get(i))
            .ok_or_else(|| Error::CompressionError(format!("qpack entry {abs} not inserted")))
    }

    /// Newest-first exact search returning the absolute index.
    #[must_use]
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<u64> {
        self.entries
            .iter()
            .rposition(|e| e.name == name && e.value == value)
            .map(|i| self.dropped + i as u64)
    }

    /// Newest-first name search returning the absolute index.
    #[must_use]
    pub fn find_name(&self, name: &[u8]) -> Option<u64> {
        self.entries
            .iter()
            .rposition(|e| e.name == name)
            .map(|i| self.dropped + i as u64)
    }

    /// True when fewer than a quarter of the capacity worth of
    /// insertions would evict this entry; encoders duplicate rather
    /// than reference such entries.
    #[must_use]
    pub fn is_draining(&self, abs: u64) -> bool {
        if abs < self.dropped {
            return true;
        }
        let entry_index = (abs - self.dropped) as usize;
        let headroom = self.capacity.saturating_sub(self.size);
        let through_entry: usize = self
            .entries
            .iter()
            .take(entry_index + 1)
            .map(Entry::size)
            .sum();
        headroom + through_entry <= self.capacity / 4
    }

    /// Snapshot of surviving entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.iter().cloned().collect()
    }

    fn evict_to(&mut self, budget: usize, evictable: u64) -> Result<(), Error> {
        while self.size > budget {
            if self.dropped >= evictable {
                return Err(Error::CompressionError(
                    "qpack eviction blocked by outstanding reference".into(),
                ));
            }
            let evicted = self
                .entries
                .pop_front()
                .ok_or_else(|| Error::CompressionError("qpack table accounting broken".into()))?;
            self.size -= evicted.size();
            self.dropped += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_shape() {
        assert_eq!(STATIC_TABLE.len(), 99);
        assert_eq!(static_entry(17).unwrap(), (&b":method"[..], &b"GET"[..]));
        assert_eq!(static_find(b":status", b"200"), Some(25));
        assert_eq!(static_find_name(b"content-type"), Some(44));
        assert!(static_entry(99).is_err());
    }

    #[test]
    fn absolute_indices_survive_eviction() {
        let mut table = DynamicTable::new(2 * ENTRY_OVERHEAD + 8);
        table.set_capacity(2 * ENTRY_OVERHEAD + 8, u64::MAX).unwrap();

        let a = table.insert(Bytes::from_static(b"aa"), Bytes::from_static(b"11"), u64::MAX).unwrap();
        let b = table.insert(Bytes::from_static(b"bb"), Bytes::from_static(b"22"), u64::MAX).unwrap();
        assert_eq!((a, b), (0, 1));

        let c = table.insert(Bytes::from_static(b"cc"), Bytes::from_static(b"33"), u64::MAX).unwrap();
        assert_eq!(c, 2);
        assert!(table.get_abs(0).is_err());
        assert_eq!(&table.get_abs(1).unwrap().name[..], b"bb");
        assert_eq!(table.insert_count(), 3);
    }

    #[test]
    fn pinned_entries_block_eviction() {
        let mut table = DynamicTable::new(ENTRY_OVERHEAD + 4);
        table.set_capacity(ENTRY_OVERHEAD + 4, u64::MAX).unwrap();
        table.insert(Bytes::from_static(b"aa"), Bytes::from_static(b"11"), u64::MAX).unwrap();
        // Entry 0 still referenced: nothing may be evicted.
        let err = table.insert(Bytes::from_static(b"bb"), Bytes::from_static(b"22"), 0);
        assert!(err.is_err());
    }
}
