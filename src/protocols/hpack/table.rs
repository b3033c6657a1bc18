//! HPACK static and dynamic index tables.
//!
//! Address space: indices 1..=61 are the static table (RFC 7541
//! Appendix A), 62 and up address the dynamic table newest-first.

use std::collections::VecDeque;

use bytes::Bytes;
use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::error::Error;

use super::ENTRY_OVERHEAD;

/// The 61 static entries. Index 1 is element 0.
pub const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Name -> first static index carrying that name (1-based).
static STATIC_NAME_INDEX: Lazy<HashMap<&'static [u8], usize>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (i, (name, _)) in STATIC_TABLE.iter().enumerate() {
        map.entry(name.as_bytes()).or_insert(i + 1);
    }
    map
});

/// Result of a table lookup during encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Exact (name, value) match at this index.
    Full(usize),
    /// Name-only match at this index.
    Name(usize),
    Miss,
}

/// A single dynamic-table entry.
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

/// The FIFO dynamic table shared in shape by both directions.
///
/// `capacity` is what the encoder last signaled (or the decoder last
/// accepted); `max_capacity` is the protocol bound negotiated via
/// `SETTINGS_HEADER_TABLE_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicTable {
    entries: VecDeque<Entry>,
    size: usize,
    capacity: usize,
    max_capacity: usize,
}

impl DynamicTable {
    #[must_use]
    pub fn new(max_capacity: usize) -> Self {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            capacity: max_capacity,
            max_capacity,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
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

    /// Raises the protocol bound (new SETTINGS value).
    pub fn set_max_capacity(&mut self, max: usize) {
        self.max_capacity = max;
        if self.capacity > max {
            self.resize(max);
        }
    }

    /// Applies a table size update, evicting until the new budget fits.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict_to(capacity);
    }

    /// Appends an entry at the head, evicting from the tail first.
    ///
    /// An entry larger than the whole budget empties the table and is
    /// itself not stored; that is defined behavior, not an error.
    pub fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry = Entry { name, value };
        let entry_size = entry.size();
        if entry_size > self.capacity {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.capacity - entry_size);
        self.size += entry_size;
        self.entries.push_front(entry);
    }

    /// Entry at 1-based dynamic index (1 = newest).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Entry> {
        index.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Searches newest-first for a value or name match.
    #[must_use]
    pub fn lookup(&self, name: &[u8], value: &[u8]) -> Lookup {
        let mut name_match = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return Lookup::Full(i + 1);
                }
                name_match.get_or_insert(i + 1);
            }
        }
        match name_match {
            Some(i) => Lookup::Name(i),
            None => Lookup::Miss,
        }
    }

    fn evict_to(&mut self, budget: usize) {
        while self.size > budget {
            let evicted = self
                .entries
                .pop_back()
                .unwrap_or_else(|| unreachable!("size > 0 implies entries"));
            self.size -= evicted.size();
        }
    }
}

/// Resolves an index across the combined static + dynamic space.
pub fn resolve<'t>(table: &'t DynamicTable, index: usize) -> Result<(&'t [u8], &'t [u8]), Error> {
    if index == 0 {
        return Err(Error::CompressionError("hpack index 0".into()));
    }
    if index <= STATIC_TABLE.len() {
        let (name, value) = STATIC_TABLE[index - 1];
        return Ok((name.as_bytes(), value.as_bytes()));
    }
    match table.get(index - STATIC_TABLE.len()) {
        Some(entry) => Ok((&entry.name, &entry.value)),
        None => Err(Error::CompressionError(format!("hpack index {index} out of range"))),
    }
}

/// Combined-space lookup used by the encoder: static first for values
/// and names, then the dynamic table shifted past the static range.
#[must_use]
pub fn find(table: &DynamicTable, name: &[u8], value: &[u8]) -> Lookup {
    let mut name_match = None;
    if let Some(&first) = STATIC_NAME_INDEX.get(name) {
        // Entries sharing a name are contiguous in the static table.
        for (i, (entry_name, entry_value)) in STATIC_TABLE.iter().enumerate().skip(first - 1) {
            if entry_name.as_bytes() != name {
                break;
            }
            if entry_value.as_bytes() == value {
                return Lookup::Full(i + 1);
            }
        }
        name_match = Some(first);
    }
    match table.lookup(name, value) {
        Lookup::Full(i) => Lookup::Full(i + STATIC_TABLE.len()),
        Lookup::Name(i) => Lookup::Name(name_match.unwrap_or(i + STATIC_TABLE.len())),
        Lookup::Miss => match name_match {
            Some(i) => Lookup::Name(i),
            None => Lookup::Miss,
        },
    }
}
