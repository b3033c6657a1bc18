//! HPACK encoder.

use bytes::Bytes;

use crate::protocols::wire::{huffman, prefix_int};

use super::table::{self, DynamicTable, Entry, Lookup};

/// Representation flag bits (RFC 7541 §6).
const INDEXED: u8 = 0b1;
const LITERAL_INDEXED: u8 = 0b01;
const SIZE_UPDATE: u8 = 0b001;
const LITERAL_NEVER: u8 = 0b0001;
const LITERAL_UNINDEXED: u8 = 0b0000;

/// Per-direction HPACK encoder.
///
/// Owns the dynamic table for the direction it encodes; the peer's
/// decoder mirrors every insertion, so the two stay bit-identical as
/// long as blocks are delivered in order (H2 guarantees that).
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Capacity changes to announce at the start of the next block.
    /// Two entries at most: the minimum seen while shrinking, then the
    /// final value.
    pending_resizes: Vec<usize>,
}

impl Encoder {
    #[must_use]
    pub fn new(max_table_capacity: usize) -> Self {
        Encoder {
            table: DynamicTable::new(max_table_capacity),
            pending_resizes: Vec::new(),
        }
    }

    /// Applies a new `SETTINGS_HEADER_TABLE_SIZE` from the peer. The
    /// required size-update representation is emitted with the next
    /// block.
    pub fn set_max_table_capacity(&mut self, max: usize) {
        let current = self.table.capacity();
        if max < current {
            // Shrinking must be announced; record the low-water mark.
            match self.pending_resizes.first().copied() {
                Some(first) if first <= max => {}
                _ => self.pending_resizes.insert(0, max),
            }
            self.pending_resizes.truncate(1);
        }
        self.pending_resizes.push(max);
        self.table.set_max_capacity(max);
        // Track the announced capacity exactly so eviction points match
        // the peer decoder's.
        self.table.resize(max);
    }

    /// Encodes one header block.
    ///
    /// Fields arrive as `(name, value, sensitive)`; sensitive fields use
    /// the never-indexed representation and stay out of the table.
    pub fn encode_block<'f, I, N, V>(&mut self, fields: I, out: &mut Vec<u8>)
    where
        I: IntoIterator<Item = (&'f N, &'f V, bool)>,
        N: AsRef<[u8]> + 'f + ?Sized,
        V: AsRef<[u8]> + 'f + ?Sized,
    {
        for capacity in self.pending_resizes.drain(..) {
            prefix_int::encode(out, 5, SIZE_UPDATE, capacity as u64);
        }

        for (name, value, sensitive) in fields {
            self.encode_field(name.as_ref(), value.as_ref(), sensitive, out);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], sensitive: bool, out: &mut Vec<u8>) {
        if sensitive || never_index(name, value) {
            match table::find(&self.table, name, value) {
                Lookup::Full(index) | Lookup::Name(index) => {
                    prefix_int::encode(out, 4, LITERAL_NEVER, index as u64);
                }
                Lookup::Miss => {
                    prefix_int::encode(out, 4, LITERAL_NEVER, 0);
                    encode_string(name, out);
                }
            }
            encode_string(value, out);
            return;
        }

        match table::find(&self.table, name, value) {
            Lookup::Full(index) => {
                prefix_int::encode(out, 7, INDEXED, index as u64);
            }
            Lookup::Name(index) => {
                prefix_int::encode(out, 6, LITERAL_INDEXED, index as u64);
                encode_string(value, out);
                self.table
                    .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
            }
            Lookup::Miss => {
                prefix_int::encode(out, 6, LITERAL_INDEXED, 0);
                encode_string(name, out);
                encode_string(value, out);
                self.table
                    .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
            }
        }
    }

    /// Current dynamic table occupancy in bytes.
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.table.size()
    }

    /// Snapshot of the dynamic table, newest first, for state
    /// comparison in tests and diagnostics.
    #[must_use]
    pub fn table_state(&self) -> Vec<Entry> {
        (1..=self.table.len())
            .filter_map(|i| self.table.get(i).cloned())
            .collect()
    }
}

/// Fields that must never enter a compression table regardless of what
/// the caller says: credentials and short cookies, which make cheap
/// guessing oracles.
fn never_index(name: &[u8], value: &[u8]) -> bool {
    match name {
        b"authorization" | b"proxy-authorization" => true,
        b"cookie" | b"set-cookie" => value.len() < 20,
        _ => false,
    }
}

/// String literal with a 7-bit length prefix; Huffman when it helps.
fn encode_string(data: &[u8], out: &mut Vec<u8>) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        prefix_int::encode(out, 7, 1, huffman_len as u64);
        huffman::encode(data, out);
    } else {
        prefix_int::encode(out, 7, 0, data.len() as u64);
        out.extend_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_full_match_is_single_indexed_byte() {
        let mut encoder = Encoder::new(4096);
        let mut out = Vec::new();
        encoder.encode_block([(&b":method"[..], &b"GET"[..], false)], &mut out);
        assert_eq!(out, [0x82]);
        assert_eq!(encoder.table_size(), 0);
    }

    #[test]
    fn sensitive_fields_use_never_indexed_and_skip_table() {
        let mut encoder = Encoder::new(4096);
        let mut out = Vec::new();
        encoder.encode_block([(&b"authorization"[..], &b"Bearer tok"[..], false)], &mut out);
        // Name index 23 (authorization) with the 0001 pattern.
        assert_eq!(out[0], 0b0001_0000 | 15);
        assert_eq!(out[1] & 0b1111, 23 - 15);
        assert_eq!(encoder.table_size(), 0);
    }

    #[test]
    fn shrink_is_announced_before_next_block() {
        let mut encoder = Encoder::new(4096);
        encoder.set_max_table_capacity(0);
        let mut out = Vec::new();
        encoder.encode_block([(&b":method"[..], &b"GET"[..], false)], &mut out);
        assert_eq!(out[0], 0b0010_0000); // size update to 0
        assert_eq!(out[1], 0x82);
    }
}
