//! QPACK encoder: field-section encoding plus the encoder-stream
//! instructions that keep the peer's table in sync.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, Bytes};

use crate::error::Error;
use crate::protocols::wire::{huffman, prefix_int};

use super::table::{self, DynamicTable, Entry};

/// Dynamic-table references owed by one encoded section.
#[derive(Debug, Clone, Copy)]
struct SectionRefs {
    required_insert_count: u64,
    min_ref: u64,
}

/// One field line awaiting the final base before rendering.
///
/// Dynamic references are kept as absolute indices because relative
/// indices depend on the base, which is only known once the whole
/// section (and its insertions) is done.
enum Line {
    IndexedStatic(usize),
    IndexedDynamic(u64),
    LiteralStaticName { index: usize, never: bool, value: Vec<u8> },
    LiteralDynamicName { abs: u64, never: bool, value: Vec<u8> },
    LiteralLiteral { name: Vec<u8>, never: bool, value: Vec<u8> },
}

/// Per-connection QPACK encoder.
///
/// `max_table_capacity` is the peer's `SETTINGS_QPACK_MAX_TABLE_CAPACITY`
/// bound; `peer_blocked_streams` its `SETTINGS_QPACK_BLOCKED_STREAMS`.
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    peer_blocked_streams: u64,
    known_received_count: u64,
    pending_capacity: Option<usize>,
    unacked: HashMap<u64, VecDeque<SectionRefs>>,
}

impl Encoder {
    #[must_use]
    pub fn new(max_table_capacity: usize, peer_blocked_streams: u64) -> Self {
        Encoder {
            table: DynamicTable::new(max_table_capacity),
            peer_blocked_streams,
            known_received_count: 0,
            pending_capacity: None,
            unacked: HashMap::new(),
        }
    }

    /// Adopts the capacity the peer's SETTINGS permit. The Set Dynamic
    /// Table Capacity instruction goes out with the next section.
    pub fn set_peer_capacity(&mut self, capacity: usize) {
        let capacity = capacity.min(self.table.max_capacity());
        self.pending_capacity = Some(capacity);
    }

    /// Encodes one field section for `stream_id`.
    ///
    /// Field lines are written to `block`; any table instructions the
    /// section needs are appended to `instructions` and must be sent on
    /// the encoder stream before or alongside the block.
    pub fn encode_section<'f, I>(
        &mut self,
        stream_id: u64,
        fields: I,
        block: &mut Vec<u8>,
        instructions: &mut Vec<u8>,
    ) -> Result<(), Error>
    where
        I: IntoIterator<Item = (&'f [u8], &'f [u8], bool)>,
    {
        if let Some(capacity) = self.pending_capacity.take() {
            prefix_int::encode(instructions, 5, 0b001, capacity as u64);
            self.table.set_capacity(capacity, self.eviction_floor())?;
        }

        let can_block = self.blocked_stream_count() < self.peer_blocked_streams
            || self.stream_is_blocked(stream_id);

        let mut lines = Vec::new();
        for (name, value, sensitive) in fields {
            let line = self.plan_field(name, value, sensitive, can_block, instructions);
            lines.push(line);
        }

        // Base is the insert count after this section's insertions, so
        // every dynamic reference is pre-base.
        let base = self.table.insert_count();
        let mut max_ref: Option<u64> = None;
        let mut min_ref: Option<u64> = None;
        for line in &lines {
            if let Line::IndexedDynamic(abs) | Line::LiteralDynamicName { abs, .. } = line {
                max_ref = Some(max_ref.map_or(*abs, |m| m.max(*abs)));
                min_ref = Some(min_ref.map_or(*abs, |m| m.min(*abs)));
            }
        }
        let required = max_ref.map_or(0, |abs| abs + 1);

        encode_required_insert_count(block, required, self.table.max_entries());
        prefix_int::encode(block, 7, 0, base - required);
        for line in lines {
            render_line(block, base, line);
        }

        if let Some(min_ref) = min_ref {
            self.unacked
                .entry(stream_id)
                .or_default()
                .push_back(SectionRefs {
                    required_insert_count: required,
                    min_ref,
                });
        }
        Ok(())
    }

    /// Picks a representation for one field, inserting into the table
    /// (and emitting instructions) where profitable.
    fn plan_field(
        &mut self,
        name: &[u8],
        value: &[u8],
        sensitive: bool,
        can_block: bool,
        instructions: &mut Vec<u8>,
    ) -> Line {
        if sensitive {
            return match table::static_find_name(name) {
                Some(index) => Line::LiteralStaticName { index, never: true, value: value.to_vec() },
                None => Line::LiteralLiteral {
                    name: name.to_vec(),
                    never: true,
                    value: value.to_vec(),
                },
            };
        }

        if let Some(index) = table::static_find(name, value) {
            return Line::IndexedStatic(index);
        }

        if let Some(abs) = self.table.find(name, value) {
            if self.referencable(abs, can_block) {
                if !self.table.is_draining(abs) {
                    return Line::IndexedDynamic(abs);
                }
                // Entry nears eviction: duplicate it, reference the copy.
                if can_block {
                    if let Some(new_abs) = self.duplicate(abs, instructions) {
                        return Line::IndexedDynamic(new_abs);
                    }
                }
            }
        }

        if can_block {
            if let Some(abs) = self.try_insert(name, value, instructions) {
                return Line::IndexedDynamic(abs);
            }
        }

        if let Some(index) = table::static_find_name(name) {
            return Line::LiteralStaticName { index, never: false, value: value.to_vec() };
        }
        if let Some(abs) = self
            .table
            .find_name(name)
            .filter(|&abs| self.referencable(abs, can_block) && !self.table.is_draining(abs))
        {
            return Line::LiteralDynamicName { abs, never: false, value: value.to_vec() };
        }
        Line::LiteralLiteral { name: name.to_vec(), never: false, value: value.to_vec() }
    }

    /// Emits a Duplicate instruction for `abs`, returning the new
    /// entry's absolute index.
    fn duplicate(&mut self, abs: u64, instructions: &mut Vec<u8>) -> Option<u64> {
        let floor = self.eviction_floor();
        let insert_count = self.table.insert_count();
        let entry = self.table.get_abs(abs).ok()?;
        let (name, value) = (entry.name.clone(), entry.value.clone());
        match self.table.insert(name, value, floor) {
            Ok(new_abs) => {
                prefix_int::encode(instructions, 5, 0b000, insert_count - 1 - abs);
                Some(new_abs)
            }
            Err(_) => None,
        }
    }

    /// Inserts (name, value), preferring a name reference, unless the
    /// entry does not fit without evicting pinned entries.
    fn try_insert(&mut self, name: &[u8], value: &[u8], instructions: &mut Vec<u8>) -> Option<u64> {
        let floor = self.eviction_floor();
        let insert_count = self.table.insert_count();

        let mut attempt = Vec::new();
        if let Some(index) = table::static_find_name(name) {
            // Insert With Name Reference, static.
            prefix_int::encode(&mut attempt, 6, 0b11, index as u64);
            encode_string(&mut attempt, value);
        } else if let Some(abs) = self
            .table
            .find_name(name)
            .filter(|&a| !self.table.is_draining(a))
        {
            // Insert With Name Reference, dynamic (relative to the
            // insert count at instruction time).
            prefix_int::encode(&mut attempt, 6, 0b10, insert_count - 1 - abs);
            encode_string(&mut attempt, value);
        } else {
            // Insert With Literal Name: 01 H + 5-bit length prefix.
            let huffman_len = huffman::encoded_len(name);
            if huffman_len < name.len() {
                prefix_int::encode(&mut attempt, 5, 0b011, huffman_len as u64);
                huffman::encode(name, &mut attempt);
            } else {
                prefix_int::encode(&mut attempt, 5, 0b010, name.len() as u64);
                attempt.extend_from_slice(name);
            }
            encode_string(&mut attempt, value);
        }

        match self
            .table
            .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value), floor)
        {
            Ok(abs) => {
                instructions.extend_from_slice(&attempt);
                Some(abs)
            }
            Err(_) => None,
        }
    }

    /// A reference to `abs` is permitted if the peer already has the
    /// entry, or if blocking this stream is allowed.
    fn referencable(&self, abs: u64, can_block: bool) -> bool {
        abs < self.known_received_count || can_block
    }

    fn eviction_floor(&self) -> u64 {
        self.unacked
            .values()
            .flatten()
            .map(|s| s.min_ref)
            .min()
            .unwrap_or(u64::MAX)
    }

    fn blocked_stream_count(&self) -> u64 {
        self.unacked
            .iter()
            .filter(|(_, sections)| {
                sections
                    .iter()
                    .any(|s| s.required_insert_count > self.known_received_count)
            })
            .count() as u64
    }

    fn stream_is_blocked(&self, stream_id: u64) -> bool {
        self.unacked.get(&stream_id).is_some_and(|sections| {
            sections
                .iter()
                .any(|s| s.required_insert_count > self.known_received_count)
        })
    }

    /// Consumes decoder-stream bytes: acknowledgments, cancellations
    /// and insert-count increments.
    pub fn read_decoder_stream(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        while buf.has_remaining() {
            let first = buf.chunk()[0];
            if first & 0b1000_0000 != 0 {
                // Section Acknowledgment.
                let (_, stream_id) = prefix_int::decode(&mut buf, 7)?;
                let sections = self.unacked.get_mut(&stream_id).ok_or_else(|| {
                    Error::CompressionError(format!("qpack ack for unknown stream {stream_id}"))
                })?;
                let section = sections.pop_front().ok_or_else(|| {
                    Error::CompressionError(format!("qpack ack with no open section on {stream_id}"))
                })?;
                if sections.is_empty() {
                    self.unacked.remove(&stream_id);
                }
                self.known_received_count =
                    self.known_received_count.max(section.required_insert_count);
            } else if first & 0b0100_0000 != 0 {
                // Stream Cancellation releases all references.
                let (_, stream_id) = prefix_int::decode(&mut buf, 6)?;
                self.unacked.remove(&stream_id);
            } else {
                // Insert Count Increment.
                let (_, increment) = prefix_int::decode(&mut buf, 6)?;
                if increment == 0 {
                    return Err(Error::CompressionError("qpack zero insert count increment".into()));
                }
                let new = self.known_received_count + increment;
                if new > self.table.insert_count() {
                    return Err(Error::CompressionError(
                        "qpack insert count increment past insertions".into(),
                    ));
                }
                self.known_received_count = new;
            }
        }
        Ok(())
    }

    /// Snapshot of the dynamic table, oldest first.
    #[must_use]
    pub fn table_state(&self) -> Vec<Entry> {
        self.table.entries()
    }

    #[must_use]
    pub fn known_received_count(&self) -> u64 {
        self.known_received_count
    }
}

fn render_line(block: &mut Vec<u8>, base: u64, line: Line) {
    match line {
        Line::IndexedStatic(index) => {
            prefix_int::encode(block, 6, 0b11, index as u64);
        }
        Line::IndexedDynamic(abs) => {
            prefix_int::encode(block, 6, 0b10, base - 1 - abs);
        }
        Line::LiteralStaticName { index, never, value } => {
            let flags = if never { 0b0111 } else { 0b0101 };
            prefix_int::encode(block, 4, flags, index as u64);
            encode_string(block, &value);
        }
        Line::LiteralDynamicName { abs, never, value } => {
            let flags = if never { 0b0110 } else { 0b0100 };
            prefix_int::encode(block, 4, flags, base - 1 - abs);
            encode_string(block, &value);
        }
        Line::LiteralLiteral { name, never, value } => {
            // 001 N H + 3-bit length prefix.
            let pattern: u8 = if never { 0b0011 } else { 0b0010 };
            let huffman_len = huffman::encoded_len(&name);
            if huffman_len < name.len() {
                prefix_int::encode(block, 3, (pattern << 1) | 1, huffman_len as u64);
                huffman::encode(&name, block);
            } else {
                prefix_int::encode(block, 3, pattern << 1, name.len() as u64);
                block.extend_from_slice(&name);
            }
            encode_string(block, &value);
        }
    }
}

/// Required-insert-count wire form (RFC 9204 §4.5.1.1).
fn encode_required_insert_count(out: &mut Vec<u8>, required: u64, max_entries: u64) {
    if required == 0 {
        prefix_int::encode(out, 8, 0, 0);
    } else {
        let encoded = required % (2 * max_entries) + 1;
        prefix_int::encode(out, 8, 0, encoded);
    }
}

/// Value string: H flag plus 7-bit length prefix.
fn encode_string(out: &mut Vec<u8>, data: &[u8]) {
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
    fn static_only_section_has_zero_required_count() {
        let mut encoder = Encoder::new(4096, 16);
        let mut block = Vec::new();
        let mut instructions = Vec::new();
        encoder
            .encode_section(
                0,
                [(&b":method"[..], &b"GET"[..], false)],
                &mut block,
                &mut instructions,
            )
            .unwrap();
        assert!(instructions.is_empty());
        // Prefix: required insert count 0, base delta 0.
        assert_eq!(&block[..2], &[0x00, 0x00]);
        // :method GET is static index 17: 0b11 pattern + 17.
        assert_eq!(block[2], 0b1100_0000 | 17);
    }

    #[test]
    fn capacity_instruction_precedes_first_insert() {
        let mut encoder = Encoder::new(4096, 16);
        encoder.set_peer_capacity(4096);
        let mut block = Vec::new();
        let mut instructions = Vec::new();
        encoder
            .encode_section(
                0,
                [(&b"x-state"[..], &b"on"[..], false)],
                &mut block,
                &mut instructions,
            )
            .unwrap();
        // Set Dynamic Table Capacity: 001 pattern, 5-bit prefix, 4096.
        assert_eq!(instructions[0] & 0b1110_0000, 0b0010_0000);
        assert!(!block.is_empty());
        assert_eq!(encoder.table_state().len(), 1);
    }

    #[test]
    fn blocked_stream_budget_zero_forces_literals() {
        let mut encoder = Encoder::new(4096, 0);
        encoder.set_peer_capacity(4096);
        let mut block = Vec::new();
        let mut instructions = Vec::new();
        encoder
            .encode_section(
                0,
                [(&b"x-state"[..], &b"on"[..], false)],
                &mut block,
                &mut instructions,
            )
            .unwrap();
        // No insertion happens: referencing it would block the stream.
        assert_eq!(encoder.table_state().len(), 0);
        assert_eq!(&block[..2], &[0x00, 0x00]);
    }

    #[test]
    fn references_are_relative_to_the_final_base() {
        let mut encoder = Encoder::new(4096, 16);
        encoder.set_peer_capacity(4096);
        let mut block = Vec::new();
        let mut instructions = Vec::new();
        // Two insertions in one section: the first reference must
        // account for the second insertion moving the base.
        encoder
            .encode_section(
                0,
                [
                    (&b"x-first"[..], &b"1"[..], false),
                    (&b"x-second"[..], &b"2"[..], false),
                ],
                &mut block,
                &mut instructions,
            )
            .unwrap();
        // Required insert count 2 encodes as 2 % (2*128) + 1 = 3.
        assert_eq!(block[0], 3);
        assert_eq!(block[1], 0); // base == required, delta 0
        // Field lines: rel 1 (abs 0 against base 2), then rel 0.
        assert_eq!(block[2], 0b1000_0000 | 1);
        assert_eq!(block[3], 0b1000_0000 | 0);
    }
}
