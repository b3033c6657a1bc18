//! QPACK decoder: encoder-stream instruction processing, field-section
//! decoding with blocking, and decoder-stream feedback.

use std::collections::HashMap;

use bytes::{Buf, Bytes};

use crate::error::Error;
use crate::protocols::wire::{huffman, prefix_int};

use super::table::{self, DynamicTable, Entry};

/// Result of attempting to decode one field section.
#[derive(Debug)]
pub enum SectionOutcome {
    /// Fully decoded, fields in wire order.
    Decoded(Vec<(Bytes, Bytes)>),
    /// The section references insertions that have not arrived on the
    /// encoder stream yet; it is parked until they do.
    Blocked,
}

/// A parked section waiting for its required insert count.
#[derive(Debug)]
struct BlockedSection {
    required_insert_count: u64,
    block: Vec<u8>,
}

/// Per-connection QPACK decoder.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    max_field_section_size: usize,
    max_blocked_streams: u64,
    /// Sections parked per stream, in arrival order.
    blocked: HashMap<u64, Vec<BlockedSection>>,
    /// Sections that unblocked since the last poll.
    unblocked: Vec<(u64, Vec<(Bytes, Bytes)>)>,
    /// Outgoing decoder-stream instructions.
    feedback: Vec<u8>,
}

impl Decoder {
    #[must_use]
    pub fn new(
        max_table_capacity: usize,
        max_field_section_size: usize,
        max_blocked_streams: u64,
    ) -> Self {
        Decoder {
            table: DynamicTable::new(max_table_capacity),
            max_field_section_size,
            max_blocked_streams,
            blocked: HashMap::new(),
            unblocked: Vec::new(),
            feedback: Vec::new(),
        }
    }

    /// Processes encoder-stream bytes: capacity changes, insertions and
    /// duplications. Newly satisfiable blocked sections are decoded and
    /// queued for [`Decoder::take_unblocked`].
    pub fn read_encoder_stream(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        let before = self.table.insert_count();

        while buf.has_remaining() {
            let first = buf.chunk()[0];
            if first & 0b1000_0000 != 0 {
                // Insert With Name Reference: 1 T + 6-bit name index.
                let (flags, index) = prefix_int::decode(&mut buf, 6)?;
                let name = if flags & 0b01 != 0 {
                    let (name, _) = table::static_entry(usize::try_from(index).map_err(|_| {
                        Error::CompressionError("qpack static index overflow".into())
                    })?)?;
                    Bytes::copy_from_slice(name)
                } else {
                    let abs = self
                        .table
                        .insert_count()
                        .checked_sub(1 + index)
                        .ok_or_else(|| Error::CompressionError("qpack relative index underflow".into()))?;
                    Bytes::copy_from_slice(&self.table.get_abs(abs)?.name)
                };
                let value = read_string(&mut buf, 7)?;
                self.table.insert(name, value, u64::MAX)?;
            } else if first & 0b0100_0000 != 0 {
                // Insert With Literal Name: 01 H + 5-bit length.
                let name = read_string(&mut buf, 5)?;
                let value = read_string(&mut buf, 7)?;
                self.table.insert(name, value, u64::MAX)?;
            } else if first & 0b0010_0000 != 0 {
                // Set Dynamic Table Capacity.
                let (_, capacity) = prefix_int::decode(&mut buf, 5)?;
                let capacity = usize::try_from(capacity)
                    .map_err(|_| Error::CompressionError("qpack capacity overflow".into()))?;
                self.table.set_capacity(capacity, u64::MAX)?;
            } else {
                // Duplicate: 000 + 5-bit relative index.
                let (_, rel) = prefix_int::decode(&mut buf, 5)?;
                let abs = self
                    .table
                    .insert_count()
                    .checked_sub(1 + rel)
                    .ok_or_else(|| Error::CompressionError("qpack duplicate index underflow".into()))?;
                let entry = self.table.get_abs(abs)?;
                let (name, value) = (entry.name.clone(), entry.value.clone());
                self.table.insert(name, value, u64::MAX)?;
            }
        }

        let inserted = self.table.insert_count() - before;
        if inserted > 0 {
            // Acknowledge progress even when no section references it;
            // the encoder's known-received count must keep up.
            prefix_int::encode(&mut self.feedback, 6, 0b00, inserted);
            self.retry_blocked()?;
        }
        Ok(())
    }

    /// Attempts to decode a section arriving on `stream_id`.
    ///
    /// Blocks (parking the bytes) when the section's required insert
    /// count outruns the table; errors if parking would exceed the
    /// advertised blocked-streams budget.
    pub fn decode_section(&mut self, stream_id: u64, block: &[u8]) -> Result<SectionOutcome, Error> {
        let mut buf = block;
        let (required, base) = self.read_prefix(&mut buf)?;

        // A section queues behind any earlier blocked section of the
        // same stream: per-stream sections decode strictly in order.
        let was_blocked = self.blocked.contains_key(&stream_id);
        if was_blocked || required > self.table.insert_count() {
            if !was_blocked && self.blocked.len() as u64 >= self.max_blocked_streams {
                return Err(Error::CompressionError(format!(
                    "qpack blocked streams exceed limit {}",
                    self.max_blocked_streams
                )));
            }
            self.blocked
                .entry(stream_id)
                .or_default()
                .push(BlockedSection {
                    required_insert_count: required,
                    block: block.to_vec(),
                });
            return Ok(SectionOutcome::Blocked);
        }

        let fields = self.decode_lines(buf, base)?;
        self.acknowledge(stream_id, required);
        Ok(SectionOutcome::Decoded(fields))
    }

    /// Sections decoded out of [`Decoder::read_encoder_stream`] after
    /// having been blocked.
    pub fn take_unblocked(&mut self) -> Vec<(u64, Vec<(Bytes, Bytes)>)> {
        std::mem::take(&mut self.unblocked)
    }

    /// Drains pending decoder-stream bytes for transmission.
    pub fn take_decoder_stream(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.feedback)
    }

    /// Abandons a request stream: parked sections are dropped and a
    /// Stream Cancellation is queued so the encoder releases its
    /// references.
    pub fn cancel_stream(&mut self, stream_id: u64) {
        self.blocked.remove(&stream_id);
        prefix_int::encode(&mut self.feedback, 6, 0b01, stream_id);
    }

    /// Number of streams currently parked on missing insertions.
    #[must_use]
    pub fn blocked_streams(&self) -> u64 {
        self.blocked.len() as u64
    }

    /// Snapshot of the dynamic table, oldest first.
    #[must_use]
    pub fn table_state(&self) -> Vec<Entry> {
        self.table.entries()
    }

    fn retry_blocked(&mut self) -> Result<(), Error> {
        let insert_count = self.table.insert_count();
        let ready_streams: Vec<u64> = self
            .blocked
            .iter()
            .filter(|(_, sections)| {
                sections
                    .iter()
                    .any(|s| s.required_insert_count <= insert_count)
            })
            .map(|(&id, _)| id)
            .collect();

        for stream_id in ready_streams {
            let Some(sections) = self.blocked.get_mut(&stream_id) else {
                continue;
            };
            let mut remaining = Vec::new();
            for section in std::mem::take(sections) {
                // Sections on one stream decode in order: once one
                // stays parked, the rest stay behind it.
                if section.required_insert_count > insert_count || !remaining.is_empty() {
                    remaining.push(section);
                    continue;
                }
                let mut buf = section.block.as_slice();
                let (required, base) = self.read_prefix(&mut buf)?;
                let fields = self.decode_lines(buf, base)?;
                self.acknowledge(stream_id, required);
                self.unblocked.push((stream_id, fields));
            }
            if remaining.is_empty() {
                self.blocked.remove(&stream_id);
            } else {
                self.blocked.insert(stream_id, remaining);
            }
        }
        Ok(())
    }

    /// Reads the encoded-section prefix, returning (required insert
    /// count, base).
    fn read_prefix(&self, buf: &mut &[u8]) -> Result<(u64, u64), Error> {
        let (_, encoded_ric) = prefix_int::decode(buf, 8)?;
        let required = self.decode_required_insert_count(encoded_ric)?;
        let (sign, delta) = prefix_int::decode(buf, 7)?;
        let base = if sign & 1 == 0 {
            required + delta
        } else {
            required
                .checked_sub(delta + 1)
                .ok_or_else(|| Error::CompressionError("qpack negative base".into()))?
        };
        Ok((required, base))
    }

    /// RFC 9204 §4.5.1.1 reconstruction.
    fn decode_required_insert_count(&self, encoded: u64) -> Result<u64, Error> {
        if encoded == 0 {
            return Ok(0);
        }
        let max_entries = self.table.max_entries();
        let full_range = 2 * max_entries;
        if encoded > full_range {
            return Err(Error::CompressionError("qpack required insert count range".into()));
        }
        let max_value = self.table.insert_count() + max_entries;
        let max_wrapped = (max_value / full_range) * full_range;
        let mut required = max_wrapped + encoded - 1;
        if required > max_value {
            if required <= full_range {
                return Err(Error::CompressionError("qpack required insert count wrap".into()));
            }
            required -= full_range;
        }
        if required == 0 {
            return Err(Error::CompressionError("qpack required insert count zero".into()));
        }
        Ok(required)
    }

    fn decode_lines(&self, mut buf: &[u8], base: u64) -> Result<Vec<(Bytes, Bytes)>, Error> {
        let mut fields = Vec::new();
        let mut section_size = 0usize;

        while buf.has_remaining() {
            let first = buf.chunk()[0];
            let (name, value) = if first & 0b1000_0000 != 0 {
                // Indexed field line: 1 T + 6-bit index.
                let (flags, index) = prefix_int::decode(&mut buf, 6)?;
                if flags & 0b01 != 0 {
                    let (name, value) = table::static_entry(index as usize)?;
                    (Bytes::copy_from_slice(name), Bytes::copy_from_slice(value))
                } else {
                    let abs = base
                        .checked_sub(1 + index)
                        .ok_or_else(|| Error::CompressionError("qpack relative index underflow".into()))?;
                    let entry = self.table.get_abs(abs)?;
                    (entry.name.clone(), entry.value.clone())
                }
            } else if first & 0b0100_0000 != 0 {
                // Literal with name reference: 01 N T + 4-bit index.
                let (flags, index) = prefix_int::decode(&mut buf, 4)?;
                let name = if flags & 0b0001 != 0 {
                    let (name, _) = table::static_entry(index as usize)?;
                    Bytes::copy_from_slice(name)
                } else {
                    let abs = base
                        .checked_sub(1 + index)
                        .ok_or_else(|| Error::CompressionError("qpack relative index underflow".into()))?;
                    self.table.get_abs(abs)?.name.clone()
                };
                let value = read_string(&mut buf, 7)?;
                (name, value)
            } else if first & 0b0010_0000 != 0 {
                // Literal with literal name: 001 N H + 3-bit length.
                let name = read_string(&mut buf, 3)?;
                let value = read_string(&mut buf, 7)?;
                (name, value)
            } else if first & 0b0001_0000 != 0 {
                // Indexed with post-base index: 0001 + 4-bit index.
                let (_, index) = prefix_int::decode(&mut buf, 4)?;
                let entry = self.table.get_abs(base + index)?;
                (entry.name.clone(), entry.value.clone())
            } else {
                // Literal with post-base name reference: 0000 N + 3-bit.
                let (_, index) = prefix_int::decode(&mut buf, 3)?;
                let name = self.table.get_abs(base + index)?.name.clone();
                let value = read_string(&mut buf, 7)?;
                (name, value)
            };

            section_size += name.len() + value.len() + super::ENTRY_OVERHEAD;
            if section_size > self.max_field_section_size {
                return Err(Error::TooLarge("decoded field section exceeds limit".into()));
            }
            fields.push((name, value));
        }
        Ok(fields)
    }

    fn acknowledge(&mut self, stream_id: u64, required: u64) {
        // Sections with no dynamic references need no acknowledgment.
        if required > 0 {
            prefix_int::encode(&mut self.feedback, 7, 0b1, stream_id);
        }
    }
}

/// String literal whose length occupies the low `prefix` bits; the
/// Huffman flag is the lowest bit above them.
fn read_string<B: Buf>(buf: &mut B, prefix: u8) -> Result<Bytes, Error> {
    let (flags, len) = prefix_int::decode(buf, prefix)?;
    let len = usize::try_from(len).map_err(|_| Error::TooLarge("qpack string length".into()))?;
    if buf.remaining() < len {
        return Err(Error::BadSyntax("qpack short string literal".into()));
    }
    let raw = buf.copy_to_bytes(len);
    if flags & 1 == 0 {
        return Ok(raw);
    }
    let mut decoded = Vec::with_capacity(len * 2);
    huffman::decode(&raw, &mut decoded)?;
    Ok(Bytes::from(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_reference_decodes_without_table_state() {
        let mut decoder = Decoder::new(4096, 64 * 1024, 16);
        // Prefix 0/0, then :method GET (static 17).
        let block = [0x00, 0x00, 0b1100_0000 | 17];
        match decoder.decode_section(0, &block).unwrap() {
            SectionOutcome::Decoded(fields) => {
                assert_eq!(fields, vec![(Bytes::from_static(b":method"), Bytes::from_static(b"GET"))]);
            }
            SectionOutcome::Blocked => panic!("static section blocked"),
        }
        // Static-only sections produce no acknowledgment.
        assert!(decoder.take_decoder_stream().is_empty());
    }

    #[test]
    fn blocked_budget_is_enforced() {
        let mut decoder = Decoder::new(4096, 64 * 1024, 1);
        // Required insert count 1 (encoded 2 under max_entries 128).
        let block = [0x02, 0x00, 0b1000_0000];
        assert!(matches!(decoder.decode_section(0, &block).unwrap(), SectionOutcome::Blocked));
        // A second blocked stream exceeds the advertised budget.
        assert!(decoder.decode_section(4, &block).is_err());
    }

    #[test]
    fn insert_count_increment_emitted_for_unreferenced_inserts() {
        let mut decoder = Decoder::new(4096, 64 * 1024, 16);
        let mut instructions = Vec::new();
        // Set capacity 4096, then insert with literal name "a": "b".
        prefix_int::encode(&mut instructions, 5, 0b001, 4096);
        prefix_int::encode(&mut instructions, 5, 0b010, 1);
        instructions.push(b'a');
        prefix_int::encode(&mut instructions, 7, 0, 1);
        instructions.push(b'b');
        decoder.read_encoder_stream(&instructions).unwrap();

        let feedback = decoder.take_decoder_stream();
        // Insert Count Increment of 1: 00 pattern.
        assert_eq!(feedback, vec![0x01]);
        assert_eq!(decoder.table_state().len(), 1);
    }
}
