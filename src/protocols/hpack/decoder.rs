//! HPACK decoder.

use bytes::{Buf, Bytes};

use crate::error::Error;
use crate::protocols::wire::{huffman, prefix_int};

use super::table::{self, DynamicTable, Entry};

/// Per-direction HPACK decoder.
///
/// `max_field_section_size` bounds the decoded size of one block
/// (sum of name + value lengths plus the 32-byte overhead per field,
/// the `SETTINGS_MAX_HEADER_LIST_SIZE` accounting).
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    max_field_section_size: usize,
}

impl Decoder {
    #[must_use]
    pub fn new(max_table_capacity: usize, max_field_section_size: usize) -> Self {
        Decoder {
            table: DynamicTable::new(max_table_capacity),
            max_field_section_size,
        }
    }

    /// Applies a new local `SETTINGS_HEADER_TABLE_SIZE` bound.
    pub fn set_max_table_capacity(&mut self, max: usize) {
        self.table.set_max_capacity(max);
    }

    /// Decodes one complete header block, invoking `emit` per field in
    /// wire order.
    ///
    /// Any failure leaves the connection unusable: HPACK table state
    /// cannot be resynchronized, so callers must treat an error here as
    /// `COMPRESSION_ERROR` and tear the connection down.
    pub fn decode_block<F>(&mut self, block: &[u8], mut emit: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> Result<(), Error>,
    {
        let mut buf = block;
        let mut seen_field = false;
        let mut section_size = 0usize;

        while buf.has_remaining() {
            let first = buf.chunk()[0];

            if first & 0b1000_0000 != 0 {
                // Indexed field.
                let (_, index) = prefix_int::decode(&mut buf, 7)?;
                let (name, value) = table::resolve(&self.table, index as usize)?;
                let (name, value) = (Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
                seen_field = true;
                self.account(&mut section_size, name.len() + value.len())?;
                emit(&name, &value)?;
            } else if first & 0b0100_0000 != 0 {
                // Literal with incremental indexing.
                let (_, name_index) = prefix_int::decode(&mut buf, 6)?;
                let name = self.read_name(&mut buf, name_index as usize)?;
                let value = read_string(&mut buf)?;
                seen_field = true;
                self.account(&mut section_size, name.len() + value.len())?;
                emit(&name, &value)?;
                self.table.insert(name, value);
            } else if first & 0b0010_0000 != 0 {
                // Dynamic table size update; only valid before the
                // first field of the block.
                if seen_field {
                    return Err(Error::CompressionError(
                        "table size update after field line".into(),
                    ));
                }
                let (_, capacity) = prefix_int::decode(&mut buf, 5)?;
                let capacity = usize::try_from(capacity)
                    .map_err(|_| Error::CompressionError("table size update overflow".into()))?;
                if capacity > self.table.max_capacity() {
                    return Err(Error::CompressionError(format!(
                        "table size update {capacity} exceeds negotiated {}",
                        self.table.max_capacity()
                    )));
                }
                self.table.resize(capacity);
            } else {
                // Literal without indexing (0000) or never indexed
                // (0001): identical layout, neither touches the table.
                let (_, name_index) = prefix_int::decode(&mut buf, 4)?;
                let name = self.read_name(&mut buf, name_index as usize)?;
                let value = read_string(&mut buf)?;
                seen_field = true;
                self.account(&mut section_size, name.len() + value.len())?;
                emit(&name, &value)?;
            }
        }

        Ok(())
    }

    fn read_name<B: Buf>(&self, buf: &mut B, index: usize) -> Result<Bytes, Error> {
        if index == 0 {
            read_string(buf)
        } else {
            let (name, _) = table::resolve(&self.table, index)?;
            Ok(Bytes::copy_from_slice(name))
        }
    }

    fn account(&self, section_size: &mut usize, field_bytes: usize) -> Result<(), Error> {
        *section_size += field_bytes + super::ENTRY_OVERHEAD;
        if *section_size > self.max_field_section_size {
            return Err(Error::TooLarge("decoded header list exceeds limit".into()));
        }
        Ok(())
    }

    /// Snapshot of the dynamic table, newest first.
    #[must_use]
    pub fn table_state(&self) -> Vec<Entry> {
        (1..=self.table.len())
            .filter_map(|i| self.table.get(i).cloned())
            .collect()
    }
}

/// Length-prefixed string literal, optionally Huffman coded.
fn read_string<B: Buf>(buf: &mut B) -> Result<Bytes, Error> {
    let (flags, len) = prefix_int::decode(buf, 7)?;
    let len = usize::try_from(len).map_err(|_| Error::TooLarge("string literal length".into()))?;
    if buf.remaining() < len {
        return Err(Error::BadSyntax("short string literal".into()));
    }
    let raw = buf.copy_to_bytes(len);
    if flags & 1 == 0 {
        return Ok(raw);
    }
    let mut decoded = Vec::with_capacity(len * 2);
    huffman::decode(&raw, &mut decoded)?;
    Ok(Bytes::from(decoded))
}
