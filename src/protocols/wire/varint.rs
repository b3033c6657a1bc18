//! QUIC variable-length integers (RFC 9000 §16).
//!
//! The top two bits of the first byte select the encoded width
//! (00/01/10/11 for 1/2/4/8 bytes); the rest is a big-endian value.
//! Values are bounded to 2^62 - 1.

use bytes::{Buf, BufMut};

use crate::error::Error;

/// Largest value a varint can carry.
pub const MAX: u64 = (1 << 62) - 1;

/// A QUIC variable-length integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    /// Wraps `value`, rejecting anything above 2^62 - 1.
    pub fn new(value: u64) -> Result<Self, Error> {
        if value > MAX {
            Err(Error::BadSyntax(format!("varint value {value} exceeds 2^62-1")))
        } else {
            Ok(VarInt(value))
        }
    }

    #[inline]
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes the minimum-length encoding occupies.
    #[must_use]
    pub fn encoded_len(self) -> usize {
        match self.0 {
            0..=0x3f => 1,
            0x40..=0x3fff => 2,
            0x4000..=0x3fff_ffff => 4,
            _ => 8,
        }
    }

    /// Writes the minimum-length encoding.
    pub fn encode<B: BufMut>(self, buf: &mut B) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(self.0 as u16 | 0x4000),
            4 => buf.put_u32(self.0 as u32 | 0x8000_0000),
            _ => buf.put_u64(self.0 | 0xc000_0000_0000_0000),
        }
    }

    /// Reads one varint.
    ///
    /// Returns `Ok(None)` when the buffer ends mid-integer, so callers
    /// feeding partial input can wait for more bytes without losing
    /// position (peek the first byte before committing).
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Option<Self>, Error> {
        if !buf.has_remaining() {
            return Ok(None);
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return Ok(None);
        }
        let value = match len {
            1 => u64::from(buf.get_u8() & 0x3f),
            2 => u64::from(buf.get_u16() & 0x3fff),
            4 => u64::from(buf.get_u32() & 0x3fff_ffff),
            _ => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
        };
        Ok(Some(VarInt(value)))
    }

    /// Like [`VarInt::decode`] but treats truncation as an error, for
    /// contexts where the full extent is already known.
    pub fn decode_exact<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        Self::decode(buf)?.ok_or_else(|| Error::BadSyntax("short varint".into()))
    }
}

impl From<u32> for VarInt {
    fn from(value: u32) -> Self {
        VarInt(u64::from(value))
    }
}

impl TryFrom<u64> for VarInt {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Error> {
        VarInt::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u64) -> usize {
        let mut buf = Vec::new();
        let v = VarInt::new(value).unwrap();
        v.encode(&mut buf);
        assert_eq!(buf.len(), v.encoded_len());
        let decoded = VarInt::decode(&mut &buf[..]).unwrap().unwrap();
        assert_eq!(decoded.value(), value);
        buf.len()
    }

    #[test]
    fn class_boundaries_round_trip_minimally() {
        assert_eq!(round_trip(0), 1);
        assert_eq!(round_trip(63), 1);
        assert_eq!(round_trip(64), 2);
        assert_eq!(round_trip(16383), 2);
        assert_eq!(round_trip(16384), 4);
        assert_eq!(round_trip(1_073_741_823), 4);
        assert_eq!(round_trip(1_073_741_824), 8);
        assert_eq!(round_trip(MAX), 8);
    }

    #[test]
    fn rfc9000_appendix_a_examples() {
        // 0xc2197c5eff14e88c decodes to 151_288_809_941_952_652.
        let bytes = [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c];
        let v = VarInt::decode(&mut &bytes[..]).unwrap().unwrap();
        assert_eq!(v.value(), 151_288_809_941_952_652);

        // 0x9d7f3e7d decodes to 494_878_333.
        let bytes = [0x9d, 0x7f, 0x3e, 0x7d];
        assert_eq!(VarInt::decode(&mut &bytes[..]).unwrap().unwrap().value(), 494_878_333);

        // 0x7bbd decodes to 15_293.
        let bytes = [0x7b, 0xbd];
        assert_eq!(VarInt::decode(&mut &bytes[..]).unwrap().unwrap().value(), 15_293);
    }

    #[test]
    fn short_input_is_not_an_error() {
        let mut buf = Vec::new();
        VarInt::new(494_878_333).unwrap().encode(&mut buf);
        for cut in 0..buf.len() {
            assert_eq!(VarInt::decode(&mut &buf[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(VarInt::new(MAX + 1).is_err());
    }
}
