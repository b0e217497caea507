//! Sequential byte reading and writing over plain buffers.
//!
//! The page and node codecs are hand-rolled over `Vec<u8>` / `&[u8]`; this
//! module keeps the offset bookkeeping in one place. Multi-byte integers
//! are big-endian, matching the page serialization format.

use eyre::{ensure, Result};

use super::varint::{decode_signed_varint, decode_varint, encode_signed_varint, encode_varint};

/// Sequential reader over a byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        ensure!(self.remaining() >= 1, "unexpected end of buffer");
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        ensure!(self.remaining() >= 4, "unexpected end of buffer");
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()); // INVARIANT: length checked
        self.pos += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        ensure!(self.remaining() >= 8, "unexpected end of buffer");
        let v = u64::from_be_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap()); // INVARIANT: length checked
        self.pos += 8;
        Ok(v)
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let (v, read) = decode_varint(&self.buf[self.pos..])?;
        self.pos += read;
        Ok(v)
    }

    pub fn read_signed_varint(&mut self) -> Result<i64> {
        let (v, read) = decode_signed_varint(&self.buf[self.pos..])?;
        self.pos += read;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= len,
            "unexpected end of buffer ({} bytes wanted, {} left)",
            len,
            self.remaining()
        );
        let v = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    /// Length-prefixed byte run (varint length).
    pub fn read_len_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        self.read_bytes(len)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_len_bytes()?;
        Ok(std::str::from_utf8(bytes)
            .map_err(|e| eyre::eyre!("invalid UTF-8 in serialized string: {}", e))?
            .to_owned())
    }
}

/// Appends `value` as a big-endian u32.
pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Appends `value` as a big-endian i32.
pub fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Appends `value` as a big-endian u64.
pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Appends `value` as a prefix varint.
pub fn put_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 9];
    let written = encode_varint(value, &mut buf);
    out.extend_from_slice(&buf[..written]);
}

/// Appends `value` zig-zag folded as a prefix varint.
pub fn put_signed_varint(out: &mut Vec<u8>, value: i64) {
    let mut buf = [0u8; 9];
    let written = encode_signed_varint(value, &mut buf);
    out.extend_from_slice(&buf[..written]);
}

/// Appends a varint length followed by the bytes.
pub fn put_len_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Appends a varint length followed by the UTF-8 bytes.
pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_len_bytes(out, s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_fields_round_trip() {
        let mut out = Vec::new();
        out.push(7u8);
        put_u32(&mut out, 0xDEAD_BEEF);
        put_u64(&mut out, u64::MAX - 1);
        put_varint(&mut out, 300);
        put_signed_varint(&mut out, -12345);
        put_string(&mut out, "qname");

        let mut r = ByteReader::new(&out);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_varint().unwrap(), 300);
        assert_eq!(r.read_signed_varint().unwrap(), -12345);
        assert_eq!(r.read_string().unwrap(), "qname");
        assert!(r.is_exhausted());
    }

    #[test]
    fn reads_past_the_end_fail() {
        let mut r = ByteReader::new(&[1, 2]);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert!(r.read_u32().is_err());
        assert_eq!(r.remaining(), 1);
    }
}
