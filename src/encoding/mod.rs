//! Byte-level encoding helpers shared by the page and node codecs.

pub mod bytes;
pub mod varint;

pub use bytes::ByteReader;
pub use varint::{
    decode_signed_varint, decode_varint, encode_signed_varint, encode_varint, varint_len,
};
