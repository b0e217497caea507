//! # Index Keys
//!
//! Every secondary-index tree orders its entries by an [`IndexKey`]. One
//! tree only ever holds one variant, but a single tagged type keeps the
//! AVL node serializable without generics bleeding into the record codec.
//!
//! CAS keys compare by (value type, typed value, path): equal values under
//! different paths are distinct entries, and range queries over one value
//! type see values in type-appropriate order (numeric for integers,
//! lexicographic for strings).

use std::cmp::Ordering;

use eyre::{bail, Result};

use crate::encoding::bytes::{put_string, put_varint, ByteReader};
use crate::name::QName;

/// Value type of a CAS entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    String = 1,
    Integer = 2,
}

impl ValueType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(ValueType::String),
            2 => Ok(ValueType::Integer),
            _ => bail!("invalid value type tag: {}", b),
        }
    }
}

/// A typed content-and-structure key: the value, its type, and the
/// path-summary node the value was found under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CasValue {
    pub value_type: ValueType,
    pub value: Vec<u8>,
    pub path_node_key: u64,
}

impl CasValue {
    pub fn string(value: &[u8], path_node_key: u64) -> Self {
        Self {
            value_type: ValueType::String,
            value: value.to_vec(),
            path_node_key,
        }
    }

    pub fn integer(value: i64, path_node_key: u64) -> Self {
        Self {
            value_type: ValueType::Integer,
            value: value.to_be_bytes().to_vec(),
            path_node_key,
        }
    }

    fn typed_value_cmp(&self, other: &Self) -> Ordering {
        match self.value_type {
            ValueType::String => self.value.cmp(&other.value),
            ValueType::Integer => {
                let decode = |bytes: &[u8]| -> i64 {
                    let mut buf = [0u8; 8];
                    let n = bytes.len().min(8);
                    buf[8 - n..].copy_from_slice(&bytes[..n]);
                    i64::from_be_bytes(buf)
                };
                decode(&self.value).cmp(&decode(&other.value))
            }
        }
    }
}

impl Ord for CasValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value_type
            .cmp(&other.value_type)
            .then_with(|| self.typed_value_cmp(other))
            .then_with(|| self.path_node_key.cmp(&other.path_node_key))
    }
}

impl PartialOrd for CasValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key of one secondary-index entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// Name index: a qualified name.
    Name(QName),
    /// Path index: a path-summary node key.
    Path(u64),
    /// CAS index: a typed value under a path.
    Cas(CasValue),
}

impl IndexKey {
    fn tag(&self) -> u8 {
        match self {
            IndexKey::Name(_) => 1,
            IndexKey::Path(_) => 2,
            IndexKey::Cas(_) => 3,
        }
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            IndexKey::Name(name) => {
                put_string(out, &name.uri);
                put_string(out, &name.prefix);
                put_string(out, &name.local_name);
            }
            IndexKey::Path(path_node_key) => {
                put_varint(out, *path_node_key);
            }
            IndexKey::Cas(cas) => {
                out.push(cas.value_type as u8);
                put_varint(out, cas.value.len() as u64);
                out.extend_from_slice(&cas.value);
                put_varint(out, cas.path_node_key);
            }
        }
    }

    pub fn deserialize(reader: &mut ByteReader<'_>) -> Result<Self> {
        match reader.read_u8()? {
            1 => {
                let uri = reader.read_string()?;
                let prefix = reader.read_string()?;
                let local_name = reader.read_string()?;
                Ok(IndexKey::Name(QName {
                    uri,
                    prefix,
                    local_name,
                }))
            }
            2 => Ok(IndexKey::Path(reader.read_varint()?)),
            3 => {
                let value_type = ValueType::from_byte(reader.read_u8()?)?;
                let value = reader.read_len_bytes()?.to_vec();
                let path_node_key = reader.read_varint()?;
                Ok(IndexKey::Cas(CasValue {
                    value_type,
                    value,
                    path_node_key,
                }))
            }
            tag => bail!("invalid index key tag: {}", tag),
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Name(a), IndexKey::Name(b)) => a
                .uri
                .cmp(&b.uri)
                .then_with(|| a.local_name.cmp(&b.local_name))
                .then_with(|| a.prefix.cmp(&b.prefix)),
            (IndexKey::Path(a), IndexKey::Path(b)) => a.cmp(b),
            (IndexKey::Cas(a), IndexKey::Cas(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_string_keys_compare_lexicographically() {
        let x = IndexKey::Cas(CasValue::string(b"x", 4));
        let y = IndexKey::Cas(CasValue::string(b"y", 4));
        assert!(x < y);
    }

    #[test]
    fn cas_integer_keys_compare_numerically() {
        let small = IndexKey::Cas(CasValue::integer(-5, 1));
        let large = IndexKey::Cas(CasValue::integer(100, 1));
        assert!(small < large);
    }

    #[test]
    fn cas_keys_distinguish_paths() {
        let a = IndexKey::Cas(CasValue::string(b"x", 1));
        let b = IndexKey::Cas(CasValue::string(b"x", 2));
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn name_keys_order_by_uri_then_local_name() {
        let a = IndexKey::Name(QName::local("a"));
        let b = IndexKey::Name(QName::local("b"));
        assert!(a < b);
    }

    #[test]
    fn keys_round_trip() {
        let keys = [
            IndexKey::Name(QName::new("http://u", "p", "n")),
            IndexKey::Path(42),
            IndexKey::Cas(CasValue::string(b"value", 7)),
            IndexKey::Cas(CasValue::integer(-12, 3)),
        ];
        for key in keys {
            let mut out = Vec::new();
            key.serialize_into(&mut out);
            let mut reader = ByteReader::new(&out);
            assert_eq!(IndexKey::deserialize(&mut reader).unwrap(), key);
            assert!(reader.is_exhausted());
        }
    }
}
