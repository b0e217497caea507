//! Node-key reference sets, the value type of every secondary index.

use eyre::Result;

use crate::encoding::bytes::{put_varint, ByteReader};

/// A duplicate-free set of node keys kept in sorted order so membership is
/// a binary search and serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeReferences {
    keys: Vec<u64>,
}

impl NodeReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding one key.
    pub fn single(key: u64) -> Self {
        Self { keys: vec![key] }
    }

    /// Adds `key`; returns false if it was already present.
    pub fn add_node_key(&mut self, key: u64) -> bool {
        match self.keys.binary_search(&key) {
            Ok(_) => false,
            Err(pos) => {
                self.keys.insert(pos, key);
                true
            }
        }
    }

    /// Removes `key`; returns true if it was present.
    pub fn remove_node_key(&mut self, key: u64) -> bool {
        match self.keys.binary_search(&key) {
            Ok(pos) => {
                self.keys.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.keys.binary_search(&key).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn node_keys(&self) -> &[u64] {
        &self.keys
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        put_varint(out, self.keys.len() as u64);
        for &key in &self.keys {
            put_varint(out, key);
        }
    }

    pub fn deserialize(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.read_varint()? as usize;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(reader.read_varint()?);
        }
        Ok(Self { keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_sorted_order_and_rejects_duplicates() {
        let mut refs = NodeReferences::new();
        assert!(refs.add_node_key(9));
        assert!(refs.add_node_key(3));
        assert!(refs.add_node_key(27));
        assert!(!refs.add_node_key(9));
        assert_eq!(refs.node_keys(), &[3, 9, 27]);
    }

    #[test]
    fn remove_reports_presence() {
        let mut refs = NodeReferences::single(5);
        assert!(refs.remove_node_key(5));
        assert!(!refs.remove_node_key(5));
        assert!(refs.is_empty());
    }

    #[test]
    fn serialization_round_trips() {
        let mut refs = NodeReferences::new();
        for key in [1u64, 500, 70_000, u64::MAX - 3] {
            refs.add_node_key(key);
        }

        let mut out = Vec::new();
        refs.serialize_into(&mut out);
        let mut reader = ByteReader::new(&out);
        assert_eq!(NodeReferences::deserialize(&mut reader).unwrap(), refs);
        assert!(reader.is_exhausted());
    }
}
