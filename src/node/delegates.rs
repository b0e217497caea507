//! # Node Delegates
//!
//! Every concrete node kind is composed from the delegate structs below;
//! each delegate owns one orthogonal slice of node state. Records hold only
//! `u64` keys toward other nodes; navigation always resolves keys through
//! a transaction, never through in-memory references.
//!
//! The `NULL_NODE_KEY` sentinel encodes "no node" inside a record; the
//! `has_*` accessors convert it at the edge.

use std::borrow::Cow;
use std::io::{Read, Write};

use eyre::{Result, WrapErr};

use crate::config::{NULL_NAME_KEY, NULL_NODE_KEY, VALUE_COMPRESSION_MIN_LEN};
use crate::node::dewey::DeweyId;

/// Basic identity shared by every node: its key, parent, type, the
/// revision it was created in, its rolling hash and the optional Dewey ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDelegate {
    pub node_key: u64,
    pub parent_key: u64,
    pub type_key: i32,
    pub revision: u32,
    pub hash: u64,
    pub dewey_id: Option<DeweyId>,
}

impl NodeDelegate {
    pub fn new(node_key: u64, parent_key: u64, revision: u32, dewey_id: Option<DeweyId>) -> Self {
        Self {
            node_key,
            parent_key,
            type_key: NULL_NAME_KEY,
            revision,
            hash: 0,
            dewey_id,
        }
    }

    pub fn has_parent(&self) -> bool {
        self.parent_key != NULL_NODE_KEY
    }
}

/// Structural position of a node: its place in the doubly linked sibling
/// chain plus the child and descendant counters of its own subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructNodeDelegate {
    pub first_child: u64,
    pub left_sibling: u64,
    pub right_sibling: u64,
    pub child_count: u64,
    pub descendant_count: u64,
}

impl StructNodeDelegate {
    pub fn new(first_child: u64, left_sibling: u64, right_sibling: u64) -> Self {
        Self {
            first_child,
            left_sibling,
            right_sibling,
            child_count: 0,
            descendant_count: 0,
        }
    }

    /// A leaf with no neighbors.
    pub fn detached() -> Self {
        Self::new(NULL_NODE_KEY, NULL_NODE_KEY, NULL_NODE_KEY)
    }

    pub fn has_first_child(&self) -> bool {
        self.first_child != NULL_NODE_KEY
    }

    pub fn has_left_sibling(&self) -> bool {
        self.left_sibling != NULL_NODE_KEY
    }

    pub fn has_right_sibling(&self) -> bool {
        self.right_sibling != NULL_NODE_KEY
    }

    pub fn increment_child_count(&mut self) {
        self.child_count += 1;
    }

    pub fn decrement_child_count(&mut self) {
        debug_assert!(self.child_count > 0, "child count underflow");
        self.child_count -= 1;
    }
}

/// Name keys of a named node plus the path-summary node its name path maps
/// to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameNodeDelegate {
    pub uri_key: i32,
    pub prefix_key: i32,
    pub local_name_key: i32,
    pub path_node_key: u64,
}

impl NameNodeDelegate {
    pub fn new(uri_key: i32, prefix_key: i32, local_name_key: i32, path_node_key: u64) -> Self {
        Self {
            uri_key,
            prefix_key,
            local_name_key,
            path_node_key,
        }
    }
}

/// Raw or compressed value bytes. The stored form is what serialization
/// writes; `value()` always yields the original bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDelegate {
    data: Vec<u8>,
    compressed: bool,
}

impl ValueDelegate {
    /// Wraps `raw`, compressing when the resource opted in and the value
    /// is longer than the compression threshold.
    pub fn new(raw: Vec<u8>, compression: bool) -> Self {
        if compression && raw.len() > VALUE_COMPRESSION_MIN_LEN {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
            // Writing to a Vec-backed encoder cannot fail.
            encoder.write_all(&raw).expect("in-memory compression");
            let data = encoder.finish().expect("in-memory compression");
            Self {
                data,
                compressed: true,
            }
        } else {
            Self {
                data: raw,
                compressed: false,
            }
        }
    }

    /// Rebuilds the delegate from its serialized form.
    pub fn from_stored(data: Vec<u8>, compressed: bool) -> Self {
        Self { data, compressed }
    }

    /// The bytes as written to disk.
    pub fn stored(&self) -> &[u8] {
        &self.data
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// The original value bytes, inflating if the stored form is
    /// compressed.
    pub fn value(&self) -> Result<Cow<'_, [u8]>> {
        if !self.compressed {
            return Ok(Cow::Borrowed(&self.data));
        }
        let mut decoder = flate2::read::ZlibDecoder::new(&self.data[..]);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .wrap_err("failed to inflate value bytes")?;
        Ok(Cow::Owned(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_delegate_null_checks() {
        let mut d = StructNodeDelegate::detached();
        assert!(!d.has_first_child() && !d.has_left_sibling() && !d.has_right_sibling());

        d.first_child = 7;
        assert!(d.has_first_child());
    }

    #[test]
    fn child_count_round_trips() {
        let mut d = StructNodeDelegate::detached();
        d.increment_child_count();
        d.increment_child_count();
        d.decrement_child_count();
        assert_eq!(d.child_count, 1);
    }

    #[test]
    fn short_values_stay_uncompressed_even_when_opted_in() {
        let v = ValueDelegate::new(b"short".to_vec(), true);
        assert!(!v.is_compressed());
        assert_eq!(v.value().unwrap().as_ref(), b"short");
    }

    #[test]
    fn long_values_compress_and_inflate_to_the_original() {
        let raw = b"a longer value that exceeds the threshold".repeat(8);
        let v = ValueDelegate::new(raw.clone(), true);
        assert!(v.is_compressed());
        assert!(v.stored().len() < raw.len());
        assert_eq!(v.value().unwrap().as_ref(), &raw[..]);
    }

    #[test]
    fn compression_disabled_stores_raw() {
        let raw = b"a longer value that exceeds the threshold".to_vec();
        let v = ValueDelegate::new(raw.clone(), false);
        assert!(!v.is_compressed());
        assert_eq!(v.stored(), &raw[..]);
    }
}
