//! # Record Binary Format
//!
//! Every record serializes as a one-byte kind tag followed by its
//! delegates in a fixed order. Fixed-width integers are big-endian; keys
//! and lengths are prefix varints.
//!
//! ```text
//! NodeDelegate    nodeKey vu64 | parentKey vu64 | typeKey i32 | hash u64
//!                 | revision vu32 | deweyLen u8 + bytes (0 = absent)
//! StructDelegate  5 x (flag u8; flag 0 => selfKey - value as signed vi64)
//!                 for firstChild, leftSib, rightSib, childCount, descCount
//! NameDelegate    prefixKey i32 | localNameKey i32 | uriKey i32
//!                 | pathNodeKey vu64
//! ValueDelegate   compressed u8 | length u32 | bytes
//! ```
//!
//! Sibling and child keys are stored self-relative because neighbors are
//! usually allocated close together, which keeps the deltas in the
//! one-byte varint range. The flag byte distinguishes a genuine NULL from
//! any numeric delta.
//!
//! Round-trip law: `deserialize(serialize(n)) == n` for every kind.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::config::NULL_NODE_KEY;
use crate::encoding::bytes::{
    put_i32, put_signed_varint, put_u32, put_u64, put_varint, ByteReader,
};
use crate::index::keys::IndexKey;
use crate::index::refs::NodeReferences;
use crate::node::dewey::DeweyId;
use crate::node::{
    AttributeNode, AvlNode, CommentNode, DeletedNode, DocumentRootNode, ElementNode, Kind,
    NameNodeDelegate, Node, NodeDelegate, NamespaceNode, PathNode, PiNode, StructNodeDelegate,
    TextNode, ValueDelegate,
};

pub fn serialize(node: &Node) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    serialize_into(node, &mut out);
    out
}

pub fn serialize_into(node: &Node, out: &mut Vec<u8>) {
    out.push(node.kind() as u8);
    match node {
        Node::DocumentRoot(n) => {
            put_node_delegate(out, &n.node);
            put_struct_delegate(out, n.node.node_key, &n.structure);
        }
        Node::Element(n) => {
            put_node_delegate(out, &n.node);
            put_struct_delegate(out, n.node.node_key, &n.structure);
            put_name_delegate(out, &n.name);
            put_varint(out, n.attribute_keys.len() as u64);
            for &attribute_key in &n.attribute_keys {
                put_varint(out, attribute_key);
                let name_key = n
                    .attribute_names
                    .iter()
                    .find(|(_, &v)| v == attribute_key)
                    .map(|(&k, _)| k)
                    .unwrap_or(crate::config::NULL_NAME_KEY);
                put_i32(out, name_key);
            }
            put_varint(out, n.namespace_keys.len() as u64);
            for &namespace_key in &n.namespace_keys {
                put_varint(out, namespace_key);
            }
        }
        Node::Attribute(n) => {
            put_node_delegate(out, &n.node);
            put_name_delegate(out, &n.name);
            put_value_delegate(out, &n.value);
        }
        Node::Namespace(n) => {
            put_node_delegate(out, &n.node);
            put_name_delegate(out, &n.name);
        }
        Node::Text(n) => {
            put_node_delegate(out, &n.node);
            put_struct_delegate(out, n.node.node_key, &n.structure);
            put_value_delegate(out, &n.value);
        }
        Node::Comment(n) => {
            put_node_delegate(out, &n.node);
            put_struct_delegate(out, n.node.node_key, &n.structure);
            put_value_delegate(out, &n.value);
        }
        Node::ProcessingInstruction(n) => {
            put_node_delegate(out, &n.node);
            put_struct_delegate(out, n.node.node_key, &n.structure);
            put_name_delegate(out, &n.name);
            put_value_delegate(out, &n.value);
        }
        Node::Path(n) => {
            put_node_delegate(out, &n.node);
            put_struct_delegate(out, n.node.node_key, &n.structure);
            put_name_delegate(out, &n.name);
            out.push(n.referenced_kind as u8);
            put_varint(out, n.level as u64);
            put_varint(out, n.references);
        }
        Node::Avl(n) => {
            put_node_delegate(out, &n.node);
            n.key.serialize_into(out);
            n.value.serialize_into(out);
            put_relative_key(out, n.node.node_key, n.left_child);
            put_relative_key(out, n.node.node_key, n.right_child);
            out.push(n.changed as u8);
        }
        Node::Deleted(n) => {
            put_node_delegate(out, &n.node);
        }
        Node::Null => {}
    }
}

pub fn deserialize(bytes: &[u8]) -> Result<Node> {
    let mut reader = ByteReader::new(bytes);
    let node = deserialize_from(&mut reader)?;
    ensure!(
        reader.is_exhausted(),
        "{} trailing bytes after record",
        reader.remaining()
    );
    Ok(node)
}

pub fn deserialize_from(reader: &mut ByteReader<'_>) -> Result<Node> {
    let kind = Kind::from_byte(reader.read_u8()?)?;
    Ok(match kind {
        Kind::DocumentRoot => {
            let node = read_node_delegate(reader)?;
            let structure = read_struct_delegate(reader, node.node_key)?;
            Node::DocumentRoot(DocumentRootNode { node, structure })
        }
        Kind::Element => {
            let node = read_node_delegate(reader)?;
            let structure = read_struct_delegate(reader, node.node_key)?;
            let name = read_name_delegate(reader)?;
            let attribute_count = reader.read_varint()? as usize;
            let mut attribute_keys = SmallVec::with_capacity(attribute_count);
            let mut attribute_names = HashMap::with_capacity(attribute_count);
            for _ in 0..attribute_count {
                let attribute_key = reader.read_varint()?;
                let name_key = reader.read_i32()?;
                attribute_keys.push(attribute_key);
                attribute_names.insert(name_key, attribute_key);
            }
            let namespace_count = reader.read_varint()? as usize;
            let mut namespace_keys = SmallVec::with_capacity(namespace_count);
            for _ in 0..namespace_count {
                namespace_keys.push(reader.read_varint()?);
            }
            Node::Element(ElementNode {
                node,
                structure,
                name,
                attribute_keys,
                attribute_names,
                namespace_keys,
            })
        }
        Kind::Attribute => {
            let node = read_node_delegate(reader)?;
            let name = read_name_delegate(reader)?;
            let value = read_value_delegate(reader)?;
            Node::Attribute(AttributeNode { node, name, value })
        }
        Kind::Namespace => {
            let node = read_node_delegate(reader)?;
            let name = read_name_delegate(reader)?;
            Node::Namespace(NamespaceNode { node, name })
        }
        Kind::Text => {
            let node = read_node_delegate(reader)?;
            let structure = read_struct_delegate(reader, node.node_key)?;
            let value = read_value_delegate(reader)?;
            Node::Text(TextNode {
                node,
                structure,
                value,
            })
        }
        Kind::Comment => {
            let node = read_node_delegate(reader)?;
            let structure = read_struct_delegate(reader, node.node_key)?;
            let value = read_value_delegate(reader)?;
            Node::Comment(CommentNode {
                node,
                structure,
                value,
            })
        }
        Kind::ProcessingInstruction => {
            let node = read_node_delegate(reader)?;
            let structure = read_struct_delegate(reader, node.node_key)?;
            let name = read_name_delegate(reader)?;
            let value = read_value_delegate(reader)?;
            Node::ProcessingInstruction(PiNode {
                node,
                structure,
                name,
                value,
            })
        }
        Kind::Path => {
            let node = read_node_delegate(reader)?;
            let structure = read_struct_delegate(reader, node.node_key)?;
            let name = read_name_delegate(reader)?;
            let referenced_kind = Kind::from_byte(reader.read_u8()?)?;
            let level = reader.read_varint()? as u32;
            let references = reader.read_varint()?;
            Node::Path(PathNode {
                node,
                structure,
                name,
                referenced_kind,
                level,
                references,
            })
        }
        Kind::Avl => {
            let node = read_node_delegate(reader)?;
            let key = IndexKey::deserialize(reader)?;
            let value = NodeReferences::deserialize(reader)?;
            let left_child = read_relative_key(reader, node.node_key)?;
            let right_child = read_relative_key(reader, node.node_key)?;
            let changed = reader.read_u8()? != 0;
            Node::Avl(AvlNode {
                node,
                key,
                value,
                left_child,
                right_child,
                changed,
            })
        }
        Kind::Deleted => Node::Deleted(DeletedNode {
            node: read_node_delegate(reader)?,
        }),
        Kind::Null => Node::Null,
    })
}

fn put_node_delegate(out: &mut Vec<u8>, delegate: &NodeDelegate) {
    put_varint(out, delegate.node_key);
    put_varint(out, delegate.parent_key);
    put_i32(out, delegate.type_key);
    put_u64(out, delegate.hash);
    put_varint(out, delegate.revision as u64);
    match &delegate.dewey_id {
        Some(id) => {
            let bytes = id.to_bytes();
            debug_assert!(!bytes.is_empty() && bytes.len() <= u8::MAX as usize);
            out.push(bytes.len() as u8);
            out.extend_from_slice(&bytes);
        }
        None => out.push(0),
    }
}

fn read_node_delegate(reader: &mut ByteReader<'_>) -> Result<NodeDelegate> {
    let node_key = reader.read_varint()?;
    let parent_key = reader.read_varint()?;
    let type_key = reader.read_i32()?;
    let hash = reader.read_u64()?;
    let revision = reader.read_varint()? as u32;
    let dewey_len = reader.read_u8()? as usize;
    let dewey_id = if dewey_len == 0 {
        None
    } else {
        Some(DeweyId::from_bytes(reader.read_bytes(dewey_len)?)?)
    };
    Ok(NodeDelegate {
        node_key,
        parent_key,
        type_key,
        revision,
        hash,
        dewey_id,
    })
}

fn put_struct_delegate(out: &mut Vec<u8>, self_key: u64, delegate: &StructNodeDelegate) {
    put_relative_key(out, self_key, delegate.first_child);
    put_relative_key(out, self_key, delegate.left_sibling);
    put_relative_key(out, self_key, delegate.right_sibling);
    put_relative_key(out, self_key, delegate.child_count);
    put_relative_key(out, self_key, delegate.descendant_count);
}

fn read_struct_delegate(reader: &mut ByteReader<'_>, self_key: u64) -> Result<StructNodeDelegate> {
    Ok(StructNodeDelegate {
        first_child: read_relative_key(reader, self_key)?,
        left_sibling: read_relative_key(reader, self_key)?,
        right_sibling: read_relative_key(reader, self_key)?,
        child_count: read_relative_key(reader, self_key)?,
        descendant_count: read_relative_key(reader, self_key)?,
    })
}

fn put_name_delegate(out: &mut Vec<u8>, delegate: &NameNodeDelegate) {
    put_i32(out, delegate.prefix_key);
    put_i32(out, delegate.local_name_key);
    put_i32(out, delegate.uri_key);
    put_varint(out, delegate.path_node_key);
}

fn read_name_delegate(reader: &mut ByteReader<'_>) -> Result<NameNodeDelegate> {
    Ok(NameNodeDelegate {
        prefix_key: reader.read_i32()?,
        local_name_key: reader.read_i32()?,
        uri_key: reader.read_i32()?,
        path_node_key: reader.read_varint()?,
    })
}

fn put_value_delegate(out: &mut Vec<u8>, delegate: &ValueDelegate) {
    out.push(delegate.is_compressed() as u8);
    put_u32(out, delegate.stored().len() as u32);
    out.extend_from_slice(delegate.stored());
}

fn read_value_delegate(reader: &mut ByteReader<'_>) -> Result<ValueDelegate> {
    let compressed = reader.read_u8()? != 0;
    let len = reader.read_u32()? as usize;
    let data = reader.read_bytes(len)?.to_vec();
    Ok(ValueDelegate::from_stored(data, compressed))
}

/// flag 1 => NULL; flag 0 => `self_key - value` as a signed varint.
fn put_relative_key(out: &mut Vec<u8>, self_key: u64, value: u64) {
    if value == NULL_NODE_KEY {
        out.push(1);
    } else {
        out.push(0);
        put_signed_varint(out, (self_key as i64).wrapping_sub(value as i64));
    }
}

fn read_relative_key(reader: &mut ByteReader<'_>, self_key: u64) -> Result<u64> {
    if reader.read_u8()? == 1 {
        return Ok(NULL_NODE_KEY);
    }
    let delta = reader.read_signed_varint()?;
    Ok((self_key as i64).wrapping_sub(delta) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::keys::CasValue;
    use crate::name::QName;

    fn delegate(key: u64) -> NodeDelegate {
        let mut d = NodeDelegate::new(key, 3, 2, None);
        d.hash = 0xFEED_FACE_CAFE_BEEF;
        d.type_key = 7;
        d
    }

    fn assert_round_trip(node: Node) {
        let bytes = serialize(&node);
        assert_eq!(deserialize(&bytes).unwrap(), node, "kind {:?}", node.kind());
    }

    #[test]
    fn document_root_round_trips() {
        assert_round_trip(Node::DocumentRoot(DocumentRootNode {
            node: NodeDelegate::new(0, NULL_NODE_KEY, 0, None),
            structure: StructNodeDelegate {
                first_child: 1,
                left_sibling: NULL_NODE_KEY,
                right_sibling: NULL_NODE_KEY,
                child_count: 1,
                descendant_count: 12,
            },
        }));
    }

    #[test]
    fn element_with_attributes_round_trips() {
        let mut attribute_names = HashMap::new();
        attribute_names.insert(91, 12u64);
        attribute_names.insert(92, 13u64);
        assert_round_trip(Node::Element(ElementNode {
            node: delegate(11),
            structure: StructNodeDelegate {
                first_child: 14,
                left_sibling: 9,
                right_sibling: NULL_NODE_KEY,
                child_count: 1,
                descendant_count: 1,
            },
            name: NameNodeDelegate::new(5, -1, 42, 2),
            attribute_keys: SmallVec::from_slice(&[12, 13]),
            attribute_names,
            namespace_keys: SmallVec::from_slice(&[15]),
        }));
    }

    #[test]
    fn attribute_and_namespace_round_trip() {
        assert_round_trip(Node::Attribute(AttributeNode {
            node: delegate(12),
            name: NameNodeDelegate::new(-1, -1, 91, 2),
            value: ValueDelegate::new(b"attr value".to_vec(), false),
        }));
        assert_round_trip(Node::Namespace(NamespaceNode {
            node: delegate(15),
            name: NameNodeDelegate::new(8, 9, -1, 0),
        }));
    }

    #[test]
    fn value_nodes_round_trip_compressed_and_raw() {
        assert_round_trip(Node::Text(TextNode {
            node: delegate(20),
            structure: StructNodeDelegate::detached(),
            value: ValueDelegate::new(b"plain".to_vec(), false),
        }));
        assert_round_trip(Node::Text(TextNode {
            node: delegate(21),
            structure: StructNodeDelegate::detached(),
            value: ValueDelegate::new(b"compressible text value ".repeat(10), true),
        }));
        assert_round_trip(Node::Comment(CommentNode {
            node: delegate(22),
            structure: StructNodeDelegate::detached(),
            value: ValueDelegate::new(b"a comment".to_vec(), false),
        }));
        assert_round_trip(Node::ProcessingInstruction(PiNode {
            node: delegate(23),
            structure: StructNodeDelegate::detached(),
            name: NameNodeDelegate::new(-1, -1, 33, 4),
            value: ValueDelegate::new(b"target data".to_vec(), false),
        }));
    }

    #[test]
    fn path_node_round_trips() {
        assert_round_trip(Node::Path(PathNode {
            node: delegate(30),
            structure: StructNodeDelegate {
                first_child: NULL_NODE_KEY,
                left_sibling: NULL_NODE_KEY,
                right_sibling: 31,
                child_count: 0,
                descendant_count: 0,
            },
            name: NameNodeDelegate::new(-1, -1, 55, 0),
            referenced_kind: Kind::Element,
            level: 3,
            references: 17,
        }));
    }

    #[test]
    fn avl_node_round_trips() {
        assert_round_trip(Node::Avl(AvlNode {
            node: delegate(40),
            key: IndexKey::Cas(CasValue::string(b"x", 9)),
            value: {
                let mut refs = NodeReferences::new();
                refs.add_node_key(100);
                refs.add_node_key(200);
                refs
            },
            left_child: 38,
            right_child: NULL_NODE_KEY,
            changed: true,
        }));
        assert_round_trip(Node::Avl(AvlNode {
            node: delegate(41),
            key: IndexKey::Name(QName::new("u", "p", "n")),
            value: NodeReferences::single(7),
            left_child: NULL_NODE_KEY,
            right_child: NULL_NODE_KEY,
            changed: false,
        }));
    }

    #[test]
    fn tombstone_and_null_round_trip() {
        assert_round_trip(Node::Deleted(DeletedNode { node: delegate(50) }));
        assert_round_trip(Node::Null);
    }

    #[test]
    fn dewey_id_survives_the_trip() {
        let id = DeweyId::document_root().new_first_child().new_first_child();
        let mut d = delegate(60);
        d.dewey_id = Some(id);
        assert_round_trip(Node::Text(TextNode {
            node: d,
            structure: StructNodeDelegate::detached(),
            value: ValueDelegate::new(b"v".to_vec(), false),
        }));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = serialize(&Node::Null);
        bytes.push(0xAB);
        assert!(deserialize(&bytes).is_err());
    }
}
