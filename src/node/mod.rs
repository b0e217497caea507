//! # Record Model
//!
//! Records are the unit stored in record pages: the nodes of the document
//! tree, the path-summary nodes, and the AVL nodes of the secondary
//! indexes. A record is a tagged variant per kind with the delegate
//! structs embedded by composition; dispatch happens on the small
//! [`Kind`] tag, and navigation between records goes through `u64` keys
//! resolved by a transaction.
//!
//! Kinds:
//!
//! - `DocumentRoot`: singleton root of the document tree (and of every
//!   index sub-tree, where its first child is the AVL tree root).
//! - `Element`, `Attribute`, `Namespace`, `Text`, `Comment`,
//!   `ProcessingInstruction`: document content.
//! - `Path`: one unique root-to-node name path in the path summary.
//! - `Avl`: one entry of a secondary index tree.
//! - `Deleted`: tombstone hiding earlier versions of a removed record.
//! - `Null`: the absent record.

pub mod codec;
pub mod delegates;
pub mod dewey;

use eyre::{bail, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::NULL_NODE_KEY;
use crate::index::keys::IndexKey;
use crate::index::refs::NodeReferences;
pub use delegates::{NameNodeDelegate, NodeDelegate, StructNodeDelegate, ValueDelegate};
pub use dewey::DeweyId;

/// Record kind tag; the first byte of every serialized record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    DocumentRoot = 1,
    Element = 2,
    Attribute = 3,
    Namespace = 4,
    Text = 5,
    Comment = 6,
    ProcessingInstruction = 7,
    Path = 8,
    Avl = 9,
    Deleted = 10,
    Null = 11,
}

impl Kind {
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            1 => Kind::DocumentRoot,
            2 => Kind::Element,
            3 => Kind::Attribute,
            4 => Kind::Namespace,
            5 => Kind::Text,
            6 => Kind::Comment,
            7 => Kind::ProcessingInstruction,
            8 => Kind::Path,
            9 => Kind::Avl,
            10 => Kind::Deleted,
            11 => Kind::Null,
            _ => bail!("invalid record kind tag: {}", b),
        })
    }

    /// Kinds that sit in the sibling chain and may have children.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Kind::DocumentRoot
                | Kind::Element
                | Kind::Text
                | Kind::Comment
                | Kind::ProcessingInstruction
                | Kind::Path
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRootNode {
    pub node: NodeDelegate,
    pub structure: StructNodeDelegate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementNode {
    pub node: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub name: NameNodeDelegate,
    pub attribute_keys: SmallVec<[u64; 4]>,
    /// Local-name key of each attribute, for O(1) lookup by name. Inverse
    /// of the per-attribute name: every value is a member of
    /// `attribute_keys`.
    pub attribute_names: HashMap<i32, u64>,
    pub namespace_keys: SmallVec<[u64; 2]>,
}

impl ElementNode {
    pub fn attribute_count(&self) -> usize {
        self.attribute_keys.len()
    }

    pub fn namespace_count(&self) -> usize {
        self.namespace_keys.len()
    }

    pub fn attribute_key_by_name(&self, local_name_key: i32) -> Option<u64> {
        self.attribute_names.get(&local_name_key).copied()
    }

    pub fn insert_attribute(&mut self, attribute_key: u64, local_name_key: i32) {
        self.attribute_keys.push(attribute_key);
        self.attribute_names.insert(local_name_key, attribute_key);
    }

    pub fn remove_attribute(&mut self, attribute_key: u64) {
        self.attribute_keys.retain(|k| *k != attribute_key);
        self.attribute_names.retain(|_, &mut v| v != attribute_key);
    }

    pub fn insert_namespace(&mut self, namespace_key: u64) {
        self.namespace_keys.push(namespace_key);
    }

    pub fn remove_namespace(&mut self, namespace_key: u64) {
        self.namespace_keys.retain(|k| *k != namespace_key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeNode {
    pub node: NodeDelegate,
    pub name: NameNodeDelegate,
    pub value: ValueDelegate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceNode {
    pub node: NodeDelegate,
    pub name: NameNodeDelegate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextNode {
    pub node: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub value: ValueDelegate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentNode {
    pub node: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub value: ValueDelegate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiNode {
    pub node: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub name: NameNodeDelegate,
    pub value: ValueDelegate,
}

/// One unique root-to-node name path. Reference-counted by the named nodes
/// sharing the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNode {
    pub node: NodeDelegate,
    pub structure: StructNodeDelegate,
    pub name: NameNodeDelegate,
    /// Kind of the nodes this path classifies (element, attribute, ...).
    pub referenced_kind: Kind,
    /// Depth of the path, document root at 0.
    pub level: u32,
    /// Number of live document nodes on this path.
    pub references: u64,
}

impl PathNode {
    pub fn increment_references(&mut self) {
        self.references += 1;
    }

    pub fn decrement_references(&mut self) {
        debug_assert!(self.references > 0, "path reference underflow");
        self.references -= 1;
    }
}

/// One entry of a secondary-index AVL tree. The parent key lives in the
/// node delegate; `changed` marks nodes awaiting a rebalancing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvlNode {
    pub node: NodeDelegate,
    pub key: IndexKey,
    pub value: NodeReferences,
    pub left_child: u64,
    pub right_child: u64,
    pub changed: bool,
}

impl AvlNode {
    pub fn has_left_child(&self) -> bool {
        self.left_child != NULL_NODE_KEY
    }

    pub fn has_right_child(&self) -> bool {
        self.right_child != NULL_NODE_KEY
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedNode {
    pub node: NodeDelegate,
}

/// A record: one tagged variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    DocumentRoot(DocumentRootNode),
    Element(ElementNode),
    Attribute(AttributeNode),
    Namespace(NamespaceNode),
    Text(TextNode),
    Comment(CommentNode),
    ProcessingInstruction(PiNode),
    Path(PathNode),
    Avl(AvlNode),
    Deleted(DeletedNode),
    Null,
}

impl Node {
    pub fn kind(&self) -> Kind {
        match self {
            Node::DocumentRoot(_) => Kind::DocumentRoot,
            Node::Element(_) => Kind::Element,
            Node::Attribute(_) => Kind::Attribute,
            Node::Namespace(_) => Kind::Namespace,
            Node::Text(_) => Kind::Text,
            Node::Comment(_) => Kind::Comment,
            Node::ProcessingInstruction(_) => Kind::ProcessingInstruction,
            Node::Path(_) => Kind::Path,
            Node::Avl(_) => Kind::Avl,
            Node::Deleted(_) => Kind::Deleted,
            Node::Null => Kind::Null,
        }
    }

    pub fn delegate(&self) -> Option<&NodeDelegate> {
        match self {
            Node::DocumentRoot(n) => Some(&n.node),
            Node::Element(n) => Some(&n.node),
            Node::Attribute(n) => Some(&n.node),
            Node::Namespace(n) => Some(&n.node),
            Node::Text(n) => Some(&n.node),
            Node::Comment(n) => Some(&n.node),
            Node::ProcessingInstruction(n) => Some(&n.node),
            Node::Path(n) => Some(&n.node),
            Node::Avl(n) => Some(&n.node),
            Node::Deleted(n) => Some(&n.node),
            Node::Null => None,
        }
    }

    pub fn delegate_mut(&mut self) -> Option<&mut NodeDelegate> {
        match self {
            Node::DocumentRoot(n) => Some(&mut n.node),
            Node::Element(n) => Some(&mut n.node),
            Node::Attribute(n) => Some(&mut n.node),
            Node::Namespace(n) => Some(&mut n.node),
            Node::Text(n) => Some(&mut n.node),
            Node::Comment(n) => Some(&mut n.node),
            Node::ProcessingInstruction(n) => Some(&mut n.node),
            Node::Path(n) => Some(&mut n.node),
            Node::Avl(n) => Some(&mut n.node),
            Node::Deleted(n) => Some(&mut n.node),
            Node::Null => None,
        }
    }

    pub fn node_key(&self) -> u64 {
        self.delegate().map_or(NULL_NODE_KEY, |d| d.node_key)
    }

    pub fn parent_key(&self) -> u64 {
        self.delegate().map_or(NULL_NODE_KEY, |d| d.parent_key)
    }

    pub fn hash(&self) -> u64 {
        self.delegate().map_or(0, |d| d.hash)
    }

    pub fn structure(&self) -> Option<&StructNodeDelegate> {
        match self {
            Node::DocumentRoot(n) => Some(&n.structure),
            Node::Element(n) => Some(&n.structure),
            Node::Text(n) => Some(&n.structure),
            Node::Comment(n) => Some(&n.structure),
            Node::ProcessingInstruction(n) => Some(&n.structure),
            Node::Path(n) => Some(&n.structure),
            _ => None,
        }
    }

    pub fn structure_mut(&mut self) -> Option<&mut StructNodeDelegate> {
        match self {
            Node::DocumentRoot(n) => Some(&mut n.structure),
            Node::Element(n) => Some(&mut n.structure),
            Node::Text(n) => Some(&mut n.structure),
            Node::Comment(n) => Some(&mut n.structure),
            Node::ProcessingInstruction(n) => Some(&mut n.structure),
            Node::Path(n) => Some(&mut n.structure),
            _ => None,
        }
    }

    pub fn name_delegate(&self) -> Option<&NameNodeDelegate> {
        match self {
            Node::Element(n) => Some(&n.name),
            Node::Attribute(n) => Some(&n.name),
            Node::Namespace(n) => Some(&n.name),
            Node::ProcessingInstruction(n) => Some(&n.name),
            Node::Path(n) => Some(&n.name),
            _ => None,
        }
    }

    pub fn name_delegate_mut(&mut self) -> Option<&mut NameNodeDelegate> {
        match self {
            Node::Element(n) => Some(&mut n.name),
            Node::Attribute(n) => Some(&mut n.name),
            Node::Namespace(n) => Some(&mut n.name),
            Node::ProcessingInstruction(n) => Some(&mut n.name),
            Node::Path(n) => Some(&mut n.name),
            _ => None,
        }
    }

    pub fn value_delegate(&self) -> Option<&ValueDelegate> {
        match self {
            Node::Attribute(n) => Some(&n.value),
            Node::Text(n) => Some(&n.value),
            Node::Comment(n) => Some(&n.value),
            Node::ProcessingInstruction(n) => Some(&n.value),
            _ => None,
        }
    }

    pub fn value_delegate_mut(&mut self) -> Option<&mut ValueDelegate> {
        match self {
            Node::Attribute(n) => Some(&mut n.value),
            Node::Text(n) => Some(&mut n.value),
            Node::Comment(n) => Some(&mut n.value),
            Node::ProcessingInstruction(n) => Some(&mut n.value),
            _ => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Node::Deleted(_))
    }

    /// Hash over the node's own content (not its subtree); the rolling
    /// ancestor hashes fold these together.
    pub fn content_hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.kind() as u8);
        buf.extend_from_slice(&self.node_key().to_be_bytes());
        if let Some(name) = self.name_delegate() {
            buf.extend_from_slice(&name.uri_key.to_be_bytes());
            buf.extend_from_slice(&name.prefix_key.to_be_bytes());
            buf.extend_from_slice(&name.local_name_key.to_be_bytes());
        }
        if let Some(value) = self.value_delegate() {
            buf.push(value.is_compressed() as u8);
            buf.extend_from_slice(value.stored());
        }
        xxh3_64(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(key: u64) -> Node {
        Node::Element(ElementNode {
            node: NodeDelegate::new(key, 0, 1, None),
            structure: StructNodeDelegate::detached(),
            name: NameNodeDelegate::new(-1, -1, 77, 0),
            attribute_keys: SmallVec::new(),
            attribute_names: HashMap::new(),
            namespace_keys: SmallVec::new(),
        })
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            Kind::DocumentRoot,
            Kind::Element,
            Kind::Attribute,
            Kind::Namespace,
            Kind::Text,
            Kind::Comment,
            Kind::ProcessingInstruction,
            Kind::Path,
            Kind::Avl,
            Kind::Deleted,
            Kind::Null,
        ] {
            assert_eq!(Kind::from_byte(kind as u8).unwrap(), kind);
        }
        assert!(Kind::from_byte(0).is_err());
        assert!(Kind::from_byte(200).is_err());
    }

    #[test]
    fn element_attribute_map_stays_consistent() {
        let mut node = element(5);
        let Node::Element(e) = &mut node else {
            unreachable!()
        };
        e.insert_attribute(10, 100);
        e.insert_attribute(11, 101);
        assert_eq!(e.attribute_count(), 2);
        assert_eq!(e.attribute_key_by_name(100), Some(10));

        e.remove_attribute(10);
        assert_eq!(e.attribute_count(), 1);
        assert_eq!(e.attribute_key_by_name(100), None);
        assert_eq!(e.attribute_key_by_name(101), Some(11));
    }

    #[test]
    fn content_hash_reflects_name_changes() {
        let a = element(5);
        let mut b = element(5);
        assert_eq!(a.content_hash(), b.content_hash());

        b.name_delegate_mut().unwrap().local_name_key = 78;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn null_node_has_no_delegates() {
        let node = Node::Null;
        assert_eq!(node.kind(), Kind::Null);
        assert!(node.delegate().is_none());
        assert_eq!(node.node_key(), NULL_NODE_KEY);
    }
}
