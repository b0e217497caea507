//! # Node Write Transaction
//!
//! The single mutation surface of a resource: structural inserts, subtree
//! moves and copies, renames, value updates and removals, expressed as
//! record operations on the page write transaction. Every mutation keeps
//! the structural invariants intact before it returns:
//!
//! 1. sibling chains stay doubly linked and parent/child links agree,
//! 2. ancestor child/descendant counts match the actual subtrees,
//! 3. rolling hashes are folded up the ancestor chain,
//! 4. the path summary reference-counts every named node's path,
//! 5. registered name/path/CAS indexes see every binding change.
//!
//! The transaction auto-commits when the staged page count or byte size
//! crosses the configured thresholds; otherwise changes become durable
//! only on `commit`. `rollback` abandons the in-progress revision.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::{
    AUTO_COMMIT_MAX_DIRTY_PAGES, AUTO_COMMIT_MAX_LOG_BYTES, DOCUMENT_NODE_KEY, HASH_FOLD_PRIME,
    NULL_NAME_KEY, NULL_NODE_KEY,
};
use crate::index::avl::{AvlTreeWriter, MoveCursor};
use crate::index::path_summary;
use crate::index::{CasValue, IndexDef, IndexKey, IndexType, NodeReferences, ValueType};
use crate::name::{name_key, QName};
use crate::node::{
    AttributeNode, CommentNode, DeweyId, ElementNode, Kind, NameNodeDelegate, NamespaceNode, Node,
    NodeDelegate, PiNode, StructNodeDelegate, TextNode, ValueDelegate,
};
use crate::page::PageKind;
use crate::resource::ResourceInner;
use crate::trx::node_read::{MoveResult, NodeReadTrx};
use crate::trx::write::PageWriteTrx;

/// Document records live in index 0 of the record family.
const REC: PageKind = PageKind::Record;
const REC_IDX: u32 = 0;

/// One event of a streamed subtree, as produced by a shredder or by
/// serializing another transaction's subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtreeEvent {
    StartElement {
        name: QName,
        attributes: Vec<(QName, Vec<u8>)>,
        namespaces: Vec<QName>,
    },
    Text(Vec<u8>),
    Comment(Vec<u8>),
    ProcessingInstruction { target: QName, data: Vec<u8> },
    EndElement,
}

/// Where a new node lands relative to the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertPos {
    FirstChild,
    LeftSibling,
    RightSibling,
}

/// The exclusive tree mutation transaction of a resource.
pub struct NodeWriteTrx {
    page: PageWriteTrx,
    resource: Arc<ResourceInner>,
    current: u64,
}

impl std::fmt::Debug for NodeWriteTrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeWriteTrx")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl NodeWriteTrx {
    pub(crate) fn open(resource: Arc<ResourceInner>) -> Result<Self> {
        let page = PageWriteTrx::open(Arc::clone(&resource))?;
        Ok(Self {
            page,
            resource,
            current: DOCUMENT_NODE_KEY,
        })
    }

    /// The revision this transaction is building.
    pub fn revision(&self) -> u32 {
        self.page.revision()
    }

    pub fn max_node_key(&self) -> u64 {
        self.page.max_node_key()
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    pub fn node_key(&self) -> u64 {
        self.current
    }

    pub fn kind(&mut self) -> Result<Kind> {
        Ok(self.current_node()?.kind())
    }

    /// A clone of the node under the cursor, observing this
    /// transaction's own writes.
    pub fn node(&mut self) -> Result<Node> {
        self.current_node()
    }

    pub fn move_to(&mut self, key: u64) -> Result<MoveResult> {
        if key == NULL_NODE_KEY {
            return Ok(MoveResult::NotMoved);
        }
        if self.page.get_record(key, REC, REC_IDX)?.is_some() {
            self.current = key;
            return Ok(MoveResult::Moved);
        }
        Ok(MoveResult::NotMoved)
    }

    pub fn move_to_document_root(&mut self) -> Result<MoveResult> {
        self.move_to(DOCUMENT_NODE_KEY)
    }

    pub fn move_to_parent(&mut self) -> Result<MoveResult> {
        let parent = self.current_node()?.parent_key();
        self.move_to(parent)
    }

    pub fn move_to_first_child(&mut self) -> Result<MoveResult> {
        let child = self
            .current_node()?
            .structure()
            .map_or(NULL_NODE_KEY, |s| s.first_child);
        self.move_to(child)
    }

    pub fn move_to_left_sibling(&mut self) -> Result<MoveResult> {
        let sibling = self
            .current_node()?
            .structure()
            .map_or(NULL_NODE_KEY, |s| s.left_sibling);
        self.move_to(sibling)
    }

    pub fn move_to_right_sibling(&mut self) -> Result<MoveResult> {
        let sibling = self
            .current_node()?
            .structure()
            .map_or(NULL_NODE_KEY, |s| s.right_sibling);
        self.move_to(sibling)
    }

    pub fn get_name(&mut self) -> Result<Option<QName>> {
        let node = self.current_node()?;
        Ok(self.resolve_name(&node))
    }

    pub fn get_value(&mut self) -> Result<Option<Vec<u8>>> {
        let node = self.current_node()?;
        match node.value_delegate() {
            Some(value) => Ok(Some(value.value()?.into_owned())),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Element / text / comment / PI insertion
    // ------------------------------------------------------------------

    pub fn insert_element_as_first_child(&mut self, name: &QName) -> Result<u64> {
        self.insert_element(name, InsertPos::FirstChild)
    }

    pub fn insert_element_as_left_sibling(&mut self, name: &QName) -> Result<u64> {
        self.insert_element(name, InsertPos::LeftSibling)
    }

    pub fn insert_element_as_right_sibling(&mut self, name: &QName) -> Result<u64> {
        self.insert_element(name, InsertPos::RightSibling)
    }

    pub fn insert_text_as_first_child(&mut self, value: &[u8]) -> Result<u64> {
        self.insert_value_node(Kind::Text, value, InsertPos::FirstChild)
    }

    pub fn insert_text_as_left_sibling(&mut self, value: &[u8]) -> Result<u64> {
        self.insert_value_node(Kind::Text, value, InsertPos::LeftSibling)
    }

    pub fn insert_text_as_right_sibling(&mut self, value: &[u8]) -> Result<u64> {
        self.insert_value_node(Kind::Text, value, InsertPos::RightSibling)
    }

    pub fn insert_comment_as_first_child(&mut self, value: &[u8]) -> Result<u64> {
        self.insert_value_node(Kind::Comment, value, InsertPos::FirstChild)
    }

    pub fn insert_comment_as_right_sibling(&mut self, value: &[u8]) -> Result<u64> {
        self.insert_value_node(Kind::Comment, value, InsertPos::RightSibling)
    }

    pub fn insert_pi_as_first_child(&mut self, target: &QName, data: &[u8]) -> Result<u64> {
        self.insert_pi(target, data, InsertPos::FirstChild)
    }

    pub fn insert_pi_as_right_sibling(&mut self, target: &QName, data: &[u8]) -> Result<u64> {
        self.insert_pi(target, data, InsertPos::RightSibling)
    }

    fn insert_element(&mut self, name: &QName, pos: InsertPos) -> Result<u64> {
        ensure!(
            !name.local_name.is_empty(),
            "element names need a local part"
        );
        let (parent_key, left_key, right_key) = self.insertion_anchor(pos)?;
        let parent_path = self.element_path_of(parent_key)?;
        let path_key =
            path_summary::get_or_create(&mut self.page, parent_path, name, Kind::Element)?;
        let (uri_key, prefix_key, local_key) = self.create_name_keys(name, Kind::Element)?;

        let key = self.page.new_record_key(REC, REC_IDX)?;
        let dewey = self.dewey_between(parent_key, left_key, right_key)?;
        let node = Node::Element(ElementNode {
            node: NodeDelegate::new(key, parent_key, self.page.revision(), dewey),
            structure: StructNodeDelegate::new(NULL_NODE_KEY, left_key, right_key),
            name: NameNodeDelegate::new(uri_key, prefix_key, local_key, path_key),
            attribute_keys: SmallVec::new(),
            attribute_names: HashMap::new(),
            namespace_keys: SmallVec::new(),
        });
        self.attach_structural(node)?;
        self.index_apply_node(key, true)?;
        self.maybe_auto_commit()?;
        Ok(key)
    }

    fn insert_value_node(&mut self, kind: Kind, value: &[u8], pos: InsertPos) -> Result<u64> {
        let (parent_key, left_key, right_key) = self.insertion_anchor(pos)?;
        let key = self.page.new_record_key(REC, REC_IDX)?;
        let dewey = self.dewey_between(parent_key, left_key, right_key)?;
        let delegate = NodeDelegate::new(key, parent_key, self.page.revision(), dewey);
        let structure = StructNodeDelegate::new(NULL_NODE_KEY, left_key, right_key);
        let value = ValueDelegate::new(value.to_vec(), self.resource.options.compression);
        let node = match kind {
            Kind::Text => Node::Text(TextNode {
                node: delegate,
                structure,
                value,
            }),
            Kind::Comment => Node::Comment(CommentNode {
                node: delegate,
                structure,
                value,
            }),
            _ => bail!("{:?} is not a value-only node kind", kind),
        };
        self.attach_structural(node)?;
        self.index_apply_node(key, true)?;
        self.maybe_auto_commit()?;
        Ok(key)
    }

    fn insert_pi(&mut self, target: &QName, data: &[u8], pos: InsertPos) -> Result<u64> {
        ensure!(
            !target.local_name.is_empty(),
            "processing instructions need a target name"
        );
        let (parent_key, left_key, right_key) = self.insertion_anchor(pos)?;
        let parent_path = self.element_path_of(parent_key)?;
        let path_key = path_summary::get_or_create(
            &mut self.page,
            parent_path,
            target,
            Kind::ProcessingInstruction,
        )?;
        let (uri_key, prefix_key, local_key) =
            self.create_name_keys(target, Kind::ProcessingInstruction)?;

        let key = self.page.new_record_key(REC, REC_IDX)?;
        let dewey = self.dewey_between(parent_key, left_key, right_key)?;
        let node = Node::ProcessingInstruction(PiNode {
            node: NodeDelegate::new(key, parent_key, self.page.revision(), dewey),
            structure: StructNodeDelegate::new(NULL_NODE_KEY, left_key, right_key),
            name: NameNodeDelegate::new(uri_key, prefix_key, local_key, path_key),
            value: ValueDelegate::new(data.to_vec(), self.resource.options.compression),
        });
        self.attach_structural(node)?;
        self.index_apply_node(key, true)?;
        self.maybe_auto_commit()?;
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Attributes and namespaces
    // ------------------------------------------------------------------

    /// Inserts an attribute on the element under the cursor. The cursor
    /// stays on the element; the new attribute's key is returned.
    pub fn insert_attribute(&mut self, name: &QName, value: &[u8]) -> Result<u64> {
        ensure!(
            !name.local_name.is_empty(),
            "attribute names need a local part"
        );
        let element_key = self.current;
        let element = match self.current_node()? {
            Node::Element(element) => element,
            other => bail!("cannot insert an attribute on a {:?} node", other.kind()),
        };
        let local_hash = name_key(&name.local_name, Kind::Attribute);
        ensure!(
            element.attribute_key_by_name(local_hash).is_none(),
            "duplicate attribute name {:?} on node {}",
            name.local_name,
            element_key
        );

        let path_key = path_summary::get_or_create(
            &mut self.page,
            element.name.path_node_key,
            name,
            Kind::Attribute,
        )?;
        let (uri_key, prefix_key, local_key) = self.create_name_keys(name, Kind::Attribute)?;

        let key = self.page.new_record_key(REC, REC_IDX)?;
        let node = Node::Attribute(AttributeNode {
            node: NodeDelegate::new(key, element_key, self.page.revision(), None),
            name: NameNodeDelegate::new(uri_key, prefix_key, local_key, path_key),
            value: ValueDelegate::new(value.to_vec(), self.resource.options.compression),
        });
        let content = node.content_hash();
        self.page.create_entry(key, node, REC, REC_IDX)?;
        match self.prepare(element_key)? {
            Node::Element(element) => element.insert_attribute(key, local_key),
            other => bail!("attribute parent is a {:?} node", other.kind()),
        }
        if self.hashes_enabled() {
            self.prepare(key)?.delegate_mut().unwrap().hash = content; // INVARIANT: attributes have delegates
            self.hash_propagate(element_key, content, true)?;
        }
        self.index_apply_node(key, true)?;
        self.maybe_auto_commit()?;
        Ok(key)
    }

    /// Declares a namespace on the element under the cursor.
    pub fn insert_namespace(&mut self, name: &QName) -> Result<u64> {
        ensure!(name.has_uri(), "namespace declarations need a URI");
        let element_key = self.current;
        let element = match self.current_node()? {
            Node::Element(element) => element,
            other => bail!("cannot insert a namespace on a {:?} node", other.kind()),
        };

        let path_key = path_summary::get_or_create(
            &mut self.page,
            element.name.path_node_key,
            name,
            Kind::Namespace,
        )?;
        let uri_key = self.page.create_name_key(&name.uri, Kind::Namespace)?;
        let prefix_key = if name.has_prefix() {
            self.page.create_name_key(&name.prefix, Kind::Namespace)?
        } else {
            NULL_NAME_KEY
        };

        let key = self.page.new_record_key(REC, REC_IDX)?;
        let node = Node::Namespace(NamespaceNode {
            node: NodeDelegate::new(key, element_key, self.page.revision(), None),
            name: NameNodeDelegate::new(uri_key, prefix_key, NULL_NAME_KEY, path_key),
        });
        let content = node.content_hash();
        self.page.create_entry(key, node, REC, REC_IDX)?;
        match self.prepare(element_key)? {
            Node::Element(element) => element.insert_namespace(key),
            other => bail!("namespace parent is a {:?} node", other.kind()),
        }
        if self.hashes_enabled() {
            self.prepare(key)?.delegate_mut().unwrap().hash = content; // INVARIANT: namespaces have delegates
            self.hash_propagate(element_key, content, true)?;
        }
        self.index_apply_node(key, true)?;
        self.maybe_auto_commit()?;
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Subtree streams
    // ------------------------------------------------------------------

    pub fn insert_subtree_as_first_child(
        &mut self,
        events: impl IntoIterator<Item = SubtreeEvent>,
    ) -> Result<u64> {
        self.insert_subtree(events, InsertPos::FirstChild)
    }

    pub fn insert_subtree_as_left_sibling(
        &mut self,
        events: impl IntoIterator<Item = SubtreeEvent>,
    ) -> Result<u64> {
        self.insert_subtree(events, InsertPos::LeftSibling)
    }

    pub fn insert_subtree_as_right_sibling(
        &mut self,
        events: impl IntoIterator<Item = SubtreeEvent>,
    ) -> Result<u64> {
        self.insert_subtree(events, InsertPos::RightSibling)
    }

    /// Drains an event stream into the tree at the given position. The
    /// cursor finishes on the first inserted node.
    fn insert_subtree(
        &mut self,
        events: impl IntoIterator<Item = SubtreeEvent>,
        initial_pos: InsertPos,
    ) -> Result<u64> {
        let mut pos = initial_pos;
        let mut root_key: Option<u64> = None;
        let mut depth = 0u32;

        for event in events {
            match event {
                SubtreeEvent::StartElement {
                    name,
                    attributes,
                    namespaces,
                } => {
                    let key = self.insert_element(&name, pos)?;
                    root_key.get_or_insert(key);
                    for namespace in &namespaces {
                        self.insert_namespace(namespace)?;
                    }
                    for (attribute_name, attribute_value) in &attributes {
                        self.insert_attribute(attribute_name, attribute_value)?;
                    }
                    pos = InsertPos::FirstChild;
                    depth += 1;
                }
                SubtreeEvent::Text(value) => {
                    let key = self.insert_value_node(Kind::Text, &value, pos)?;
                    root_key.get_or_insert(key);
                    pos = InsertPos::RightSibling;
                }
                SubtreeEvent::Comment(value) => {
                    let key = self.insert_value_node(Kind::Comment, &value, pos)?;
                    root_key.get_or_insert(key);
                    pos = InsertPos::RightSibling;
                }
                SubtreeEvent::ProcessingInstruction { target, data } => {
                    let key = self.insert_pi(&target, &data, pos)?;
                    root_key.get_or_insert(key);
                    pos = InsertPos::RightSibling;
                }
                SubtreeEvent::EndElement => {
                    ensure!(depth > 0, "unbalanced subtree event stream");
                    if pos != InsertPos::FirstChild {
                        // The cursor sits on the element's last child.
                        self.move_to_parent()?;
                    }
                    pos = InsertPos::RightSibling;
                    depth -= 1;
                }
            }
        }
        ensure!(depth == 0, "unterminated elements in subtree event stream");

        let root = root_key.ok_or_else(|| eyre::eyre!("empty subtree event stream"))?;
        self.current = root;
        Ok(root)
    }

    pub fn copy_subtree_as_first_child(&mut self, source: &NodeReadTrx) -> Result<u64> {
        let events = subtree_events(source, source.node_key())?;
        self.insert_subtree(events, InsertPos::FirstChild)
    }

    pub fn copy_subtree_as_left_sibling(&mut self, source: &NodeReadTrx) -> Result<u64> {
        let events = subtree_events(source, source.node_key())?;
        self.insert_subtree(events, InsertPos::LeftSibling)
    }

    pub fn copy_subtree_as_right_sibling(&mut self, source: &NodeReadTrx) -> Result<u64> {
        let events = subtree_events(source, source.node_key())?;
        self.insert_subtree(events, InsertPos::RightSibling)
    }

    // ------------------------------------------------------------------
    // Subtree moves
    // ------------------------------------------------------------------

    pub fn move_subtree_to_first_child(&mut self, from_key: u64) -> Result<()> {
        self.move_subtree(from_key, InsertPos::FirstChild)
    }

    pub fn move_subtree_to_left_sibling(&mut self, from_key: u64) -> Result<()> {
        self.move_subtree(from_key, InsertPos::LeftSibling)
    }

    pub fn move_subtree_to_right_sibling(&mut self, from_key: u64) -> Result<()> {
        self.move_subtree(from_key, InsertPos::RightSibling)
    }

    fn move_subtree(&mut self, from_key: u64, pos: InsertPos) -> Result<()> {
        ensure!(
            from_key != DOCUMENT_NODE_KEY && from_key != NULL_NODE_KEY,
            "cannot move the document root"
        );
        let from = self.node_at(from_key)?;
        ensure!(
            from.structure().is_some() && from.kind() != Kind::DocumentRoot,
            "cannot move a {:?} node",
            from.kind()
        );

        let (parent_key, left_key, right_key) = self.insertion_anchor(pos)?;
        ensure!(
            left_key != from_key && right_key != from_key && parent_key != from_key,
            "node {} is already at the requested position",
            from_key
        );

        // Cycle prevention: the destination must not live inside the
        // moved subtree.
        let mut ancestor = parent_key;
        while ancestor != NULL_NODE_KEY {
            ensure!(
                ancestor != from_key,
                "cannot move node {} below its own descendant",
                from_key
            );
            ancestor = self.node_at(ancestor)?.parent_key();
        }

        let old_parent_path = self.element_path_of(from.parent_key())?;
        let subtree_size = from.structure().unwrap().descendant_count + 1; // INVARIANT: ensured structural
        let stored_hash = from.hash();

        self.detach_structural(&from, subtree_size, stored_hash)?;

        {
            let node = self.prepare(from_key)?;
            node.delegate_mut().unwrap().parent_key = parent_key; // INVARIANT: structural nodes have delegates
            let structure = node.structure_mut().unwrap();
            structure.left_sibling = left_key;
            structure.right_sibling = right_key;
        }
        if left_key != NULL_NODE_KEY {
            self.prepare_struct(left_key)?.right_sibling = from_key;
        } else {
            self.prepare_struct(parent_key)?.first_child = from_key;
        }
        if right_key != NULL_NODE_KEY {
            self.prepare_struct(right_key)?.left_sibling = from_key;
        }
        {
            let parent = self.prepare_struct(parent_key)?;
            parent.increment_child_count();
        }
        self.adjust_ancestor_descendants(parent_key, subtree_size as i64)?;
        if self.hashes_enabled() {
            self.hash_propagate(parent_key, stored_hash, true)?;
        }

        if self.resource.options.dewey_ids {
            self.relabel_subtree(from_key)?;
        }

        let new_parent_path = self.element_path_of(parent_key)?;
        if old_parent_path != new_parent_path {
            self.reassign_paths(from_key, old_parent_path, new_parent_path)?;
        }

        self.current = from_key;
        self.maybe_auto_commit()
    }

    // ------------------------------------------------------------------
    // Rename / value update / removal
    // ------------------------------------------------------------------

    /// Renames the named node under the cursor, keeping the path summary,
    /// the name dictionaries and the name indexes consistent.
    pub fn set_name(&mut self, name: &QName) -> Result<()> {
        let key = self.current;
        let node = self.current_node()?;
        let Some(old_name) = node.name_delegate().cloned() else {
            bail!("cannot rename a {:?} node", node.kind());
        };
        let kind = node.kind();
        let old_content = node.content_hash();
        let old_stored = node.hash();

        self.index_apply_node(key, false)?;

        let parent_path = self.element_path_of(node.parent_key())?;
        let old_path = old_name.path_node_key;
        let new_path = path_summary::get_or_create(&mut self.page, parent_path, name, kind)?;
        path_summary::release(&mut self.page, old_path)?;

        self.remove_name_keys(&old_name, kind)?;
        let (uri_key, prefix_key, local_key) = self.create_name_keys(name, kind)?;
        {
            let prepared = self.prepare(key)?;
            let name_delegate = prepared.name_delegate_mut().unwrap(); // INVARIANT: checked named above
            name_delegate.uri_key = uri_key;
            name_delegate.prefix_key = prefix_key;
            name_delegate.local_name_key = local_key;
            name_delegate.path_node_key = new_path;
        }

        // An element rename moves every descendant path.
        if kind == Kind::Element && old_path != new_path {
            self.reassign_children(key, old_path, new_path)?;
        }

        self.index_apply_node(key, true)?;

        if self.hashes_enabled() {
            let new_content = self.node_at(key)?.content_hash();
            self.hash_replace_content(key, old_stored, old_content, new_content)?;
        }
        self.maybe_auto_commit()
    }

    /// Replaces the value of the node under the cursor.
    pub fn set_value(&mut self, value: &[u8]) -> Result<()> {
        let key = self.current;
        let node = self.current_node()?;
        ensure!(
            node.value_delegate().is_some(),
            "cannot set a value on a {:?} node",
            node.kind()
        );
        let old_content = node.content_hash();
        let old_stored = node.hash();

        self.index_apply_node(key, false)?;
        {
            let compression = self.resource.options.compression;
            let prepared = self.prepare(key)?;
            *prepared.value_delegate_mut().unwrap() = // INVARIANT: checked above
                ValueDelegate::new(value.to_vec(), compression);
        }
        self.index_apply_node(key, true)?;

        if self.hashes_enabled() {
            let new_content = self.node_at(key)?.content_hash();
            self.hash_replace_content(key, old_stored, old_content, new_content)?;
        }
        self.maybe_auto_commit()
    }

    /// Removes the node under the cursor (and its whole subtree for
    /// structural nodes). The cursor moves to the right sibling, else the
    /// left sibling, else the parent.
    pub fn remove(&mut self) -> Result<()> {
        let node = self.current_node()?;
        match node.kind() {
            Kind::DocumentRoot => bail!("cannot remove the document root"),
            Kind::Attribute => self.remove_attribute_node(&node),
            Kind::Namespace => self.remove_namespace_node(&node),
            _ => self.remove_structural(&node),
        }?;
        self.maybe_auto_commit()
    }

    fn remove_attribute_node(&mut self, node: &Node) -> Result<()> {
        let key = node.node_key();
        let element_key = node.parent_key();

        self.index_apply_node(key, false)?;
        let name = node.name_delegate().unwrap().clone(); // INVARIANT: attributes are named
        path_summary::release(&mut self.page, name.path_node_key)?;
        self.remove_name_keys(&name, Kind::Attribute)?;

        if self.hashes_enabled() {
            self.hash_propagate(element_key, node.hash(), false)?;
        }
        match self.prepare(element_key)? {
            Node::Element(element) => element.remove_attribute(key),
            other => bail!("attribute parent is a {:?} node", other.kind()),
        }
        self.page.remove_entry(key, REC, REC_IDX)?;
        self.current = element_key;
        Ok(())
    }

    fn remove_namespace_node(&mut self, node: &Node) -> Result<()> {
        let key = node.node_key();
        let element_key = node.parent_key();

        let name = node.name_delegate().unwrap().clone(); // INVARIANT: namespaces are named
        path_summary::release(&mut self.page, name.path_node_key)?;
        self.page.remove_name(name.uri_key, Kind::Namespace)?;
        if name.prefix_key != NULL_NAME_KEY {
            self.page.remove_name(name.prefix_key, Kind::Namespace)?;
        }

        if self.hashes_enabled() {
            self.hash_propagate(element_key, node.hash(), false)?;
        }
        match self.prepare(element_key)? {
            Node::Element(element) => element.remove_namespace(key),
            other => bail!("namespace parent is a {:?} node", other.kind()),
        }
        self.page.remove_entry(key, REC, REC_IDX)?;
        self.current = element_key;
        Ok(())
    }

    fn remove_structural(&mut self, node: &Node) -> Result<()> {
        let root_key = node.node_key();
        let structure = node.structure().unwrap().clone(); // INVARIANT: structural checked by caller
        let subtree_size = structure.descendant_count + 1;
        let stored_hash = node.hash();

        // Unlink first so sibling/parent state is consistent even while
        // the subtree records are being tombstoned.
        self.detach_structural(node, subtree_size, stored_hash)?;

        // Tombstone depth-first (reversed pre-order), so a node's parent
        // is still resolvable while the node is handled and child paths
        // release before their parents.
        let keys = self.collect_subtree(root_key)?;
        for &key in keys.iter().rev() {
            let doomed = self.node_at(key)?;
            self.index_apply_node(key, false)?;
            if let Some(name) = doomed.name_delegate().cloned() {
                path_summary::release(&mut self.page, name.path_node_key)?;
                match doomed.kind() {
                    Kind::Namespace => {
                        self.page.remove_name(name.uri_key, Kind::Namespace)?;
                        if name.prefix_key != NULL_NAME_KEY {
                            self.page.remove_name(name.prefix_key, Kind::Namespace)?;
                        }
                    }
                    kind => self.remove_name_keys(&name, kind)?,
                }
            }
            self.page.remove_entry(key, REC, REC_IDX)?;
        }

        self.current = if structure.right_sibling != NULL_NODE_KEY {
            structure.right_sibling
        } else if structure.left_sibling != NULL_NODE_KEY {
            structure.left_sibling
        } else {
            node.parent_key()
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Index management
    // ------------------------------------------------------------------

    /// Declares a CAS index and builds it over the existing document.
    pub fn create_cas_index(
        &mut self,
        number: u32,
        content_type: ValueType,
        paths: Vec<String>,
    ) -> Result<()> {
        let def = IndexDef::cas(number, content_type, paths);
        self.resource.register_index(def.clone())?;
        AvlTreeWriter::open(&mut self.page, PageKind::Cas, number)?;
        self.build_index(&def)
    }

    /// Declares a name index and builds it over the existing document.
    pub fn create_name_index(&mut self, number: u32) -> Result<()> {
        let def = IndexDef::name(number);
        self.resource.register_index(def.clone())?;
        AvlTreeWriter::open(&mut self.page, PageKind::Name, number)?;
        self.build_index(&def)
    }

    /// Declares a path index and builds it over the existing document.
    pub fn create_path_index(&mut self, number: u32, paths: Vec<String>) -> Result<()> {
        let def = IndexDef::path(number, paths);
        self.resource.register_index(def.clone())?;
        AvlTreeWriter::open(&mut self.page, PageKind::Path, number)?;
        self.build_index(&def)
    }

    fn build_index(&mut self, def: &IndexDef) -> Result<()> {
        debug!(?def, "building index over the existing document");
        let keys = self.collect_subtree(DOCUMENT_NODE_KEY)?;
        for key in keys {
            self.index_apply_def(def, key, true)?;
        }
        Ok(())
    }

    /// Applies or retracts every registered index binding of a node.
    fn index_apply_node(&mut self, key: u64, add: bool) -> Result<()> {
        let defs = self.resource.index_defs();
        for def in &defs {
            self.index_apply_def(def, key, add)?;
        }
        Ok(())
    }

    fn index_apply_def(&mut self, def: &IndexDef, key: u64, add: bool) -> Result<()> {
        let node = self.node_at(key)?;
        match def.index_type {
            IndexType::Name => self.apply_name_index(def, &node, add),
            IndexType::Path => self.apply_path_index(def, &node, add),
            IndexType::Cas => self.apply_cas_index(def, &node, add),
        }
    }

    fn apply_name_index(&mut self, def: &IndexDef, node: &Node, add: bool) -> Result<()> {
        if !matches!(
            node.kind(),
            Kind::Element | Kind::Attribute | Kind::ProcessingInstruction
        ) {
            return Ok(());
        }
        let name_delegate = node.name_delegate().unwrap(); // INVARIANT: kinds above are named
        if !def.paths.is_empty() {
            let steps = path_summary::steps_for(&mut self.page, name_delegate.path_node_key)?;
            if !def.matches_path(&steps) {
                return Ok(());
            }
        }
        let Some(qname) = self.resolve_name(node) else {
            return Ok(());
        };
        let index_key = IndexKey::Name(qname);
        let node_key = node.node_key();
        let mut tree = AvlTreeWriter::open(&mut self.page, PageKind::Name, def.number)?;
        if add {
            tree.index(index_key, NodeReferences::single(node_key), MoveCursor::ToDocumentRoot)?;
        } else {
            tree.remove(&index_key, node_key)?;
        }
        Ok(())
    }

    fn apply_path_index(&mut self, def: &IndexDef, node: &Node, add: bool) -> Result<()> {
        let Some(name_delegate) = node.name_delegate() else {
            return Ok(());
        };
        let path_key = name_delegate.path_node_key;
        if !def.paths.is_empty() {
            let steps = path_summary::steps_for(&mut self.page, path_key)?;
            if !def.matches_path(&steps) {
                return Ok(());
            }
        }
        let node_key = node.node_key();
        let mut tree = AvlTreeWriter::open(&mut self.page, PageKind::Path, def.number)?;
        if add {
            tree.index(
                IndexKey::Path(path_key),
                NodeReferences::single(node_key),
                MoveCursor::ToDocumentRoot,
            )?;
        } else {
            tree.remove(&IndexKey::Path(path_key), node_key)?;
        }
        Ok(())
    }

    fn apply_cas_index(&mut self, def: &IndexDef, node: &Node, add: bool) -> Result<()> {
        let Some(value_delegate) = node.value_delegate() else {
            return Ok(());
        };
        let Some(path_context) = self.cas_path_context(node)? else {
            return Ok(());
        };
        if !def.paths.is_empty() {
            let steps = path_summary::steps_for(&mut self.page, path_context)?;
            if !def.matches_path(&steps) {
                return Ok(());
            }
        }
        let bytes = value_delegate.value()?;
        let Some(cas) = cas_value(def.content_type, &bytes, path_context) else {
            return Ok(());
        };
        let node_key = node.node_key();
        let mut tree = AvlTreeWriter::open(&mut self.page, PageKind::Cas, def.number)?;
        if add {
            tree.index(
                IndexKey::Cas(cas),
                NodeReferences::single(node_key),
                MoveCursor::ToDocumentRoot,
            )?;
        } else {
            tree.remove(&IndexKey::Cas(cas), node_key)?;
        }
        Ok(())
    }

    /// The path-summary node a value node's CAS entries are keyed under.
    fn cas_path_context(&mut self, node: &Node) -> Result<Option<u64>> {
        match node.kind() {
            Kind::Attribute | Kind::ProcessingInstruction => {
                Ok(Some(node.name_delegate().unwrap().path_node_key)) // INVARIANT: named kinds
            }
            Kind::Text | Kind::Comment => {
                let parent = self.node_at(node.parent_key())?;
                Ok(Some(match parent {
                    Node::Element(element) => element.name.path_node_key,
                    _ => DOCUMENT_NODE_KEY,
                }))
            }
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Commits the staged revision and keeps the transaction usable on
    /// top of it.
    pub fn commit(&mut self) -> Result<u32> {
        self.page.commit()
    }

    /// Abandons every staged change; the resource stays at the revision
    /// this transaction last committed or began on.
    pub fn rollback(&mut self) -> Result<()> {
        self.page.abort()?;
        self.current = DOCUMENT_NODE_KEY;
        Ok(())
    }

    fn maybe_auto_commit(&mut self) -> Result<()> {
        if self.page.dirty_page_count() > AUTO_COMMIT_MAX_DIRTY_PAGES
            || self.page.staged_bytes() > AUTO_COMMIT_MAX_LOG_BYTES
        {
            debug!(
                dirty = self.page.dirty_page_count(),
                bytes = self.page.staged_bytes(),
                "auto-committing"
            );
            self.page.commit()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn node_at(&mut self, key: u64) -> Result<Node> {
        self.page
            .get_record(key, REC, REC_IDX)?
            .ok_or_else(|| eyre::eyre!("node {} does not exist in this revision", key))
    }

    fn current_node(&mut self) -> Result<Node> {
        self.node_at(self.current)
    }

    fn prepare(&mut self, key: u64) -> Result<&mut Node> {
        self.page.prepare_entry_for_modification(key, REC, REC_IDX)
    }

    fn prepare_struct(&mut self, key: u64) -> Result<&mut StructNodeDelegate> {
        let node = self.prepare(key)?;
        let kind = node.kind();
        node.structure_mut()
            .ok_or_else(|| eyre::eyre!("{:?} node {} has no structure", kind, key))
    }

    fn hashes_enabled(&self) -> bool {
        self.resource.options.hashes
    }

    fn resolve_name(&self, node: &Node) -> Option<QName> {
        let name = node.name_delegate()?;
        let kind = node.kind();
        Some(QName {
            uri: self
                .page
                .get_name(name.uri_key, Kind::Namespace)
                .unwrap_or_default(),
            prefix: self.page.get_name(name.prefix_key, kind).unwrap_or_default(),
            local_name: self
                .page
                .get_name(name.local_name_key, kind)
                .unwrap_or_default(),
        })
    }

    /// Computes `(parent, left, right)` for a new node at `pos` relative
    /// to the cursor.
    fn insertion_anchor(&mut self, pos: InsertPos) -> Result<(u64, u64, u64)> {
        let current = self.current_node()?;
        let structure = current
            .structure()
            .ok_or_else(|| {
                eyre::eyre!("cannot insert relative to a {:?} node", current.kind())
            })?;
        match pos {
            InsertPos::FirstChild => {
                ensure!(
                    matches!(current.kind(), Kind::Element | Kind::DocumentRoot),
                    "{:?} nodes cannot take children",
                    current.kind()
                );
                Ok((current.node_key(), NULL_NODE_KEY, structure.first_child))
            }
            InsertPos::LeftSibling => {
                ensure!(
                    current.kind() != Kind::DocumentRoot,
                    "the document root has no siblings"
                );
                Ok((
                    current.parent_key(),
                    structure.left_sibling,
                    current.node_key(),
                ))
            }
            InsertPos::RightSibling => {
                ensure!(
                    current.kind() != Kind::DocumentRoot,
                    "the document root has no siblings"
                );
                Ok((
                    current.parent_key(),
                    current.node_key(),
                    structure.right_sibling,
                ))
            }
        }
    }

    /// Wires a freshly built structural node into the tree: sibling and
    /// parent links, ancestor counters, hash fold, cursor.
    fn attach_structural(&mut self, node: Node) -> Result<()> {
        let key = node.node_key();
        let parent_key = node.parent_key();
        let (left, right) = {
            let structure = node.structure().unwrap(); // INVARIANT: callers build structural nodes
            (structure.left_sibling, structure.right_sibling)
        };
        let content = node.content_hash();

        self.page.create_entry(key, node, REC, REC_IDX)?;

        if left != NULL_NODE_KEY {
            self.prepare_struct(left)?.right_sibling = key;
        } else {
            self.prepare_struct(parent_key)?.first_child = key;
        }
        if right != NULL_NODE_KEY {
            self.prepare_struct(right)?.left_sibling = key;
        }
        self.prepare_struct(parent_key)?.increment_child_count();
        self.adjust_ancestor_descendants(parent_key, 1)?;

        if self.hashes_enabled() {
            self.prepare(key)?.delegate_mut().unwrap().hash = content; // INVARIANT: structural nodes have delegates
            self.hash_propagate(parent_key, content, true)?;
        }
        self.current = key;
        Ok(())
    }

    /// Unlinks a structural node from its siblings and parent, rolling
    /// back ancestor counters and hashes for the whole subtree.
    fn detach_structural(&mut self, node: &Node, subtree_size: u64, stored_hash: u64) -> Result<()> {
        let key = node.node_key();
        let parent_key = node.parent_key();
        let structure = node.structure().unwrap(); // INVARIANT: callers check structural

        if structure.left_sibling != NULL_NODE_KEY {
            self.prepare_struct(structure.left_sibling)?.right_sibling = structure.right_sibling;
        }
        if structure.right_sibling != NULL_NODE_KEY {
            self.prepare_struct(structure.right_sibling)?.left_sibling = structure.left_sibling;
        }
        {
            let parent = self.prepare_struct(parent_key)?;
            if parent.first_child == key {
                parent.first_child = structure.right_sibling;
            }
            parent.decrement_child_count();
        }
        self.adjust_ancestor_descendants(parent_key, -(subtree_size as i64))?;
        if self.hashes_enabled() {
            self.hash_propagate(parent_key, stored_hash, false)?;
        }
        Ok(())
    }

    /// Adds `delta` to the descendant count of `start` and every
    /// ancestor above it.
    fn adjust_ancestor_descendants(&mut self, start: u64, delta: i64) -> Result<()> {
        let mut cursor = start;
        while cursor != NULL_NODE_KEY {
            let node = self.prepare(cursor)?;
            let parent = node.delegate().unwrap().parent_key; // INVARIANT: ancestors have delegates
            let structure = node
                .structure_mut()
                .ok_or_else(|| eyre::eyre!("ancestor {} has no structure", cursor))?;
            structure.descendant_count = if delta >= 0 {
                structure.descendant_count + delta as u64
            } else {
                structure.descendant_count.saturating_sub((-delta) as u64)
            };
            cursor = parent;
        }
        Ok(())
    }

    /// Folds `subtree_hash` into (or out of) every ancestor starting at
    /// `first_ancestor`. Multiplying the delta per level keeps the fold
    /// position-sensitive while staying exactly invertible.
    fn hash_propagate(&mut self, first_ancestor: u64, subtree_hash: u64, add: bool) -> Result<()> {
        let mut delta = subtree_hash.wrapping_mul(HASH_FOLD_PRIME);
        let mut cursor = first_ancestor;
        while cursor != NULL_NODE_KEY {
            let node = self.prepare(cursor)?;
            let delegate = node.delegate_mut().unwrap(); // INVARIANT: ancestors have delegates
            delegate.hash = if add {
                delegate.hash.wrapping_add(delta)
            } else {
                delegate.hash.wrapping_sub(delta)
            };
            cursor = delegate.parent_key;
            delta = delta.wrapping_mul(HASH_FOLD_PRIME);
        }
        Ok(())
    }

    /// Swaps a node's own content contribution inside its stored hash and
    /// propagates the difference upward.
    fn hash_replace_content(
        &mut self,
        key: u64,
        old_stored: u64,
        old_content: u64,
        new_content: u64,
    ) -> Result<()> {
        let new_stored = old_stored
            .wrapping_sub(old_content)
            .wrapping_add(new_content);
        let parent_key = {
            let node = self.prepare(key)?;
            let delegate = node.delegate_mut().unwrap(); // INVARIANT: named/value nodes have delegates
            delegate.hash = new_stored;
            delegate.parent_key
        };
        self.hash_propagate(parent_key, new_stored.wrapping_sub(old_stored), true)
    }

    fn create_name_keys(&mut self, name: &QName, kind: Kind) -> Result<(i32, i32, i32)> {
        let local_key = self.page.create_name_key(&name.local_name, kind)?;
        let prefix_key = if name.has_prefix() {
            self.page.create_name_key(&name.prefix, kind)?
        } else {
            NULL_NAME_KEY
        };
        let uri_key = if name.has_uri() {
            self.page.create_name_key(&name.uri, Kind::Namespace)?
        } else {
            NULL_NAME_KEY
        };
        Ok((uri_key, prefix_key, local_key))
    }

    fn remove_name_keys(&mut self, name: &NameNodeDelegate, kind: Kind) -> Result<()> {
        self.page.remove_name(name.local_name_key, kind)?;
        if name.prefix_key != NULL_NAME_KEY {
            self.page.remove_name(name.prefix_key, kind)?;
        }
        if name.uri_key != NULL_NAME_KEY {
            self.page.remove_name(name.uri_key, Kind::Namespace)?;
        }
        Ok(())
    }

    /// Path-summary node of `key` when it is an element; the summary
    /// anchor for the document root.
    fn element_path_of(&mut self, key: u64) -> Result<u64> {
        match self.node_at(key)? {
            Node::Element(element) => Ok(element.name.path_node_key),
            Node::DocumentRoot(_) => Ok(DOCUMENT_NODE_KEY),
            other => bail!("{:?} nodes anchor no paths", other.kind()),
        }
    }

    fn dewey_between(
        &mut self,
        parent_key: u64,
        left_key: u64,
        right_key: u64,
    ) -> Result<Option<DeweyId>> {
        if !self.resource.options.dewey_ids {
            return Ok(None);
        }
        let parent = self
            .node_at(parent_key)?
            .delegate()
            .and_then(|d| d.dewey_id.clone())
            .unwrap_or_else(DeweyId::document_root);
        let left = if left_key != NULL_NODE_KEY {
            self.node_at(left_key)?.delegate().and_then(|d| d.dewey_id.clone())
        } else {
            None
        };
        let right = if right_key != NULL_NODE_KEY {
            self.node_at(right_key)?
                .delegate()
                .and_then(|d| d.dewey_id.clone())
        } else {
            None
        };
        Ok(Some(DeweyId::new_between(
            &parent,
            left.as_ref(),
            right.as_ref(),
        )))
    }

    /// Recomputes the Dewey IDs of a moved subtree from its new position.
    fn relabel_subtree(&mut self, root_key: u64) -> Result<()> {
        let node = self.node_at(root_key)?;
        let structure = node.structure().unwrap(); // INVARIANT: moved nodes are structural
        let id = self.dewey_between(
            node.parent_key(),
            structure.left_sibling,
            structure.right_sibling,
        )?;
        self.prepare(root_key)?.delegate_mut().unwrap().dewey_id = id; // INVARIANT: structural nodes have delegates
        self.relabel_children(root_key)
    }

    fn relabel_children(&mut self, parent_key: u64) -> Result<()> {
        let parent_dewey = self
            .node_at(parent_key)?
            .delegate()
            .and_then(|d| d.dewey_id.clone())
            .unwrap_or_else(DeweyId::document_root);

        let mut child = self
            .node_at(parent_key)?
            .structure()
            .map_or(NULL_NODE_KEY, |s| s.first_child);
        let mut previous: Option<DeweyId> = None;
        while child != NULL_NODE_KEY {
            let id = DeweyId::new_between(&parent_dewey, previous.as_ref(), None);
            self.prepare(child)?.delegate_mut().unwrap().dewey_id = Some(id.clone()); // INVARIANT: structural
            previous = Some(id);
            self.relabel_children(child)?;
            child = self
                .node_at(child)?
                .structure()
                .map_or(NULL_NODE_KEY, |s| s.right_sibling);
        }
        Ok(())
    }

    /// Re-homes the path-summary bindings of a subtree whose parent path
    /// changed (move or rename), rewriting CAS entries whose keys embed
    /// the old paths.
    fn reassign_paths(&mut self, key: u64, old_parent_path: u64, new_parent_path: u64) -> Result<()> {
        if old_parent_path == new_parent_path {
            return Ok(());
        }
        let node = self.node_at(key)?;
        match &node {
            Node::Element(element) => {
                let old_path = element.name.path_node_key;
                let name = self
                    .resolve_name(&node)
                    .ok_or_else(|| eyre::eyre!("element {} has unresolvable names", key))?;
                let new_path = path_summary::get_or_create(
                    &mut self.page,
                    new_parent_path,
                    &name,
                    Kind::Element,
                )?;
                self.repoint_path(key, &node, old_path, new_path)?;
                self.reassign_children(key, old_path, new_path)
            }
            Node::ProcessingInstruction(pi) => {
                let old_path = pi.name.path_node_key;
                let name = self
                    .resolve_name(&node)
                    .ok_or_else(|| eyre::eyre!("node {} has unresolvable names", key))?;
                let new_path = path_summary::get_or_create(
                    &mut self.page,
                    new_parent_path,
                    &name,
                    Kind::ProcessingInstruction,
                )?;
                self.repoint_path(key, &node, old_path, new_path)
            }
            Node::Text(_) | Node::Comment(_) => {
                // Value entries are keyed under the parent element path.
                self.reindex_cas_under(&node, old_parent_path, new_parent_path)
            }
            _ => Ok(()),
        }
    }

    /// Re-homes an element's attributes, namespaces and children after
    /// the element's own path node changed.
    fn reassign_children(&mut self, element_key: u64, old_path: u64, new_path: u64) -> Result<()> {
        let node = self.node_at(element_key)?;
        let Node::Element(element) = &node else {
            return Ok(());
        };
        let attribute_keys: Vec<u64> = element.attribute_keys.to_vec();
        let namespace_keys: Vec<u64> = element.namespace_keys.to_vec();
        for attribute_key in attribute_keys {
            self.reassign_leaf_path(attribute_key, new_path)?;
        }
        for namespace_key in namespace_keys {
            self.reassign_leaf_path(namespace_key, new_path)?;
        }
        let mut child = element.structure.first_child;
        while child != NULL_NODE_KEY {
            self.reassign_paths(child, old_path, new_path)?;
            child = self
                .node_at(child)?
                .structure()
                .map_or(NULL_NODE_KEY, |s| s.right_sibling);
        }
        Ok(())
    }

    /// Moves an attribute or namespace to a path under its element's new
    /// path node.
    fn reassign_leaf_path(&mut self, key: u64, new_parent_path: u64) -> Result<()> {
        let node = self.node_at(key)?;
        let kind = node.kind();
        let old_path = node.name_delegate().unwrap().path_node_key; // INVARIANT: attrs/namespaces are named
        let name = self
            .resolve_name(&node)
            .ok_or_else(|| eyre::eyre!("node {} has unresolvable names", key))?;
        let new_path =
            path_summary::get_or_create(&mut self.page, new_parent_path, &name, kind)?;
        self.repoint_path(key, &node, old_path, new_path)
    }

    /// Rewrites one node's path binding: path/CAS index entries keyed by
    /// the old path move to the new one, the old path releases one
    /// reference.
    fn repoint_path(&mut self, key: u64, node: &Node, old_path: u64, new_path: u64) -> Result<()> {
        if old_path == new_path {
            // `get_or_create` took an extra reference for the same path.
            path_summary::release(&mut self.page, old_path)?;
            return Ok(());
        }
        let defs = self.resource.index_defs();
        for def in &defs {
            match def.index_type {
                IndexType::Path => {
                    let mut tree = AvlTreeWriter::open(&mut self.page, PageKind::Path, def.number)?;
                    tree.remove(&IndexKey::Path(old_path), key)?;
                }
                IndexType::Cas => {
                    if let Some(value_delegate) = node.value_delegate() {
                        let bytes = value_delegate.value()?.into_owned();
                        if let Some(cas) = cas_value(def.content_type, &bytes, old_path) {
                            let mut tree =
                                AvlTreeWriter::open(&mut self.page, PageKind::Cas, def.number)?;
                            tree.remove(&IndexKey::Cas(cas), key)?;
                        }
                    }
                }
                IndexType::Name => {}
            }
        }

        self.prepare(key)?
            .name_delegate_mut()
            .unwrap() // INVARIANT: callers pass named nodes
            .path_node_key = new_path;
        path_summary::release(&mut self.page, old_path)?;

        let fresh = self.node_at(key)?;
        for def in &defs {
            match def.index_type {
                IndexType::Path => self.apply_path_index(def, &fresh, true)?,
                IndexType::Cas => self.apply_cas_index(def, &fresh, true)?,
                IndexType::Name => {}
            }
        }
        Ok(())
    }

    /// Re-keys the CAS entries of a value node from one parent path to
    /// another.
    fn reindex_cas_under(&mut self, node: &Node, old_path: u64, new_path: u64) -> Result<()> {
        let Some(value_delegate) = node.value_delegate() else {
            return Ok(());
        };
        let bytes = value_delegate.value()?.into_owned();
        let node_key = node.node_key();
        let defs = self.resource.index_defs();
        for def in &defs {
            if def.index_type != IndexType::Cas {
                continue;
            }
            if let Some(old_cas) = cas_value(def.content_type, &bytes, old_path) {
                let mut tree = AvlTreeWriter::open(&mut self.page, PageKind::Cas, def.number)?;
                tree.remove(&IndexKey::Cas(old_cas), node_key)?;
            }
            if !def.paths.is_empty() {
                let steps = path_summary::steps_for(&mut self.page, new_path)?;
                if !def.matches_path(&steps) {
                    continue;
                }
            }
            if let Some(new_cas) = cas_value(def.content_type, &bytes, new_path) {
                let mut tree = AvlTreeWriter::open(&mut self.page, PageKind::Cas, def.number)?;
                tree.index(
                    IndexKey::Cas(new_cas),
                    NodeReferences::single(node_key),
                    MoveCursor::ToDocumentRoot,
                )?;
            }
        }
        Ok(())
    }

    /// Pre-order keys of a subtree, attributes and namespaces included.
    fn collect_subtree(&mut self, root: u64) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(key) = stack.pop() {
            let node = self.node_at(key)?;
            out.push(key);
            if let Node::Element(element) = &node {
                out.extend(element.namespace_keys.iter().copied());
                out.extend(element.attribute_keys.iter().copied());
            }
            if let Some(structure) = node.structure() {
                let mut children = Vec::new();
                let mut child = structure.first_child;
                while child != NULL_NODE_KEY {
                    children.push(child);
                    child = self
                        .node_at(child)?
                        .structure()
                        .map_or(NULL_NODE_KEY, |s| s.right_sibling);
                }
                stack.extend(children.into_iter().rev());
            }
        }
        Ok(out)
    }
}

/// Converts raw value bytes to a typed CAS key; `None` when the bytes are
/// not representable in the index's content type.
fn cas_value(content_type: ValueType, bytes: &[u8], path: u64) -> Option<CasValue> {
    match content_type {
        ValueType::String => Some(CasValue::string(bytes, path)),
        ValueType::Integer => std::str::from_utf8(bytes)
            .ok()?
            .trim()
            .parse::<i64>()
            .ok()
            .map(|v| CasValue::integer(v, path)),
    }
}

/// Serializes a committed subtree into the event stream the insert
/// machinery consumes; the copy source cursor is left untouched.
fn subtree_events(source: &NodeReadTrx, root_key: u64) -> Result<Vec<SubtreeEvent>> {
    let page = source.page_trx();
    let mut events = Vec::new();
    emit_subtree(page, root_key, &mut events)?;
    Ok(events)
}

fn emit_subtree(
    page: &crate::trx::read::PageReadTrx,
    key: u64,
    events: &mut Vec<SubtreeEvent>,
) -> Result<()> {
    let node = page
        .get_record(key, REC, REC_IDX)?
        .ok_or_else(|| eyre::eyre!("copy source node {} does not exist", key))?;
    match &node {
        Node::Element(element) => {
            let name = crate::trx::node_read::resolve_name(page, &node)
                .ok_or_else(|| eyre::eyre!("element {} has unresolvable names", key))?;
            let mut attributes = Vec::with_capacity(element.attribute_count());
            for &attribute_key in &element.attribute_keys {
                let attribute = page
                    .get_record(attribute_key, REC, REC_IDX)?
                    .ok_or_else(|| eyre::eyre!("attribute {} does not exist", attribute_key))?;
                let attribute_name = crate::trx::node_read::resolve_name(page, &attribute)
                    .ok_or_else(|| eyre::eyre!("attribute {} has unresolvable names", attribute_key))?;
                let value = attribute
                    .value_delegate()
                    .ok_or_else(|| eyre::eyre!("attribute {} has no value", attribute_key))?
                    .value()?
                    .into_owned();
                attributes.push((attribute_name, value));
            }
            let mut namespaces = Vec::with_capacity(element.namespace_count());
            for &namespace_key in &element.namespace_keys {
                let namespace = page
                    .get_record(namespace_key, REC, REC_IDX)?
                    .ok_or_else(|| eyre::eyre!("namespace {} does not exist", namespace_key))?;
                namespaces.push(
                    crate::trx::node_read::resolve_name(page, &namespace)
                        .ok_or_else(|| eyre::eyre!("namespace {} has unresolvable names", namespace_key))?,
                );
            }
            events.push(SubtreeEvent::StartElement {
                name,
                attributes,
                namespaces,
            });
            let mut child = element.structure.first_child;
            while child != NULL_NODE_KEY {
                emit_subtree(page, child, events)?;
                child = page
                    .get_record(child, REC, REC_IDX)?
                    .and_then(|n| n.structure().map(|s| s.right_sibling))
                    .unwrap_or(NULL_NODE_KEY);
            }
            events.push(SubtreeEvent::EndElement);
        }
        Node::Text(text) => {
            events.push(SubtreeEvent::Text(text.value.value()?.into_owned()));
        }
        Node::Comment(comment) => {
            events.push(SubtreeEvent::Comment(comment.value.value()?.into_owned()));
        }
        Node::ProcessingInstruction(pi) => {
            let target = crate::trx::node_read::resolve_name(page, &node)
                .ok_or_else(|| eyre::eyre!("node {} has unresolvable names", key))?;
            events.push(SubtreeEvent::ProcessingInstruction {
                target,
                data: pi.value.value()?.into_owned(),
            });
        }
        other => bail!("cannot copy a {:?} node as a subtree", other.kind()),
    }
    Ok(())
}
