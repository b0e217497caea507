//! # Node Read Transaction
//!
//! The user-visible cursor over a committed revision of the document
//! tree. The cursor is a stateful object: `move_to_*` methods attempt a
//! move and report [`Moved`] or [`NotMoved`]; a failed move leaves the
//! cursor where it was. Accessors read the node under the cursor.
//!
//! Secondary-index lookups ride the same snapshot through
//! [`NodeReadTrx::index_get`].

use eyre::{ensure, Result};

use crate::config::{DOCUMENT_NODE_KEY, NULL_NODE_KEY};
use crate::index::avl::AvlTree;
use crate::index::{IndexKey, IndexType, NodeReferences, SearchMode};
use crate::name::QName;
use crate::node::{DeweyId, Kind, Node};
use crate::page::PageKind;
use crate::trx::read::PageReadTrx;

/// Outcome of a cursor move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    Moved,
    NotMoved,
}

impl MoveResult {
    pub fn has_moved(self) -> bool {
        self == MoveResult::Moved
    }
}

/// Read-only node cursor pinned to one revision.
pub struct NodeReadTrx {
    page: PageReadTrx,
    current: Node,
}

impl std::fmt::Debug for NodeReadTrx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeReadTrx")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl NodeReadTrx {
    pub(crate) fn new(page: PageReadTrx) -> Result<Self> {
        let current = page
            .get_record(DOCUMENT_NODE_KEY, PageKind::Record, 0)?
            .ok_or_else(|| eyre::eyre!("resource has no document root record"))?;
        Ok(Self { page, current })
    }

    /// The revision this cursor is pinned to.
    pub fn revision(&self) -> u32 {
        self.page.revision()
    }

    pub fn page_trx(&self) -> &PageReadTrx {
        &self.page
    }

    /// Surrenders the cursor, exposing the underlying page transaction.
    pub fn into_page_trx(self) -> PageReadTrx {
        self.page
    }

    /// Highest node key allocated up to this revision.
    pub fn max_node_key(&self) -> u64 {
        self.page.max_node_key()
    }

    // ------------------------------------------------------------------
    // Cursor state
    // ------------------------------------------------------------------

    pub fn kind(&self) -> Kind {
        self.current.kind()
    }

    pub fn node_key(&self) -> u64 {
        self.current.node_key()
    }

    pub fn parent_key(&self) -> u64 {
        self.current.parent_key()
    }

    /// A clone of the node under the cursor.
    pub fn node(&self) -> Node {
        self.current.clone()
    }

    pub fn hash(&self) -> u64 {
        self.current.hash()
    }

    pub fn dewey_id(&self) -> Option<&DeweyId> {
        self.current.delegate().and_then(|d| d.dewey_id.as_ref())
    }

    pub fn is_document_root(&self) -> bool {
        self.current.kind() == Kind::DocumentRoot
    }

    pub fn has_parent(&self) -> bool {
        self.parent_key() != NULL_NODE_KEY
    }

    pub fn has_first_child(&self) -> bool {
        self.current
            .structure()
            .is_some_and(|s| s.has_first_child())
    }

    pub fn has_left_sibling(&self) -> bool {
        self.current
            .structure()
            .is_some_and(|s| s.has_left_sibling())
    }

    pub fn has_right_sibling(&self) -> bool {
        self.current
            .structure()
            .is_some_and(|s| s.has_right_sibling())
    }

    pub fn first_child_key(&self) -> u64 {
        self.current
            .structure()
            .map_or(NULL_NODE_KEY, |s| s.first_child)
    }

    pub fn left_sibling_key(&self) -> u64 {
        self.current
            .structure()
            .map_or(NULL_NODE_KEY, |s| s.left_sibling)
    }

    pub fn right_sibling_key(&self) -> u64 {
        self.current
            .structure()
            .map_or(NULL_NODE_KEY, |s| s.right_sibling)
    }

    pub fn child_count(&self) -> u64 {
        self.current.structure().map_or(0, |s| s.child_count)
    }

    pub fn descendant_count(&self) -> u64 {
        self.current.structure().map_or(0, |s| s.descendant_count)
    }

    pub fn attribute_count(&self) -> usize {
        match &self.current {
            Node::Element(element) => element.attribute_count(),
            _ => 0,
        }
    }

    pub fn namespace_count(&self) -> usize {
        match &self.current {
            Node::Element(element) => element.namespace_count(),
            _ => 0,
        }
    }

    /// Qualified name of the node under the cursor, for named kinds.
    pub fn get_name(&self) -> Option<QName> {
        resolve_name(&self.page, &self.current)
    }

    /// Raw value bytes of the node under the cursor, for value kinds.
    pub fn get_value(&self) -> Result<Option<Vec<u8>>> {
        match self.current.value_delegate() {
            Some(value) => Ok(Some(value.value()?.into_owned())),
            None => Ok(None),
        }
    }

    /// Key of the path-summary node classifying this node's name path.
    pub fn path_node_key(&self) -> Option<u64> {
        self.current.name_delegate().map(|n| n.path_node_key)
    }

    // ------------------------------------------------------------------
    // Cursor moves
    // ------------------------------------------------------------------

    /// Moves to `key` if it names a live node in this revision.
    pub fn move_to(&mut self, key: u64) -> Result<MoveResult> {
        if key == NULL_NODE_KEY {
            return Ok(MoveResult::NotMoved);
        }
        match self.page.get_record(key, PageKind::Record, 0)? {
            Some(node) => {
                self.current = node;
                Ok(MoveResult::Moved)
            }
            None => Ok(MoveResult::NotMoved),
        }
    }

    pub fn move_to_document_root(&mut self) -> Result<MoveResult> {
        self.move_to(DOCUMENT_NODE_KEY)
    }

    pub fn move_to_parent(&mut self) -> Result<MoveResult> {
        self.move_to(self.parent_key())
    }

    pub fn move_to_first_child(&mut self) -> Result<MoveResult> {
        self.move_to(self.first_child_key())
    }

    /// Moves to the last child by walking the sibling chain.
    pub fn move_to_last_child(&mut self) -> Result<MoveResult> {
        if !self.move_to_first_child()?.has_moved() {
            return Ok(MoveResult::NotMoved);
        }
        while self.has_right_sibling() {
            self.move_to_right_sibling()?;
        }
        Ok(MoveResult::Moved)
    }

    pub fn move_to_left_sibling(&mut self) -> Result<MoveResult> {
        self.move_to(self.left_sibling_key())
    }

    pub fn move_to_right_sibling(&mut self) -> Result<MoveResult> {
        self.move_to(self.right_sibling_key())
    }

    /// Moves to the element's `index`-th attribute.
    pub fn move_to_attribute(&mut self, index: usize) -> Result<MoveResult> {
        let key = match &self.current {
            Node::Element(element) => element.attribute_keys.get(index).copied(),
            _ => None,
        };
        match key {
            Some(key) => self.move_to(key),
            None => Ok(MoveResult::NotMoved),
        }
    }

    /// Moves to the attribute with the given local name.
    pub fn move_to_attribute_by_name(&mut self, name: &QName) -> Result<MoveResult> {
        let key = match &self.current {
            Node::Element(element) => element
                .attribute_key_by_name(crate::name::name_key(&name.local_name, Kind::Attribute)),
            _ => None,
        };
        match key {
            Some(key) => self.move_to(key),
            None => Ok(MoveResult::NotMoved),
        }
    }

    /// Moves to the element's `index`-th namespace declaration.
    pub fn move_to_namespace(&mut self, index: usize) -> Result<MoveResult> {
        let key = match &self.current {
            Node::Element(element) => element.namespace_keys.get(index).copied(),
            _ => None,
        };
        match key {
            Some(key) => self.move_to(key),
            None => Ok(MoveResult::NotMoved),
        }
    }

    // ------------------------------------------------------------------
    // Index access
    // ------------------------------------------------------------------

    /// Looks `key` up in a secondary index under this snapshot.
    pub fn index_get(
        &mut self,
        index_type: IndexType,
        number: u32,
        key: &IndexKey,
        mode: SearchMode,
    ) -> Result<Option<NodeReferences>> {
        let kind = index_type.page_kind();
        let sub_root = self
            .page
            .family_sub_root(self.page.revision_root(), kind, number)
            .map_err(|_| eyre::eyre!("unknown {:?} index number {}", index_type, number))?;
        ensure!(
            sub_root != crate::config::NULL_OFFSET,
            "unknown {:?} index number {}",
            index_type,
            number
        );
        let mut tree = AvlTree::new(&mut self.page, kind, number);
        Ok(tree.get(key, mode)?.map(|node| node.value))
    }
}

/// Resolves a node's qualified name through the revision's name page.
pub(crate) fn resolve_name(page: &PageReadTrx, node: &Node) -> Option<QName> {
    let name = node.name_delegate()?;
    let kind = node.kind();
    let local_name = page.get_name(name.local_name_key, kind).unwrap_or_default();
    let prefix = page.get_name(name.prefix_key, kind).unwrap_or_default();
    let uri = page
        .get_name(name.uri_key, Kind::Namespace)
        .unwrap_or_default();
    Some(QName {
        uri,
        prefix,
        local_name,
    })
}
