//! # AVL Index Trees
//!
//! Every secondary index is an AVL tree whose nodes are ordinary records
//! inside the index's `(page kind, index)` sub-tree, so index updates ride
//! the same copy-on-write, caching and versioning machinery as document
//! nodes. The index's own `DocumentRoot` record (key 0) anchors the tree:
//! its first child is the tree root, or NULL while the index is empty.
//!
//! ## Shape
//!
//! An AVL record stores its index key, its reference-set value, left and
//! right child keys (parent lives in the node delegate) and a `changed`
//! flag. The flag marks the path that needs rebalancing: after an insert
//! the new leaf is flagged; while a flagged parent meets a flagged uncle
//! the flags recolor upward, otherwise a single or double rotation
//! repairs the spot. Rotations rewrite the three or four involved nodes
//! through one batch of copy-on-write preparations. The tree root's flag
//! is cleared on exit.
//!
//! ## Cursor
//!
//! Reader and writer share one cursor: `move_to_first_child` descends to
//! the left child, `move_to_last_child` to the right, `move_to_parent`
//! ascends. The BST descent of `get`, the attach step of `index` and the
//! three deletion cases of `remove` are all expressed over it.

use eyre::{bail, ensure, Result};

use crate::config::{DOCUMENT_NODE_KEY, NULL_NODE_KEY};
use crate::index::keys::IndexKey;
use crate::index::refs::NodeReferences;
use crate::index::SearchMode;
use crate::node::{
    AvlNode, DocumentRootNode, Node, NodeDelegate, StructNodeDelegate,
};
use crate::page::PageKind;
use crate::trx::read::PageReadTrx;
use crate::trx::write::PageWriteTrx;
use crate::trx::RecordAccess;

/// Where an insertion starts its descent: from the tree root, or from
/// the node the cursor already sits on (useful for sorted bulk loads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveCursor {
    ToDocumentRoot,
    FromCursor,
}

/// Cursor position inside an index tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    DocumentRoot,
    Avl(u64),
}

/// An AVL index tree bound to one `(page kind, index)` sub-tree of a page
/// transaction.
pub struct AvlTree<'a, T> {
    trx: &'a mut T,
    kind: PageKind,
    index: u32,
    position: Position,
}

/// Read-only view of an index tree.
pub type AvlTreeReader<'a> = AvlTree<'a, PageReadTrx>;

/// Mutating view of an index tree.
pub type AvlTreeWriter<'a> = AvlTree<'a, PageWriteTrx>;

impl<'a, T: RecordAccess> AvlTree<'a, T> {
    /// Binds to an existing index sub-tree.
    pub fn new(trx: &'a mut T, kind: PageKind, index: u32) -> Self {
        Self {
            trx,
            kind,
            index,
            position: Position::DocumentRoot,
        }
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn index_id(&self) -> u32 {
        self.index
    }

    /// Fetches an AVL record; NULL and the document root resolve to
    /// `None`.
    pub fn node(&mut self, key: u64) -> Result<Option<AvlNode>> {
        if key == NULL_NODE_KEY || key == DOCUMENT_NODE_KEY {
            return Ok(None);
        }
        match self.trx.record(key, self.kind, self.index)? {
            Some(Node::Avl(avl)) => Ok(Some(avl)),
            Some(other) => bail!(
                "index record {} is a {:?}, not an AVL node",
                key,
                other.kind()
            ),
            None => Ok(None),
        }
    }

    fn required(&mut self, key: u64) -> Result<AvlNode> {
        self.node(key)?
            .ok_or_else(|| eyre::eyre!("missing AVL node {} in {:?} index {}", key, self.kind, self.index))
    }

    /// The index's anchoring document-root record.
    pub fn document_root(&mut self) -> Result<DocumentRootNode> {
        match self.trx.record(DOCUMENT_NODE_KEY, self.kind, self.index)? {
            Some(Node::DocumentRoot(root)) => Ok(root),
            Some(other) => bail!("index anchor is a {:?} record", other.kind()),
            None => bail!("{:?} index {} has no anchor record", self.kind, self.index),
        }
    }

    /// Key of the tree root, or `None` while the index is empty.
    pub fn tree_root_key(&mut self) -> Result<Option<u64>> {
        let root = self.document_root()?;
        Ok((root.structure.first_child != NULL_NODE_KEY).then_some(root.structure.first_child))
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    pub fn move_to_document_root(&mut self) {
        self.position = Position::DocumentRoot;
    }

    /// Moves to `key` if it names a live AVL record; stays put otherwise.
    pub fn move_to(&mut self, key: u64) -> Result<bool> {
        if key == DOCUMENT_NODE_KEY {
            self.position = Position::DocumentRoot;
            return Ok(true);
        }
        if self.node(key)?.is_some() {
            self.position = Position::Avl(key);
            return Ok(true);
        }
        Ok(false)
    }

    /// Left child of an AVL node; the tree root from the document root.
    pub fn move_to_first_child(&mut self) -> Result<bool> {
        let target = match self.position {
            Position::DocumentRoot => self.document_root()?.structure.first_child,
            Position::Avl(key) => self.required(key)?.left_child,
        };
        if target == NULL_NODE_KEY {
            return Ok(false);
        }
        self.move_to(target)
    }

    /// Right child of an AVL node; the tree root from the document root.
    pub fn move_to_last_child(&mut self) -> Result<bool> {
        let target = match self.position {
            Position::DocumentRoot => self.document_root()?.structure.first_child,
            Position::Avl(key) => self.required(key)?.right_child,
        };
        if target == NULL_NODE_KEY {
            return Ok(false);
        }
        self.move_to(target)
    }

    pub fn move_to_parent(&mut self) -> Result<bool> {
        match self.position {
            Position::DocumentRoot => Ok(false),
            Position::Avl(key) => {
                let parent = self.required(key)?.node.parent_key;
                self.move_to(parent)
            }
        }
    }

    /// The AVL node under the cursor, if the cursor is on one.
    pub fn current(&mut self) -> Result<Option<AvlNode>> {
        match self.position {
            Position::DocumentRoot => Ok(None),
            Position::Avl(key) => self.node(key),
        }
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Finds the entry satisfying `mode` relative to `key`; for the
    /// range modes, the closest such entry. The cursor lands on the match.
    pub fn get(&mut self, key: &IndexKey, mode: SearchMode) -> Result<Option<AvlNode>> {
        let Some(root_key) = self.tree_root_key()? else {
            return Ok(None);
        };

        let mut best: Option<AvlNode> = None;
        let mut cursor = root_key;
        loop {
            let node = self.required(cursor)?;
            let ordering = node.key.cmp(key);

            if mode.matches(ordering) {
                if mode == SearchMode::Equal {
                    self.position = Position::Avl(cursor);
                    return Ok(Some(node));
                }
                // Every later match during the descent is closer to the
                // search key than the one before it.
                best = Some(node.clone());
            }

            let next = match ordering {
                std::cmp::Ordering::Greater => node.left_child,
                std::cmp::Ordering::Less => node.right_child,
                std::cmp::Ordering::Equal => {
                    // An exact hit only helps the strict modes by moving
                    // past it; the inclusive modes already recorded it.
                    match mode {
                        SearchMode::Greater => node.right_child,
                        SearchMode::Less => node.left_child,
                        _ => NULL_NODE_KEY,
                    }
                }
            };
            if next == NULL_NODE_KEY {
                break;
            }
            cursor = next;
        }

        if let Some(found) = &best {
            self.position = Position::Avl(found.node.node_key);
        }
        Ok(best)
    }
}

impl<'a> AvlTree<'a, PageWriteTrx> {
    /// Binds to `(kind, index)` for writing, registering the index and
    /// creating its anchor record on first use.
    pub fn open(trx: &'a mut PageWriteTrx, kind: PageKind, index: u32) -> Result<Self> {
        ensure!(
            kind.is_record_family() && kind != PageKind::Record,
            "{:?} pages hold no index trees",
            kind
        );
        trx.create_index(kind, index)?;
        if trx.get_record(DOCUMENT_NODE_KEY, kind, index)?.is_none() {
            let anchor = Node::DocumentRoot(DocumentRootNode {
                node: NodeDelegate::new(DOCUMENT_NODE_KEY, NULL_NODE_KEY, trx.revision(), None),
                structure: StructNodeDelegate::detached(),
            });
            trx.create_entry(DOCUMENT_NODE_KEY, anchor, kind, index)?;
        }
        Ok(Self {
            trx,
            kind,
            index,
            position: Position::DocumentRoot,
        })
    }

    /// Indexes `key`: creates the entry or merges `value` into the
    /// existing reference set. Returns the references now stored.
    /// `move_cursor` selects where the descent starts.
    pub fn index(
        &mut self,
        key: IndexKey,
        value: NodeReferences,
        move_cursor: MoveCursor,
    ) -> Result<NodeReferences> {
        if move_cursor == MoveCursor::ToDocumentRoot {
            self.move_to_document_root();
        }
        let Some(root_key) = self.tree_root_key()? else {
            // Empty index: the new entry becomes the tree root.
            let node_key = self.trx.new_record_key(self.kind, self.index)?;
            let root = Node::Avl(AvlNode {
                node: NodeDelegate::new(node_key, DOCUMENT_NODE_KEY, self.trx.revision(), None),
                key,
                value: value.clone(),
                left_child: NULL_NODE_KEY,
                right_child: NULL_NODE_KEY,
                changed: false,
            });
            self.trx.create_entry(node_key, root, self.kind, self.index)?;

            let anchor = self.prepare_node(DOCUMENT_NODE_KEY)?;
            let structure = anchor.structure_mut().unwrap(); // INVARIANT: anchor is a document root
            structure.first_child = node_key;
            structure.increment_child_count();
            structure.descendant_count += 1;
            self.position = Position::Avl(node_key);
            return Ok(value);
        };

        // Descend from the cursor when the caller vouches for it (sorted
        // bulk loads), from the tree root otherwise.
        let mut cursor = match self.position {
            Position::Avl(key) => key,
            Position::DocumentRoot => root_key,
        };
        loop {
            let node = self.required(cursor)?;
            match key.cmp(&node.key) {
                std::cmp::Ordering::Equal => {
                    // Merge the reference sets.
                    let mut merged = node.value.clone();
                    let mut grew = false;
                    for &node_key in value.node_keys() {
                        grew |= merged.add_node_key(node_key);
                    }
                    if grew {
                        let avl = self.prepare_avl(cursor)?;
                        avl.value = merged.clone();
                    }
                    self.position = Position::Avl(cursor);
                    return Ok(merged);
                }
                std::cmp::Ordering::Less => {
                    if node.has_left_child() {
                        cursor = node.left_child;
                        continue;
                    }
                    let child_key = self.attach_leaf(cursor, true, key, value.clone())?;
                    self.adjust(child_key)?;
                    self.bump_descendants()?;
                    self.position = Position::Avl(child_key);
                    return Ok(value);
                }
                std::cmp::Ordering::Greater => {
                    if node.has_right_child() {
                        cursor = node.right_child;
                        continue;
                    }
                    let child_key = self.attach_leaf(cursor, false, key, value.clone())?;
                    self.adjust(child_key)?;
                    self.bump_descendants()?;
                    self.position = Position::Avl(child_key);
                    return Ok(value);
                }
            }
        }
    }

    /// Removes `node_key` from the references stored under `key`. When
    /// the reference set drains empty the tree node itself is deleted and
    /// the tree rebalanced. Returns whether the reference was present.
    pub fn remove(&mut self, key: &IndexKey, node_key: u64) -> Result<bool> {
        ensure!(
            node_key != NULL_NODE_KEY,
            "cannot remove the null node key from an index"
        );
        let Some(found) = self.get(key, SearchMode::Equal)? else {
            return Ok(false);
        };

        let mut value = found.value.clone();
        if !value.remove_node_key(node_key) {
            return Ok(false);
        }

        if value.is_empty() {
            self.remove_node(found.node.node_key)?;
        } else {
            let avl = self.prepare_avl(found.node.node_key)?;
            avl.value = value;
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Structure maintenance
    // ------------------------------------------------------------------

    fn attach_leaf(
        &mut self,
        parent_key: u64,
        as_left: bool,
        key: IndexKey,
        value: NodeReferences,
    ) -> Result<u64> {
        let child_key = self.trx.new_record_key(self.kind, self.index)?;
        let child = Node::Avl(AvlNode {
            node: NodeDelegate::new(child_key, parent_key, self.trx.revision(), None),
            key,
            value,
            left_child: NULL_NODE_KEY,
            right_child: NULL_NODE_KEY,
            changed: false,
        });
        self.trx
            .create_entry(child_key, child, self.kind, self.index)?;

        let parent = self.prepare_avl(parent_key)?;
        if as_left {
            parent.left_child = child_key;
        } else {
            parent.right_child = child_key;
        }
        Ok(child_key)
    }

    fn bump_descendants(&mut self) -> Result<()> {
        let anchor = self.prepare_node(DOCUMENT_NODE_KEY)?;
        anchor.structure_mut().unwrap().descendant_count += 1; // INVARIANT: anchor is a document root
        Ok(())
    }

    /// Physically deletes the tree node `target`, handling the classical
    /// no-child / one-child / two-children cases, then rebalances.
    fn remove_node(&mut self, target: u64) -> Result<()> {
        let to_delete = self.required(target)?;
        let parent_key = to_delete.node.parent_key;

        match (to_delete.has_left_child(), to_delete.has_right_child()) {
            (false, false) => {
                self.replace_parent_link(parent_key, target, NULL_NODE_KEY)?;
                if parent_key != DOCUMENT_NODE_KEY {
                    self.adjust(parent_key)?;
                }
            }
            (true, false) => {
                let child = to_delete.left_child;
                self.replace_parent_link(parent_key, target, child)?;
                self.prepare_avl(child)?.node.parent_key = parent_key;
                if parent_key != DOCUMENT_NODE_KEY {
                    self.adjust(child)?;
                }
            }
            (false, true) => {
                let child = to_delete.right_child;
                self.replace_parent_link(parent_key, target, child)?;
                self.prepare_avl(child)?.node.parent_key = parent_key;
                if parent_key != DOCUMENT_NODE_KEY {
                    self.adjust(child)?;
                }
            }
            (true, true) => {
                // In-order successor: leftmost of the right subtree.
                let mut successor = self.required(to_delete.right_child)?;
                while successor.has_left_child() {
                    successor = self.required(successor.left_child)?;
                }
                let successor_key = successor.node.node_key;
                let successor_parent = successor.node.parent_key;

                self.prepare_avl(to_delete.left_child)?.node.parent_key = successor_key;

                if to_delete.right_child != successor_key {
                    // Detach the successor from its old spot; its right
                    // subtree (if any) takes its place.
                    self.prepare_avl(to_delete.right_child)?.node.parent_key = successor_key;
                    if successor.has_right_child() {
                        self.prepare_avl(successor.right_child)?.node.parent_key =
                            successor_parent;
                    }
                    let old_parent = self.prepare_avl(successor_parent)?;
                    old_parent.left_child = if successor.has_right_child() {
                        successor.right_child
                    } else {
                        NULL_NODE_KEY
                    };
                    old_parent.changed = true;
                }

                {
                    let moved = self.prepare_avl(successor_key)?;
                    moved.left_child = to_delete.left_child;
                    if to_delete.right_child != successor_key {
                        moved.right_child = to_delete.right_child;
                    }
                    moved.node.parent_key = parent_key;
                }
                self.replace_parent_link(parent_key, target, successor_key)?;

                if to_delete.right_child != successor_key {
                    self.adjust(successor_parent)?;
                } else {
                    self.adjust(successor_key)?;
                }
            }
        }

        self.trx.remove_entry(target, self.kind, self.index)?;

        let anchor = self.prepare_node(DOCUMENT_NODE_KEY)?;
        let structure = anchor.structure_mut().unwrap(); // INVARIANT: anchor is a document root
        structure.descendant_count = structure.descendant_count.saturating_sub(1);
        if self.position == Position::Avl(target) {
            self.position = Position::DocumentRoot;
        }
        Ok(())
    }

    /// Points whatever linked `old_child` (the anchor or an AVL parent)
    /// at `new_child` instead.
    fn replace_parent_link(&mut self, parent_key: u64, old_child: u64, new_child: u64) -> Result<()> {
        if parent_key == DOCUMENT_NODE_KEY {
            let anchor = self.prepare_node(DOCUMENT_NODE_KEY)?;
            let structure = anchor.structure_mut().unwrap(); // INVARIANT: anchor is a document root
            structure.first_child = new_child;
            if new_child == NULL_NODE_KEY {
                structure.decrement_child_count();
            }
            return Ok(());
        }
        let parent = self.prepare_avl(parent_key)?;
        if parent.left_child == old_child {
            parent.left_child = new_child;
        } else {
            debug_assert_eq!(parent.right_child, old_child);
            parent.right_child = new_child;
        }
        parent.changed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------------

    /// Walks the changed-flag path upward from `start`, recoloring where
    /// a flagged uncle allows it and rotating otherwise. Clears the tree
    /// root's flag on exit.
    fn adjust(&mut self, start: u64) -> Result<()> {
        self.set_changed(start, true)?;

        let mut node_key = start;
        loop {
            let node = self.required(node_key)?;
            if node.node.parent_key == DOCUMENT_NODE_KEY {
                break;
            }
            let Some(parent) = self.node(node.node.parent_key)? else {
                break;
            };
            if !parent.changed || parent.node.parent_key == DOCUMENT_NODE_KEY {
                break;
            }
            let Some(grand) = self.node(parent.node.parent_key)? else {
                break;
            };
            let parent_key = parent.node.node_key;
            let grand_key = grand.node.node_key;

            if grand.left_child == parent_key {
                let uncle = self.node(grand.right_child)?;
                if let Some(uncle) = uncle.filter(|u| u.changed) {
                    // Flagged uncle: recolor and keep walking up.
                    self.set_changed(parent_key, false)?;
                    self.set_changed(uncle.node.node_key, false)?;
                    self.set_changed(grand_key, true)?;
                    node_key = grand_key;
                } else {
                    let mut pivot = node_key;
                    if parent.right_child == node_key {
                        pivot = parent_key;
                        self.rotate_left(pivot)?;
                    }
                    self.finish_rotation(pivot, RotateKind::Right)?;
                    node_key = pivot;
                }
            } else if grand.right_child == parent_key {
                let uncle = self.node(grand.left_child)?;
                if let Some(uncle) = uncle.filter(|u| u.changed) {
                    self.set_changed(parent_key, false)?;
                    self.set_changed(uncle.node.node_key, false)?;
                    self.set_changed(grand_key, true)?;
                    node_key = grand_key;
                } else {
                    let mut pivot = node_key;
                    if parent.left_child == node_key {
                        pivot = parent_key;
                        self.rotate_right(pivot)?;
                    }
                    self.finish_rotation(pivot, RotateKind::Left)?;
                    node_key = pivot;
                }
            } else {
                break;
            }
        }

        if let Some(root_key) = self.tree_root_key()? {
            self.set_changed(root_key, false)?;
        }
        Ok(())
    }

    /// Second half of the single/double rotation: unflag the pivot's
    /// parent, flag and rotate the grandparent.
    fn finish_rotation(&mut self, pivot: u64, kind: RotateKind) -> Result<()> {
        let pivot_node = self.required(pivot)?;
        let Some(parent) = self.node(pivot_node.node.parent_key)? else {
            return Ok(());
        };
        self.set_changed(parent.node.node_key, false)?;
        let Some(grand) = self.node(parent.node.parent_key)? else {
            return Ok(());
        };
        self.set_changed(grand.node.node_key, true)?;
        match kind {
            RotateKind::Left => self.rotate_left(grand.node.node_key)?,
            RotateKind::Right => self.rotate_right(grand.node.node_key)?,
        }
        Ok(())
    }

    fn set_changed(&mut self, key: u64, changed: bool) -> Result<()> {
        let avl = self.prepare_avl(key)?;
        avl.changed = changed;
        Ok(())
    }

    /// Rotates `node` with its right child; the child moves up.
    fn rotate_left(&mut self, node_key: u64) -> Result<()> {
        let node = self.required(node_key)?;
        ensure!(
            node.has_right_child(),
            "left rotation of {} without a right child",
            node_key
        );
        let right_key = node.right_child;
        let right = self.required(right_key)?;
        let node_parent = node.node.parent_key;

        self.prepare_avl(node_key)?.right_child = right.left_child;
        if right.has_left_child() {
            self.prepare_avl(right.left_child)?.node.parent_key = node_key;
        }

        self.prepare_avl(right_key)?.node.parent_key = node_parent;
        self.replace_parent_link_for_rotation(node_parent, node_key, right_key)?;

        self.prepare_avl(right_key)?.left_child = node_key;
        self.prepare_avl(node_key)?.node.parent_key = right_key;
        Ok(())
    }

    /// Rotates `node` with its left child; the child moves up.
    fn rotate_right(&mut self, node_key: u64) -> Result<()> {
        let node = self.required(node_key)?;
        ensure!(
            node.has_left_child(),
            "right rotation of {} without a left child",
            node_key
        );
        let left_key = node.left_child;
        let left = self.required(left_key)?;
        let node_parent = node.node.parent_key;

        self.prepare_avl(node_key)?.left_child = left.right_child;
        if left.has_right_child() {
            self.prepare_avl(left.right_child)?.node.parent_key = node_key;
        }

        self.prepare_avl(left_key)?.node.parent_key = node_parent;
        self.replace_parent_link_for_rotation(node_parent, node_key, left_key)?;

        self.prepare_avl(left_key)?.right_child = node_key;
        self.prepare_avl(node_key)?.node.parent_key = left_key;
        Ok(())
    }

    fn replace_parent_link_for_rotation(
        &mut self,
        parent_key: u64,
        old_child: u64,
        new_child: u64,
    ) -> Result<()> {
        if parent_key == DOCUMENT_NODE_KEY {
            let anchor = self.prepare_node(DOCUMENT_NODE_KEY)?;
            anchor.structure_mut().unwrap().first_child = new_child; // INVARIANT: anchor is a document root
            return Ok(());
        }
        let parent = self.prepare_avl(parent_key)?;
        if parent.left_child == old_child {
            parent.left_child = new_child;
        } else {
            debug_assert_eq!(parent.right_child, old_child);
            parent.right_child = new_child;
        }
        Ok(())
    }

    fn prepare_node(&mut self, key: u64) -> Result<&mut Node> {
        self.trx
            .prepare_entry_for_modification(key, self.kind, self.index)
    }

    fn prepare_avl(&mut self, key: u64) -> Result<&mut AvlNode> {
        match self.prepare_node(key)? {
            Node::Avl(avl) => Ok(avl),
            other => bail!("index record {} is a {:?}, not an AVL node", key, other.kind()),
        }
    }
}

#[derive(Clone, Copy)]
enum RotateKind {
    Left,
    Right,
}
