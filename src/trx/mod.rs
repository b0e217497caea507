//! # Transactions
//!
//! - [`read`]: snapshot reader over one committed revision.
//! - [`write`]: the copy-on-write page writer, exclusive per resource.
//! - [`node_read`] / [`node_write`]: the node cursor and the tree mutation
//!   surface built on top of the page transactions.
//!
//! This module holds the shared pieces: the log keys addressing dirty
//! pages inside a write transaction, and the container pairing a pristine
//! record-page view with the slots the transaction touched.

pub mod node_read;
pub mod node_write;
pub mod read;
pub mod write;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::config::{FANOUT_SHIFT, INDIRECT_LEVELS, NULL_NODE_KEY};
use crate::node::{DeletedNode, Kind, Node, NodeDelegate};
use crate::page::{PageKind, RecordPage};

/// Record and name resolution shared by the read and write transactions;
/// the index layers are generic over it so one cursor serves both sides.
pub trait RecordAccess {
    fn record(&mut self, key: u64, kind: PageKind, index: u32) -> Result<Option<Node>>;
    fn name(&mut self, key: i32, kind: Kind) -> Option<String>;
}

impl RecordAccess for read::PageReadTrx {
    fn record(&mut self, key: u64, kind: PageKind, index: u32) -> Result<Option<Node>> {
        read::PageReadTrx::get_record(self, key, kind, index)
    }

    fn name(&mut self, key: i32, kind: Kind) -> Option<String> {
        read::PageReadTrx::get_name(self, key, kind)
    }
}

impl RecordAccess for write::PageWriteTrx {
    fn record(&mut self, key: u64, kind: PageKind, index: u32) -> Result<Option<Node>> {
        write::PageWriteTrx::get_record(self, key, kind, index)
    }

    fn name(&mut self, key: i32, kind: Kind) -> Option<String> {
        write::PageWriteTrx::get_name(self, key, kind)
    }
}

/// Level value addressing a family page itself (name/path/CAS/summary)
/// rather than a node of its indirect tree.
pub const FAMILY_LEVEL: i32 = -1;

/// Level value addressing leaf record pages.
pub const LEAF_LEVEL: i32 = INDIRECT_LEVELS as i32;

/// Logical address of a dirty page inside a write transaction:
/// `(page kind, level, key slice, index)`.
///
/// The key slice is the page key truncated to the level: indirect level 0
/// is the sub-tree root (slice 0), each deeper level keeps
/// `FANOUT_SHIFT` more bits, and `LEAF_LEVEL` keeps the full page key.
/// The slice is deterministic, so COW can address a page's copy without
/// knowing where it will land in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogKey {
    pub kind: PageKind,
    pub level: i32,
    pub slice: u64,
    pub index: u32,
}

impl LogKey {
    pub fn family(kind: PageKind) -> Self {
        Self {
            kind,
            level: FAMILY_LEVEL,
            slice: 0,
            index: 0,
        }
    }

    pub fn leaf(kind: PageKind, index: u32, page_key: u64) -> Self {
        Self {
            kind,
            level: LEAF_LEVEL,
            slice: page_key,
            index,
        }
    }

    pub fn indirect(kind: PageKind, index: u32, level: u32, page_key: u64) -> Self {
        debug_assert!(level < INDIRECT_LEVELS);
        Self {
            kind,
            level: level as i32,
            slice: slice_at(page_key, level),
            index,
        }
    }

    /// Fixed-width key bytes for the persistent log index.
    pub fn to_bytes(self) -> [u8; 17] {
        let mut out = [0u8; 17];
        out[0] = self.kind as u8;
        out[1..5].copy_from_slice(&self.level.to_be_bytes());
        out[5..13].copy_from_slice(&self.slice.to_be_bytes());
        out[13..17].copy_from_slice(&self.index.to_be_bytes());
        out
    }
}

/// Key slice of `page_key` at an indirect `level` (0 = sub-tree root).
pub fn slice_at(page_key: u64, level: u32) -> u64 {
    page_key >> (FANOUT_SHIFT * (INDIRECT_LEVELS - level))
}

/// Slot inside the indirect page at `level` on the path to `page_key`.
pub fn indirect_slot(page_key: u64, level: u32) -> usize {
    (slice_at(page_key, level + 1) & (crate::config::FANOUT as u64 - 1)) as usize
}

/// Slot inside the deepest indirect page pointing at the leaf for
/// `page_key`.
pub fn leaf_slot(page_key: u64) -> usize {
    (page_key & (crate::config::FANOUT as u64 - 1)) as usize
}

/// A dirty record page inside the write transaction: the pristine merged
/// view the transaction started from, plus every slot it created,
/// prepared or tombstoned. Reads go modified-first, so the transaction
/// observes its own writes; commit diffs `modified` against `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContainer {
    base: RecordPage,
    modified: HashMap<u16, Node>,
    /// Fragments merged into `base`; drives the full-dump decision.
    fragment_count: u32,
}

impl PageContainer {
    pub fn new(base: RecordPage, fragment_count: u32) -> Self {
        Self {
            base,
            modified: HashMap::new(),
            fragment_count,
        }
    }

    pub fn page_key(&self) -> u64 {
        self.base.page_key()
    }

    pub fn base(&self) -> &RecordPage {
        &self.base
    }

    pub fn modified(&self) -> &HashMap<u16, Node> {
        &self.modified
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    pub fn is_modified(&self) -> bool {
        !self.modified.is_empty()
    }

    /// The record visible to the owning transaction, tombstones hidden.
    pub fn record(&self, slot: u16) -> Option<&Node> {
        match self.modified.get(&slot) {
            Some(record) if record.is_deleted() => None,
            Some(record) => Some(record),
            None => self.base.record(slot),
        }
    }

    /// Inserts a freshly created record.
    pub fn create_slot(&mut self, slot: u16, record: Node) -> &mut Node {
        self.modified.entry(slot).insert(record).into_mut()
    }

    /// Reinstates a modified slot when a spilled container is loaded back.
    pub fn restore_slot(&mut self, slot: u16, record: Node) {
        self.modified.insert(slot, record);
    }

    /// Copies the committed record into the modified set and hands out a
    /// mutable reference; the copy happens once per transaction.
    pub fn prepare_slot(&mut self, slot: u16) -> Result<&mut Node> {
        if !self.modified.contains_key(&slot) {
            let base = self
                .base
                .record(slot)
                .cloned()
                .ok_or_else(|| eyre::eyre!("no record in slot {} to modify", slot))?;
            self.modified.insert(slot, base);
        }
        let record = self.modified.get_mut(&slot).unwrap(); // INVARIANT: inserted above
        ensure!(
            !record.is_deleted(),
            "record in slot {} was removed by this transaction",
            slot
        );
        Ok(record)
    }

    /// Replaces the record with a tombstone hiding every earlier version.
    pub fn remove_slot(&mut self, slot: u16, record_key: u64, revision: u32) -> Result<()> {
        ensure!(
            self.record(slot).is_some(),
            "no record in slot {} to remove",
            slot
        );
        self.modified.insert(
            slot,
            Node::Deleted(DeletedNode {
                node: NodeDelegate::new(record_key, NULL_NODE_KEY, revision, None),
            }),
        );
        Ok(())
    }

    /// The page fragment to commit, or `None` when nothing changed.
    /// Emits a complete page when the fragment chain has grown to the
    /// full-dump interval (or the page is brand new), a delta otherwise.
    pub fn committed_page(&self, revision: u32) -> Option<RecordPage> {
        if self.modified.is_empty() {
            return None;
        }
        if self.fragment_count == 0
            || self.fragment_count >= crate::config::FULL_DUMP_INTERVAL
        {
            let mut full = self.base.full_dump_with(&self.modified, revision);
            full.set_full_dump(true);
            Some(full)
        } else {
            let delta = self.base.delta_against(&self.modified, revision);
            if delta.is_empty() {
                None
            } else {
                Some(delta)
            }
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.base.estimated_size() + self.modified.len() * 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{StructNodeDelegate, TextNode, ValueDelegate};

    fn text(key: u64, value: &[u8]) -> Node {
        Node::Text(TextNode {
            node: NodeDelegate::new(key, 0, 1, None),
            structure: StructNodeDelegate::detached(),
            value: ValueDelegate::new(value.to_vec(), false),
        })
    }

    #[test]
    fn log_key_slices_follow_the_levels() {
        let page_key = 0b0000101_0000011_0000010_0000001u64;
        assert_eq!(slice_at(page_key, 0), 0);
        assert_eq!(slice_at(page_key, 1), 0b0000101);
        assert_eq!(slice_at(page_key, 2), 0b0000101_0000011);
        assert_eq!(slice_at(page_key, 4), page_key);

        assert_eq!(indirect_slot(page_key, 0), 0b0000101);
        assert_eq!(indirect_slot(page_key, 1), 0b0000011);
        assert_eq!(indirect_slot(page_key, 2), 0b0000010);
        assert_eq!(leaf_slot(page_key), 0b0000001);
    }

    #[test]
    fn log_key_bytes_are_distinct_per_field() {
        let a = LogKey::leaf(PageKind::Record, 0, 5);
        let b = LogKey::leaf(PageKind::Cas, 0, 5);
        let c = LogKey::indirect(PageKind::Record, 0, 3, 5 << FANOUT_SHIFT);
        assert_ne!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.to_bytes(), c.to_bytes());
    }

    #[test]
    fn container_reads_its_own_writes() {
        let mut base = RecordPage::new(0, 1);
        base.set_slot(1, text(1, b"committed"));
        let mut container = PageContainer::new(base, 1);

        assert!(container.record(1).is_some());
        let record = container.prepare_slot(1).unwrap();
        *record.value_delegate_mut().unwrap() = ValueDelegate::new(b"changed".to_vec(), false);

        assert_eq!(
            container
                .record(1)
                .unwrap()
                .value_delegate()
                .unwrap()
                .value()
                .unwrap()
                .as_ref(),
            b"changed"
        );
    }

    #[test]
    fn prepare_missing_slot_fails() {
        let mut container = PageContainer::new(RecordPage::new(0, 1), 1);
        assert!(container.prepare_slot(3).is_err());
    }

    #[test]
    fn remove_hides_the_record_from_the_container() {
        let mut base = RecordPage::new(0, 1);
        base.set_slot(2, text(2, b"doomed"));
        let mut container = PageContainer::new(base, 1);

        container.remove_slot(2, 2, 2).unwrap();
        assert!(container.record(2).is_none());
        assert!(container.prepare_slot(2).is_err());
        assert!(container.remove_slot(2, 2, 2).is_err());
    }

    #[test]
    fn committed_page_is_none_without_changes() {
        let mut base = RecordPage::new(0, 1);
        base.set_slot(1, text(1, b"same"));
        let container = PageContainer::new(base, 1);
        assert!(container.committed_page(2).is_none());
    }

    #[test]
    fn fresh_pages_commit_as_full_dumps() {
        let mut container = PageContainer::new(RecordPage::new(0, 1), 0);
        container.create_slot(0, text(0, b"new"));
        let page = container.committed_page(1).unwrap();
        assert!(page.is_full_dump());
    }

    #[test]
    fn grown_chains_commit_as_full_dumps() {
        let mut base = RecordPage::new(0, 3);
        base.set_slot(1, text(1, b"old"));
        let mut container = PageContainer::new(base, crate::config::FULL_DUMP_INTERVAL);
        container.create_slot(2, text(2, b"new"));

        let page = container.committed_page(4).unwrap();
        assert!(page.is_full_dump());
        assert!(page.has_slot(1) && page.has_slot(2));
    }

    #[test]
    fn short_chains_commit_as_deltas() {
        let mut base = RecordPage::new(0, 3);
        base.set_slot(1, text(1, b"old"));
        let mut container = PageContainer::new(base, 1);
        container.create_slot(2, text(2, b"new"));

        let page = container.committed_page(4).unwrap();
        assert!(!page.is_full_dump());
        assert!(!page.has_slot(1) && page.has_slot(2));
    }
}
