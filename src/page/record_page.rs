//! # Record Pages and Delta Merge
//!
//! A record page holds the records whose keys share one page key
//! (`key >> RECORD_SHIFT`). Committed pages are usually **deltas**: only
//! the slots that changed in that revision are stored, and a read merges
//! the page fragments of up to `SLIDING_WINDOW` revisions, newest first.
//! The first fragment that carries a slot wins; a `Deleted` tombstone in a
//! newer fragment hides every older version of that record.
//!
//! ```text
//! rev 7 (delta):        slot 2 -> Deleted      slot 9 -> n9'
//! rev 6 (delta):        slot 4 -> n4
//! rev 4 (full dump):    slot 2 -> n2  slot 4 -> n4  slot 9 -> n9
//!
//! read at rev 7:        slot 2 -> gone   slot 4 -> n4   slot 9 -> n9'
//! ```
//!
//! Every `FULL_DUMP_INTERVAL` revisions the commit writes the complete
//! merged page instead of a delta, bounding any merge to the window.

use eyre::Result;
use hashbrown::HashMap;

use crate::config::{RECORD_LOW_MASK, RECORD_SHIFT};
use crate::node::Node;

/// Extracts the page key of a record key.
pub fn page_key_of(record_key: u64) -> u64 {
    record_key >> RECORD_SHIFT
}

/// Extracts the low-order slot of a record key.
pub fn slot_of(record_key: u64) -> u16 {
    (record_key & RECORD_LOW_MASK) as u16
}

/// One page fragment: the slots present in one revision's version of the
/// page. Whether that is a delta or a complete dump is decided at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPage {
    page_key: u64,
    revision: u32,
    /// A complete page: the merge never needs to look at older fragments.
    full_dump: bool,
    slots: HashMap<u16, Node>,
}

impl RecordPage {
    pub fn new(page_key: u64, revision: u32) -> Self {
        Self {
            page_key,
            revision,
            full_dump: false,
            slots: HashMap::new(),
        }
    }

    pub fn from_parts(
        page_key: u64,
        revision: u32,
        full_dump: bool,
        slots: HashMap<u16, Node>,
    ) -> Self {
        Self {
            page_key,
            revision,
            full_dump,
            slots,
        }
    }

    pub fn page_key(&self) -> u64 {
        self.page_key
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn is_full_dump(&self) -> bool {
        self.full_dump
    }

    pub fn set_full_dump(&mut self, full_dump: bool) {
        self.full_dump = full_dump;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The raw slot content, tombstones included.
    pub fn slot(&self, slot: u16) -> Option<&Node> {
        self.slots.get(&slot)
    }

    pub fn slot_mut(&mut self, slot: u16) -> Option<&mut Node> {
        self.slots.get_mut(&slot)
    }

    pub fn has_slot(&self, slot: u16) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn set_slot(&mut self, slot: u16, record: Node) {
        self.slots.insert(slot, record);
    }

    /// The live record in `slot`: `None` when absent or tombstoned.
    pub fn record(&self, slot: u16) -> Option<&Node> {
        self.slots.get(&slot).filter(|record| !record.is_deleted())
    }

    /// Slots in ascending order, for deterministic serialization.
    pub fn sorted_slots(&self) -> Vec<(u16, &Node)> {
        let mut slots: Vec<_> = self.slots.iter().map(|(&k, v)| (k, v)).collect();
        slots.sort_unstable_by_key(|(k, _)| *k);
        slots
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Node)> {
        self.slots.iter().map(|(&k, v)| (k, v))
    }

    /// Folds an older fragment under this one: slots already present win.
    pub fn merge_older(&mut self, older: &RecordPage) {
        debug_assert_eq!(self.page_key, older.page_key);
        for (&slot, record) in &older.slots {
            self.slots.entry(slot).or_insert_with(|| record.clone());
        }
    }

    /// The fragment to commit for the next revision: the slots of
    /// `modified` that differ from this pristine base view.
    pub fn delta_against(&self, modified: &HashMap<u16, Node>, revision: u32) -> RecordPage {
        let mut delta = RecordPage::new(self.page_key, revision);
        for (&slot, record) in modified {
            if self.slots.get(&slot) != Some(record) {
                delta.set_slot(slot, record.clone());
            }
        }
        delta
    }

    /// The complete page for a full-dump revision: the base view overlaid
    /// with the modified slots.
    pub fn full_dump_with(&self, modified: &HashMap<u16, Node>, revision: u32) -> RecordPage {
        let mut full = RecordPage::from_parts(self.page_key, revision, true, self.slots.clone());
        for (&slot, record) in modified {
            full.set_slot(slot, record.clone());
        }
        full
    }

    /// Rough serialized size, for the auto-commit byte threshold.
    pub fn estimated_size(&self) -> usize {
        self.slots.len() * 64
    }
}

/// Applies the sliding-window read rule to fragments supplied newest
/// first: the first fragment carrying the slot decides.
pub fn resolve_slot<'a, I>(fragments: I, slot: u16) -> Result<Option<&'a Node>>
where
    I: IntoIterator<Item = &'a RecordPage>,
{
    for fragment in fragments {
        if let Some(record) = fragment.slot(slot) {
            if record.is_deleted() {
                return Ok(None);
            }
            return Ok(Some(record));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NULL_NODE_KEY;
    use crate::node::{DeletedNode, Node, NodeDelegate, StructNodeDelegate, TextNode, ValueDelegate};

    fn text(key: u64, value: &[u8]) -> Node {
        Node::Text(TextNode {
            node: NodeDelegate::new(key, 0, 1, None),
            structure: StructNodeDelegate::detached(),
            value: ValueDelegate::new(value.to_vec(), false),
        })
    }

    fn tombstone(key: u64) -> Node {
        Node::Deleted(DeletedNode {
            node: NodeDelegate::new(key, NULL_NODE_KEY, 1, None),
        })
    }

    #[test]
    fn key_decomposition_matches_the_shift() {
        assert_eq!(page_key_of(0), 0);
        assert_eq!(slot_of(0), 0);
        assert_eq!(page_key_of(511), 0);
        assert_eq!(slot_of(511), 511);
        assert_eq!(page_key_of(512), 1);
        assert_eq!(slot_of(512), 0);
    }

    #[test]
    fn newer_fragment_wins_in_the_merge() {
        let mut old = RecordPage::new(0, 4);
        old.set_slot(2, text(2, b"old"));
        old.set_slot(4, text(4, b"kept"));

        let mut new = RecordPage::new(0, 7);
        new.set_slot(2, text(2, b"new"));

        let resolved = resolve_slot([&new, &old], 2).unwrap().unwrap();
        assert_eq!(
            resolved.value_delegate().unwrap().value().unwrap().as_ref(),
            b"new"
        );
        let kept = resolve_slot([&new, &old], 4).unwrap().unwrap();
        assert_eq!(
            kept.value_delegate().unwrap().value().unwrap().as_ref(),
            b"kept"
        );
    }

    #[test]
    fn tombstone_hides_older_versions() {
        let mut old = RecordPage::new(0, 4);
        old.set_slot(2, text(2, b"old"));

        let mut new = RecordPage::new(0, 7);
        new.set_slot(2, tombstone(2));

        assert!(resolve_slot([&new, &old], 2).unwrap().is_none());
        assert!(new.record(2).is_none());
        assert!(new.has_slot(2));
    }

    #[test]
    fn merge_older_keeps_newer_slots() {
        let mut newer = RecordPage::new(3, 7);
        newer.set_slot(1, text(1537, b"new"));

        let mut older = RecordPage::new(3, 5);
        older.set_slot(1, text(1537, b"old"));
        older.set_slot(2, text(1538, b"only-old"));

        newer.merge_older(&older);
        assert_eq!(newer.len(), 2);
        assert_eq!(
            newer
                .record(1)
                .unwrap()
                .value_delegate()
                .unwrap()
                .value()
                .unwrap()
                .as_ref(),
            b"new"
        );
    }

    #[test]
    fn delta_contains_only_changed_slots() {
        let mut base = RecordPage::new(0, 3);
        base.set_slot(1, text(1, b"same"));
        base.set_slot(2, text(2, b"before"));

        let mut modified = HashMap::new();
        modified.insert(1u16, text(1, b"same"));
        modified.insert(2u16, text(2, b"after"));
        modified.insert(3u16, text(3, b"fresh"));

        let delta = base.delta_against(&modified, 4);
        assert!(!delta.has_slot(1));
        assert!(delta.has_slot(2));
        assert!(delta.has_slot(3));

        let full = base.full_dump_with(&modified, 4);
        assert_eq!(full.len(), 3);
    }
}
