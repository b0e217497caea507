//! # Page Write Transaction
//!
//! The exclusive copy-on-write writer of a resource. All mutations stage
//! pages in two logs (record-page containers in the spillable
//! [`IntentLog`], copied indirect and family pages in memory) and nothing
//! touches the resource file until `commit`.
//!
//! ## COW protocol
//!
//! Preparing a record for modification walks the root-to-leaf indirect
//! path of its page: every indirect page not yet copied is cloned into the
//! indirect log under its deterministic log key, then the leaf page's
//! sliding-window view is materialized once into a container. From then on
//! the transaction reads and writes that container; parent slots are
//! rewritten with real offsets only at flush time, children first.
//!
//! ## Commit
//!
//! 1. Drain the containers (memory and spill) and append each one's delta
//!    or full dump, recording leaf offsets in the copied parents.
//! 2. Flush the indirect levels deepest-first, wiring child offsets
//!    upward; level-0 pages become the new family sub-roots.
//! 3. Flush dirty family pages and the new revision root.
//! 4. fsync, append the new uber page, fsync, flip the header trailer
//!    slot. That single word is the linearization point: a crash before
//!    it leaves the resource at the prior revision.
//! 5. Clear the logs and rebind to the new revision.
//!
//! `abort` discards both logs and rebinds; the uber page is untouched.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result};
use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::config::{
    FANOUT, FANOUT_SHIFT, INDIRECT_LEVELS, NULL_OFFSET, RECORD_LOG_IN_MEMORY_CAP,
};
use crate::node::{Kind, Node};
use crate::page::record_page::{page_key_of, slot_of};
use crate::page::{
    codec as page_codec, IndexFamilyPage, IndirectPage, NamePage, Page, PageKind, RecordPage,
    RevisionRootPage, UberPage,
};
use crate::resource::ResourceInner;
use crate::trx::read::{load_page, PageReadTrx};
use crate::trx::{indirect_slot, leaf_slot, LogKey, PageContainer};
use crate::txlog::IntentLog;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Exclusive copy-on-write page writer.
pub struct PageWriteTrx {
    read: PageReadTrx,
    new_revision: u32,
    /// Working copy of the revision root being built.
    root: RevisionRootPage,
    /// Working copy of the name page (dictionaries + name-index family).
    name_page: NamePage,
    name_dirty: bool,
    /// Working copies of the path/CAS/path-summary family pages; presence
    /// means dirty.
    families: HashMap<PageKind, IndexFamilyPage>,
    record_log: IntentLog,
    indirect_log: HashMap<LogKey, IndirectPage>,
}

impl PageWriteTrx {
    /// Opens the writer on the latest committed revision. The caller must
    /// already hold the resource's writer claim.
    pub(crate) fn open(resource: Arc<ResourceInner>) -> Result<Self> {
        let latest = resource.uber().latest_revision();
        let read = PageReadTrx::open(Arc::clone(&resource), latest)?;
        let new_revision = latest + 1;
        let root = read
            .revision_root()
            .next_revision(read.root_offset(), now_millis());
        let name_page = read.name_page().clone();
        let record_log = IntentLog::new(resource.log_path(), RECORD_LOG_IN_MEMORY_CAP)?;
        Ok(Self {
            read,
            new_revision,
            root,
            name_page,
            name_dirty: false,
            families: HashMap::new(),
            record_log,
            indirect_log: HashMap::new(),
        })
    }

    /// The revision this transaction is building.
    pub fn revision(&self) -> u32 {
        self.new_revision
    }

    /// The committed revision this transaction reads through to.
    pub fn read_revision(&self) -> u32 {
        self.read.revision()
    }

    pub fn read_trx(&self) -> &PageReadTrx {
        &self.read
    }

    pub(crate) fn resource(&self) -> &Arc<ResourceInner> {
        self.read.resource()
    }

    pub fn max_node_key(&self) -> u64 {
        self.root.max_node_key
    }

    /// Number of pages staged for the next commit.
    pub fn dirty_page_count(&self) -> usize {
        self.record_log.len() + self.indirect_log.len()
    }

    /// Estimated bytes staged for the next commit.
    pub fn staged_bytes(&self) -> usize {
        self.record_log.estimated_bytes()
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    pub fn create_name_key(&mut self, name: &str, kind: Kind) -> Result<i32> {
        self.name_dirty = true;
        self.name_page.create_name_key(name, kind)
    }

    pub fn get_name(&self, key: i32, kind: Kind) -> Option<String> {
        self.name_page.get_name(key, kind).map(str::to_owned)
    }

    pub fn remove_name(&mut self, key: i32, kind: Kind) -> Result<()> {
        self.name_dirty = true;
        self.name_page.remove_name(key, kind)
    }

    // ------------------------------------------------------------------
    // Index families and key allocation
    // ------------------------------------------------------------------

    fn family_mut(&mut self, kind: PageKind) -> Result<&mut IndexFamilyPage> {
        match kind {
            PageKind::Name => {
                self.name_dirty = true;
                Ok(&mut self.name_page.family)
            }
            PageKind::Path | PageKind::Cas | PageKind::PathSummary => {
                if !self.families.contains_key(&kind) {
                    let committed = match self.read.family_page(kind)? {
                        Some(page) => match page.as_ref() {
                            Page::Family(family) => family.clone(),
                            other => eyre::bail!(
                                "{:?} family slot holds a {:?} page",
                                kind,
                                other.kind()
                            ),
                        },
                        None => IndexFamilyPage::empty(kind),
                    };
                    self.families.insert(kind, committed);
                }
                Ok(self.families.get_mut(&kind).unwrap()) // INVARIANT: inserted above
            }
            _ => eyre::bail!("page kind {:?} has no index family", kind),
        }
    }

    fn family_ref(&self, kind: PageKind) -> Result<Option<&IndexFamilyPage>> {
        match kind {
            PageKind::Name => Ok(Some(&self.name_page.family)),
            PageKind::Path | PageKind::Cas | PageKind::PathSummary => {
                Ok(self.families.get(&kind))
            }
            _ => eyre::bail!("page kind {:?} has no index family", kind),
        }
    }

    /// Registers index `index` of `kind`, creating its empty sub-tree.
    pub fn create_index(&mut self, kind: PageKind, index: u32) -> Result<()> {
        ensure!(
            kind.is_record_family() && kind != PageKind::Record,
            "cannot create an index under {:?} pages",
            kind
        );
        self.family_mut(kind)?.ensure_index(index);
        Ok(())
    }

    /// Whether `(kind, index)` exists, counting indexes created by this
    /// transaction.
    pub fn index_exists(&self, kind: PageKind, index: u32) -> Result<bool> {
        if kind == PageKind::Record {
            return Ok(true);
        }
        if let Some(family) = self.family_ref(kind)? {
            if family.has_index(index) {
                return Ok(true);
            }
        }
        self.committed_index_exists(kind, index)
    }

    fn committed_index_exists(&self, kind: PageKind, index: u32) -> Result<bool> {
        match kind {
            PageKind::Record => Ok(true),
            PageKind::Name => Ok(self.read.name_page().family.has_index(index)),
            PageKind::Path | PageKind::Cas | PageKind::PathSummary => {
                match self.read.family_page(kind)? {
                    Some(page) => match page.as_ref() {
                        Page::Family(family) => Ok(family.has_index(index)),
                        other => {
                            eyre::bail!("{:?} family slot holds a {:?} page", kind, other.kind())
                        }
                    },
                    None => Ok(false),
                }
            }
            _ => eyre::bail!("page kind {:?} has no index family", kind),
        }
    }

    /// Allocates the next record key of `(kind, index)`. Keys are never
    /// reused, so the counters only grow.
    pub fn new_record_key(&mut self, kind: PageKind, index: u32) -> Result<u64> {
        if kind == PageKind::Record {
            self.root.max_node_key += 1;
            return Ok(self.root.max_node_key);
        }
        ensure!(
            self.index_exists(kind, index)?,
            "unknown {:?} index number {}",
            kind,
            index
        );
        self.family_mut(kind)?.new_node_key(index)
    }

    /// Highest key allocated for `(kind, index)` so far.
    pub fn current_max_key(&self, kind: PageKind, index: u32) -> Result<u64> {
        if kind == PageKind::Record {
            return Ok(self.root.max_node_key);
        }
        if let Some(family) = self.family_ref(kind)? {
            if family.has_index(index) {
                return family.max_node_key(index);
            }
        }
        match kind {
            PageKind::Name => self.read.name_page().family.max_node_key(index),
            _ => match self.read.family_page(kind)? {
                Some(page) => match page.as_ref() {
                    Page::Family(family) => family.max_node_key(index),
                    other => eyre::bail!("{:?} family slot holds a {:?} page", kind, other.kind()),
                },
                None => eyre::bail!("unknown {:?} index number {}", kind, index),
            },
        }
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Read-your-writes record lookup: staged containers win over the
    /// committed snapshot.
    pub fn get_record(&mut self, key: u64, kind: PageKind, index: u32) -> Result<Option<Node>> {
        ensure!(kind.is_record_family(), "{:?} pages hold no records", kind);
        let log_key = LogKey::leaf(kind, index, page_key_of(key));
        if self.record_log.contains(&log_key) {
            let container = self
                .record_log
                .container(&log_key)?
                .expect("staged container vanished"); // INVARIANT: contains() checked
            return Ok(container.record(slot_of(key)).cloned());
        }
        if !self.committed_index_exists(kind, index)? {
            return Ok(None);
        }
        self.read.get_record(key, kind, index)
    }

    /// Stages a freshly created record under `key`.
    pub fn create_entry(
        &mut self,
        key: u64,
        record: Node,
        kind: PageKind,
        index: u32,
    ) -> Result<&mut Node> {
        ensure!(
            record.node_key() == key,
            "record key {} does not match entry key {}",
            record.node_key(),
            key
        );
        let log_key = self.prepare_container(kind, index, page_key_of(key))?;
        let container = self
            .record_log
            .container(&log_key)?
            .expect("prepared container vanished"); // INVARIANT: prepared above
        Ok(container.create_slot(slot_of(key), record))
    }

    /// Copies the record under `key` into the current revision and hands
    /// out a mutable reference. Subsequent reads within this transaction
    /// observe the mutation.
    pub fn prepare_entry_for_modification(
        &mut self,
        key: u64,
        kind: PageKind,
        index: u32,
    ) -> Result<&mut Node> {
        let log_key = self.prepare_container(kind, index, page_key_of(key))?;
        let container = self
            .record_log
            .container(&log_key)?
            .expect("prepared container vanished"); // INVARIANT: prepared above
        container
            .prepare_slot(slot_of(key))
            .map_err(|e| eyre::eyre!("cannot modify record {}: {}", key, e))
    }

    /// Replaces the record under `key` with a tombstone. The key is never
    /// reused.
    pub fn remove_entry(&mut self, key: u64, kind: PageKind, index: u32) -> Result<()> {
        let log_key = self.prepare_container(kind, index, page_key_of(key))?;
        let revision = self.new_revision;
        let container = self
            .record_log
            .container(&log_key)?
            .expect("prepared container vanished"); // INVARIANT: prepared above
        container
            .remove_slot(slot_of(key), key, revision)
            .map_err(|e| eyre::eyre!("cannot remove record {}: {}", key, e))
    }

    /// Ensures the leaf container for `page_key` is staged, copying the
    /// indirect path and materializing the committed view on first touch.
    fn prepare_container(
        &mut self,
        kind: PageKind,
        index: u32,
        page_key: u64,
    ) -> Result<LogKey> {
        ensure!(kind.is_record_family(), "{:?} pages hold no records", kind);
        ensure!(
            self.index_exists(kind, index)?,
            "unknown {:?} index number {}",
            kind,
            index
        );
        let log_key = LogKey::leaf(kind, index, page_key);
        if self.record_log.contains(&log_key) {
            return Ok(log_key);
        }

        // Materialize the family working copy now: the commit flush holds
        // the file write lock and must not fault in committed pages.
        if kind != PageKind::Record {
            self.family_mut(kind)?.ensure_index(index);
        }

        self.prepare_indirect_path(kind, index, page_key)?;

        let committed_view = if self.committed_index_exists(kind, index)? {
            self.read.materialize_view(kind, index, page_key)?
        } else {
            None
        };
        let container = match committed_view {
            Some((view, fragments)) => PageContainer::new(view, fragments),
            None => PageContainer::new(RecordPage::new(page_key, self.new_revision), 0),
        };
        trace!(?log_key, "staged record page container");
        self.record_log.put(log_key, container)?;
        Ok(log_key)
    }

    /// Copies every indirect page on the root-to-leaf path of `page_key`
    /// into the indirect log.
    fn prepare_indirect_path(&mut self, kind: PageKind, index: u32, page_key: u64) -> Result<()> {
        let mut committed_offset = if self.committed_index_exists(kind, index)? {
            self.read
                .family_sub_root(self.read.revision_root(), kind, index)?
        } else {
            NULL_OFFSET
        };

        for level in 0..INDIRECT_LEVELS {
            let log_key = LogKey::indirect(kind, index, level, page_key);
            if !self.indirect_log.contains_key(&log_key) {
                let copy = if committed_offset != NULL_OFFSET {
                    let page = load_page(
                        self.read.resource(),
                        PageKind::Indirect,
                        level as i32,
                        index,
                        committed_offset,
                    )?;
                    page.as_indirect()?.clone()
                } else {
                    IndirectPage::empty()
                };
                self.indirect_log.insert(log_key, copy);
            }

            if committed_offset != NULL_OFFSET {
                let page = load_page(
                    self.read.resource(),
                    PageKind::Indirect,
                    level as i32,
                    index,
                    committed_offset,
                )?;
                committed_offset = page.as_indirect()?.child(indirect_slot(page_key, level));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit / abort
    // ------------------------------------------------------------------

    /// Flushes every staged page, writes the new revision root and flips
    /// the uber pointer. Returns the committed revision number and
    /// rebinds this transaction to it.
    pub fn commit(&mut self) -> Result<u32> {
        let committed_revision = self.new_revision;
        let timestamp = now_millis();
        let resource = Arc::clone(self.read.resource());

        let containers = self.record_log.drain_all()?;
        debug!(
            revision = committed_revision,
            containers = containers.len(),
            indirect = self.indirect_log.len(),
            "committing revision"
        );

        let mut file = resource.file.write();

        // Leaves first: their offsets feed the copied parents.
        for (log_key, container) in containers {
            let Some(page) = container.committed_page(committed_revision) else {
                continue;
            };
            let blob = page_codec::serialize(&Page::Record(page));
            let offset = file.append_blob(&blob)?;
            let parent_key = LogKey::indirect(
                log_key.kind,
                log_key.index,
                INDIRECT_LEVELS - 1,
                log_key.slice,
            );
            let parent = self
                .indirect_log
                .get_mut(&parent_key)
                .ok_or_else(|| eyre::eyre!("missing copied parent for leaf {:?}", log_key))?;
            parent.set_child(leaf_slot(log_key.slice), offset);
        }

        // Indirect levels deepest-first, wiring offsets upward.
        for level in (0..INDIRECT_LEVELS).rev() {
            let keys: Vec<LogKey> = self
                .indirect_log
                .keys()
                .filter(|key| key.level == level as i32)
                .copied()
                .collect();
            for key in keys {
                let page = self.indirect_log.remove(&key).unwrap(); // INVARIANT: key collected above
                let blob = page_codec::serialize(&Page::Indirect(page));
                let offset = file.append_blob(&blob)?;
                if level == 0 {
                    match key.kind {
                        PageKind::Record => self.root.record_root = offset,
                        PageKind::Name => {
                            self.name_page.family.ensure_index(key.index);
                            self.name_page.family.roots[key.index as usize] = offset;
                            self.name_dirty = true;
                        }
                        other => {
                            let family = self.family_mut(other)?;
                            family.ensure_index(key.index);
                            family.roots[key.index as usize] = offset;
                        }
                    }
                } else {
                    let parent_key = LogKey {
                        kind: key.kind,
                        level: key.level - 1,
                        slice: key.slice >> FANOUT_SHIFT,
                        index: key.index,
                    };
                    let parent = self.indirect_log.get_mut(&parent_key).ok_or_else(|| {
                        eyre::eyre!("missing copied parent for indirect {:?}", key)
                    })?;
                    parent.set_child((key.slice & (FANOUT as u64 - 1)) as usize, offset);
                }
            }
        }

        // Family pages, then the revision root.
        for kind in [PageKind::Path, PageKind::Cas, PageKind::PathSummary] {
            if let Some(family) = self.families.remove(&kind) {
                let blob = page_codec::serialize(&Page::Family(family));
                let offset = file.append_blob(&blob)?;
                self.root.set_family_root(kind, offset)?;
            }
        }
        if self.name_dirty {
            let blob = page_codec::serialize(&Page::Name(self.name_page.clone()));
            self.root.name_page = file.append_blob(&blob)?;
        }

        self.root.revision = committed_revision;
        self.root.timestamp = timestamp;
        self.root.prev_root_offset = self.read.root_offset();
        let root_blob = page_codec::serialize(&Page::RevisionRoot(self.root.clone()));
        let root_offset = file.append_blob(&root_blob)?;

        // Linearization: everything durable, then the uber flip.
        file.sync()?;
        let uber = UberPage {
            revision_count: committed_revision + 1,
            revision_root_offset: root_offset,
        };
        let uber_blob = page_codec::serialize(&Page::Uber(uber.clone()));
        let uber_offset = file.append_blob(&uber_blob)?;
        file.sync()?;
        file.write_uber_slot(uber_offset, uber_blob.len() as u32)?;
        file.refresh_map()?;
        drop(file);

        resource.set_uber(uber);
        debug!(revision = committed_revision, "revision committed");

        self.record_log.clear()?;
        self.indirect_log.clear();
        self.rebind()?;
        Ok(committed_revision)
    }

    /// Discards every staged change; the resource stays at the revision
    /// this transaction was opened on.
    pub fn abort(&mut self) -> Result<()> {
        debug!(revision = self.new_revision, "aborting write transaction");
        self.record_log.clear()?;
        self.indirect_log.clear();
        self.rebind()
    }

    /// Rebinds the working state to the latest committed revision.
    fn rebind(&mut self) -> Result<()> {
        let resource = Arc::clone(self.read.resource());
        let latest = resource.uber().latest_revision();
        self.read = PageReadTrx::open(resource, latest)?;
        self.new_revision = latest + 1;
        self.root = self
            .read
            .revision_root()
            .next_revision(self.read.root_offset(), now_millis());
        self.name_page = self.read.name_page().clone();
        self.name_dirty = false;
        self.families.clear();
        Ok(())
    }
}

impl Drop for PageWriteTrx {
    fn drop(&mut self) {
        self.read.resource().release_writer();
    }
}
