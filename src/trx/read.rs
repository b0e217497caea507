//! # Page Read Transaction
//!
//! A snapshot reader bound to one committed revision. Opening walks the
//! revision-root chain down from the uber page to the requested revision;
//! every page it touches afterwards is resolved through the shared cache,
//! and nothing it does ever mutates on-disk state.
//!
//! ## Record resolution
//!
//! `get_record` decomposes the key into the per-level indirect slots,
//! walks the family's indirect tree to the leaf record page, and applies
//! the sliding-window merge: the newest fragment wins; a fragment that
//! does not carry the slot forwards the walk to the revision just below
//! the fragment's own commit revision, until a full dump, the page's
//! origin, or the window bound ends the search. A tombstone in a newer
//! fragment hides every older version.

use std::cell::RefCell;
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::cache::PageCacheKey;
use crate::config::{INDIRECT_LEVELS, NULL_NODE_KEY, NULL_OFFSET, SLIDING_WINDOW};
use crate::node::{Kind, Node};
use crate::page::record_page::{page_key_of, slot_of};
use crate::page::{codec as page_codec, NamePage, Page, PageKind, RecordPage, RevisionRootPage};
use crate::resource::ResourceInner;
use crate::trx::{indirect_slot, FAMILY_LEVEL, LEAF_LEVEL};

/// Snapshot reader over a fixed revision.
pub struct PageReadTrx {
    resource: Arc<ResourceInner>,
    revision: u32,
    root: RevisionRootPage,
    root_offset: u64,
    name_page: Arc<Page>,
    /// Revision roots resolved while merging, keyed by revision.
    roots_memo: RefCell<HashMap<u32, RevisionRootPage>>,
}

impl PageReadTrx {
    /// Binds to `revision`, which must already be committed.
    pub(crate) fn open(resource: Arc<ResourceInner>, revision: u32) -> Result<Self> {
        let uber = resource.uber();
        ensure!(
            revision <= uber.latest_revision(),
            "unknown revision {} (latest is {})",
            revision,
            uber.latest_revision()
        );

        let mut offset = uber.revision_root_offset;
        let root = loop {
            let page = load_page(&resource, PageKind::RevisionRoot, FAMILY_LEVEL, 0, offset)?;
            let Page::RevisionRoot(root) = page.as_ref() else {
                eyre::bail!("revision-root offset {} holds a {:?} page", offset, page.kind());
            };
            if root.revision == revision {
                break root.clone();
            }
            ensure!(
                root.revision > revision && root.prev_root_offset != NULL_OFFSET,
                "broken revision chain at revision {} looking for {}",
                root.revision,
                revision
            );
            offset = root.prev_root_offset;
        };

        let name_page = if root.name_page != NULL_OFFSET {
            load_page(&resource, PageKind::Name, FAMILY_LEVEL, 0, root.name_page)?
        } else {
            Arc::new(Page::Name(NamePage::empty()))
        };

        Ok(Self {
            resource,
            revision,
            root,
            root_offset: offset,
            name_page,
            roots_memo: RefCell::new(HashMap::new()),
        })
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn revision_root(&self) -> &RevisionRootPage {
        &self.root
    }

    pub fn root_offset(&self) -> u64 {
        self.root_offset
    }

    pub fn max_node_key(&self) -> u64 {
        self.root.max_node_key
    }

    pub(crate) fn resource(&self) -> &Arc<ResourceInner> {
        &self.resource
    }

    /// The committed name page of this revision.
    pub fn name_page(&self) -> &NamePage {
        match self.name_page.as_ref() {
            Page::Name(name) => name,
            _ => unreachable!("name page slot holds a non-name page"),
        }
    }

    /// Resolves a name key through the per-kind dictionaries.
    pub fn get_name(&self, key: i32, kind: Kind) -> Option<String> {
        self.name_page().get_name(key, kind).map(str::to_owned)
    }

    /// Fetches the record stored under `key` in the given family, merging
    /// the sliding window of page fragments.
    pub fn get_record(&self, key: u64, kind: PageKind, index: u32) -> Result<Option<Node>> {
        ensure!(kind.is_record_family(), "{:?} pages hold no records", kind);
        ensure!(key != NULL_NODE_KEY, "cannot resolve the null node key");

        let page_key = page_key_of(key);
        let slot = slot_of(key);

        let mut revision = self.revision;
        let mut fetches = 0u32;
        loop {
            let Some(page) = self.leaf_page_at(revision, kind, index, page_key)? else {
                return Ok(None);
            };
            let fragment = page.as_record()?;
            if fragment.has_slot(slot) {
                // A tombstone resolves to "gone" right here.
                return Ok(fragment.record(slot).cloned());
            }
            fetches += 1;
            if fragment.is_full_dump() || fragment.revision() == 0 || fetches >= SLIDING_WINDOW {
                return Ok(None);
            }
            revision = fragment.revision() - 1;
        }
    }

    /// Merged view of a record page as visible at this revision, plus the
    /// number of fragments the merge consumed. `None` when the page does
    /// not exist.
    pub fn materialize_view(
        &self,
        kind: PageKind,
        index: u32,
        page_key: u64,
    ) -> Result<Option<(RecordPage, u32)>> {
        let Some(newest) = self.leaf_page_at(self.revision, kind, index, page_key)? else {
            return Ok(None);
        };
        let newest = newest.as_record()?;
        let mut merged = newest.clone();
        let mut fragments = 1u32;

        // Cursor over the fragment chain: the next older fragment is the
        // newest one visible just below the current fragment's revision.
        let mut cursor = (newest.revision(), newest.is_full_dump());
        while !cursor.1 && cursor.0 > 0 && fragments < SLIDING_WINDOW {
            let Some(older) = self.leaf_page_at(cursor.0 - 1, kind, index, page_key)? else {
                break;
            };
            let older = older.as_record()?;
            ensure!(
                older.revision() < cursor.0,
                "fragment chain did not move backwards at revision {}",
                cursor.0
            );
            merged.merge_older(older);
            fragments += 1;
            cursor = (older.revision(), older.is_full_dump());
        }

        Ok(Some((merged, fragments)))
    }

    /// The newest committed fragment of `page_key` visible at `revision`.
    fn leaf_page_at(
        &self,
        revision: u32,
        kind: PageKind,
        index: u32,
        page_key: u64,
    ) -> Result<Option<Arc<Page>>> {
        let root = self.root_at(revision)?;
        // An index may not exist yet in an older revision the merge
        // walks through; that is an absent page, not an error.
        let Some(sub_root) = self.try_family_sub_root(&root, kind, index)? else {
            return Ok(None);
        };
        if sub_root == NULL_OFFSET {
            return Ok(None);
        }

        let mut offset = sub_root;
        for level in 0..INDIRECT_LEVELS {
            let page = load_page(&self.resource, PageKind::Indirect, level as i32, index, offset)?;
            let child = page.as_indirect()?.child(indirect_slot(page_key, level));
            if child == NULL_OFFSET {
                return Ok(None);
            }
            offset = child;
        }

        Ok(Some(load_page(
            &self.resource,
            PageKind::Record,
            LEAF_LEVEL,
            index,
            offset,
        )?))
    }

    /// The revision root of `revision`, walking the chain down from this
    /// transaction's own root and memoizing every root it passes.
    fn root_at(&self, revision: u32) -> Result<RevisionRootPage> {
        ensure!(
            revision <= self.revision,
            "revision {} is newer than this snapshot ({})",
            revision,
            self.revision
        );
        if revision == self.revision {
            return Ok(self.root.clone());
        }
        if let Some(root) = self.roots_memo.borrow().get(&revision) {
            return Ok(root.clone());
        }

        let mut current = self.root.clone();
        loop {
            ensure!(
                current.prev_root_offset != NULL_OFFSET,
                "broken revision chain below revision {}",
                current.revision
            );
            let page = load_page(
                &self.resource,
                PageKind::RevisionRoot,
                FAMILY_LEVEL,
                0,
                current.prev_root_offset,
            )?;
            let Page::RevisionRoot(root) = page.as_ref() else {
                eyre::bail!("revision chain offset holds a {:?} page", page.kind());
            };
            self.roots_memo
                .borrow_mut()
                .insert(root.revision, root.clone());
            if root.revision == revision {
                return Ok(root.clone());
            }
            ensure!(
                root.revision > revision,
                "revision {} missing from the chain",
                revision
            );
            current = root.clone();
        }
    }

    /// Like `family_sub_root`, but resolves an unknown index number to
    /// `None` instead of an error.
    fn try_family_sub_root(
        &self,
        root: &RevisionRootPage,
        kind: PageKind,
        index: u32,
    ) -> Result<Option<u64>> {
        match kind {
            PageKind::Record => Ok(Some(root.record_root)),
            PageKind::Name => {
                if root.name_page == NULL_OFFSET {
                    return Ok(None);
                }
                let page =
                    load_page(&self.resource, PageKind::Name, FAMILY_LEVEL, 0, root.name_page)?;
                let Page::Name(name) = page.as_ref() else {
                    eyre::bail!("name page slot holds a {:?} page", page.kind());
                };
                if !name.family.has_index(index) {
                    return Ok(None);
                }
                Ok(Some(name.family.root(index)?))
            }
            PageKind::Path | PageKind::Cas | PageKind::PathSummary => {
                let offset = root.family_root(kind)?;
                if offset == NULL_OFFSET {
                    return Ok(None);
                }
                let page = load_page(&self.resource, kind, FAMILY_LEVEL, 0, offset)?;
                let Page::Family(family) = page.as_ref() else {
                    eyre::bail!("{:?} family slot holds a {:?} page", kind, page.kind());
                };
                if !family.has_index(index) {
                    return Ok(None);
                }
                Ok(Some(family.root(index)?))
            }
            _ => eyre::bail!("{:?} pages hold no records", kind),
        }
    }

    /// Sub-root offset of `(kind, index)` under `root`.
    pub(crate) fn family_sub_root(
        &self,
        root: &RevisionRootPage,
        kind: PageKind,
        index: u32,
    ) -> Result<u64> {
        match kind {
            PageKind::Record => Ok(root.record_root),
            PageKind::Name => {
                if root.name_page == NULL_OFFSET {
                    return Ok(NULL_OFFSET);
                }
                let page =
                    load_page(&self.resource, PageKind::Name, FAMILY_LEVEL, 0, root.name_page)?;
                let Page::Name(name) = page.as_ref() else {
                    eyre::bail!("name page slot holds a {:?} page", page.kind());
                };
                name.family.root(index)
            }
            PageKind::Path | PageKind::Cas | PageKind::PathSummary => {
                let offset = root.family_root(kind)?;
                if offset == NULL_OFFSET {
                    return Ok(NULL_OFFSET);
                }
                let page = load_page(&self.resource, kind, FAMILY_LEVEL, 0, offset)?;
                let Page::Family(family) = page.as_ref() else {
                    eyre::bail!("{:?} family slot holds a {:?} page", kind, page.kind());
                };
                family.root(index)
            }
            _ => eyre::bail!("{:?} pages hold no records", kind),
        }
    }

    /// The committed family page of `kind` (name, path, CAS or path
    /// summary), if this revision has one.
    pub fn family_page(&self, kind: PageKind) -> Result<Option<Arc<Page>>> {
        let offset = self.root.family_root(kind)?;
        if offset == NULL_OFFSET {
            return Ok(None);
        }
        Ok(Some(load_page(
            &self.resource,
            kind,
            FAMILY_LEVEL,
            0,
            offset,
        )?))
    }
}

/// Loads and decodes a committed page through the shared cache.
pub(crate) fn load_page(
    resource: &Arc<ResourceInner>,
    kind: PageKind,
    level: i32,
    index: u32,
    offset: u64,
) -> Result<Arc<Page>> {
    let key = PageCacheKey::new(kind, level, index, offset);
    resource.cache.get_or_load(key, || {
        let file = resource.file.read();
        let page = page_codec::deserialize(file.read_blob(offset)?)?;
        ensure!(
            page.kind() == kind,
            "expected a {:?} page at offset {}, found {:?}",
            kind,
            offset,
            page.kind()
        );
        Ok(page)
    })
}
