//! # Page Model
//!
//! Pages are the unit of IO and copy-on-write. Every page kind carries a
//! one-byte tag and serializes to a framed blob in the resource file;
//! references between pages are plain file offsets (`NULL_OFFSET` when the
//! child does not exist yet), resolved at flush time for pages still in a
//! transaction log.
//!
//! ## Kinds
//!
//! - **Uber**: revision count plus the offset of the latest revision
//!   root. The uber page is the single mutable pointer of the resource:
//!   rewriting its trailer slot commits a revision.
//! - **RevisionRoot**: per-revision metadata and the sub-roots of the
//!   five record families. Revision roots chain backwards through
//!   `prev_root_offset`, which is how a reader binds to any revision and
//!   how the sliding-window merge reaches older page fragments.
//! - **Indirect**: fan-out array of child offsets; `INDIRECT_LEVELS`
//!   levels address a family's record pages.
//! - **Record**: leaf page of records, possibly a delta (see
//!   [`record_page`]).
//! - **Name**: the name dictionaries plus the name-index family roots.
//! - **Path / Cas / PathSummary**: index family pages: one indirect
//!   sub-root and one node-key counter per index.

pub mod codec;
pub mod record_page;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

use crate::config::{NULL_NAME_KEY, NULL_OFFSET};
use crate::name::name_key;
use crate::node::Kind;
pub use record_page::RecordPage;

/// Page kind tag; doubles as the record-family selector in the
/// transaction APIs (`Record`, `Name`, `Path`, `Cas`, `PathSummary`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Uber = 1,
    RevisionRoot = 2,
    Indirect = 3,
    Record = 4,
    Name = 5,
    Path = 6,
    Cas = 7,
    PathSummary = 8,
}

impl PageKind {
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            1 => PageKind::Uber,
            2 => PageKind::RevisionRoot,
            3 => PageKind::Indirect,
            4 => PageKind::Record,
            5 => PageKind::Name,
            6 => PageKind::Path,
            7 => PageKind::Cas,
            8 => PageKind::PathSummary,
            _ => bail!("invalid page kind tag: {}", b),
        })
    }

    /// Kinds whose sub-trees hold records.
    pub fn is_record_family(self) -> bool {
        matches!(
            self,
            PageKind::Record
                | PageKind::Name
                | PageKind::Path
                | PageKind::Cas
                | PageKind::PathSummary
        )
    }
}

/// The single mutable pointer of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UberPage {
    pub revision_count: u32,
    pub revision_root_offset: u64,
}

impl UberPage {
    /// Latest committed revision number.
    pub fn latest_revision(&self) -> u32 {
        debug_assert!(self.revision_count > 0);
        self.revision_count - 1
    }
}

/// Per-revision metadata and family sub-roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRootPage {
    pub revision: u32,
    /// Commit wall-clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Highest document-record key allocated up to this revision.
    pub max_node_key: u64,
    /// Offset of the previous revision's root; `NULL_OFFSET` at revision 0.
    pub prev_root_offset: u64,
    /// Indirect sub-root of the document record tree.
    pub record_root: u64,
    pub name_page: u64,
    pub path_page: u64,
    pub cas_page: u64,
    pub path_summary_page: u64,
}

impl RevisionRootPage {
    /// Root of the empty bootstrap revision.
    pub fn bootstrap(timestamp: u64) -> Self {
        Self {
            revision: 0,
            timestamp,
            max_node_key: 0,
            prev_root_offset: NULL_OFFSET,
            record_root: NULL_OFFSET,
            name_page: NULL_OFFSET,
            path_page: NULL_OFFSET,
            cas_page: NULL_OFFSET,
            path_summary_page: NULL_OFFSET,
        }
    }

    /// Working copy for the next revision, sharing every sub-root until
    /// copy-on-write replaces it.
    pub fn next_revision(&self, own_offset: u64, timestamp: u64) -> Self {
        Self {
            revision: self.revision + 1,
            timestamp,
            prev_root_offset: own_offset,
            ..self.clone()
        }
    }

    pub fn family_root(&self, kind: PageKind) -> Result<u64> {
        Ok(match kind {
            PageKind::Record => self.record_root,
            PageKind::Name => self.name_page,
            PageKind::Path => self.path_page,
            PageKind::Cas => self.cas_page,
            PageKind::PathSummary => self.path_summary_page,
            _ => bail!("page kind {:?} is not a record family", kind),
        })
    }

    pub fn set_family_root(&mut self, kind: PageKind, offset: u64) -> Result<()> {
        match kind {
            PageKind::Record => self.record_root = offset,
            PageKind::Name => self.name_page = offset,
            PageKind::Path => self.path_page = offset,
            PageKind::Cas => self.cas_page = offset,
            PageKind::PathSummary => self.path_summary_page = offset,
            _ => bail!("page kind {:?} is not a record family", kind),
        }
        Ok(())
    }
}

/// Fan-out array of child offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectPage {
    refs: Vec<u64>,
}

impl IndirectPage {
    pub fn empty() -> Self {
        Self {
            refs: vec![NULL_OFFSET; crate::config::FANOUT],
        }
    }

    pub fn from_refs(refs: Vec<u64>) -> Result<Self> {
        ensure!(
            refs.len() == crate::config::FANOUT,
            "indirect page with {} slots (fan-out {})",
            refs.len(),
            crate::config::FANOUT
        );
        Ok(Self { refs })
    }

    pub fn child(&self, slot: usize) -> u64 {
        self.refs[slot]
    }

    pub fn has_child(&self, slot: usize) -> bool {
        self.refs[slot] != NULL_OFFSET
    }

    pub fn set_child(&mut self, slot: usize, offset: u64) {
        self.refs[slot] = offset;
    }

    pub fn refs(&self) -> &[u64] {
        &self.refs
    }
}

/// One entry of a name dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub name: String,
    pub uses: u32,
}

/// Index family state: one indirect sub-root and one key counter per
/// index number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFamilyPage {
    pub kind: PageKind,
    pub roots: Vec<u64>,
    pub max_node_keys: Vec<u64>,
}

impl IndexFamilyPage {
    pub fn empty(kind: PageKind) -> Self {
        debug_assert!(kind.is_record_family());
        Self {
            kind,
            roots: Vec::new(),
            max_node_keys: Vec::new(),
        }
    }

    pub fn index_count(&self) -> u32 {
        self.roots.len() as u32
    }

    pub fn has_index(&self, index: u32) -> bool {
        (index as usize) < self.roots.len()
    }

    /// Grows the family to cover `index`, creating empty sub-trees.
    pub fn ensure_index(&mut self, index: u32) {
        while self.roots.len() <= index as usize {
            self.roots.push(NULL_OFFSET);
            self.max_node_keys.push(0);
        }
    }

    pub fn root(&self, index: u32) -> Result<u64> {
        ensure!(
            self.has_index(index),
            "unknown {:?} index number {}",
            self.kind,
            index
        );
        Ok(self.roots[index as usize])
    }

    pub fn max_node_key(&self, index: u32) -> Result<u64> {
        ensure!(
            self.has_index(index),
            "unknown {:?} index number {}",
            self.kind,
            index
        );
        Ok(self.max_node_keys[index as usize])
    }

    /// Allocates the next record key of `index`.
    pub fn new_node_key(&mut self, index: u32) -> Result<u64> {
        ensure!(
            self.has_index(index),
            "unknown {:?} index number {}",
            self.kind,
            index
        );
        self.max_node_keys[index as usize] += 1;
        Ok(self.max_node_keys[index as usize])
    }
}

/// Name dictionaries plus the name-index family roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePage {
    pub family: IndexFamilyPage,
    elements: HashMap<i32, NameEntry>,
    attributes: HashMap<i32, NameEntry>,
    namespaces: HashMap<i32, NameEntry>,
    processing_instructions: HashMap<i32, NameEntry>,
}

impl NamePage {
    pub fn empty() -> Self {
        Self {
            family: IndexFamilyPage::empty(PageKind::Name),
            elements: HashMap::new(),
            attributes: HashMap::new(),
            namespaces: HashMap::new(),
            processing_instructions: HashMap::new(),
        }
    }

    pub fn from_parts(
        family: IndexFamilyPage,
        dictionaries: [HashMap<i32, NameEntry>; 4],
    ) -> Self {
        let [elements, attributes, namespaces, processing_instructions] = dictionaries;
        Self {
            family,
            elements,
            attributes,
            namespaces,
            processing_instructions,
        }
    }

    fn dictionary(&self, kind: Kind) -> Result<&HashMap<i32, NameEntry>> {
        Ok(match kind {
            Kind::Element => &self.elements,
            Kind::Attribute => &self.attributes,
            Kind::Namespace => &self.namespaces,
            Kind::ProcessingInstruction => &self.processing_instructions,
            _ => bail!("kind {:?} has no name dictionary", kind),
        })
    }

    fn dictionary_mut(&mut self, kind: Kind) -> Result<&mut HashMap<i32, NameEntry>> {
        Ok(match kind {
            Kind::Element => &mut self.elements,
            Kind::Attribute => &mut self.attributes,
            Kind::Namespace => &mut self.namespaces,
            Kind::ProcessingInstruction => &mut self.processing_instructions,
            _ => bail!("kind {:?} has no name dictionary", kind),
        })
    }

    pub fn dictionaries(&self) -> [&HashMap<i32, NameEntry>; 4] {
        [
            &self.elements,
            &self.attributes,
            &self.namespaces,
            &self.processing_instructions,
        ]
    }

    /// Interns `name` for `kind`, returning its content-addressed key.
    /// Re-interning an existing name bumps its use count.
    pub fn create_name_key(&mut self, name: &str, kind: Kind) -> Result<i32> {
        if name.is_empty() {
            return Ok(NULL_NAME_KEY);
        }
        let key = name_key(name, kind);
        let dictionary = self.dictionary_mut(kind)?;
        match dictionary.get_mut(&key) {
            Some(entry) => {
                ensure!(
                    entry.name == name,
                    "name key collision: {:?} and {:?} both map to {}",
                    entry.name,
                    name,
                    key
                );
                entry.uses += 1;
            }
            None => {
                dictionary.insert(
                    key,
                    NameEntry {
                        name: name.to_owned(),
                        uses: 1,
                    },
                );
            }
        }
        Ok(key)
    }

    pub fn get_name(&self, key: i32, kind: Kind) -> Option<&str> {
        if key == NULL_NAME_KEY {
            return None;
        }
        self.dictionary(kind)
            .ok()?
            .get(&key)
            .map(|entry| entry.name.as_str())
    }

    /// Drops one use of `key`; the entry disappears with its last user.
    pub fn remove_name(&mut self, key: i32, kind: Kind) -> Result<()> {
        if key == NULL_NAME_KEY {
            return Ok(());
        }
        let dictionary = self.dictionary_mut(kind)?;
        if let Some(entry) = dictionary.get_mut(&key) {
            entry.uses -= 1;
            if entry.uses == 0 {
                dictionary.remove(&key);
            }
        }
        Ok(())
    }
}

/// A decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Uber(UberPage),
    RevisionRoot(RevisionRootPage),
    Indirect(IndirectPage),
    Record(RecordPage),
    Name(NamePage),
    /// Path, CAS and path-summary pages share one shape.
    Family(IndexFamilyPage),
}

impl Page {
    pub fn kind(&self) -> PageKind {
        match self {
            Page::Uber(_) => PageKind::Uber,
            Page::RevisionRoot(_) => PageKind::RevisionRoot,
            Page::Indirect(_) => PageKind::Indirect,
            Page::Record(_) => PageKind::Record,
            Page::Name(_) => PageKind::Name,
            Page::Family(family) => family.kind,
        }
    }

    pub fn as_indirect(&self) -> Result<&IndirectPage> {
        match self {
            Page::Indirect(page) => Ok(page),
            _ => bail!("expected indirect page, found {:?}", self.kind()),
        }
    }

    pub fn as_record(&self) -> Result<&RecordPage> {
        match self {
            Page::Record(page) => Ok(page),
            _ => bail!("expected record page, found {:?}", self.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_kind_tags_round_trip() {
        for kind in [
            PageKind::Uber,
            PageKind::RevisionRoot,
            PageKind::Indirect,
            PageKind::Record,
            PageKind::Name,
            PageKind::Path,
            PageKind::Cas,
            PageKind::PathSummary,
        ] {
            assert_eq!(PageKind::from_byte(kind as u8).unwrap(), kind);
        }
        assert!(PageKind::from_byte(0).is_err());
    }

    #[test]
    fn name_page_interns_and_counts_uses() {
        let mut page = NamePage::empty();
        let key = page.create_name_key("title", Kind::Element).unwrap();
        let again = page.create_name_key("title", Kind::Element).unwrap();
        assert_eq!(key, again);
        assert_eq!(page.get_name(key, Kind::Element), Some("title"));

        page.remove_name(key, Kind::Element).unwrap();
        assert_eq!(page.get_name(key, Kind::Element), Some("title"));
        page.remove_name(key, Kind::Element).unwrap();
        assert_eq!(page.get_name(key, Kind::Element), None);
    }

    #[test]
    fn name_page_keeps_kinds_apart() {
        let mut page = NamePage::empty();
        let as_element = page.create_name_key("id", Kind::Element).unwrap();
        let as_attribute = page.create_name_key("id", Kind::Attribute).unwrap();
        assert_ne!(as_element, as_attribute);
        assert_eq!(page.get_name(as_attribute, Kind::Attribute), Some("id"));
        assert_eq!(page.get_name(as_element, Kind::Attribute), None);
    }

    #[test]
    fn empty_name_interns_to_the_null_key() {
        let mut page = NamePage::empty();
        assert_eq!(
            page.create_name_key("", Kind::Element).unwrap(),
            NULL_NAME_KEY
        );
    }

    #[test]
    fn family_page_grows_and_allocates_keys() {
        let mut family = IndexFamilyPage::empty(PageKind::Cas);
        assert!(family.root(0).is_err());

        family.ensure_index(1);
        assert_eq!(family.index_count(), 2);
        assert_eq!(family.root(1).unwrap(), NULL_OFFSET);
        assert_eq!(family.new_node_key(1).unwrap(), 1);
        assert_eq!(family.new_node_key(1).unwrap(), 2);
        assert_eq!(family.max_node_key(0).unwrap(), 0);
    }

    #[test]
    fn revision_root_chains_to_its_predecessor() {
        let root = RevisionRootPage::bootstrap(1000);
        let next = root.next_revision(4096, 2000);
        assert_eq!(next.revision, 1);
        assert_eq!(next.prev_root_offset, 4096);
        assert_eq!(next.max_node_key, root.max_node_key);
    }
}
