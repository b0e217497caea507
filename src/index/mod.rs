//! # Secondary Indexes
//!
//! Three index types share one machinery: an AVL tree of
//! [`keys::IndexKey`] → [`refs::NodeReferences`] stored as records in the
//! index's own page sub-tree.
//!
//! - **Name** indexes map qualified names to the nodes bearing them.
//! - **Path** indexes map path-summary node keys to the nodes on that
//!   path.
//! - **CAS** ("content and structure") indexes map typed values under a
//!   path to the nodes holding them.
//!
//! Index definitions are declared against a resource, persisted beside
//! the resource file, and maintained incrementally by the node write
//! transaction.

pub mod avl;
pub mod keys;
pub mod path_summary;
pub mod refs;

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::encoding::bytes::{put_string, put_u32, ByteReader};
use crate::page::PageKind;
pub use keys::{CasValue, IndexKey, ValueType};
pub use refs::NodeReferences;

/// Kind of a secondary index.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    Name = 1,
    Path = 2,
    Cas = 3,
}

impl IndexType {
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            1 => IndexType::Name,
            2 => IndexType::Path,
            3 => IndexType::Cas,
            _ => bail!("invalid index type tag: {}", b),
        })
    }

    /// Page family the index's tree lives under.
    pub fn page_kind(self) -> PageKind {
        match self {
            IndexType::Name => PageKind::Name,
            IndexType::Path => PageKind::Path,
            IndexType::Cas => PageKind::Cas,
        }
    }
}

/// How a lookup treats the search key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl SearchMode {
    /// Whether a candidate comparing as `candidate.cmp(search_key) ==
    /// ordering` satisfies this mode.
    pub fn matches(self, ordering: Ordering) -> bool {
        match self {
            SearchMode::Equal => ordering == Ordering::Equal,
            SearchMode::Greater => ordering == Ordering::Greater,
            SearchMode::GreaterOrEqual => ordering != Ordering::Less,
            SearchMode::Less => ordering == Ordering::Less,
            SearchMode::LessOrEqual => ordering != Ordering::Greater,
        }
    }

    /// Whether candidates below the key's BST position can still qualify.
    pub fn seeks_smaller(self) -> bool {
        matches!(self, SearchMode::Less | SearchMode::LessOrEqual)
    }
}

/// Declaration of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub index_type: IndexType,
    /// Index number within its family; sub-tree selector.
    pub number: u32,
    /// Value type indexed by a CAS index; `String` elsewhere.
    pub content_type: ValueType,
    /// Path filters: a node feeds the index only when its summary path
    /// matches one of these (empty = every node). `/a/b` anchors at the
    /// root, `//a/b` matches the step sequence ending anywhere.
    pub paths: Vec<String>,
}

impl IndexDef {
    pub fn cas(number: u32, content_type: ValueType, paths: Vec<String>) -> Self {
        Self {
            index_type: IndexType::Cas,
            number,
            content_type,
            paths,
        }
    }

    pub fn name(number: u32) -> Self {
        Self {
            index_type: IndexType::Name,
            number,
            content_type: ValueType::String,
            paths: Vec::new(),
        }
    }

    pub fn path(number: u32, paths: Vec<String>) -> Self {
        Self {
            index_type: IndexType::Path,
            number,
            content_type: ValueType::String,
            paths,
        }
    }

    /// Whether a node whose summary path is `steps` (local names, root
    /// first) feeds this index.
    pub fn matches_path(&self, steps: &[String]) -> bool {
        if self.paths.is_empty() {
            return true;
        }
        self.paths
            .iter()
            .any(|pattern| pattern_matches(pattern, steps))
    }
}

fn pattern_matches(pattern: &str, steps: &[String]) -> bool {
    if let Some(rest) = pattern.strip_prefix("//") {
        let wanted: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if wanted.len() > steps.len() {
            return false;
        }
        let tail = &steps[steps.len() - wanted.len()..];
        tail.iter().zip(&wanted).all(|(step, want)| step == want)
    } else {
        let wanted: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        wanted.len() == steps.len()
            && steps.iter().zip(&wanted).all(|(step, want)| step == want)
    }
}

/// Serializes index definitions for the sidecar file.
pub fn serialize_defs(defs: &[IndexDef]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, defs.len() as u32);
    for def in defs {
        out.push(def.index_type as u8);
        put_u32(&mut out, def.number);
        out.push(def.content_type as u8);
        put_u32(&mut out, def.paths.len() as u32);
        for path in &def.paths {
            put_string(&mut out, path);
        }
    }
    out
}

pub fn deserialize_defs(bytes: &[u8]) -> Result<Vec<IndexDef>> {
    let mut reader = ByteReader::new(bytes);
    let count = reader.read_u32()? as usize;
    let mut defs = Vec::with_capacity(count);
    for _ in 0..count {
        let index_type = IndexType::from_byte(reader.read_u8()?)?;
        let number = reader.read_u32()?;
        let content_type = match reader.read_u8()? {
            1 => ValueType::String,
            2 => ValueType::Integer,
            tag => bail!("invalid value type tag: {}", tag),
        };
        let path_count = reader.read_u32()? as usize;
        let mut paths = Vec::with_capacity(path_count);
        for _ in 0..path_count {
            paths.push(reader.read_string()?);
        }
        defs.push(IndexDef {
            index_type,
            number,
            content_type,
            paths,
        });
    }
    ensure!(
        reader.is_exhausted(),
        "{} trailing bytes after index definitions",
        reader.remaining()
    );
    Ok(defs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn search_modes_match_expected_orderings() {
        assert!(SearchMode::Equal.matches(Ordering::Equal));
        assert!(!SearchMode::Equal.matches(Ordering::Greater));
        assert!(SearchMode::Greater.matches(Ordering::Greater));
        assert!(!SearchMode::Greater.matches(Ordering::Equal));
        assert!(SearchMode::GreaterOrEqual.matches(Ordering::Equal));
        assert!(SearchMode::Less.matches(Ordering::Less));
        assert!(SearchMode::LessOrEqual.matches(Ordering::Equal));
        assert!(!SearchMode::LessOrEqual.matches(Ordering::Greater));
    }

    #[test]
    fn absolute_patterns_anchor_at_the_root() {
        let def = IndexDef::cas(0, ValueType::String, vec!["/a/b".into()]);
        assert!(def.matches_path(&steps(&["a", "b"])));
        assert!(!def.matches_path(&steps(&["a"])));
        assert!(!def.matches_path(&steps(&["x", "a", "b"])));
    }

    #[test]
    fn descendant_patterns_match_any_suffix() {
        let def = IndexDef::cas(0, ValueType::String, vec!["//a/b".into()]);
        assert!(def.matches_path(&steps(&["a", "b"])));
        assert!(def.matches_path(&steps(&["x", "a", "b"])));
        assert!(!def.matches_path(&steps(&["a", "b", "c"])));
    }

    #[test]
    fn empty_path_list_matches_everything() {
        let def = IndexDef::name(0);
        assert!(def.matches_path(&steps(&["anything"])));
        assert!(def.matches_path(&[]));
    }

    #[test]
    fn defs_round_trip_through_the_sidecar_format() {
        let defs = vec![
            IndexDef::cas(0, ValueType::String, vec!["//a/b".into(), "/c".into()]),
            IndexDef::name(1),
            IndexDef::path(2, vec!["/a".into()]),
        ];
        let bytes = serialize_defs(&defs);
        assert_eq!(deserialize_defs(&bytes).unwrap(), defs);
    }
}
