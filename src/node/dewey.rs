//! # Dewey IDs
//!
//! A Dewey ID labels a structural node with the division path from the
//! document root, so document order between any two labeled nodes is a
//! plain lexicographic comparison with no tree navigation.
//!
//! Divisions of fresh children are odd and spaced by two, leaving even
//! values as insertion room. When two neighbors become adjacent the new ID
//! extends the left neighbor by one division instead, which still sorts
//! strictly between the two:
//!
//! ```text
//! parent        1.3          sibling gap      1.3.3 < 1.3.4 < 1.3.5
//! children      1.3.3, 1.3.5 exhausted gap    1.3.3 < 1.3.3.3 < 1.3.4
//! ```
//!
//! Only structural nodes carry IDs; attributes and namespaces are unordered
//! properties of their element.

use eyre::Result;

use crate::encoding::bytes::{put_varint, ByteReader};

/// First division handed to a node with no labeled neighbor.
const FIRST_DIVISION: u32 = 3;

/// Spacing between consecutively appended siblings.
const DIVISION_GAP: u32 = 2;

/// Order-preserving, path-encoded node label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeweyId {
    divisions: Vec<u32>,
}

impl DeweyId {
    /// ID of the document root: the empty division path.
    pub fn document_root() -> Self {
        Self { divisions: Vec::new() }
    }

    pub fn divisions(&self) -> &[u32] {
        &self.divisions
    }

    pub fn level(&self) -> usize {
        self.divisions.len()
    }

    /// ID for the first child of `self` when no sibling is labeled yet.
    pub fn new_first_child(&self) -> Self {
        let mut divisions = self.divisions.clone();
        divisions.push(FIRST_DIVISION);
        Self { divisions }
    }

    /// ID strictly between `left` and `right`, both children of `parent`.
    /// Either neighbor may be absent (insertion at the chain ends).
    pub fn new_between(parent: &Self, left: Option<&Self>, right: Option<&Self>) -> Self {
        match (left, right) {
            (None, None) => parent.new_first_child(),
            (Some(l), None) => {
                let mut divisions = l.divisions.clone();
                let last = divisions.last_mut().expect("sibling below the root");
                *last += DIVISION_GAP;
                Self { divisions }
            }
            (None, Some(r)) => {
                let mut divisions = r.divisions.clone();
                let last = divisions.last_mut().expect("sibling below the root");
                if *last > FIRST_DIVISION {
                    *last = (*last - 1).max(FIRST_DIVISION - 1);
                    Self { divisions }
                } else {
                    // No room before the first division: step under it.
                    *last -= 1;
                    divisions.push(FIRST_DIVISION);
                    Self { divisions }
                }
            }
            (Some(l), Some(r)) => {
                let ll = *l.divisions.last().expect("sibling below the root");
                let rl = *r.divisions.last().expect("sibling below the root");
                if l.divisions.len() == r.divisions.len() && rl > ll + 1 {
                    let mut divisions = l.divisions.clone();
                    *divisions.last_mut().unwrap() = ll + (rl - ll) / 2; // INVARIANT: gap checked above
                    Self { divisions }
                } else {
                    // Gap exhausted: extend the left neighbor.
                    let mut divisions = l.divisions.clone();
                    divisions.push(FIRST_DIVISION);
                    Self { divisions }
                }
            }
        }
    }

    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.level() < other.level() && other.divisions.starts_with(&self.divisions)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.divisions.len() * 2);
        for &division in &self.divisions {
            put_varint(&mut out, division as u64);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let mut divisions = Vec::new();
        while !reader.is_exhausted() {
            divisions.push(reader.read_varint()? as u32);
        }
        Ok(Self { divisions })
    }
}

impl std::fmt::Display for DeweyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.divisions.is_empty() {
            return write!(f, "/");
        }
        for division in &self.divisions {
            write!(f, ".{}", division)?;
        }
        Ok(())
    }
}
