//! # Qualified Names and Name Keys
//!
//! Named nodes never store strings; they store 32-bit name keys that
//! resolve through the per-kind dictionaries on the name page. A name key
//! is the content-addressed xxh3 hash of the string folded to 32 bits and
//! seeded by the node kind, so the same local name used as an element and
//! as an attribute occupies distinct dictionary slots.

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::NULL_NAME_KEY;
use crate::node::Kind;

/// A qualified name. Empty strings stand for an absent prefix/URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QName {
    pub uri: String,
    pub prefix: String,
    pub local_name: String,
}

impl QName {
    pub fn new(uri: &str, prefix: &str, local_name: &str) -> Self {
        Self {
            uri: uri.to_owned(),
            prefix: prefix.to_owned(),
            local_name: local_name.to_owned(),
        }
    }

    /// Name with only a local part.
    pub fn local(local_name: &str) -> Self {
        Self::new("", "", local_name)
    }

    pub fn has_prefix(&self) -> bool {
        !self.prefix.is_empty()
    }

    pub fn has_uri(&self) -> bool {
        !self.uri.is_empty()
    }
}

impl std::fmt::Display for QName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_prefix() {
            write!(f, "{}:{}", self.prefix, self.local_name)
        } else {
            write!(f, "{}", self.local_name)
        }
    }
}

/// Content-addressed dictionary key for `name` used as kind `kind`.
pub fn name_key(name: &str, kind: Kind) -> i32 {
    let hash = xxh3_64_with_seed(name.as_bytes(), kind as u8 as u64);
    // Fold to 32 bits; -1 is reserved as the null key.
    let key = (hash ^ (hash >> 32)) as i32;
    if key == NULL_NAME_KEY {
        0
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_key_is_stable_and_kind_seeded() {
        let as_element = name_key("author", Kind::Element);
        let as_attribute = name_key("author", Kind::Attribute);

        assert_eq!(as_element, name_key("author", Kind::Element));
        assert_ne!(as_element, as_attribute);
        assert_ne!(as_element, NULL_NAME_KEY);
    }

    #[test]
    fn display_uses_prefix_when_present() {
        assert_eq!(QName::local("b").to_string(), "b");
        assert_eq!(QName::new("u", "p", "b").to_string(), "p:b");
    }
}
