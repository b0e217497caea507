//! Per-resource behavior toggles, fixed at resource creation.

use crate::config::DEFAULT_CACHE_CAPACITY;

/// Options chosen when a resource is created. The page-tree geometry and
/// revision window are format constants recorded in the file header; these
/// toggles only affect how records are produced.
#[derive(Debug, Clone)]
pub struct ResourceOptions {
    /// Compress text/attribute values longer than the compression threshold.
    pub compression: bool,
    /// Label every structural node with a Dewey ID on insertion.
    pub dewey_ids: bool,
    /// Maintain rolling hashes over the document tree.
    pub hashes: bool,
    /// Number of decoded pages the shared cache retains.
    pub cache_capacity: usize,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            compression: false,
            dewey_ids: false,
            hashes: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl ResourceOptions {
    pub fn with_compression(mut self, on: bool) -> Self {
        self.compression = on;
        self
    }

    pub fn with_dewey_ids(mut self, on: bool) -> Self {
        self.dewey_ids = on;
        self
    }

    pub fn with_hashes(mut self, on: bool) -> Self {
        self.hashes = on;
        self
    }

    pub fn with_cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }
}
