//! # Shared Page Cache
//!
//! A bounded cache of decoded pages keyed by their logical identity. Pages
//! are immutable once committed, so entries are `Arc`-shared: a hit hands
//! out a clone of the `Arc` and eviction never invalidates a reader.
//! Mutation always goes through the write transaction's copy-on-write
//! path, never through a cached page.
//!
//! ## Sharding
//!
//! A single lock over the whole cache would serialize every reader. The
//! cache is split into [`CACHE_SHARD_COUNT`] shards, each behind its own
//! `RwLock`, with keys distributed by hash. Readers of different shards
//! never contend.
//!
//! ## Eviction
//!
//! Each shard runs a second-chance sweep: entries carry a `visited` flag
//! set on access; the eviction hand clears flags until it finds an
//! unvisited entry, which keeps hot pages resident while a long scan of
//! cold pages drains quickly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::CACHE_SHARD_COUNT;
use crate::page::{Page, PageKind};

/// Logical identity of a committed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageCacheKey {
    pub kind: PageKind,
    /// Indirect level, `-1` for non-indirect pages.
    pub level: i32,
    /// Index number within the family, 0 elsewhere.
    pub index: u32,
    /// File offset of the page blob.
    pub offset: u64,
}

impl PageCacheKey {
    pub fn new(kind: PageKind, level: i32, index: u32, offset: u64) -> Self {
        Self {
            kind,
            level,
            index,
            offset,
        }
    }
}

struct CacheEntry {
    key: PageCacheKey,
    page: Arc<Page>,
    visited: AtomicBool,
}

struct CacheShard {
    entries: Vec<CacheEntry>,
    index: HashMap<PageCacheKey, usize>,
    hand: usize,
    capacity: usize,
}

impl CacheShard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &PageCacheKey) -> Option<Arc<Page>> {
        self.index.get(key).map(|&idx| {
            let entry = &self.entries[idx];
            entry.visited.store(true, Ordering::Release);
            Arc::clone(&entry.page)
        })
    }

    fn evict_one(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        loop {
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            let entry = &self.entries[self.hand];
            if entry.visited.swap(false, Ordering::AcqRel) {
                self.hand += 1;
                continue;
            }
            let removed = self.entries.swap_remove(self.hand);
            self.index.remove(&removed.key);
            if self.hand < self.entries.len() {
                let moved_key = self.entries[self.hand].key;
                self.index.insert(moved_key, self.hand);
            }
            return;
        }
    }

    fn insert(&mut self, key: PageCacheKey, page: Arc<Page>) {
        if self.index.contains_key(&key) {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        let idx = self.entries.len();
        self.entries.push(CacheEntry {
            key,
            page,
            visited: AtomicBool::new(true),
        });
        self.index.insert(key, idx);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Sharded cache of decoded, committed pages.
pub struct PageCache {
    shards: Vec<RwLock<CacheShard>>,
}

impl PageCache {
    pub fn new(total_capacity: usize) -> Self {
        let capacity_per_shard = total_capacity.div_ceil(CACHE_SHARD_COUNT);
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|_| RwLock::new(CacheShard::new(capacity_per_shard)))
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &PageCacheKey) -> &RwLock<CacheShard> {
        let hash = (key.offset)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(key.kind as u64);
        &self.shards[(hash % CACHE_SHARD_COUNT as u64) as usize]
    }

    pub fn get(&self, key: &PageCacheKey) -> Option<Arc<Page>> {
        self.shard(key).read().get(key)
    }

    /// Returns the cached page or decodes it through `load` and caches the
    /// result. `load` runs outside any shard lock, so a slow disk read
    /// never blocks unrelated lookups.
    pub fn get_or_load<F>(&self, key: PageCacheKey, load: F) -> Result<Arc<Page>>
    where
        F: FnOnce() -> Result<Page>,
    {
        if let Some(page) = self.shard(&key).read().get(&key) {
            return Ok(page);
        }

        let page = Arc::new(load()?);

        let mut shard = self.shard(&key).write();
        if let Some(existing) = shard.get(&key) {
            return Ok(existing);
        }
        shard.insert(key, Arc::clone(&page));
        Ok(page)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut guard = shard.write();
            guard.entries.clear();
            guard.index.clear();
            guard.hand = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::UberPage;

    fn key(offset: u64) -> PageCacheKey {
        PageCacheKey::new(PageKind::Record, -1, 0, offset)
    }

    fn page(revision_count: u32) -> Page {
        Page::Uber(UberPage {
            revision_count,
            revision_root_offset: 0,
        })
    }

    #[test]
    fn get_or_load_loads_once() {
        let cache = PageCache::new(64);
        let mut loads = 0;

        for _ in 0..3 {
            let loaded = cache
                .get_or_load(key(8), || {
                    loads += 1;
                    Ok(page(1))
                })
                .unwrap();
            assert_eq!(*loaded, page(1));
        }
        assert_eq!(loads, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_identities_do_not_collide() {
        let cache = PageCache::new(64);
        cache.get_or_load(key(8), || Ok(page(1))).unwrap();
        let other = PageCacheKey::new(PageKind::Cas, 2, 1, 8);
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn capacity_is_bounded_under_churn() {
        let capacity = CACHE_SHARD_COUNT * 2;
        let cache = PageCache::new(capacity);
        for offset in 0..(capacity as u64 * 4) {
            cache.get_or_load(key(offset), || Ok(page(1))).unwrap();
        }
        assert!(cache.len() <= capacity + CACHE_SHARD_COUNT);
    }

    #[test]
    fn evicted_pages_stay_usable_through_their_arc() {
        let cache = PageCache::new(CACHE_SHARD_COUNT);
        let held = cache.get_or_load(key(1), || Ok(page(7))).unwrap();
        for offset in 2..200u64 {
            cache.get_or_load(key(offset), || Ok(page(0))).unwrap();
        }
        assert_eq!(*held, page(7));
    }

    #[test]
    fn clear_empties_every_shard() {
        let cache = PageCache::new(64);
        for offset in 0..32u64 {
            cache.get_or_load(key(offset), || Ok(page(0))).unwrap();
        }
        cache.clear();
        assert!(cache.is_empty());
    }
}
