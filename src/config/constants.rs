//! # Engine Constants
//!
//! Centralizes the constants that define the page-tree geometry, the
//! revisioning scheme and the transaction-layer thresholds. Values that
//! depend on each other are co-located and guarded by compile-time
//! assertions so a change to one cannot silently invalidate another.
//!
//! ## Key decomposition
//!
//! A 64-bit node key is split into a page key and a low-order slot:
//!
//! ```text
//! node key:  [ ........ page key ........ | slot (RECORD_SHIFT bits) ]
//! page key:  [ lvl0 | lvl1 | lvl2 | lvl3 ]   (FANOUT_SHIFT bits each)
//! ```
//!
//! The page key is decomposed base-`FANOUT` into one slot index per
//! indirect level, so `INDIRECT_LEVELS` levels of fan-out 128 plus 512
//! records per leaf page address `128^4 * 512 = 2^37` node keys per
//! sub-tree.
//!
//! ## Revision geometry
//!
//! `SLIDING_WINDOW` bounds how many page fragments a read may merge;
//! `FULL_DUMP_INTERVAL` forces a complete page every that many revisions so
//! the merge never needs to look further back than the window.

// ============================================================================
// PAGE-TREE GEOMETRY
// ============================================================================

/// Fan-out of every indirect page.
pub const FANOUT: usize = 128;

/// Bits consumed per indirect level (`FANOUT == 1 << FANOUT_SHIFT`).
pub const FANOUT_SHIFT: u32 = 7;

/// Number of indirect levels between a sub-tree root and its record pages.
pub const INDIRECT_LEVELS: u32 = 4;

/// Maximum number of records held by one record page.
pub const RECORDS_PER_PAGE: usize = 512;

/// Bits consumed by the low-order record slot (`RECORDS_PER_PAGE == 1 << RECORD_SHIFT`).
pub const RECORD_SHIFT: u32 = 9;

/// Mask extracting the record slot from a node key.
pub const RECORD_LOW_MASK: u64 = RECORDS_PER_PAGE as u64 - 1;

/// Highest addressable page key (exclusive).
pub const PAGE_KEY_SPAN: u64 = 1 << (FANOUT_SHIFT * INDIRECT_LEVELS);

const _: () = assert!(FANOUT == 1 << FANOUT_SHIFT, "FANOUT derivation mismatch");
const _: () = assert!(
    RECORDS_PER_PAGE == 1 << RECORD_SHIFT,
    "RECORDS_PER_PAGE derivation mismatch"
);

// ============================================================================
// REVISIONING
// ============================================================================

/// Number of prior revisions a read may consult when merging record-page
/// deltas.
pub const SLIDING_WINDOW: u32 = 4;

/// A complete (non-delta) record page is written every this many revisions,
/// bounding every read to at most `SLIDING_WINDOW` page fetches.
pub const FULL_DUMP_INTERVAL: u32 = SLIDING_WINDOW;

const _: () = assert!(
    FULL_DUMP_INTERVAL <= SLIDING_WINDOW,
    "a merge must reach a full dump within the sliding window"
);

// ============================================================================
// RESERVED KEYS AND SENTINELS
// ============================================================================

/// In-record encoding of "no node": the all-ones bit pattern (-1).
pub const NULL_NODE_KEY: u64 = u64::MAX;

/// Node key of the document root, fixed at resource creation.
pub const DOCUMENT_NODE_KEY: u64 = 0;

/// In-record encoding of "no name".
pub const NULL_NAME_KEY: i32 = -1;

/// In-reference encoding of "page not yet written".
pub const NULL_OFFSET: u64 = u64::MAX;

// ============================================================================
// TRANSACTION LAYER
// ============================================================================

/// Number of shards in the page cache.
pub const CACHE_SHARD_COUNT: usize = 64;

/// Default number of decoded pages the cache retains.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Number of record-page containers the write transaction keeps in memory
/// before spilling to the persistent transaction log.
pub const RECORD_LOG_IN_MEMORY_CAP: usize = 1024;

/// The persistent transaction log fsyncs after this many puts.
pub const LOG_SYNC_INTERVAL: u64 = 10_000;

/// Auto-commit once this many pages are dirty in one write transaction.
pub const AUTO_COMMIT_MAX_DIRTY_PAGES: usize = 32_768;

/// Auto-commit once the staged log exceeds this estimated byte size.
pub const AUTO_COMMIT_MAX_LOG_BYTES: usize = 256 * 1024 * 1024;

// ============================================================================
// RECORD VALUES
// ============================================================================

/// Values longer than this are eligible for compression when the resource
/// opted in.
pub const VALUE_COMPRESSION_MIN_LEN: usize = 10;

/// Multiplier folding a descendant hash into its ancestors' rolling hashes.
/// Odd, so removals can subtract exactly what an insertion added.
pub const HASH_FOLD_PRIME: u64 = 0x9E37_79B9_7F4A_7C15;

const _: () = assert!(HASH_FOLD_PRIME % 2 == 1, "hash fold multiplier must be odd");
