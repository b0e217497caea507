//! # Resource Management
//!
//! A resource is one versioned document: a directory holding the resource
//! file, the transaction-log spill file and the index-definition sidecar.
//! [`Resource`] is the embedding entry point: it opens or creates the
//! directory, owns the shared page cache and hands out transactions.
//!
//! ```text
//! my-resource/
//! ├── resource.rt     # header + append-only pages
//! ├── txn.log         # write-transaction spill, wiped on commit/abort
//! └── indexes.def     # secondary index declarations
//! ```
//!
//! ## Concurrency contract
//!
//! Any number of read transactions may coexist, each pinned to the
//! revision it was opened on. At most one write transaction exists at a
//! time; a second `begin_write` is rejected until the first is dropped.
//! A commit makes the new revision visible to readers opened afterwards
//! and never disturbs readers opened before.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result, WrapErr};
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::PageCache;
use crate::config::{ResourceOptions, DOCUMENT_NODE_KEY, NULL_NODE_KEY};
use crate::index::{deserialize_defs, serialize_defs, IndexDef};
use crate::io::{ResourceFile, FLAG_COMPRESSION, FLAG_DEWEY_IDS, FLAG_HASHES};
use crate::node::{DocumentRootNode, Node, NodeDelegate, StructNodeDelegate};
use crate::page::{
    codec as page_codec, IndirectPage, Page, RecordPage, RevisionRootPage, UberPage,
};
use crate::trx::node_read::NodeReadTrx;
use crate::trx::node_write::NodeWriteTrx;
use crate::trx::read::PageReadTrx;
use crate::trx::{indirect_slot, leaf_slot};

const RESOURCE_FILE_NAME: &str = "resource.rt";
const LOG_FILE_NAME: &str = "txn.log";
const INDEX_DEFS_FILE_NAME: &str = "indexes.def";

/// Shared state behind every transaction of one resource.
pub(crate) struct ResourceInner {
    pub(crate) file: RwLock<ResourceFile>,
    pub(crate) cache: PageCache,
    pub(crate) options: ResourceOptions,
    uber: RwLock<UberPage>,
    writer_active: AtomicBool,
    log_path: PathBuf,
    defs_path: PathBuf,
    index_defs: RwLock<Vec<IndexDef>>,
}

impl ResourceInner {
    pub(crate) fn uber(&self) -> UberPage {
        self.uber.read().clone()
    }

    pub(crate) fn set_uber(&self, uber: UberPage) {
        *self.uber.write() = uber;
    }

    pub(crate) fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub(crate) fn claim_writer(&self) -> Result<()> {
        ensure!(
            self.writer_active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "a write transaction is already open on this resource"
        );
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        self.writer_active.store(false, Ordering::Release);
    }

    pub(crate) fn index_defs(&self) -> Vec<IndexDef> {
        self.index_defs.read().clone()
    }

    /// Registers a new index definition and persists the sidecar.
    pub(crate) fn register_index(&self, def: IndexDef) -> Result<()> {
        let mut defs = self.index_defs.write();
        ensure!(
            !defs
                .iter()
                .any(|d| d.index_type == def.index_type && d.number == def.number),
            "{:?} index number {} already exists",
            def.index_type,
            def.number
        );
        defs.push(def);
        std::fs::write(&self.defs_path, serialize_defs(&defs))
            .wrap_err("failed to persist index definitions")?;
        Ok(())
    }
}

/// A versioned hierarchical document resource.
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    /// Creates a resource directory and commits the empty bootstrap
    /// revision 0, containing only the document root node.
    pub fn create<P: AsRef<Path>>(dir: P, options: ResourceOptions) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create resource directory '{}'", dir.display()))?;

        let mut flags = 0u32;
        if options.compression {
            flags |= FLAG_COMPRESSION;
        }
        if options.dewey_ids {
            flags |= FLAG_DEWEY_IDS;
        }
        if options.hashes {
            flags |= FLAG_HASHES;
        }

        let mut file = ResourceFile::create(dir.join(RESOURCE_FILE_NAME), flags)?;
        let uber = bootstrap_revision(&mut file)?;
        debug!(path = %dir.display(), "bootstrapped resource at revision 0");

        let cache_capacity = options.cache_capacity;
        let inner = Arc::new(ResourceInner {
            file: RwLock::new(file),
            cache: PageCache::new(cache_capacity),
            options,
            uber: RwLock::new(uber),
            writer_active: AtomicBool::new(false),
            log_path: dir.join(LOG_FILE_NAME),
            defs_path: dir.join(INDEX_DEFS_FILE_NAME),
            index_defs: RwLock::new(Vec::new()),
        });
        Ok(Self { inner })
    }

    /// Opens an existing resource at its latest committed revision.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let file = ResourceFile::open(dir.join(RESOURCE_FILE_NAME))?;

        let (uber_offset, _) = file
            .uber_slot()
            .ok_or_else(|| eyre::eyre!("resource '{}' was never committed", dir.display()))?;
        let uber = match page_codec::deserialize(file.read_blob(uber_offset)?)? {
            Page::Uber(uber) => uber,
            page => eyre::bail!("uber slot points at a {:?} page", page.kind()),
        };

        let header_flags = file.header().flags();
        let options = ResourceOptions::default()
            .with_compression(header_flags & FLAG_COMPRESSION != 0)
            .with_dewey_ids(header_flags & FLAG_DEWEY_IDS != 0)
            .with_hashes(header_flags & FLAG_HASHES != 0);

        let defs_path = dir.join(INDEX_DEFS_FILE_NAME);
        let index_defs = if defs_path.exists() {
            deserialize_defs(
                &std::fs::read(&defs_path).wrap_err("failed to read index definitions")?,
            )?
        } else {
            Vec::new()
        };

        debug!(
            path = %dir.display(),
            revision = uber.latest_revision(),
            "opened resource"
        );
        let cache_capacity = options.cache_capacity;
        let inner = Arc::new(ResourceInner {
            file: RwLock::new(file),
            cache: PageCache::new(cache_capacity),
            options,
            uber: RwLock::new(uber),
            writer_active: AtomicBool::new(false),
            log_path: dir.join(LOG_FILE_NAME),
            defs_path,
            index_defs: RwLock::new(index_defs),
        });
        Ok(Self { inner })
    }

    pub fn options(&self) -> &ResourceOptions {
        &self.inner.options
    }

    /// The latest committed revision number.
    pub fn latest_revision(&self) -> u32 {
        self.inner.uber().latest_revision()
    }

    /// The registered secondary indexes.
    pub fn index_defs(&self) -> Vec<IndexDef> {
        self.inner.index_defs()
    }

    /// Opens a node cursor on the latest committed revision.
    pub fn begin_read(&self) -> Result<NodeReadTrx> {
        self.begin_read_at(self.latest_revision())
    }

    /// Opens a node cursor pinned to `revision`.
    pub fn begin_read_at(&self, revision: u32) -> Result<NodeReadTrx> {
        let page = PageReadTrx::open(Arc::clone(&self.inner), revision)?;
        NodeReadTrx::new(page)
    }

    /// Opens the single node write transaction. Fails while another write
    /// transaction is alive.
    pub fn begin_write(&self) -> Result<NodeWriteTrx> {
        self.inner.claim_writer()?;
        match NodeWriteTrx::open(Arc::clone(&self.inner)) {
            Ok(trx) => Ok(trx),
            Err(e) => {
                // The page transaction releases the claim when it exists;
                // reaching here means it never did.
                self.inner.release_writer();
                Err(e)
            }
        }
    }
}

/// Writes revision 0: a full-dump record page holding the document root,
/// the indirect chain above it, the revision root and the uber page.
fn bootstrap_revision(file: &mut ResourceFile) -> Result<UberPage> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let document_root = Node::DocumentRoot(DocumentRootNode {
        node: NodeDelegate::new(DOCUMENT_NODE_KEY, NULL_NODE_KEY, 0, None),
        structure: StructNodeDelegate::detached(),
    });
    let mut leaf = RecordPage::new(0, 0);
    leaf.set_full_dump(true);
    leaf.set_slot(0, document_root);
    let mut child_offset = file.append_blob(&page_codec::serialize(&Page::Record(leaf)))?;

    // The document root's page key is 0, so every indirect slot on the
    // path is slot 0.
    for level in (0..crate::config::INDIRECT_LEVELS).rev() {
        let mut indirect = IndirectPage::empty();
        let slot = if level == crate::config::INDIRECT_LEVELS - 1 {
            leaf_slot(0)
        } else {
            indirect_slot(0, level)
        };
        indirect.set_child(slot, child_offset);
        child_offset = file.append_blob(&page_codec::serialize(&Page::Indirect(indirect)))?;
    }

    let mut root = RevisionRootPage::bootstrap(timestamp);
    root.record_root = child_offset;
    let root_offset = file.append_blob(&page_codec::serialize(&Page::RevisionRoot(root)))?;

    file.sync()?;
    let uber = UberPage {
        revision_count: 1,
        revision_root_offset: root_offset,
    };
    let uber_blob = page_codec::serialize(&Page::Uber(uber.clone()));
    let uber_offset = file.append_blob(&uber_blob)?;
    file.sync()?;
    file.write_uber_slot(uber_offset, uber_blob.len() as u32)?;
    file.refresh_map()?;
    Ok(uber)
}
