//! # Transaction Log
//!
//! A write transaction stages every dirty record page in a two-level log:
//! an in-memory map up to a configured capacity, spilling to a persistent
//! key/value file once a long-running transaction outgrows it. The
//! persistent level is plain best-effort storage: durable `put`, `get`,
//! `remove`, `clear`, with an fsync every [`LOG_SYNC_INTERVAL`] puts. It
//! is wiped on commit and on abort.
//!
//! ## Spill file format
//!
//! ```text
//! entry := logKey (17 B) | valueLen u32 | value
//! value := fragmentCount u32 | baseLen u32 | base page blob
//!          | modifiedCount u16 | modifiedCount x (slot vu64, record)
//! ```
//!
//! The in-memory index maps log keys to file positions; superseded entries
//! (a container re-spilled after further edits) simply leave their old
//! bytes behind, and the file is truncated wholesale when the transaction
//! finishes. A container lives in exactly one level at a time: loading a
//! spilled container back for modification removes it from the spill
//! index.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::debug;

use crate::config::LOG_SYNC_INTERVAL;
use crate::encoding::bytes::{put_u32, put_varint, ByteReader};
use crate::node::codec as node_codec;
use crate::page::{codec as page_codec, Page, RecordPage};
use crate::trx::{LogKey, PageContainer};

/// Durable spill store for dirty page containers.
pub struct PersistentLog {
    path: PathBuf,
    file: File,
    index: HashMap<LogKey, (u64, u32)>,
    end: u64,
    puts: u64,
}

impl PersistentLog {
    /// Creates (or truncates) the spill file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create transaction log '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            index: HashMap::new(),
            end: 0,
            puts: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Bytes currently occupied by the spill file.
    pub fn byte_size(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, key: &LogKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn put(&mut self, key: LogKey, container: &PageContainer) -> Result<()> {
        let value = serialize_container(container);

        self.file
            .seek(SeekFrom::Start(self.end))
            .wrap_err("failed to seek in transaction log")?;
        self.file
            .write_all(&key.to_bytes())
            .wrap_err("failed to append transaction log key")?;
        self.file
            .write_all(&(value.len() as u32).to_be_bytes())
            .wrap_err("failed to append transaction log length")?;
        self.file
            .write_all(&value)
            .wrap_err("failed to append transaction log value")?;

        let offset = self.end + 17 + 4;
        self.index.insert(key, (offset, value.len() as u32));
        self.end = offset + value.len() as u64;

        self.puts += 1;
        if self.puts % LOG_SYNC_INTERVAL == 0 {
            self.file
                .sync_data()
                .wrap_err("failed to sync transaction log")?;
        }
        Ok(())
    }

    pub fn get(&mut self, key: &LogKey) -> Result<Option<PageContainer>> {
        let Some(&(offset, len)) = self.index.get(key) else {
            return Ok(None);
        };
        let mut value = vec![0u8; len as usize];
        self.file
            .seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek in transaction log")?;
        self.file
            .read_exact(&mut value)
            .wrap_err("failed to read transaction log entry")?;
        Ok(Some(deserialize_container(&value)?))
    }

    pub fn remove(&mut self, key: &LogKey) {
        self.index.remove(key);
    }

    /// Loads and removes every spilled container.
    pub fn drain_all(&mut self) -> Result<Vec<(LogKey, PageContainer)>> {
        let keys: Vec<LogKey> = self.index.keys().copied().collect();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let container = self
                .get(&key)?
                .expect("indexed transaction log entry vanished"); // INVARIANT: key taken from the index
            self.index.remove(&key);
            entries.push((key, container));
        }
        Ok(entries)
    }

    /// Drops every entry and reclaims the file space.
    pub fn clear(&mut self) -> Result<()> {
        self.index.clear();
        self.end = 0;
        self.puts = 0;
        self.file
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;
        Ok(())
    }
}

fn serialize_container(container: &PageContainer) -> Vec<u8> {
    let base_blob = page_codec::serialize(&Page::Record(container.base().clone()));
    let mut out = Vec::with_capacity(base_blob.len() + 64);
    put_u32(&mut out, container.fragment_count());
    put_u32(&mut out, base_blob.len() as u32);
    out.extend_from_slice(&base_blob);
    let modified = container.modified();
    out.extend_from_slice(&(modified.len() as u16).to_be_bytes());
    let mut slots: Vec<_> = modified.iter().collect();
    slots.sort_unstable_by_key(|(&slot, _)| slot);
    for (&slot, record) in slots {
        put_varint(&mut out, slot as u64);
        node_codec::serialize_into(record, &mut out);
    }
    out
}

fn deserialize_container(bytes: &[u8]) -> Result<PageContainer> {
    let mut reader = ByteReader::new(bytes);
    let fragment_count = reader.read_u32()?;
    let base_len = reader.read_u32()? as usize;
    let base = match page_codec::deserialize(reader.read_bytes(base_len)?)? {
        Page::Record(page) => page,
        page => eyre::bail!("spilled container base is a {:?} page", page.kind()),
    };
    let mut container = PageContainer::new(base, fragment_count);
    let count = u16::from_be_bytes(reader.read_bytes(2)?.try_into().unwrap()) as usize; // INVARIANT: 2 bytes read
    for _ in 0..count {
        let slot = reader.read_varint()? as u16;
        let record = node_codec::deserialize_from(&mut reader)?;
        container.restore_slot(slot, record);
    }
    ensure!(
        reader.is_exhausted(),
        "{} trailing bytes in spilled container",
        reader.remaining()
    );
    Ok(container)
}

/// Two-level dirty page log: in-memory containers up to `capacity`, the
/// overflow spilled to a [`PersistentLog`].
pub struct IntentLog {
    memory: HashMap<LogKey, PageContainer>,
    spill: PersistentLog,
    capacity: usize,
}

impl IntentLog {
    pub fn new<P: AsRef<Path>>(spill_path: P, capacity: usize) -> Result<Self> {
        Ok(Self {
            memory: HashMap::new(),
            spill: PersistentLog::create(spill_path)?,
            capacity: capacity.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.spill.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &LogKey) -> bool {
        self.memory.contains_key(key) || self.spill.contains(key)
    }

    /// Estimated staged bytes, for the auto-commit threshold.
    pub fn estimated_bytes(&self) -> usize {
        let in_memory: usize = self
            .memory
            .values()
            .map(PageContainer::estimated_size)
            .sum();
        in_memory + self.spill.byte_size() as usize
    }

    /// Mutable access to a staged container, pulling it back from the
    /// spill level if needed.
    pub fn container(&mut self, key: &LogKey) -> Result<Option<&mut PageContainer>> {
        if !self.memory.contains_key(key) {
            let Some(container) = self.spill.get(key)? else {
                return Ok(None);
            };
            self.spill.remove(key);
            self.insert(*key, container)?;
        }
        Ok(self.memory.get_mut(key))
    }

    pub fn put(&mut self, key: LogKey, container: PageContainer) -> Result<()> {
        self.insert(key, container)
    }

    fn insert(&mut self, key: LogKey, container: PageContainer) -> Result<()> {
        if self.memory.len() >= self.capacity {
            self.spill_memory()?;
        }
        self.memory.insert(key, container);
        Ok(())
    }

    /// Pushes every in-memory container down to the persistent level.
    pub fn spill_memory(&mut self) -> Result<()> {
        debug!(containers = self.memory.len(), "spilling intent log");
        for (key, container) in self.memory.drain() {
            self.spill.put(key, &container)?;
        }
        Ok(())
    }

    /// Takes every staged container, leaving the log empty.
    pub fn drain_all(&mut self) -> Result<Vec<(LogKey, PageContainer)>> {
        let mut entries: Vec<(LogKey, PageContainer)> = self.memory.drain().collect();
        entries.extend(self.spill.drain_all()?);
        Ok(entries)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.memory.clear();
        self.spill.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeDelegate, StructNodeDelegate, TextNode, ValueDelegate};
    use crate::page::PageKind;

    fn text(key: u64, value: &[u8]) -> Node {
        Node::Text(TextNode {
            node: NodeDelegate::new(key, 0, 1, None),
            structure: StructNodeDelegate::detached(),
            value: ValueDelegate::new(value.to_vec(), false),
        })
    }

    fn container(page_key: u64, slots: &[(u16, &[u8])]) -> PageContainer {
        let mut base = RecordPage::new(page_key, 1);
        base.set_slot(0, text(page_key << 9, b"committed"));
        let mut c = PageContainer::new(base, 1);
        for &(slot, value) in slots {
            c.create_slot(slot, text((page_key << 9) + slot as u64, value));
        }
        c
    }

    #[test]
    fn persistent_log_round_trips_containers() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PersistentLog::create(dir.path().join("txn.log")).unwrap();

        let key = LogKey::leaf(PageKind::Record, 0, 7);
        let original = container(7, &[(3, b"spilled")]);
        log.put(key, &original).unwrap();

        assert!(log.contains(&key));
        assert_eq!(log.get(&key).unwrap().unwrap(), original);
    }

    #[test]
    fn persistent_log_clear_empties_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PersistentLog::create(dir.path().join("txn.log")).unwrap();

        log.put(LogKey::leaf(PageKind::Record, 0, 1), &container(1, &[]))
            .unwrap();
        assert!(log.byte_size() > 0);

        log.clear().unwrap();
        assert!(log.is_empty());
        assert_eq!(log.byte_size(), 0);
    }

    #[test]
    fn rewriting_a_key_returns_the_latest_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = PersistentLog::create(dir.path().join("txn.log")).unwrap();

        let key = LogKey::leaf(PageKind::Cas, 2, 4);
        log.put(key, &container(4, &[(1, b"first")])).unwrap();
        let latest = container(4, &[(1, b"second")]);
        log.put(key, &latest).unwrap();

        assert_eq!(log.get(&key).unwrap().unwrap(), latest);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn intent_log_spills_past_capacity_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = IntentLog::new(dir.path().join("txn.log"), 4).unwrap();

        for page_key in 0..10u64 {
            log.put(
                LogKey::leaf(PageKind::Record, 0, page_key),
                container(page_key, &[(1, b"v")]),
            )
            .unwrap();
        }
        assert_eq!(log.len(), 10);

        for page_key in 0..10u64 {
            let key = LogKey::leaf(PageKind::Record, 0, page_key);
            let found = log.container(&key).unwrap().unwrap();
            assert_eq!(found.page_key(), page_key);
        }
    }

    #[test]
    fn intent_log_drain_returns_every_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = IntentLog::new(dir.path().join("txn.log"), 2).unwrap();

        for page_key in 0..5u64 {
            log.put(
                LogKey::leaf(PageKind::Record, 0, page_key),
                container(page_key, &[]),
            )
            .unwrap();
        }

        let drained = log.drain_all().unwrap();
        assert_eq!(drained.len(), 5);
        assert!(log.is_empty());
    }
}
