//! # Resource File IO
//!
//! The resource file is a 64-byte header followed by an append-only
//! sequence of framed page blobs. Committed bytes are never rewritten, with
//! one exception: the header carries a trailer slot naming the offset of
//! the current uber page, and flipping that slot is the linearization point
//! of a commit.
//!
//! ## File layout
//!
//! ```text
//! +--------------------------+  offset 0
//! | ResourceHeader (64 B)    |  magic, format constants, uber trailer slot
//! +--------------------------+  offset 64
//! | blob: len | crc32 | body |  <- appended, never rewritten
//! +--------------------------+
//! | blob: len | crc32 | body |
//! +--------------------------+
//! | ...                      |
//! ```
//!
//! Every blob is framed with its length and a CRC32 of the body, so a torn
//! append or bit rot is detected at read time instead of surfacing as a
//! garbled page.
//!
//! ## Commit protocol
//!
//! 1. Append every dirty page, children before parents.
//! 2. Append the new uber page and `fsync`.
//! 3. Rewrite the 8-byte trailer slot in the header and `fsync` again.
//!
//! A crash before step 3 leaves the trailer naming the previous uber page:
//! the tail of the file is unreachable garbage and the resource opens at
//! the prior revision. A crash after step 3 opens at the new revision.
//!
//! ## Read path
//!
//! Reads go through a shared memory map of the committed region. Appends
//! bypass the map (plain file writes); after a commit the map is refreshed
//! to cover the new pages. Readers holding blobs from the old map are
//! unaffected because committed offsets are stable.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    FANOUT, FULL_DUMP_INTERVAL, INDIRECT_LEVELS, NULL_OFFSET, RECORDS_PER_PAGE, SLIDING_WINDOW,
};
use crate::zerocopy_accessors;

pub const RESOURCE_MAGIC: &[u8; 8] = b"revtree\0";
pub const FORMAT_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 64;

/// Byte offset of the uber trailer slot inside the header.
const UBER_SLOT_OFFSET: u64 = 48;

/// Bytes of framing (length + checksum) prepended to every blob.
pub const BLOB_FRAME_SIZE: usize = 8;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Header flag: values are compressed when eligible.
pub const FLAG_COMPRESSION: u32 = 1 << 0;
/// Header flag: structural nodes carry Dewey IDs.
pub const FLAG_DEWEY_IDS: u32 = 1 << 1;
/// Header flag: rolling hashes are maintained.
pub const FLAG_HASHES: u32 = 1 << 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ResourceHeader {
    magic: [u8; 8],
    version: U32,
    records_per_page: U32,
    fanout: U32,
    indirect_levels: U32,
    sliding_window: U32,
    full_dump_interval: U32,
    flags: U32,
    _reserved: [u8; 12],
    uber_offset: U64,
    uber_len: U32,
    _reserved2: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<ResourceHeader>() == FILE_HEADER_SIZE);

impl ResourceHeader {
    pub fn new(flags: u32) -> Self {
        Self {
            magic: *RESOURCE_MAGIC,
            version: U32::new(FORMAT_VERSION),
            records_per_page: U32::new(RECORDS_PER_PAGE as u32),
            fanout: U32::new(FANOUT as u32),
            indirect_levels: U32::new(INDIRECT_LEVELS),
            sliding_window: U32::new(SLIDING_WINDOW),
            full_dump_interval: U32::new(FULL_DUMP_INTERVAL),
            flags: U32::new(flags),
            _reserved: [0; 12],
            uber_offset: U64::new(NULL_OFFSET),
            uber_len: U32::new(0),
            _reserved2: [0; 4],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for ResourceHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ResourceHeader: {:?}", e))?;

        ensure!(
            &header.magic == RESOURCE_MAGIC,
            "invalid magic bytes in resource file"
        );
        ensure!(
            header.version.get() == FORMAT_VERSION,
            "unsupported format version: {} (expected {})",
            header.version.get(),
            FORMAT_VERSION
        );
        ensure!(
            header.fanout.get() == FANOUT as u32
                && header.records_per_page.get() == RECORDS_PER_PAGE as u32
                && header.indirect_levels.get() == INDIRECT_LEVELS,
            "resource page-tree geometry does not match this build"
        );

        Ok(header)
    }

    zerocopy_accessors! {
        version: u32,
        records_per_page: u32,
        fanout: u32,
        sliding_window: u32,
        full_dump_interval: u32,
        flags: u32,
        uber_offset: u64,
        uber_len: u32,
    }
}

/// Append-only resource file with a memory-mapped read side.
pub struct ResourceFile {
    path: PathBuf,
    file: File,
    map: Mmap,
    header: ResourceHeader,
    end: u64,
}

impl ResourceFile {
    /// Creates a fresh resource file containing only the header. The uber
    /// trailer slot starts unset; the resource is unreadable until the
    /// bootstrap commit flips it.
    pub fn create<P: AsRef<Path>>(path: P, flags: u32) -> Result<Self> {
        let path = path.as_ref();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create resource file '{}'", path.display()))?;

        let header = ResourceHeader::new(flags);
        file.write_all(header.as_bytes())
            .wrap_err("failed to write resource header")?;
        file.sync_data().wrap_err("failed to sync resource header")?;

        // SAFETY: the file was created with exclusive access and is managed
        // solely through this handle; the map is refreshed after every
        // commit and dropped with the struct.
        let map = unsafe { Mmap::map(&file).wrap_err("failed to map resource file")? };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            header,
            end: FILE_HEADER_SIZE as u64,
        })
    }

    /// Opens an existing resource file. Bytes past the last committed uber
    /// page (from a torn commit) stay unreachable; new appends land after
    /// them.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open resource file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err("failed to stat resource file")?
            .len();
        ensure!(
            len >= FILE_HEADER_SIZE as u64,
            "resource file '{}' is shorter than its header",
            path.display()
        );

        // SAFETY: see `create`.
        let map = unsafe { Mmap::map(&file).wrap_err("failed to map resource file")? };
        let header = *ResourceHeader::from_bytes(&map[..])?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            header,
            end: len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ResourceHeader {
        &self.header
    }

    /// Total file length in bytes.
    pub fn len(&self) -> u64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == FILE_HEADER_SIZE as u64
    }

    /// Appends one framed blob, returning the offset it can be read back
    /// from after the next `sync` + `refresh_map`.
    pub fn append_blob(&mut self, payload: &[u8]) -> Result<u64> {
        let offset = self.end;

        let len = u32::try_from(payload.len()).wrap_err("page blob exceeds u32 length")?;
        let crc = CRC32.checksum(payload);

        self.file
            .seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek to append position")?;
        self.file
            .write_all(&len.to_be_bytes())
            .wrap_err("failed to append blob frame")?;
        self.file
            .write_all(&crc.to_be_bytes())
            .wrap_err("failed to append blob frame")?;
        self.file
            .write_all(payload)
            .wrap_err("failed to append blob payload")?;

        self.end = offset + BLOB_FRAME_SIZE as u64 + payload.len() as u64;
        Ok(offset)
    }

    /// Reads a committed blob from the memory map, verifying its checksum.
    pub fn read_blob(&self, offset: u64) -> Result<&[u8]> {
        let map_len = self.map.len() as u64;
        ensure!(
            offset >= FILE_HEADER_SIZE as u64 && offset + BLOB_FRAME_SIZE as u64 <= map_len,
            "blob offset {} out of bounds (mapped length {})",
            offset,
            map_len
        );

        let frame = &self.map[offset as usize..offset as usize + BLOB_FRAME_SIZE];
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as u64; // INVARIANT: frame is 8 bytes
        let crc = u32::from_be_bytes(frame[4..8].try_into().unwrap());

        let body_start = offset + BLOB_FRAME_SIZE as u64;
        ensure!(
            body_start + len <= map_len,
            "blob at {} runs past the mapped length ({} + {} > {})",
            offset,
            body_start,
            len,
            map_len
        );

        let body = &self.map[body_start as usize..(body_start + len) as usize];
        ensure!(
            CRC32.checksum(body) == crc,
            "checksum mismatch for page blob at offset {}",
            offset
        );

        Ok(body)
    }

    /// Durably persists all appended blobs.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync resource file")
    }

    /// Re-maps the file so blobs appended since the last refresh become
    /// readable.
    pub fn refresh_map(&mut self) -> Result<()> {
        // SAFETY: see `create`.
        self.map = unsafe { Mmap::map(&self.file).wrap_err("failed to remap resource file")? };
        Ok(())
    }

    /// Flips the uber trailer slot to a freshly appended uber page. Must be
    /// called after `sync`; syncs again once the slot is rewritten so the
    /// flip is the single durable linearization point.
    pub fn write_uber_slot(&mut self, offset: u64, len: u32) -> Result<()> {
        let mut slot = [0u8; 12];
        slot[..8].copy_from_slice(U64::new(offset).as_bytes());
        slot[8..].copy_from_slice(U32::new(len).as_bytes());

        self.file
            .seek(SeekFrom::Start(UBER_SLOT_OFFSET))
            .wrap_err("failed to seek to uber slot")?;
        self.file
            .write_all(&slot)
            .wrap_err("failed to rewrite uber slot")?;
        self.file.sync_data().wrap_err("failed to sync uber slot")?;

        self.header.set_uber_offset(offset);
        self.header.set_uber_len(len);
        Ok(())
    }

    /// Offset and length of the current uber page, if any commit succeeded.
    pub fn uber_slot(&self) -> Option<(u64, u32)> {
        let offset = self.header.uber_offset();
        (offset != NULL_OFFSET).then(|| (offset, self.header.uber_len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_64_bytes() {
        assert_eq!(std::mem::size_of::<ResourceHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn create_then_open_round_trips_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.rt");

        let file = ResourceFile::create(&path, FLAG_HASHES).unwrap();
        assert!(file.is_empty());
        assert!(file.uber_slot().is_none());
        drop(file);

        let file = ResourceFile::open(&path).unwrap();
        assert_eq!(file.header().flags(), FLAG_HASHES);
        assert_eq!(file.header().fanout(), FANOUT as u32);
        assert!(file.uber_slot().is_none());
    }

    #[test]
    fn appended_blobs_read_back_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = ResourceFile::create(dir.path().join("r.rt"), 0).unwrap();

        let a = file.append_blob(b"first page").unwrap();
        let b = file.append_blob(b"second, longer page payload").unwrap();
        file.sync().unwrap();
        file.refresh_map().unwrap();

        assert_eq!(file.read_blob(a).unwrap(), b"first page");
        assert_eq!(file.read_blob(b).unwrap(), b"second, longer page payload");
    }

    #[test]
    fn blob_read_before_refresh_is_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = ResourceFile::create(dir.path().join("r.rt"), 0).unwrap();

        let offset = file.append_blob(b"payload").unwrap();
        assert!(file.read_blob(offset).is_err());
    }

    #[test]
    fn corrupted_blob_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.rt");
        let mut file = ResourceFile::create(&path, 0).unwrap();

        let offset = file.append_blob(b"some page bytes").unwrap();
        file.sync().unwrap();

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut raw = OpenOptions::new().write(true).open(&path).unwrap();
            raw.seek(SeekFrom::Start(offset + BLOB_FRAME_SIZE as u64))
                .unwrap();
            raw.write_all(b"X").unwrap();
        }

        file.refresh_map().unwrap();
        let err = file.read_blob(offset).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn uber_slot_flip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.rt");
        let mut file = ResourceFile::create(&path, 0).unwrap();

        let offset = file.append_blob(b"uber").unwrap();
        file.sync().unwrap();
        file.write_uber_slot(offset, 4).unwrap();
        drop(file);

        let file = ResourceFile::open(&path).unwrap();
        assert_eq!(file.uber_slot(), Some((offset, 4)));
    }
}
