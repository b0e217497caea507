//! # Page Serialization
//!
//! Every page serializes as a one-byte kind tag followed by its body.
//! Fixed-width integers are big-endian; keys and lengths are varints
//! where noted. Record bodies reuse the record codec.
//!
//! ```text
//! Uber          revisionCount u32 | rootOffset u64
//! RevisionRoot  revision u32 | timestamp u64 | maxNodeKey u64
//!               | prevRoot u64 | 5 family offsets u64
//! Indirect      FANOUT x (present u8, childOffset u64)
//! Record        pageKey vu64 | revision u32 | fullDump u8 | slotCount u16
//!               | slotCount x (slot vu64, record)
//! Name          family body | 4 dictionaries
//! Path/Cas/..   family body: indexCount u16
//!               | indexCount x (rootOffset u64, maxNodeKey u64)
//! ```

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::config::{FANOUT, NULL_OFFSET};
use crate::encoding::bytes::{put_i32, put_string, put_u32, put_u64, put_varint, ByteReader};
use crate::node::codec as node_codec;
use crate::page::{
    IndexFamilyPage, IndirectPage, NameEntry, NamePage, Page, PageKind, RecordPage,
    RevisionRootPage, UberPage,
};

pub fn serialize(page: &Page) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.push(page.kind() as u8);
    match page {
        Page::Uber(uber) => {
            put_u32(&mut out, uber.revision_count);
            put_u64(&mut out, uber.revision_root_offset);
        }
        Page::RevisionRoot(root) => {
            put_u32(&mut out, root.revision);
            put_u64(&mut out, root.timestamp);
            put_u64(&mut out, root.max_node_key);
            put_u64(&mut out, root.prev_root_offset);
            put_u64(&mut out, root.record_root);
            put_u64(&mut out, root.name_page);
            put_u64(&mut out, root.path_page);
            put_u64(&mut out, root.cas_page);
            put_u64(&mut out, root.path_summary_page);
        }
        Page::Indirect(indirect) => {
            for &child in indirect.refs() {
                out.push((child != NULL_OFFSET) as u8);
                put_u64(&mut out, child);
            }
        }
        Page::Record(record) => put_record_page(&mut out, record),
        Page::Name(name) => {
            put_family(&mut out, &name.family);
            for dictionary in name.dictionaries() {
                put_dictionary(&mut out, dictionary);
            }
        }
        Page::Family(family) => put_family(&mut out, family),
    }
    out
}

pub fn deserialize(bytes: &[u8]) -> Result<Page> {
    let mut reader = ByteReader::new(bytes);
    let kind = PageKind::from_byte(reader.read_u8()?)?;
    let page = match kind {
        PageKind::Uber => Page::Uber(UberPage {
            revision_count: reader.read_u32()?,
            revision_root_offset: reader.read_u64()?,
        }),
        PageKind::RevisionRoot => Page::RevisionRoot(RevisionRootPage {
            revision: reader.read_u32()?,
            timestamp: reader.read_u64()?,
            max_node_key: reader.read_u64()?,
            prev_root_offset: reader.read_u64()?,
            record_root: reader.read_u64()?,
            name_page: reader.read_u64()?,
            path_page: reader.read_u64()?,
            cas_page: reader.read_u64()?,
            path_summary_page: reader.read_u64()?,
        }),
        PageKind::Indirect => {
            let mut refs = Vec::with_capacity(FANOUT);
            for _ in 0..FANOUT {
                let present = reader.read_u8()? != 0;
                let child = reader.read_u64()?;
                refs.push(if present { child } else { NULL_OFFSET });
            }
            Page::Indirect(IndirectPage::from_refs(refs)?)
        }
        PageKind::Record => Page::Record(read_record_page(&mut reader)?),
        PageKind::Name => {
            let family = read_family(&mut reader, PageKind::Name)?;
            let dictionaries = [
                read_dictionary(&mut reader)?,
                read_dictionary(&mut reader)?,
                read_dictionary(&mut reader)?,
                read_dictionary(&mut reader)?,
            ];
            Page::Name(NamePage::from_parts(family, dictionaries))
        }
        PageKind::Path | PageKind::Cas | PageKind::PathSummary => {
            Page::Family(read_family(&mut reader, kind)?)
        }
    };
    ensure!(
        reader.is_exhausted(),
        "{} trailing bytes after {:?} page",
        reader.remaining(),
        kind
    );
    Ok(page)
}

fn put_record_page(out: &mut Vec<u8>, record: &RecordPage) {
    put_varint(out, record.page_key());
    put_u32(out, record.revision());
    out.push(record.is_full_dump() as u8);
    let slots = record.sorted_slots();
    debug_assert!(slots.len() <= u16::MAX as usize);
    out.extend_from_slice(&(slots.len() as u16).to_be_bytes());
    for (slot, node) in slots {
        put_varint(out, slot as u64);
        node_codec::serialize_into(node, out);
    }
}

fn read_record_page(reader: &mut ByteReader<'_>) -> Result<RecordPage> {
    let page_key = reader.read_varint()?;
    let revision = reader.read_u32()?;
    let full_dump = reader.read_u8()? != 0;
    let count = u16::from_be_bytes(reader.read_bytes(2)?.try_into().unwrap()) as usize; // INVARIANT: 2 bytes read
    let mut slots = HashMap::with_capacity(count);
    for _ in 0..count {
        let slot = reader.read_varint()? as u16;
        let node = node_codec::deserialize_from(reader)?;
        slots.insert(slot, node);
    }
    Ok(RecordPage::from_parts(page_key, revision, full_dump, slots))
}

fn put_family(out: &mut Vec<u8>, family: &IndexFamilyPage) {
    debug_assert_eq!(family.roots.len(), family.max_node_keys.len());
    out.extend_from_slice(&(family.roots.len() as u16).to_be_bytes());
    for (root, max) in family.roots.iter().zip(&family.max_node_keys) {
        put_u64(out, *root);
        put_u64(out, *max);
    }
}

fn read_family(reader: &mut ByteReader<'_>, kind: PageKind) -> Result<IndexFamilyPage> {
    let count = u16::from_be_bytes(reader.read_bytes(2)?.try_into().unwrap()) as usize; // INVARIANT: 2 bytes read
    let mut roots = Vec::with_capacity(count);
    let mut max_node_keys = Vec::with_capacity(count);
    for _ in 0..count {
        roots.push(reader.read_u64()?);
        max_node_keys.push(reader.read_u64()?);
    }
    Ok(IndexFamilyPage {
        kind,
        roots,
        max_node_keys,
    })
}

fn put_dictionary(out: &mut Vec<u8>, dictionary: &HashMap<i32, NameEntry>) {
    put_u32(out, dictionary.len() as u32);
    let mut entries: Vec<_> = dictionary.iter().collect();
    entries.sort_unstable_by_key(|(&key, _)| key);
    for (&key, entry) in entries {
        put_i32(out, key);
        put_u32(out, entry.uses);
        put_string(out, &entry.name);
    }
}

fn read_dictionary(reader: &mut ByteReader<'_>) -> Result<HashMap<i32, NameEntry>> {
    let count = reader.read_u32()? as usize;
    let mut dictionary = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = reader.read_i32()?;
        let uses = reader.read_u32()?;
        let name = reader.read_string()?;
        dictionary.insert(key, NameEntry { name, uses });
    }
    Ok(dictionary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Kind, Node, NodeDelegate, StructNodeDelegate, TextNode, ValueDelegate};

    fn assert_round_trip(page: Page) {
        let bytes = serialize(&page);
        assert_eq!(deserialize(&bytes).unwrap(), page, "kind {:?}", page.kind());
    }

    #[test]
    fn uber_page_round_trips() {
        assert_round_trip(Page::Uber(UberPage {
            revision_count: 12,
            revision_root_offset: 0xABCD,
        }));
    }

    #[test]
    fn revision_root_round_trips() {
        let mut root = RevisionRootPage::bootstrap(123_456);
        root.max_node_key = 99;
        root.record_root = 64;
        root.cas_page = 8192;
        assert_round_trip(Page::RevisionRoot(root));
    }

    #[test]
    fn indirect_page_round_trips_sparse_slots() {
        let mut indirect = IndirectPage::empty();
        indirect.set_child(0, 64);
        indirect.set_child(77, 12_345);
        indirect.set_child(FANOUT - 1, u64::MAX - 1);
        let bytes = serialize(&Page::Indirect(indirect.clone()));
        let Page::Indirect(decoded) = deserialize(&bytes).unwrap() else {
            panic!("wrong kind")
        };
        assert_eq!(decoded, indirect);
        assert!(!decoded.has_child(1));
        assert!(decoded.has_child(77));
    }

    #[test]
    fn record_page_round_trips() {
        let mut record = RecordPage::new(3, 9);
        for slot in [0u16, 17, 511] {
            record.set_slot(
                slot,
                Node::Text(TextNode {
                    node: NodeDelegate::new(3 * 512 + slot as u64, 0, 9, None),
                    structure: StructNodeDelegate::detached(),
                    value: ValueDelegate::new(format!("value {}", slot).into_bytes(), false),
                }),
            );
        }
        assert_round_trip(Page::Record(record));
    }

    #[test]
    fn name_page_round_trips_with_dictionaries() {
        let mut name = NamePage::empty();
        name.family.ensure_index(0);
        name.family.roots[0] = 4096;
        name.family.max_node_keys[0] = 3;
        name.create_name_key("chapter", Kind::Element).unwrap();
        name.create_name_key("chapter", Kind::Element).unwrap();
        name.create_name_key("lang", Kind::Attribute).unwrap();
        name.create_name_key("xi", Kind::Namespace).unwrap();
        assert_round_trip(Page::Name(name));
    }

    #[test]
    fn family_pages_round_trip_each_kind() {
        for kind in [PageKind::Path, PageKind::Cas, PageKind::PathSummary] {
            let mut family = IndexFamilyPage::empty(kind);
            family.ensure_index(2);
            family.roots[1] = 777;
            family.max_node_keys[1] = 41;
            assert_round_trip(Page::Family(family));
        }
    }

    #[test]
    fn truncated_page_is_rejected() {
        let bytes = serialize(&Page::Uber(UberPage {
            revision_count: 1,
            revision_root_offset: 2,
        }));
        assert!(deserialize(&bytes[..bytes.len() - 1]).is_err());
    }
}
