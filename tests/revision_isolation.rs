//! Revisioning behavior: immutability of committed revisions, snapshot
//! isolation for readers, crash-free reopen, and rollback.

use revtree::{QName, Resource, ResourceOptions};
use tempfile::TempDir;

fn create_resource() -> (TempDir, Resource) {
    let dir = tempfile::tempdir().unwrap();
    let resource = Resource::create(dir.path().join("r"), ResourceOptions::default()).unwrap();
    (dir, resource)
}

#[test]
fn empty_resource_starts_at_revision_zero() {
    let (_dir, resource) = create_resource();
    assert_eq!(resource.latest_revision(), 0);

    let rtx = resource.begin_read().unwrap();
    assert_eq!(rtx.revision(), 0);
    assert!(rtx.is_document_root());
    assert_eq!(rtx.child_count(), 0);
}

#[test]
fn first_commit_produces_revision_one() {
    // Insert element `a` as document child, commit, read it back.
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let revision = wtx.commit().unwrap();
    assert_eq!(revision, 1);
    drop(wtx);

    let mut rtx = resource.begin_read_at(1).unwrap();
    assert_eq!(rtx.child_count(), 1);
    assert!(rtx.move_to_first_child().unwrap().has_moved());
    assert_eq!(rtx.node_key(), a);
    assert_eq!(rtx.get_name().unwrap().local_name, "a");
    assert_eq!(rtx.parent_key(), 0);
    assert!(!rtx.has_left_sibling());
    assert!(!rtx.has_right_sibling());
    assert!(!rtx.has_first_child());
    assert_eq!(rtx.descendant_count(), 0);
}

#[test]
fn removal_is_visible_only_from_the_new_revision() {
    // <a><b/><c/></a> at revision 1; remove b at revision 2.
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let _a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let c = wtx.insert_element_as_right_sibling(&QName::local("c")).unwrap();
    assert_eq!(wtx.commit().unwrap(), 1);

    wtx.move_to(b).unwrap();
    wtx.remove().unwrap();
    assert_eq!(wtx.commit().unwrap(), 2);
    drop(wtx);

    let mut old = resource.begin_read_at(1).unwrap();
    old.move_to_first_child().unwrap();
    assert_eq!(old.child_count(), 2);
    old.move_to_first_child().unwrap();
    assert_eq!(old.node_key(), b);
    assert_eq!(old.right_sibling_key(), c);

    let mut new = resource.begin_read_at(2).unwrap();
    new.move_to_first_child().unwrap();
    assert_eq!(new.child_count(), 1);
    new.move_to_first_child().unwrap();
    assert_eq!(new.node_key(), c);
    assert!(!new.has_left_sibling());
    assert!(!new.has_right_sibling());
}

#[test]
fn pinned_reader_survives_a_concurrent_removal_commit() {
    // A reader bound to revision R sees identical records after a later
    // commit removes hundreds of nodes.
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let mut text_keys = Vec::new();
    for i in 0..500u32 {
        wtx.move_to(a).unwrap();
        let key = wtx
            .insert_text_as_first_child(format!("value {i}").as_bytes())
            .unwrap();
        text_keys.push(key);
    }
    let pinned_revision = wtx.commit().unwrap();

    let mut reader = resource.begin_read_at(pinned_revision).unwrap();
    let before: Vec<Vec<u8>> = text_keys
        .iter()
        .map(|&key| {
            assert!(reader.move_to(key).unwrap().has_moved());
            reader.get_value().unwrap().unwrap()
        })
        .collect();

    // Remove every text node in a later revision.
    for &key in &text_keys {
        wtx.move_to(key).unwrap();
        wtx.remove().unwrap();
    }
    wtx.commit().unwrap();
    drop(wtx);

    for (i, &key) in text_keys.iter().enumerate() {
        assert!(reader.move_to(key).unwrap().has_moved(), "key {key} vanished");
        assert_eq!(reader.get_value().unwrap().unwrap(), before[i]);
    }

    let mut after = resource.begin_read().unwrap();
    after.move_to_first_child().unwrap();
    assert_eq!(after.child_count(), 0);
}

#[test]
fn committed_revisions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r");
    {
        let resource = Resource::create(&path, ResourceOptions::default()).unwrap();
        let mut wtx = resource.begin_write().unwrap();
        wtx.insert_element_as_first_child(&QName::local("root")).unwrap();
        wtx.insert_text_as_first_child(b"persisted").unwrap();
        wtx.commit().unwrap();
    }

    let resource = Resource::open(&path).unwrap();
    assert_eq!(resource.latest_revision(), 1);
    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to_first_child().unwrap();
    assert_eq!(rtx.get_name().unwrap().local_name, "root");
    rtx.move_to_first_child().unwrap();
    assert_eq!(rtx.get_value().unwrap().unwrap(), b"persisted");
}

#[test]
fn rollback_abandons_the_staged_revision() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    wtx.commit().unwrap();

    wtx.move_to_first_child().unwrap();
    wtx.insert_element_as_first_child(&QName::local("doomed")).unwrap();
    wtx.rollback().unwrap();
    drop(wtx);

    assert_eq!(resource.latest_revision(), 1);
    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to_first_child().unwrap();
    assert_eq!(rtx.child_count(), 0);
}

#[test]
fn only_one_writer_at_a_time() {
    let (_dir, resource) = create_resource();

    let wtx = resource.begin_write().unwrap();
    let second = resource.begin_write();
    assert!(second.is_err());
    assert!(second
        .unwrap_err()
        .to_string()
        .contains("already open"));

    drop(wtx);
    assert!(resource.begin_write().is_ok());
}

#[test]
fn unknown_revision_is_rejected() {
    let (_dir, resource) = create_resource();
    let err = resource.begin_read_at(7).unwrap_err();
    assert!(err.to_string().contains("unknown revision"));
}

#[test]
fn many_revisions_stay_readable_through_the_sliding_window() {
    // The same node is rewritten across more revisions than the sliding
    // window; every revision keeps returning its own value.
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let text = wtx.insert_text_as_first_child(b"v1").unwrap();
    wtx.commit().unwrap();

    for i in 2..=12u32 {
        wtx.move_to(text).unwrap();
        wtx.set_value(format!("v{i}").as_bytes()).unwrap();
        wtx.commit().unwrap();
    }
    drop(wtx);

    for revision in 1..=12u32 {
        let mut rtx = resource.begin_read_at(revision).unwrap();
        assert!(rtx.move_to(text).unwrap().has_moved());
        assert_eq!(
            rtx.get_value().unwrap().unwrap(),
            format!("v{revision}").into_bytes(),
            "revision {revision}"
        );
    }
}

#[test]
fn compressed_storage_stays_close_to_uncompressed_size() {
    // 10 000 text nodes with 12-byte values, once with compression and
    // once without; sizes stay within 1.5x of each other and every value
    // reads back byte-identical.
    let dir = tempfile::tempdir().unwrap();

    let mut sizes = Vec::new();
    for (name, compression) in [("plain", false), ("compressed", true)] {
        let path = dir.path().join(name);
        let resource = Resource::create(
            &path,
            ResourceOptions::default().with_compression(compression),
        )
        .unwrap();

        let mut wtx = resource.begin_write().unwrap();
        let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
        let mut keys = Vec::with_capacity(10_000);
        wtx.move_to(a).unwrap();
        for i in 0..10_000u32 {
            let value = format!("value-{i:05}");
            debug_assert_eq!(value.len(), 11);
            let key = if keys.is_empty() {
                wtx.insert_text_as_first_child(format!("{value} ").as_bytes())
                    .unwrap()
            } else {
                wtx.insert_text_as_right_sibling(format!("{value} ").as_bytes())
                    .unwrap()
            };
            keys.push(key);
        }
        wtx.commit().unwrap();
        drop(wtx);

        let mut rtx = resource.begin_read().unwrap();
        for (i, &key) in keys.iter().enumerate() {
            assert!(rtx.move_to(key).unwrap().has_moved());
            assert_eq!(
                rtx.get_value().unwrap().unwrap(),
                format!("value-{i:05} ").into_bytes()
            );
        }

        sizes.push(std::fs::metadata(path.join("resource.rt")).unwrap().len());
    }

    let (plain, compressed) = (sizes[0], sizes[1]);
    assert!(
        compressed as f64 <= plain as f64 * 1.5,
        "compressed file {} vs plain {}",
        compressed,
        plain
    );
}
