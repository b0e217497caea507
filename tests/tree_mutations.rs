//! Structural mutations: sibling/parent wiring, descendant counts,
//! subtree moves and copies, renames, hashes and Dewey IDs.

use revtree::{
    MoveResult, NodeReadTrx, QName, Resource, ResourceOptions, SubtreeEvent,
};
use tempfile::TempDir;

fn create_resource() -> (TempDir, Resource) {
    let dir = tempfile::tempdir().unwrap();
    let resource = Resource::create(dir.path().join("r"), ResourceOptions::default()).unwrap();
    (dir, resource)
}

/// Walks the whole tree verifying the structural invariants: doubly
/// linked sibling chains, parent agreement, child counts and descendant
/// counts. Returns the subtree size (descendants + 1).
fn verify_subtree(rtx: &mut NodeReadTrx, key: u64) -> u64 {
    assert!(rtx.move_to(key).unwrap().has_moved());
    let child_count = rtx.child_count();
    let descendant_count = rtx.descendant_count();

    let mut seen_children = 0u64;
    let mut seen_descendants = 0u64;
    let mut previous = None::<u64>;
    let mut child = rtx.first_child_key();
    while child != u64::MAX {
        assert!(rtx.move_to(child).unwrap().has_moved());
        assert_eq!(rtx.parent_key(), key, "parent link of {child}");
        assert_eq!(
            rtx.left_sibling_key(),
            previous.unwrap_or(u64::MAX),
            "left link of {child}"
        );
        let next = rtx.right_sibling_key();
        seen_children += 1;
        seen_descendants += verify_subtree(rtx, child);
        previous = Some(child);
        child = next;
    }

    assert_eq!(child_count, seen_children, "child count of {key}");
    assert_eq!(descendant_count, seen_descendants, "descendant count of {key}");
    descendant_count + 1
}

fn verify_tree(resource: &Resource) {
    let mut rtx = resource.begin_read().unwrap();
    verify_subtree(&mut rtx, 0);
}

#[test]
fn node_keys_are_monotonic_and_never_reused() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    assert!(b > a);
    wtx.commit().unwrap();

    wtx.move_to(b).unwrap();
    wtx.remove().unwrap();
    wtx.commit().unwrap();

    wtx.move_to(a).unwrap();
    let c = wtx.insert_element_as_first_child(&QName::local("c")).unwrap();
    assert!(c > b, "removed key {b} must never be reused, got {c}");
    wtx.commit().unwrap();
}

#[test]
fn sibling_insertions_keep_invariants() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let _d = wtx.insert_element_as_right_sibling(&QName::local("d")).unwrap();
    // Squeeze c between b and d.
    let c = wtx.insert_element_as_left_sibling(&QName::local("c")).unwrap();
    wtx.insert_text_as_first_child(b"inside c").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    verify_tree(&resource);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(a).unwrap();
    assert_eq!(rtx.child_count(), 3);
    assert_eq!(rtx.descendant_count(), 4);
    rtx.move_to(b).unwrap();
    assert_eq!(rtx.right_sibling_key(), c);
}

#[test]
fn subtree_removal_updates_every_ancestor() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    wtx.insert_text_as_first_child(b"t1").unwrap();
    wtx.move_to(b).unwrap();
    let _c = wtx.insert_element_as_right_sibling(&QName::local("c")).unwrap();
    wtx.commit().unwrap();

    wtx.move_to(b).unwrap();
    wtx.remove().unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    verify_tree(&resource);
    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(a).unwrap();
    assert_eq!(rtx.child_count(), 1);
    assert_eq!(rtx.descendant_count(), 1);
    assert!(rtx.move_to(b).unwrap() == MoveResult::NotMoved);
}

#[test]
fn move_into_own_descendant_fails_without_side_effects() {
    // Key 7-style scenario: moving a node below its own descendant must
    // fail with an invariant violation and change nothing.
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let c = wtx.insert_element_as_first_child(&QName::local("c")).unwrap();
    wtx.commit().unwrap();

    wtx.move_to(c).unwrap();
    let err = wtx.move_subtree_to_first_child(a).unwrap_err();
    assert!(err.to_string().contains("descendant"), "got: {err}");
    wtx.commit().unwrap();
    drop(wtx);

    verify_tree(&resource);
    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(b).unwrap();
    assert_eq!(rtx.parent_key(), a);
    rtx.move_to(c).unwrap();
    assert_eq!(rtx.parent_key(), b);
}

#[test]
fn move_subtree_rewires_both_ends() {
    // <a><b><t/></b></a><x/>  =>  move b under x.
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    wtx.insert_text_as_first_child(b"payload").unwrap();
    wtx.move_to(a).unwrap();
    let x = wtx.insert_element_as_right_sibling(&QName::local("x")).unwrap();
    wtx.commit().unwrap();

    wtx.move_to(x).unwrap();
    wtx.move_subtree_to_first_child(b).unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    verify_tree(&resource);
    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(a).unwrap();
    assert_eq!(rtx.child_count(), 0);
    assert_eq!(rtx.descendant_count(), 0);
    rtx.move_to(x).unwrap();
    assert_eq!(rtx.child_count(), 1);
    assert_eq!(rtx.descendant_count(), 2);
    rtx.move_to(b).unwrap();
    assert_eq!(rtx.parent_key(), x);
}

#[test]
fn set_name_and_value_change_what_readers_see() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let t = wtx.insert_text_as_first_child(b"before").unwrap();
    wtx.commit().unwrap();

    wtx.move_to(a).unwrap();
    wtx.set_name(&QName::local("renamed")).unwrap();
    wtx.move_to(t).unwrap();
    wtx.set_value(b"after").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(a).unwrap();
    assert_eq!(rtx.get_name().unwrap().local_name, "renamed");
    rtx.move_to(t).unwrap();
    assert_eq!(rtx.get_value().unwrap().unwrap(), b"after");

    let mut old = resource.begin_read_at(1).unwrap();
    old.move_to(a).unwrap();
    assert_eq!(old.get_name().unwrap().local_name, "a");
}

#[test]
fn attributes_and_namespaces_live_on_their_element() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    wtx.insert_namespace(&QName::new("http://example.org", "ex", ""))
        .unwrap();
    let lang = wtx.insert_attribute(&QName::local("lang"), b"en").unwrap();
    wtx.insert_attribute(&QName::local("id"), b"n1").unwrap();

    let duplicate = wtx.insert_attribute(&QName::local("lang"), b"de");
    assert!(duplicate.unwrap_err().to_string().contains("duplicate"));
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to_first_child().unwrap();
    assert_eq!(rtx.attribute_count(), 2);
    assert_eq!(rtx.namespace_count(), 1);

    assert!(rtx
        .move_to_attribute_by_name(&QName::local("lang"))
        .unwrap()
        .has_moved());
    assert_eq!(rtx.node_key(), lang);
    assert_eq!(rtx.get_value().unwrap().unwrap(), b"en");
}

#[test]
fn subtree_events_build_a_full_fragment() {
    let (_dir, resource) = create_resource();

    let events = vec![
        SubtreeEvent::StartElement {
            name: QName::local("book"),
            attributes: vec![(QName::local("isbn"), b"123".to_vec())],
            namespaces: vec![],
        },
        SubtreeEvent::StartElement {
            name: QName::local("title"),
            attributes: vec![],
            namespaces: vec![],
        },
        SubtreeEvent::Text(b"Versioned trees".to_vec()),
        SubtreeEvent::EndElement,
        SubtreeEvent::Comment(b"review pending".to_vec()),
        SubtreeEvent::EndElement,
    ];

    let mut wtx = resource.begin_write().unwrap();
    let book = wtx.insert_subtree_as_first_child(events).unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    verify_tree(&resource);
    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(book).unwrap();
    assert_eq!(rtx.get_name().unwrap().local_name, "book");
    assert_eq!(rtx.attribute_count(), 1);
    assert_eq!(rtx.child_count(), 2);
    assert_eq!(rtx.descendant_count(), 3);

    rtx.move_to_first_child().unwrap();
    assert_eq!(rtx.get_name().unwrap().local_name, "title");
    rtx.move_to_right_sibling().unwrap();
    assert_eq!(rtx.get_value().unwrap().unwrap(), b"review pending");
}

#[test]
fn copy_subtree_duplicates_without_sharing_keys() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    wtx.insert_attribute(&QName::local("k"), b"v").unwrap();
    wtx.insert_text_as_first_child(b"copied text").unwrap();
    wtx.commit().unwrap();

    let mut source = resource.begin_read().unwrap();
    source.move_to(b).unwrap();

    wtx.move_to(a).unwrap();
    let copy = wtx.copy_subtree_as_right_sibling(&source).unwrap();
    wtx.commit().unwrap();
    drop(wtx);
    assert_ne!(copy, b);

    verify_tree(&resource);
    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(copy).unwrap();
    assert_eq!(rtx.get_name().unwrap().local_name, "b");
    assert_eq!(rtx.parent_key(), 0);
    assert_eq!(rtx.attribute_count(), 1);
    rtx.move_to_first_child().unwrap();
    assert_eq!(rtx.get_value().unwrap().unwrap(), b"copied text");

    // The original is untouched.
    rtx.move_to(b).unwrap();
    assert_eq!(rtx.parent_key(), a);
}

#[test]
fn rolling_hashes_track_descendant_changes() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let t = wtx.insert_text_as_first_child(b"one").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let rtx = {
        let mut rtx = resource.begin_read().unwrap();
        rtx.move_to(a).unwrap();
        rtx
    };
    let hash_before = rtx.hash();
    assert_ne!(hash_before, 0);

    let mut wtx = resource.begin_write().unwrap();
    wtx.move_to(t).unwrap();
    wtx.set_value(b"two").unwrap();
    wtx.commit().unwrap();

    let mut changed = resource.begin_read().unwrap();
    changed.move_to(a).unwrap();
    assert_ne!(changed.hash(), hash_before);

    // Reverting the value restores the ancestor hash exactly.
    wtx.move_to(t).unwrap();
    wtx.set_value(b"one").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut reverted = resource.begin_read().unwrap();
    reverted.move_to(a).unwrap();
    assert_eq!(reverted.hash(), hash_before);
}

#[test]
fn dewey_ids_preserve_document_order() {
    let dir = tempfile::tempdir().unwrap();
    let resource = Resource::create(
        dir.path().join("r"),
        ResourceOptions::default().with_dewey_ids(true),
    )
    .unwrap();

    let mut wtx = resource.begin_write().unwrap();
    let a = wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let d = wtx.insert_element_as_right_sibling(&QName::local("d")).unwrap();
    let c = wtx.insert_element_as_left_sibling(&QName::local("c")).unwrap();
    wtx.move_to(b).unwrap();
    let nested = wtx.insert_element_as_first_child(&QName::local("n")).unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    let id_of = |rtx: &mut revtree::NodeReadTrx, key: u64| {
        rtx.move_to(key).unwrap();
        rtx.dewey_id().unwrap().clone()
    };
    let id_a = id_of(&mut rtx, a);
    let id_b = id_of(&mut rtx, b);
    let id_c = id_of(&mut rtx, c);
    let id_d = id_of(&mut rtx, d);
    let id_nested = id_of(&mut rtx, nested);

    assert!(id_a < id_b && id_b < id_c && id_c < id_d);
    assert!(id_b < id_nested && id_nested < id_c);
    assert!(id_a.is_ancestor_of(&id_nested));
}
