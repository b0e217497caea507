//! Secondary indexes: CAS point and range lookups, name and path
//! indexes, balance of the backing search trees, and index maintenance
//! across removals and reopen.

use revtree::index::avl::AvlTree;
use revtree::{
    CasValue, IndexKey, IndexType, QName, Resource, ResourceOptions, SearchMode, ValueType,
};
use tempfile::TempDir;

fn create_resource() -> (TempDir, Resource) {
    let dir = tempfile::tempdir().unwrap();
    let resource = Resource::create(dir.path().join("r"), ResourceOptions::default()).unwrap();
    (dir, resource)
}

#[test]
fn cas_index_answers_point_and_range_queries() {
    // CAS index over the text values of //a/b; three b children with
    // values "x", "y", "x".
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.create_cas_index(0, ValueType::String, vec!["//a/b".into()])
        .unwrap();

    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b1 = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let t1 = wtx.insert_text_as_first_child(b"x").unwrap();
    wtx.move_to(b1).unwrap();
    let b2 = wtx.insert_element_as_right_sibling(&QName::local("b")).unwrap();
    let t2 = wtx.insert_text_as_first_child(b"y").unwrap();
    wtx.move_to(b2).unwrap();
    wtx.insert_element_as_right_sibling(&QName::local("b")).unwrap();
    let t3 = wtx.insert_text_as_first_child(b"x").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(b1).unwrap();
    let path = rtx.path_node_key().unwrap();

    let equal = rtx
        .index_get(
            IndexType::Cas,
            0,
            &IndexKey::Cas(CasValue::string(b"x", path)),
            SearchMode::Equal,
        )
        .unwrap()
        .expect("two nodes hold \"x\"");
    assert_eq!(equal.node_keys(), &[t1, t3]);

    let greater = rtx
        .index_get(
            IndexType::Cas,
            0,
            &IndexKey::Cas(CasValue::string(b"x", path)),
            SearchMode::Greater,
        )
        .unwrap()
        .expect("\"y\" is greater than \"x\"");
    assert_eq!(greater.node_keys(), &[t2]);

    let none = rtx
        .index_get(
            IndexType::Cas,
            0,
            &IndexKey::Cas(CasValue::string(b"z", path)),
            SearchMode::Greater,
        )
        .unwrap();
    assert!(none.is_none());
}

#[test]
fn cas_path_filter_excludes_other_paths() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.create_cas_index(0, ValueType::String, vec!["//a/b".into()])
        .unwrap();

    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let indexed = wtx.insert_text_as_first_child(b"match").unwrap();
    wtx.move_to(b).unwrap();
    wtx.insert_element_as_right_sibling(&QName::local("other")).unwrap();
    wtx.insert_text_as_first_child(b"match").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(b).unwrap();
    let path = rtx.path_node_key().unwrap();

    let refs = rtx
        .index_get(
            IndexType::Cas,
            0,
            &IndexKey::Cas(CasValue::string(b"match", path)),
            SearchMode::Equal,
        )
        .unwrap()
        .unwrap();
    assert_eq!(refs.node_keys(), &[indexed]);
}

#[test]
fn integer_cas_index_orders_numerically() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.create_cas_index(0, ValueType::Integer, vec![]).unwrap();

    wtx.insert_element_as_first_child(&QName::local("n")).unwrap();
    let t2 = wtx.insert_text_as_first_child(b"2").unwrap();
    let t10 = wtx.insert_text_as_right_sibling(b"10").unwrap();
    wtx.insert_text_as_right_sibling(b"not a number").unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(t2).unwrap();
    let path = {
        // Text values of element children are keyed under the element's
        // path node.
        rtx.move_to_parent().unwrap();
        rtx.path_node_key().unwrap()
    };

    // Lexicographically "10" < "2"; numerically 10 > 2.
    let greater = rtx
        .index_get(
            IndexType::Cas,
            0,
            &IndexKey::Cas(CasValue::integer(2, path)),
            SearchMode::Greater,
        )
        .unwrap()
        .unwrap();
    assert_eq!(greater.node_keys(), &[t10]);
}

#[test]
fn name_index_tracks_inserts_and_removals() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.create_name_index(0).unwrap();

    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b1 = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let b2 = wtx.insert_element_as_right_sibling(&QName::local("b")).unwrap();
    wtx.commit().unwrap();

    let key = IndexKey::Name(QName::local("b"));
    let mut rtx = resource.begin_read().unwrap();
    let refs = rtx
        .index_get(IndexType::Name, 0, &key, SearchMode::Equal)
        .unwrap()
        .unwrap();
    assert_eq!(refs.node_keys(), &[b1, b2]);
    drop(rtx);

    wtx.move_to(b1).unwrap();
    wtx.remove().unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    let refs = rtx
        .index_get(IndexType::Name, 0, &key, SearchMode::Equal)
        .unwrap()
        .unwrap();
    assert_eq!(refs.node_keys(), &[b2]);

    // The earlier revision still answers with both.
    let mut old = resource.begin_read_at(1).unwrap();
    let refs = old
        .index_get(IndexType::Name, 0, &key, SearchMode::Equal)
        .unwrap()
        .unwrap();
    assert_eq!(refs.node_keys(), &[b1, b2]);
}

#[test]
fn draining_a_key_removes_its_index_entry() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.create_name_index(0).unwrap();
    wtx.insert_element_as_first_child(&QName::local("solo")).unwrap();
    wtx.commit().unwrap();

    wtx.move_to_first_child().unwrap();
    wtx.remove().unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    let found = rtx
        .index_get(
            IndexType::Name,
            0,
            &IndexKey::Name(QName::local("solo")),
            SearchMode::Equal,
        )
        .unwrap();
    assert!(found.is_none(), "drained key must leave the tree");
}

#[test]
fn path_index_finds_nodes_by_path() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.create_path_index(0, vec![]).unwrap();

    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b1 = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let b2 = wtx.insert_element_as_right_sibling(&QName::local("b")).unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(b1).unwrap();
    let path = rtx.path_node_key().unwrap();

    let refs = rtx
        .index_get(IndexType::Path, 0, &IndexKey::Path(path), SearchMode::Equal)
        .unwrap()
        .unwrap();
    assert_eq!(refs.node_keys(), &[b1, b2]);
}

#[test]
fn unknown_index_number_is_a_clean_error() {
    let (_dir, resource) = create_resource();
    let mut rtx = resource.begin_read().unwrap();
    let err = rtx
        .index_get(
            IndexType::Cas,
            3,
            &IndexKey::Cas(CasValue::string(b"x", 1)),
            SearchMode::Equal,
        )
        .unwrap_err();
    assert!(err.to_string().contains("unknown"), "got: {err}");
}

#[test]
fn index_definitions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r");
    let b;
    {
        let resource = Resource::create(&path, ResourceOptions::default()).unwrap();
        let mut wtx = resource.begin_write().unwrap();
        wtx.create_cas_index(0, ValueType::String, vec!["//a/b".into()])
            .unwrap();
        wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
        b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
        wtx.insert_text_as_first_child(b"kept").unwrap();
        wtx.commit().unwrap();
    }

    let resource = Resource::open(&path).unwrap();
    assert_eq!(resource.index_defs().len(), 1);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(b).unwrap();
    let path_key = rtx.path_node_key().unwrap();
    let refs = rtx
        .index_get(
            IndexType::Cas,
            0,
            &IndexKey::Cas(CasValue::string(b"kept", path_key)),
            SearchMode::Equal,
        )
        .unwrap()
        .unwrap();
    assert_eq!(refs.len(), 1);
}

#[test]
fn index_created_over_existing_content_sees_it() {
    let (_dir, resource) = create_resource();

    let mut wtx = resource.begin_write().unwrap();
    wtx.insert_element_as_first_child(&QName::local("a")).unwrap();
    let b = wtx.insert_element_as_first_child(&QName::local("b")).unwrap();
    let t = wtx.insert_text_as_first_child(b"preexisting").unwrap();
    wtx.commit().unwrap();

    // The index is declared after the content exists.
    wtx.create_cas_index(0, ValueType::String, vec!["//a/b".into()])
        .unwrap();
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();
    rtx.move_to(b).unwrap();
    let path = rtx.path_node_key().unwrap();
    let refs = rtx
        .index_get(
            IndexType::Cas,
            0,
            &IndexKey::Cas(CasValue::string(b"preexisting", path)),
            SearchMode::Equal,
        )
        .unwrap()
        .unwrap();
    assert_eq!(refs.node_keys(), &[t]);
}

#[test]
fn search_trees_stay_ordered_and_shallow() {
    // Sequential CAS insertions are the adversarial case for a balanced
    // tree: verify strict BST order and a logarithmic height bound.
    let (_dir, resource) = create_resource();

    let count = 256u32;
    let mut wtx = resource.begin_write().unwrap();
    wtx.create_cas_index(0, ValueType::Integer, vec![]).unwrap();
    wtx.insert_element_as_first_child(&QName::local("n")).unwrap();
    for i in 0..count {
        wtx.insert_text_as_first_child(format!("{i}").as_bytes())
            .unwrap();
        wtx.move_to_parent().unwrap();
    }
    wtx.commit().unwrap();
    drop(wtx);

    let mut rtx = resource.begin_read().unwrap();

    // Every value is findable.
    rtx.move_to_first_child().unwrap();
    let path = rtx.path_node_key().unwrap();
    for i in 0..count {
        let refs = rtx
            .index_get(
                IndexType::Cas,
                0,
                &IndexKey::Cas(CasValue::integer(i as i64, path)),
                SearchMode::Equal,
            )
            .unwrap();
        assert!(refs.is_some(), "value {i} missing from the index");
    }

    // Walk the raw tree: BST order + height bound.
    let mut page = rtx.into_page_trx();
    let mut tree = AvlTree::new(&mut page, revtree::page::PageKind::Cas, 0);
    let root = tree.tree_root_key().unwrap().expect("non-empty index");

    fn check(
        tree: &mut AvlTree<'_, revtree::trx::read::PageReadTrx>,
        key: u64,
        lower: Option<&IndexKey>,
        upper: Option<&IndexKey>,
    ) -> u32 {
        let node = tree.node(key).unwrap().unwrap();
        if let Some(lower) = lower {
            assert!(node.key > *lower, "BST order violated");
        }
        if let Some(upper) = upper {
            assert!(node.key < *upper, "BST order violated");
        }
        let mut height = 0;
        if node.has_left_child() {
            height = height.max(check(tree, node.left_child, lower, Some(&node.key)));
        }
        if node.has_right_child() {
            height = height.max(check(tree, node.right_child, Some(&node.key), upper));
        }
        height + 1
    }

    let height = check(&mut tree, root, None, None);
    let bound = 2 * (count as f64 + 1.0).log2().ceil() as u32 + 1;
    assert!(
        height <= bound,
        "tree of {count} keys has height {height}, bound {bound}"
    );
}
