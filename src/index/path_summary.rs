//! # Path Summary
//!
//! The path summary is an auxiliary tree whose nodes are the unique
//! root-to-node name paths of the document, stored as [`PathNode`]
//! records in index 0 of the path-summary family. Every named document
//! node points at its path node; the path node counts how many live
//! document nodes share the path and disappears with the last of them.
//!
//! ```text
//! document                    path summary
//! <a><b/><b lang=".."/></a>   /a (refs 1)
//!                             └── /a/b (refs 2)
//!                                 └── /a/b/@lang (refs 1)
//! ```
//!
//! Two paths with the same name sequence but different referenced kinds
//! (an element `b` and an attribute `b`) are distinct path nodes.

use eyre::{bail, ensure, Result};

use crate::config::{DOCUMENT_NODE_KEY, NULL_NODE_KEY};
use crate::name::{name_key, QName};
use crate::node::{
    DocumentRootNode, Kind, NameNodeDelegate, Node, NodeDelegate, PathNode, StructNodeDelegate,
};
use crate::page::PageKind;
use crate::trx::write::PageWriteTrx;
use crate::trx::RecordAccess;

/// The path summary always lives in index 0 of its family.
pub const PATH_SUMMARY_INDEX: u32 = 0;

/// Fetches a path node, failing on any other record kind.
pub fn path_node<T: RecordAccess>(trx: &mut T, key: u64) -> Result<Option<PathNode>> {
    if key == NULL_NODE_KEY || key == DOCUMENT_NODE_KEY {
        return Ok(None);
    }
    match trx.record(key, PageKind::PathSummary, PATH_SUMMARY_INDEX)? {
        Some(Node::Path(path)) => Ok(Some(path)),
        Some(other) => bail!("path summary record {} is a {:?}", key, other.kind()),
        None => Ok(None),
    }
}

/// Local-name steps of the path ending at `path_key`, root first.
pub fn steps_for<T: RecordAccess>(trx: &mut T, path_key: u64) -> Result<Vec<String>> {
    let mut steps = Vec::new();
    let mut cursor = path_key;
    while let Some(node) = path_node(trx, cursor)? {
        let local = trx
            .name(node.name.local_name_key, node.referenced_kind)
            .unwrap_or_default();
        steps.push(local);
        cursor = node.node.parent_key;
    }
    steps.reverse();
    Ok(steps)
}

/// Creates the path-summary anchor record if this resource never indexed
/// a named node before.
pub fn ensure_anchor(trx: &mut PageWriteTrx) -> Result<()> {
    trx.create_index(PageKind::PathSummary, PATH_SUMMARY_INDEX)?;
    if trx
        .get_record(DOCUMENT_NODE_KEY, PageKind::PathSummary, PATH_SUMMARY_INDEX)?
        .is_none()
    {
        let anchor = Node::DocumentRoot(DocumentRootNode {
            node: NodeDelegate::new(DOCUMENT_NODE_KEY, NULL_NODE_KEY, trx.revision(), None),
            structure: StructNodeDelegate::detached(),
        });
        trx.create_entry(DOCUMENT_NODE_KEY, anchor, PageKind::PathSummary, PATH_SUMMARY_INDEX)?;
    }
    Ok(())
}

/// Returns the path node for `name` as a child path of
/// `parent_path_key` (the anchor for top-level paths), creating it on
/// first use and bumping its reference count otherwise.
pub fn get_or_create(
    trx: &mut PageWriteTrx,
    parent_path_key: u64,
    name: &QName,
    kind: Kind,
) -> Result<u64> {
    ensure_anchor(trx)?;

    let local_key = name_key(&name.local_name, kind);
    let uri_key = if name.has_uri() {
        name_key(&name.uri, Kind::Namespace)
    } else {
        crate::config::NULL_NAME_KEY
    };

    // Search the child chain for a matching path.
    let (parent_level, first_child) = parent_parts(trx, parent_path_key)?;
    let mut cursor = first_child;
    while cursor != NULL_NODE_KEY {
        let candidate = path_node(trx, cursor)?
            .ok_or_else(|| eyre::eyre!("broken path-summary sibling chain at {}", cursor))?;
        if candidate.referenced_kind == kind
            && candidate.name.local_name_key == local_key
            && candidate.name.uri_key == uri_key
        {
            let node = prepare_path(trx, cursor)?;
            node.increment_references();
            return Ok(cursor);
        }
        cursor = candidate.structure.right_sibling;
    }

    // New unique path: intern its names and attach as first child.
    let key = trx.new_record_key(PageKind::PathSummary, PATH_SUMMARY_INDEX)?;
    let local_name_key = trx.create_name_key(&name.local_name, kind)?;
    let uri_name_key = if name.has_uri() {
        trx.create_name_key(&name.uri, Kind::Namespace)?
    } else {
        crate::config::NULL_NAME_KEY
    };
    let prefix_name_key = if name.has_prefix() {
        trx.create_name_key(&name.prefix, kind)?
    } else {
        crate::config::NULL_NAME_KEY
    };

    let node = Node::Path(PathNode {
        node: NodeDelegate::new(key, parent_path_key, trx.revision(), None),
        structure: StructNodeDelegate::new(NULL_NODE_KEY, NULL_NODE_KEY, first_child),
        name: NameNodeDelegate::new(uri_name_key, prefix_name_key, local_name_key, 0),
        referenced_kind: kind,
        level: parent_level + 1,
        references: 1,
    });
    trx.create_entry(key, node, PageKind::PathSummary, PATH_SUMMARY_INDEX)?;

    if first_child != NULL_NODE_KEY {
        prepare_path(trx, first_child)?.structure.left_sibling = key;
    }
    {
        let parent = prepare_any(trx, parent_path_key)?;
        let structure = parent.structure_mut().unwrap(); // INVARIANT: anchor or path node
        structure.first_child = key;
        structure.increment_child_count();
    }

    // Descendant counts up the ancestor chain, anchor included.
    let mut ancestor = parent_path_key;
    loop {
        let node = prepare_any(trx, ancestor)?;
        node.structure_mut().unwrap().descendant_count += 1; // INVARIANT: anchor or path node
        if ancestor == DOCUMENT_NODE_KEY {
            break;
        }
        ancestor = node.delegate().unwrap().parent_key; // INVARIANT: path nodes have delegates
    }

    Ok(key)
}

/// Drops one reference from `path_key`. A path node is physically removed
/// once nothing references it and no child path remains; removal then
/// ripples upward through ancestors that were only kept alive by it.
pub fn release(trx: &mut PageWriteTrx, path_key: u64) -> Result<()> {
    let Some(node) = path_node(trx, path_key)? else {
        bail!("released path node {} does not exist", path_key);
    };
    ensure!(node.references > 0, "path node {} reference underflow", path_key);
    prepare_path(trx, path_key)?.decrement_references();

    let mut cursor = path_key;
    while cursor != DOCUMENT_NODE_KEY {
        let Some(node) = path_node(trx, cursor)? else {
            break;
        };
        if node.references > 0 || node.structure.has_first_child() {
            break;
        }
        collect(trx, &node)?;
        cursor = node.node.parent_key;
    }
    Ok(())
}

/// Unlinks and deletes one dead path node (zero references, no children).
fn collect(trx: &mut PageWriteTrx, node: &PathNode) -> Result<()> {
    let path_key = node.node.node_key;

    if node.structure.has_left_sibling() {
        prepare_path(trx, node.structure.left_sibling)?
            .structure
            .right_sibling = node.structure.right_sibling;
    }
    if node.structure.has_right_sibling() {
        prepare_path(trx, node.structure.right_sibling)?
            .structure
            .left_sibling = node.structure.left_sibling;
    }
    {
        let parent = prepare_any(trx, node.node.parent_key)?;
        let structure = parent.structure_mut().unwrap(); // INVARIANT: anchor or path node
        if structure.first_child == path_key {
            structure.first_child = node.structure.right_sibling;
        }
        structure.decrement_child_count();
    }

    let mut ancestor = node.node.parent_key;
    loop {
        let prepared = prepare_any(trx, ancestor)?;
        let structure = prepared.structure_mut().unwrap(); // INVARIANT: anchor or path node
        structure.descendant_count = structure.descendant_count.saturating_sub(1);
        if ancestor == DOCUMENT_NODE_KEY {
            break;
        }
        ancestor = prepared.delegate().unwrap().parent_key; // INVARIANT: path nodes have delegates
    }

    trx.remove_name(node.name.local_name_key, node.referenced_kind)?;
    if node.name.uri_key != crate::config::NULL_NAME_KEY {
        trx.remove_name(node.name.uri_key, Kind::Namespace)?;
    }
    if node.name.prefix_key != crate::config::NULL_NAME_KEY {
        trx.remove_name(node.name.prefix_key, node.referenced_kind)?;
    }
    trx.remove_entry(path_key, PageKind::PathSummary, PATH_SUMMARY_INDEX)
}

fn parent_parts(trx: &mut PageWriteTrx, parent_path_key: u64) -> Result<(u32, u64)> {
    if parent_path_key == DOCUMENT_NODE_KEY {
        let anchor = anchor_node(trx)?;
        return Ok((0, anchor.structure.first_child));
    }
    let parent = path_node(trx, parent_path_key)?
        .ok_or_else(|| eyre::eyre!("parent path node {} does not exist", parent_path_key))?;
    Ok((parent.level, parent.structure.first_child))
}

fn anchor_node(trx: &mut PageWriteTrx) -> Result<DocumentRootNode> {
    match trx.get_record(DOCUMENT_NODE_KEY, PageKind::PathSummary, PATH_SUMMARY_INDEX)? {
        Some(Node::DocumentRoot(root)) => Ok(root),
        Some(other) => bail!("path summary anchor is a {:?} record", other.kind()),
        None => bail!("path summary has no anchor record"),
    }
}

fn prepare_path<'t>(trx: &'t mut PageWriteTrx, key: u64) -> Result<&'t mut PathNode> {
    match trx.prepare_entry_for_modification(key, PageKind::PathSummary, PATH_SUMMARY_INDEX)? {
        Node::Path(path) => Ok(path),
        other => bail!("path summary record {} is a {:?}", key, other.kind()),
    }
}

fn prepare_any<'t>(trx: &'t mut PageWriteTrx, key: u64) -> Result<&'t mut Node> {
    trx.prepare_entry_for_modification(key, PageKind::PathSummary, PATH_SUMMARY_INDEX)
}
