//! # revtree: Versioned Storage for Hierarchical Documents
//!
//! revtree is an append-only storage engine for XML-shaped documents.
//! Every commit produces an immutable revision; any prior revision stays
//! readable forever. The engine provides structural mutations (insert,
//! move, remove subtrees, rename, set values), secondary indexes (path,
//! content-and-structure, name) and point/range queries over both the
//! tree and the indexes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use revtree::{QName, Resource, ResourceOptions};
//!
//! let resource = Resource::create("./my-doc", ResourceOptions::default())?;
//!
//! let mut wtx = resource.begin_write()?;
//! wtx.insert_element_as_first_child(&QName::local("a"))?;
//! wtx.insert_text_as_first_child(b"hello")?;
//! let revision = wtx.commit()?;
//!
//! let mut rtx = resource.begin_read_at(revision)?;
//! rtx.move_to_first_child()?;
//! assert_eq!(rtx.get_name().unwrap().local_name, "a");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  Node cursor / node write transaction     │  trx::node_read / node_write
//! ├───────────────────────────────────────────┤
//! │  AVL index trees + path summary           │  index
//! ├───────────────────────────────────────────┤
//! │  Page read / write transactions (COW)     │  trx::read / write
//! ├──────────────────────┬────────────────────┤
//! │  Shared page cache   │  Transaction log   │  cache, txlog
//! ├──────────────────────┴────────────────────┤
//! │  Page + record codecs                     │  page, node, encoding
//! ├───────────────────────────────────────────┤
//! │  Append-only resource file (mmap reads)   │  io
//! └───────────────────────────────────────────┘
//! ```
//!
//! A 64-bit node key resolves through a fan-out-128 indirect page tree to
//! a record page; record pages are versioned as deltas merged over a
//! sliding window of revisions. A write transaction stages copy-on-write
//! pages in a two-level log and publishes them atomically by flipping the
//! uber pointer in the file header, the one mutable word of the format.
//!
//! ## Concurrency
//!
//! One writer per resource, any number of readers, each reader pinned to
//! the revision it opened on. Readers never block the writer and never
//! observe partial revisions.

mod macros;

pub mod cache;
pub mod config;
pub mod encoding;
pub mod index;
pub mod io;
pub mod name;
pub mod node;
pub mod page;
pub mod resource;
pub mod trx;
pub mod txlog;

pub use config::ResourceOptions;
pub use index::{CasValue, IndexDef, IndexKey, IndexType, NodeReferences, SearchMode, ValueType};
pub use name::QName;
pub use node::{DeweyId, Kind, Node};
pub use resource::Resource;
pub use trx::node_read::{MoveResult, NodeReadTrx};
pub use trx::node_write::{NodeWriteTrx, SubtreeEvent};
