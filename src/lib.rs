//! # Brine - Object Store Index Engine
//!
//! Brine is the transactional index layer of a log-structured object
//! store: a copy-on-write B+-tree mapping fixed-width logical addresses to
//! fixed-width physical extent records. It translates between the logical
//! namespace exposed to clients and the physical block layout maintained
//! by the storage engine.
//!
//! ## Quick Start
//!
//! ```ignore
//! use brine::btree::{with_tree, FixedKvTree};
//! use brine::store::BlockCache;
//! use brine::types::ExtentMapping;
//!
//! let cache: BlockCache<u64, ExtentMapping> =
//!     BlockCache::create("./index.brine", 4096)?;
//!
//! let txn = cache.begin_transaction();
//! with_tree(&cache, &txn, |c, _tree| {
//!     let root_block = c.cache.duplicate_root_for_write(c.txn);
//!     FixedKvTree::mkfs(&root_block, c);
//!     Ok(())
//! })?;
//! cache.commit(&txn)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Tree handle (mkfs / bounds / iterate)   │
//! ├──────────────────────────────────────────┤
//! │  Lookup engine     │   Mutation engine    │
//! │  (descent, cursor) │  (COW, split/merge)  │
//! ├──────────────────────────────────────────┤
//! │   Node contract (leaf / internal nodes)   │
//! ├──────────────────────────────────────────┤
//! │  Block cache (extents, transactions,      │
//! │  duplicate-for-write, commit)             │
//! ├──────────────────────────────────────────┤
//! │  Memory-mapped block device               │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Transactional Model
//!
//! Every operation runs against one transaction. Mutations are
//! copy-on-write: before any node is written the transaction obtains a
//! private mutable clone from the cache; the committed tree is immutable
//! until commit publishes the clone set atomically. Concurrent
//! transactions each see either the committed view of a node or their own
//! pending clone, never another transaction's work in progress.
//!
//! Execution is single-threaded cooperative per store. There is no shared
//! mutable state between transactions inside the tree core.
//!
//! ## Module Overview
//!
//! - [`types`]: physical addresses, key/value contracts, node metadata
//! - [`config`]: depth bound, node sizing, capacity derivation
//! - [`store`]: block device, extents, transactions, block cache
//! - [`btree`]: the fixed-KV tree core (cursor, lookup, mutation)

pub mod btree;
pub mod config;
pub mod store;
pub mod types;

pub use btree::{with_tree, with_tree_state, Cursor, FixedKvTree, OpCtx};
pub use store::{BlockCache, Transaction, TreeStats};
pub use types::{ExtentMapping, Paddr};
