//! # Store Layer
//!
//! The storage substrate the index runs on: a memory-mapped block device,
//! the extent model (node images with identity and copy-on-write lifecycle
//! state), transactions, and the block cache that ties them together.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │          B+-tree core (crate::btree)        │
//! ├────────────────────────────────────────────┤
//! │  BlockCache: fault / duplicate-for-write /  │
//! │  retire / commit, resident index, root      │
//! ├──────────────────────┬─────────────────────┤
//! │  Transaction:        │  Extents: Stable /  │
//! │  mutation set, stats │  Fresh / Pending    │
//! ├──────────────────────┴─────────────────────┤
//! │  BlockDevice: mmap'd fixed-size blocks     │
//! └────────────────────────────────────────────┘
//! ```
//!
//! Execution is single-threaded cooperative per store: extents are shared
//! via `Rc` and never cross threads. Stable extents are the committed view
//! and may be observed by any transaction; mutable clones belong to exactly
//! one transaction and become stable at commit.

mod cache;
mod device;
mod extent;
mod transaction;

pub use cache::BlockCache;
pub use device::BlockDevice;
pub use extent::{
    AnyExtent, ChildSlot, DataExtent, DataRef, Extent, ExtentState, InternalRef, LeafRef,
    NodeHandle, PhyTreeRoot, RootBlock, RootBlockRef, TreeNode, TxnId,
};
pub use transaction::{ExtentPresence, Transaction, TransactionRef, TreeStats};
