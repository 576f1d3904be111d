//! # Transactional Fixed-KV B+-Tree
//!
//! This module implements the index core: a copy-on-write B+-tree mapping
//! fixed-width keys (logical addresses) to fixed-width value records
//! (physical extent mappings), run against the block cache in
//! [`crate::store`].
//!
//! ## Architecture Overview
//!
//! ```text
//!                 FixedKvTree (tree.rs)
//!        lookup engine │ mutation engine │ handle
//!                      │
//!              Cursor (cursor.rs)
//!        leaf position + bounded ancestor stack
//!                      │
//!        LeafNode (leaf.rs) / InternalNode (internal.rs)
//!        ordered search, capacity predicates,
//!        split/merge/balance factories, block codec
//! ```
//!
//! ## Transactional Model
//!
//! Every operation runs inside an [`OpCtx`]: a block cache plus one
//! transaction. Reads may observe either the committed view of a node or
//! the transaction's private mutable clone; writes always go through
//! `duplicate_for_write` first. A single transaction must not interleave
//! reads through stale cursors with mutations: any insert/update/remove
//! invalidates every other outstanding cursor on that transaction, because
//! mutations may retire or relocate the nodes those cursors reference.
//!
//! ## Node Blocks
//!
//! Every node occupies exactly one device block, led by a fixed header
//! (magic, kind, depth, entry count, xxh3-64 checksum) and the node's key
//! range. A checksum mismatch on fault is a fatal corruption condition:
//! the process aborts rather than serve a corrupt index.

mod cursor;
mod internal;
mod leaf;
mod tree;

pub use cursor::Cursor;
pub use internal::InternalNode;
pub use leaf::LeafNode;
pub use tree::{
    with_tree, with_tree_state, FixedKvTree, MappedSpaceVisitor,
};

use xxhash_rust::xxh3::xxh3_64;
use zerocopy::{
    byteorder::{LittleEndian, U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::config::NODE_HEADER_SIZE;
use crate::store::{BlockCache, Transaction};
use crate::types::{Depth, NodeKey, NodeVal, Paddr};

pub(crate) const NODE_MAGIC: u32 = 0x6272_746e; // "brtn"
pub(crate) const NODE_KIND_INTERNAL: u8 = 1;
pub(crate) const NODE_KIND_LEAF: u8 = 2;

/// Context every tree operation runs in: one cache, one transaction.
pub struct OpCtx<'a, K: NodeKey, V: NodeVal> {
    pub cache: &'a BlockCache<K, V>,
    pub txn: &'a Transaction<K, V>,
}

impl<'a, K: NodeKey, V: NodeVal> Clone for OpCtx<'a, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, K: NodeKey, V: NodeVal> Copy for OpCtx<'a, K, V> {}

impl<'a, K: NodeKey, V: NodeVal> OpCtx<'a, K, V> {
    pub fn new(cache: &'a BlockCache<K, V>, txn: &'a Transaction<K, V>) -> Self {
        Self { cache, txn }
    }
}

/// Fixed header leading every node block.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct NodeBlockHeader {
    magic: U32<LittleEndian>,
    kind: u8,
    _reserved0: u8,
    depth: U16<LittleEndian>,
    len: U16<LittleEndian>,
    _reserved1: [u8; 6],
    checksum: U64<LittleEndian>,
    _reserved2: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<NodeBlockHeader>() == NODE_HEADER_SIZE);

impl NodeBlockHeader {
    pub(crate) fn new(kind: u8, depth: Depth, len: u16, checksum: u64) -> Self {
        Self {
            magic: U32::new(NODE_MAGIC),
            kind,
            _reserved0: 0,
            depth: U16::new(depth),
            len: U16::new(len),
            _reserved1: [0; 6],
            checksum: U64::new(checksum),
            _reserved2: [0; 8],
        }
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        buf[..NODE_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    /// Parses and verifies a node block header. Any disagreement (magic,
    /// kind, depth, checksum) means the block is not the node the tree
    /// mapped at this address, which is fatal corruption.
    pub(crate) fn parse(buf: &[u8], expected_kind: u8, owner: Paddr) -> Self {
        let header = NodeBlockHeader::read_from_bytes(&buf[..NODE_HEADER_SIZE])
            .unwrap_or_else(|e| panic!("short node block at {:?}: {:?}", owner, e));

        assert!(
            header.magic.get() == NODE_MAGIC,
            "node block at {:?} has bad magic {:#x}",
            owner,
            header.magic.get()
        );
        assert!(
            header.kind == expected_kind,
            "node block at {:?} has kind {}, expected {}",
            owner,
            header.kind,
            expected_kind
        );
        if expected_kind == NODE_KIND_LEAF {
            assert!(
                header.depth.get() == 1,
                "leaf block at {:?} records depth {}",
                owner,
                header.depth.get()
            );
        } else {
            assert!(
                header.depth.get() > 1,
                "internal block at {:?} records depth {}",
                owner,
                header.depth.get()
            );
        }

        let computed = node_checksum(buf);
        assert!(
            header.checksum.get() == computed,
            "node block at {:?} checksum mismatch: recorded {:#x}, computed {:#x}",
            owner,
            header.checksum.get(),
            computed
        );

        header
    }

    pub(crate) fn depth(&self) -> Depth {
        self.depth.get()
    }

    pub(crate) fn len(&self) -> u16 {
        self.len.get()
    }
}

/// Checksum over a node block's payload (everything past the header).
pub(crate) fn node_checksum(buf: &[u8]) -> u64 {
    xxh3_64(&buf[NODE_HEADER_SIZE..])
}
