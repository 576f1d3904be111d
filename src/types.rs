//! # Core Types
//!
//! Fundamental types shared across the storage and btree layers: physical
//! addresses, node metadata, and the key/value traits the fixed-KV tree is
//! generic over.
//!
//! ## Physical Addresses
//!
//! A [`Paddr`] names one block on the backing device. Addresses come in two
//! forms:
//!
//! - **Absolute**: a plain block number.
//! - **Block-relative**: a signed delta against some owning block, produced
//!   when a node is serialized (child pointers and value-embedded addresses
//!   are stored relative to the block that contains them).
//!
//! The in-memory representation handed around by the tree is always
//! absolute; the relative form only exists on the wire and is resolved with
//! [`Paddr::maybe_relative_to`] as soon as it is read. The transform is
//! symmetric: every write path relativizes, every read path resolves.
//!
//! ## Key/Value Contracts
//!
//! [`NodeKey`] and [`NodeVal`] are the fixed-width, totally ordered types a
//! tree instance maps between. Keys expose `MIN`/`MAX` sentinels so the root
//! node always covers `[MIN, MAX)`; values may embed a physical address and
//! participate in the relativization scheme above.

use std::fmt;

use crate::config::PADDR_ENCODED_LEN;

/// Tree depth. Depth 1 is a leaf; the root sits at the tree's full depth.
pub type Depth = u16;

const PADDR_REL_FLAG: u64 = 1 << 63;
const PADDR_NULL_RAW: u64 = u64::MAX;

/// Physical block address on the backing device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Paddr(u64);

impl Paddr {
    /// Sentinel for "no address".
    pub const NULL: Paddr = Paddr(PADDR_NULL_RAW);

    /// Reserved zero address; never allocated to an extent.
    pub const ZERO: Paddr = Paddr(0);

    pub fn new(block: u64) -> Self {
        debug_assert!(block & PADDR_REL_FLAG == 0, "block number overflow");
        Paddr(block)
    }

    pub fn is_null(&self) -> bool {
        self.0 == PADDR_NULL_RAW
    }

    pub fn is_relative(&self) -> bool {
        !self.is_null() && self.0 & PADDR_REL_FLAG != 0
    }

    pub fn is_absolute(&self) -> bool {
        !self.is_null() && !self.is_relative()
    }

    /// Block number of an absolute address.
    pub fn block(&self) -> u64 {
        debug_assert!(self.is_absolute(), "block() on non-absolute paddr");
        self.0
    }

    /// Encodes this address relative to `base`. Null addresses pass through.
    pub fn make_relative_to(self, base: Paddr) -> Paddr {
        if self.is_null() {
            return self;
        }
        debug_assert!(self.is_absolute() && base.is_absolute());
        let delta = self.0 as i64 - base.0 as i64;
        Paddr(PADDR_REL_FLAG | (delta as u64 & !PADDR_REL_FLAG))
    }

    /// Resolves a possibly-relative address against the owning block.
    /// Absolute and null addresses pass through unchanged.
    pub fn maybe_relative_to(self, base: Paddr) -> Paddr {
        if !self.is_relative() {
            return self;
        }
        debug_assert!(base.is_absolute());
        // Sign-extend the 63-bit delta.
        let delta = ((self.0 << 1) as i64) >> 1;
        Paddr((base.0 as i64 + delta) as u64)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Paddr(raw)
    }
}

impl fmt::Debug for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "paddr(null)")
        } else if self.is_relative() {
            let delta = ((self.0 << 1) as i64) >> 1;
            write!(f, "paddr(rel{:+})", delta)
        } else {
            write!(f, "paddr({})", self.0)
        }
    }
}

/// Placement hint passed to the allocator when a fresh extent is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementHint {
    Hot,
    Cold,
}

/// Rewrite generation of a freshly allocated extent.
pub const INIT_GENERATION: u32 = 0;

/// The kinds of extents the cache manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    InternalNode,
    LeafNode,
    Data,
}

/// Fixed-width, totally ordered key type for a tree instance.
///
/// `MIN`/`MAX` are the sentinel bounds: the root node's range is always
/// `[MIN, MAX)` and `MAX` itself is never stored as an entry key.
pub trait NodeKey: Copy + Ord + Eq + std::hash::Hash + fmt::Debug + 'static {
    const MIN: Self;
    const MAX: Self;
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;

    /// Key reached by advancing this key by `len` units, saturating at MAX.
    /// Used to test whether a mapping starting at this key covers another.
    fn add_offset(self, len: u32) -> Self;
}

impl NodeKey for u32 {
    const MIN: Self = 0;
    const MAX: Self = u32::MAX;
    const ENCODED_LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().unwrap())
    }

    fn add_offset(self, len: u32) -> Self {
        self.saturating_add(len)
    }
}

impl NodeKey for u64 {
    const MIN: Self = 0;
    const MAX: Self = u64::MAX;
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }

    fn add_offset(self, len: u32) -> Self {
        self.saturating_add(len as u64)
    }
}

/// Fixed-width value record stored in leaf entries.
///
/// Values that embed a physical address must apply the relativization
/// transform symmetrically: [`NodeVal::encode`] stores embedded addresses
/// relative to the owning leaf's block, [`NodeVal::decode`] resolves them,
/// and [`NodeVal::maybe_relative_to`] is invoked on every in-memory read
/// path (a no-op for the always-absolute in-memory form).
pub trait NodeVal: Copy + PartialEq + Eq + fmt::Debug + 'static {
    const ENCODED_LEN: usize;

    fn encode(&self, owner: Paddr, buf: &mut [u8]);
    fn decode(owner: Paddr, buf: &[u8]) -> Self;

    /// Resolves any embedded relative address against the owning node.
    fn maybe_relative_to(self, _owner: Paddr) -> Self {
        self
    }

    /// Length of the mapped extent, in key units. Used by
    /// `upper_bound_right` to test coverage of a key by the previous entry.
    fn extent_len(&self) -> u32;
}

/// The production value record: a physical extent mapping.
///
/// Maps a logical address to `len` blocks starting at `paddr`, with
/// per-mapping flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentMapping {
    pub paddr: Paddr,
    pub len: u32,
    pub flags: u32,
}

impl ExtentMapping {
    pub fn new(paddr: Paddr, len: u32) -> Self {
        Self {
            paddr,
            len,
            flags: 0,
        }
    }
}

impl NodeVal for ExtentMapping {
    const ENCODED_LEN: usize = 16;

    fn encode(&self, owner: Paddr, buf: &mut [u8]) {
        let stored = if self.paddr.is_absolute() {
            self.paddr.make_relative_to(owner)
        } else {
            self.paddr
        };
        buf[..8].copy_from_slice(&stored.to_raw().to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(owner: Paddr, buf: &[u8]) -> Self {
        let raw = u64::from_le_bytes(buf[..8].try_into().unwrap());
        Self {
            paddr: Paddr::from_raw(raw).maybe_relative_to(owner),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    fn maybe_relative_to(mut self, owner: Paddr) -> Self {
        self.paddr = self.paddr.maybe_relative_to(owner);
        self
    }

    fn extent_len(&self) -> u32 {
        self.len
    }
}

const _: () = assert!(ExtentMapping::ENCODED_LEN == 8 + 4 + 4);
const _: () = assert!(PADDR_ENCODED_LEN == 8);

/// Per-node metadata: the half-open key range `[begin, end)` this node
/// covers and its depth in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta<K: NodeKey> {
    pub begin: K,
    pub end: K,
    pub depth: Depth,
}

impl<K: NodeKey> NodeMeta<K> {
    pub fn new(begin: K, end: K, depth: Depth) -> Self {
        debug_assert!(begin < end);
        debug_assert!(depth >= 1);
        Self { begin, end, depth }
    }

    /// A node is the root iff it covers the whole key space.
    pub fn is_root(&self) -> bool {
        self.begin == K::MIN && self.end == K::MAX
    }

    pub fn contains(&self, key: K) -> bool {
        self.begin <= key && key < self.end
    }

    /// True iff `child` covers a subrange of this node one level down.
    pub fn is_parent_of(&self, child: &NodeMeta<K>) -> bool {
        self.depth == child.depth + 1 && self.begin <= child.begin && child.end <= self.end
    }
}
