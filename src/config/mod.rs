//! # Configuration Constants
//!
//! Centralizes the tunables of the index engine. Constants that depend on
//! each other are co-located so a change to one is checked against the
//! others by the compile-time assertions below.
//!
//! ## Dependency Graph
//!
//! ```text
//! NODE_HEADER_SIZE (32 bytes)
//!       │
//!       └─> leaf/internal capacity derivation:
//!             capacity = (node_size - header - 2 * key_len) / entry_len
//!           The two key_len slots hold the node's [begin, end) range.
//!
//! MAX_DEPTH (8)
//!       │
//!       └─> cursor ancestor stack bound (MAX_DEPTH - 1 internal levels).
//!           Any operation that would grow the tree past this depth is a
//!           fatal corruption condition.
//!
//! DEFAULT_NODE_SIZE (4096 bytes)
//!       │
//!       └─> block size of the backing device; every node occupies
//!           exactly one block.
//! ```

/// Maximum tree depth. The cursor's ancestor stack holds at most
/// `MAX_DEPTH - 1` internal levels; growing the tree past this depth aborts.
pub const MAX_DEPTH: usize = 8;

/// Size of the fixed node block header in bytes (magic, kind, depth, entry
/// count, checksum). The node's `[begin, end)` range follows the header.
pub const NODE_HEADER_SIZE: usize = 32;

/// Default node/block size in bytes.
pub const DEFAULT_NODE_SIZE: usize = 4096;

/// Encoded width of a physical address in internal-node entries.
pub const PADDR_ENCODED_LEN: usize = 8;

/// Size of the superblock region at block 0.
pub const SUPERBLOCK_SIZE: usize = 64;

/// First block available to the extent allocator; block 0 is the
/// superblock.
pub const FIRST_ALLOCATABLE_BLOCK: u64 = 1;

/// Entries a leaf node can hold for the given node size and key/value
/// widths.
pub const fn leaf_capacity(node_size: usize, key_len: usize, val_len: usize) -> usize {
    (node_size - NODE_HEADER_SIZE - 2 * key_len) / (key_len + val_len)
}

/// Entries an internal node can hold for the given node size and key width.
pub const fn internal_capacity(node_size: usize, key_len: usize) -> usize {
    (node_size - NODE_HEADER_SIZE - 2 * key_len) / (key_len + PADDR_ENCODED_LEN)
}

/// Minimum occupancy for a non-root node of the given capacity. A node at
/// or below this is a merge/balance candidate.
pub const fn min_capacity(capacity: usize) -> usize {
    capacity / 2
}

const _: () = assert!(MAX_DEPTH >= 2, "tree must support at least one internal level");

const _: () = assert!(
    leaf_capacity(DEFAULT_NODE_SIZE, 8, 16) >= 4,
    "default node size must hold a workable leaf fan-out"
);

const _: () = assert!(
    internal_capacity(DEFAULT_NODE_SIZE, 8) >= 4,
    "default node size must hold a workable internal fan-out"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_derivation_small_node() {
        // 136-byte nodes with u32 keys and 16-byte values give leaf
        // fan-out 4 and internal fan-out 8, the geometry the scenario
        // tests use.
        assert_eq!(leaf_capacity(136, 4, 16), 4);
        assert_eq!(internal_capacity(136, 4), 8);
        assert_eq!(internal_capacity(128, 4), 7);
    }

    #[test]
    fn min_capacity_is_half() {
        assert_eq!(min_capacity(4), 2);
        assert_eq!(min_capacity(5), 2);
        assert_eq!(min_capacity(128), 64);
    }
}
