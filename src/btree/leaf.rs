//! # Leaf Nodes
//!
//! A leaf holds the tree's actual `(key, value)` pairs, sorted by key, all
//! within the node's metadata range `[begin, end)`. Leaves sit at depth 1.
//!
//! ## Block Layout
//!
//! ```text
//! +-----------------------------+
//! | NodeBlockHeader (32 bytes)  |  magic, kind, depth, len, checksum
//! +-----------------------------+
//! | begin key | end key         |  node metadata range
//! +-----------------------------+
//! | entry 0: key | value        |
//! | entry 1: key | value        |
//! | ...                         |
//! +-----------------------------+
//! ```
//!
//! Value-embedded physical addresses are stored relative to this leaf's
//! own block address and resolved on decode; see [`crate::types::NodeVal`].
//!
//! ## Capacity
//!
//! Derived from the block size: `(node_size - header - 2*key) / entry`.
//! A node at max capacity gates a split; one below min capacity (half of
//! max) gates a merge; one exactly at min capacity cannot donate entries
//! and forces a full merge instead of a rebalance.

use crate::btree::{node_checksum, NodeBlockHeader, NODE_KIND_LEAF};
use crate::config::{min_capacity, NODE_HEADER_SIZE};
use crate::store::TreeNode;
use crate::types::{ExtentKind, NodeKey, NodeMeta, NodeVal, Paddr};

#[derive(Debug, Clone)]
pub struct LeafNode<K: NodeKey, V: NodeVal> {
    meta: NodeMeta<K>,
    entries: Vec<(K, V)>,
    capacity: usize,
}

impl<K: NodeKey, V: NodeVal> LeafNode<K, V> {
    pub fn new(meta: NodeMeta<K>, capacity: usize) -> Self {
        debug_assert!(meta.depth == 1);
        Self {
            meta,
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn meta(&self) -> NodeMeta<K> {
        self.meta
    }

    pub fn set_meta(&mut self, meta: NodeMeta<K>) {
        debug_assert!(meta.depth == 1);
        self.meta = meta;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn key_at(&self, pos: usize) -> K {
        self.entries[pos].0
    }

    /// Raw stored value; callers that may observe an embedded address go
    /// through the cursor, which resolves it against the leaf's paddr.
    pub fn val_at(&self, pos: usize) -> V {
        self.entries[pos].1
    }

    pub fn first_key(&self) -> K {
        debug_assert!(!self.entries.is_empty());
        self.entries[0].0
    }

    pub fn last_key(&self) -> K {
        debug_assert!(!self.entries.is_empty());
        self.entries[self.entries.len() - 1].0
    }

    /// Position of the first entry with `key >= k`.
    pub fn lower_bound(&self, k: K) -> usize {
        self.entries.partition_point(|(key, _)| *key < k)
    }

    /// Position of the first entry with `key > k`.
    pub fn upper_bound(&self, k: K) -> usize {
        self.entries.partition_point(|(key, _)| *key <= k)
    }

    pub fn insert_at(&mut self, pos: usize, key: K, val: V) {
        debug_assert!(self.entries.len() < self.capacity);
        debug_assert!(self.meta.contains(key));
        debug_assert!(pos == 0 || self.entries[pos - 1].0 < key);
        debug_assert!(pos == self.entries.len() || key < self.entries[pos].0);
        self.entries.insert(pos, (key, val));
    }

    pub fn remove_at(&mut self, pos: usize) {
        self.entries.remove(pos);
    }

    pub fn update_at(&mut self, pos: usize, val: V) {
        self.entries[pos].1 = val;
    }

    pub fn at_max_capacity(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn at_min_capacity(&self) -> bool {
        self.entries.len() <= min_capacity(self.capacity)
    }

    pub fn below_min_capacity(&self) -> bool {
        self.entries.len() < min_capacity(self.capacity)
    }

    /// Splits into `(left, right, pivot)`. Every key below the pivot lands
    /// in `left`; the pivot equals `right`'s first key and becomes the new
    /// boundary of both metadata ranges.
    pub fn make_split_children(&self) -> (Self, Self, K) {
        debug_assert!(self.entries.len() >= 2);
        let split = self.entries.len() / 2;
        let pivot = self.entries[split].0;

        let left = Self {
            meta: NodeMeta::new(self.meta.begin, pivot, 1),
            entries: self.entries[..split].to_vec(),
            capacity: self.capacity,
        };
        let right = Self {
            meta: NodeMeta::new(pivot, self.meta.end, 1),
            entries: self.entries[split..].to_vec(),
            capacity: self.capacity,
        };
        (left, right, pivot)
    }

    /// Merges this node with its right neighbor into one replacement node
    /// covering both ranges.
    pub fn make_full_merge(&self, right: &Self) -> Self {
        debug_assert!(self.meta.end == right.meta.begin);
        debug_assert!(self.entries.len() + right.entries.len() <= self.capacity);
        let mut entries = Vec::with_capacity(self.entries.len() + right.entries.len());
        entries.extend_from_slice(&self.entries);
        entries.extend_from_slice(&right.entries);
        Self {
            meta: NodeMeta::new(self.meta.begin, right.meta.end, 1),
            entries,
            capacity: self.capacity,
        }
    }

    /// Redistributes entries between this node and its right neighbor,
    /// splitting the combined sequence at `pivot_idx`.
    pub fn make_balanced(&self, right: &Self, pivot_idx: usize) -> (Self, Self, K) {
        debug_assert!(self.meta.end == right.meta.begin);
        let mut combined = Vec::with_capacity(self.entries.len() + right.entries.len());
        combined.extend_from_slice(&self.entries);
        combined.extend_from_slice(&right.entries);
        debug_assert!(pivot_idx > 0 && pivot_idx < combined.len());

        let pivot = combined[pivot_idx].0;
        let left = Self {
            meta: NodeMeta::new(self.meta.begin, pivot, 1),
            entries: combined[..pivot_idx].to_vec(),
            capacity: self.capacity,
        };
        let new_right = Self {
            meta: NodeMeta::new(pivot, right.meta.end, 1),
            entries: combined[pivot_idx..].to_vec(),
            capacity: self.capacity,
        };
        (left, new_right, pivot)
    }

    /// Serializes into one block. `owner` is this node's block address;
    /// value-embedded addresses are stored relative to it.
    pub fn encode(&self, owner: Paddr, buf: &mut [u8]) {
        buf.fill(0);
        self.meta.begin.encode(&mut buf[NODE_HEADER_SIZE..]);
        self.meta
            .end
            .encode(&mut buf[NODE_HEADER_SIZE + K::ENCODED_LEN..]);

        let base = NODE_HEADER_SIZE + 2 * K::ENCODED_LEN;
        let entry_len = K::ENCODED_LEN + V::ENCODED_LEN;
        for (i, (key, val)) in self.entries.iter().enumerate() {
            let off = base + i * entry_len;
            key.encode(&mut buf[off..]);
            val.encode(owner, &mut buf[off + K::ENCODED_LEN..]);
        }

        let header = NodeBlockHeader::new(
            NODE_KIND_LEAF,
            1,
            self.entries.len() as u16,
            node_checksum(buf),
        );
        header.write_to(buf);
    }

    /// Deserializes one block. Checksum or layout disagreement is a fatal
    /// corruption condition.
    pub fn decode(owner: Paddr, buf: &[u8]) -> Self {
        let header = NodeBlockHeader::parse(buf, NODE_KIND_LEAF, owner);

        let begin = K::decode(&buf[NODE_HEADER_SIZE..]);
        let end = K::decode(&buf[NODE_HEADER_SIZE + K::ENCODED_LEN..]);
        let capacity =
            crate::config::leaf_capacity(buf.len(), K::ENCODED_LEN, V::ENCODED_LEN);
        let len = header.len() as usize;
        assert!(
            len <= capacity,
            "leaf at {:?} records {} entries, capacity {}",
            owner,
            len,
            capacity
        );

        let base = NODE_HEADER_SIZE + 2 * K::ENCODED_LEN;
        let entry_len = K::ENCODED_LEN + V::ENCODED_LEN;
        let mut entries = Vec::with_capacity(capacity);
        for i in 0..len {
            let off = base + i * entry_len;
            let key = K::decode(&buf[off..]);
            let val = V::decode(owner, &buf[off + K::ENCODED_LEN..]);
            entries.push((key, val));
        }

        Self {
            meta: NodeMeta::new(begin, end, 1),
            entries,
            capacity,
        }
    }
}

impl<K: NodeKey, V: NodeVal> TreeNode for LeafNode<K, V> {
    type Key = K;
    type Val = V;

    const KIND: ExtentKind = ExtentKind::LeafNode;

    fn meta(&self) -> NodeMeta<K> {
        self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtentMapping;

    type Leaf = LeafNode<u32, ExtentMapping>;

    fn mapping(block: u64) -> ExtentMapping {
        ExtentMapping::new(Paddr::new(block), 4)
    }

    fn full_leaf() -> Leaf {
        let mut leaf = Leaf::new(NodeMeta::new(0, u32::MAX, 1), 4);
        for (i, k) in [10u32, 20, 30, 40].into_iter().enumerate() {
            leaf.insert_at(i, k, mapping(k as u64));
        }
        leaf
    }

    #[test]
    fn bounds_on_sorted_entries() {
        let leaf = full_leaf();

        assert_eq!(leaf.lower_bound(10), 0);
        assert_eq!(leaf.lower_bound(15), 1);
        assert_eq!(leaf.lower_bound(40), 3);
        assert_eq!(leaf.lower_bound(41), 4);

        assert_eq!(leaf.upper_bound(10), 1);
        assert_eq!(leaf.upper_bound(9), 0);
        assert_eq!(leaf.upper_bound(40), 4);
    }

    #[test]
    fn capacity_predicates() {
        let mut leaf = Leaf::new(NodeMeta::new(0, u32::MAX, 1), 4);
        assert!(leaf.below_min_capacity());

        leaf.insert_at(0, 10, mapping(1));
        leaf.insert_at(1, 20, mapping(2));
        assert!(leaf.at_min_capacity());
        assert!(!leaf.below_min_capacity());
        assert!(!leaf.at_max_capacity());

        leaf.insert_at(2, 30, mapping(3));
        leaf.insert_at(3, 40, mapping(4));
        assert!(leaf.at_max_capacity());
    }

    #[test]
    fn split_pivot_is_rights_first_key() {
        let leaf = full_leaf();
        let (left, right, pivot) = leaf.make_split_children();

        assert_eq!(pivot, 30);
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 2);
        assert_eq!(right.first_key(), pivot);
        assert_eq!(left.meta(), NodeMeta::new(0, 30, 1));
        assert_eq!(right.meta(), NodeMeta::new(30, u32::MAX, 1));
    }

    #[test]
    fn full_merge_concatenates_and_widens() {
        let leaf = full_leaf();
        let (left, right, _) = leaf.make_split_children();

        let merged = left.make_full_merge(&right);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.meta(), NodeMeta::new(0, u32::MAX, 1));
        assert_eq!(merged.key_at(0), 10);
        assert_eq!(merged.key_at(3), 40);
    }

    #[test]
    fn balanced_redistribution() {
        let mut left = Leaf::new(NodeMeta::new(0, 50, 1), 4);
        left.insert_at(0, 10, mapping(1));
        left.insert_at(1, 20, mapping(2));
        left.insert_at(2, 30, mapping(3));

        let mut right = Leaf::new(NodeMeta::new(50, u32::MAX, 1), 4);
        right.insert_at(0, 60, mapping(6));

        let (l, r, pivot) = left.make_balanced(&right, 2);
        assert_eq!(pivot, 30);
        assert_eq!(l.len(), 2);
        assert_eq!(r.len(), 2);
        assert_eq!(l.meta().end, 30);
        assert_eq!(r.meta().begin, 30);
        assert_eq!(r.key_at(1), 60);
    }

    #[test]
    fn codec_preserves_entries_and_relativizes_values() {
        let owner = Paddr::new(77);
        let leaf = full_leaf();

        let mut buf = vec![0u8; 128];
        leaf.encode(owner, &mut buf);
        let decoded = Leaf::decode(owner, &buf);

        assert_eq!(decoded.meta(), leaf.meta());
        assert_eq!(decoded.len(), leaf.len());
        for i in 0..leaf.len() {
            assert_eq!(decoded.key_at(i), leaf.key_at(i));
            assert_eq!(decoded.val_at(i), leaf.val_at(i));
        }
    }

    #[test]
    #[should_panic(expected = "checksum")]
    fn corrupted_block_is_fatal() {
        let owner = Paddr::new(3);
        let leaf = full_leaf();

        let mut buf = vec![0u8; 128];
        leaf.encode(owner, &mut buf);
        buf[100] ^= 0xFF;
        let _ = Leaf::decode(owner, &buf);
    }
}
