//! # Internal Nodes
//!
//! An internal node maps key pivots to child node addresses. The first
//! entry's key always equals the node's `begin`; the child at position `i`
//! covers `[entry[i].key, entry[i+1].key)`, or `[entry[i].key, end)` for
//! the last entry. Descent therefore selects `upper_bound(k) - 1`, never
//! `begin()`, since `entry[0].key <= k` holds whenever the parent routed
//! `k` here.
//!
//! ## Child-Pointer Array
//!
//! Alongside the on-disk entries each in-memory internal node carries a
//! parallel array of direct child pointers ([`ChildSlot`]): a live handle,
//! a `Reserved` marker (known absent from the cache, fault the device
//! directly), or `Unknown` (ask the cache). The array must agree with the
//! entry array after every insert/remove/update/split/merge; sentinel
//! entries are preserved across structural operations.
//!
//! ## Block Layout
//!
//! ```text
//! +-----------------------------+
//! | NodeBlockHeader (32 bytes)  |  magic, kind, depth, len, checksum
//! +-----------------------------+
//! | begin key | end key         |
//! +-----------------------------+
//! | entry 0: key | child paddr  |  paddr stored block-relative
//! | ...                         |
//! +-----------------------------+
//! ```

use std::rc::Rc;

use crate::btree::{node_checksum, NodeBlockHeader, NODE_KIND_INTERNAL};
use crate::config::{min_capacity, NODE_HEADER_SIZE, PADDR_ENCODED_LEN};
use crate::store::{ChildSlot, Extent, TreeNode};
use crate::types::{Depth, ExtentKind, NodeKey, NodeMeta, NodeVal, Paddr};

#[derive(Clone)]
pub struct InternalNode<K: NodeKey, V: NodeVal> {
    meta: NodeMeta<K>,
    entries: Vec<(K, Paddr)>,
    children: Vec<ChildSlot<K, V>>,
    capacity: usize,
}

impl<K: NodeKey, V: NodeVal> InternalNode<K, V> {
    pub fn new(meta: NodeMeta<K>, capacity: usize) -> Self {
        debug_assert!(meta.depth > 1);
        Self {
            meta,
            entries: Vec::with_capacity(capacity),
            children: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn meta(&self) -> NodeMeta<K> {
        self.meta
    }

    pub fn set_meta(&mut self, meta: NodeMeta<K>) {
        debug_assert!(meta.depth > 1);
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

    pub fn entry_key(&self, pos: usize) -> K {
        self.entries[pos].0
    }

    /// Raw stored child address; resolve against this node's paddr before
    /// use (`Paddr::maybe_relative_to`). The in-memory form is absolute.
    pub fn entry_paddr(&self, pos: usize) -> Paddr {
        self.entries[pos].1
    }

    pub fn first_key(&self) -> K {
        debug_assert!(!self.entries.is_empty());
        self.entries[0].0
    }

    pub fn child(&self, pos: usize) -> &ChildSlot<K, V> {
        &self.children[pos]
    }

    /// Key range the child at `pos` covers.
    pub fn child_range(&self, pos: usize) -> (K, K) {
        let begin = self.entries[pos].0;
        let end = if pos + 1 < self.entries.len() {
            self.entries[pos + 1].0
        } else {
            self.meta.end
        };
        (begin, end)
    }

    /// Position of the first entry with `key >= k`.
    pub fn lower_bound(&self, k: K) -> usize {
        self.entries.partition_point(|(key, _)| *key < k)
    }

    /// Position of the first entry with `key > k`.
    pub fn upper_bound(&self, k: K) -> usize {
        self.entries.partition_point(|(key, _)| *key <= k)
    }

    pub fn insert_at(&mut self, pos: usize, key: K, paddr: Paddr, child: ChildSlot<K, V>) {
        debug_assert!(self.entries.len() < self.capacity);
        debug_assert!(pos == 0 || self.entries[pos - 1].0 < key);
        debug_assert!(pos == self.entries.len() || key < self.entries[pos].0);
        self.entries.insert(pos, (key, paddr));
        self.children.insert(pos, child);
    }

    pub fn remove_at(&mut self, pos: usize) {
        self.entries.remove(pos);
        self.children.remove(pos);
    }

    /// Points the entry at `pos` at a replacement child, keeping its key.
    pub fn update_at(&mut self, pos: usize, paddr: Paddr, child: ChildSlot<K, V>) {
        self.entries[pos].1 = paddr;
        self.children[pos] = child;
    }

    /// Replaces the entry at `pos` wholesale (new pivot and child), as the
    /// rebalance path does for the right-hand node.
    pub fn replace_at(&mut self, pos: usize, key: K, paddr: Paddr, child: ChildSlot<K, V>) {
        debug_assert!(pos == 0 || self.entries[pos - 1].0 < key);
        debug_assert!(pos + 1 == self.entries.len() || key < self.entries[pos + 1].0);
        self.entries[pos] = (key, paddr);
        self.children[pos] = child;
    }

    /// Child-pointer cache update; does not touch the entry array.
    pub fn set_child(&mut self, pos: usize, child: ChildSlot<K, V>) {
        self.children[pos] = child;
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

    /// Splits into `(left, right, pivot)`, partitioning both the entry
    /// array and the child-pointer array. Sentinel slots are preserved.
    pub fn make_split_children(&self) -> (Self, Self, K) {
        debug_assert!(self.entries.len() >= 2);
        let split = self.entries.len() / 2;
        let pivot = self.entries[split].0;

        let left = Self {
            meta: NodeMeta::new(self.meta.begin, pivot, self.meta.depth),
            entries: self.entries[..split].to_vec(),
            children: self.children[..split].to_vec(),
            capacity: self.capacity,
        };
        let right = Self {
            meta: NodeMeta::new(pivot, self.meta.end, self.meta.depth),
            entries: self.entries[split..].to_vec(),
            children: self.children[split..].to_vec(),
            capacity: self.capacity,
        };
        (left, right, pivot)
    }

    pub fn make_full_merge(&self, right: &Self) -> Self {
        debug_assert!(self.meta.end == right.meta.begin);
        debug_assert!(self.meta.depth == right.meta.depth);
        debug_assert!(self.entries.len() + right.entries.len() <= self.capacity);

        let mut entries = Vec::with_capacity(self.entries.len() + right.entries.len());
        entries.extend_from_slice(&self.entries);
        entries.extend_from_slice(&right.entries);
        let mut children = Vec::with_capacity(entries.capacity());
        children.extend(self.children.iter().cloned());
        children.extend(right.children.iter().cloned());

        Self {
            meta: NodeMeta::new(self.meta.begin, right.meta.end, self.meta.depth),
            entries,
            children,
            capacity: self.capacity,
        }
    }

    pub fn make_balanced(&self, right: &Self, pivot_idx: usize) -> (Self, Self, K) {
        debug_assert!(self.meta.end == right.meta.begin);
        debug_assert!(self.meta.depth == right.meta.depth);

        let mut entries = Vec::with_capacity(self.entries.len() + right.entries.len());
        entries.extend_from_slice(&self.entries);
        entries.extend_from_slice(&right.entries);
        let mut children: Vec<ChildSlot<K, V>> = Vec::with_capacity(entries.capacity());
        children.extend(self.children.iter().cloned());
        children.extend(right.children.iter().cloned());
        debug_assert!(pivot_idx > 0 && pivot_idx < entries.len());

        let pivot = entries[pivot_idx].0;
        let new_left = Self {
            meta: NodeMeta::new(self.meta.begin, pivot, self.meta.depth),
            entries: entries[..pivot_idx].to_vec(),
            children: children[..pivot_idx].to_vec(),
            capacity: self.capacity,
        };
        let new_right = Self {
            meta: NodeMeta::new(pivot, right.meta.end, self.meta.depth),
            entries: entries[pivot_idx..].to_vec(),
            children: children[pivot_idx..].to_vec(),
            capacity: self.capacity,
        };
        (new_left, new_right, pivot)
    }

    /// Serializes into one block. Child addresses are stored relative to
    /// `owner`, this node's own block address.
    pub fn encode(&self, owner: Paddr, buf: &mut [u8]) {
        buf.fill(0);
        self.meta.begin.encode(&mut buf[NODE_HEADER_SIZE..]);
        self.meta
            .end
            .encode(&mut buf[NODE_HEADER_SIZE + K::ENCODED_LEN..]);

        let base = NODE_HEADER_SIZE + 2 * K::ENCODED_LEN;
        let entry_len = K::ENCODED_LEN + PADDR_ENCODED_LEN;
        for (i, (key, paddr)) in self.entries.iter().enumerate() {
            let off = base + i * entry_len;
            key.encode(&mut buf[off..]);
            let stored = paddr.make_relative_to(owner);
            buf[off + K::ENCODED_LEN..off + entry_len]
                .copy_from_slice(&stored.to_raw().to_le_bytes());
        }

        let header = NodeBlockHeader::new(
            NODE_KIND_INTERNAL,
            self.meta.depth,
            self.entries.len() as u16,
            node_checksum(buf),
        );
        header.write_to(buf);
    }

    /// Deserializes one block. All child slots start `Unknown`. Checksum
    /// or layout disagreement is a fatal corruption condition.
    pub fn decode(owner: Paddr, buf: &[u8]) -> Self {
        let header = NodeBlockHeader::parse(buf, NODE_KIND_INTERNAL, owner);
        let depth: Depth = header.depth();

        let begin = K::decode(&buf[NODE_HEADER_SIZE..]);
        let end = K::decode(&buf[NODE_HEADER_SIZE + K::ENCODED_LEN..]);
        let capacity = crate::config::internal_capacity(buf.len(), K::ENCODED_LEN);
        let len = header.len() as usize;
        assert!(
            len <= capacity,
            "internal node at {:?} records {} entries, capacity {}",
            owner,
            len,
            capacity
        );

        let base = NODE_HEADER_SIZE + 2 * K::ENCODED_LEN;
        let entry_len = K::ENCODED_LEN + PADDR_ENCODED_LEN;
        let mut entries = Vec::with_capacity(capacity);
        let mut children = Vec::with_capacity(capacity);
        for i in 0..len {
            let off = base + i * entry_len;
            let key = K::decode(&buf[off..]);
            let raw = u64::from_le_bytes(
                buf[off + K::ENCODED_LEN..off + entry_len].try_into().unwrap(),
            );
            entries.push((key, Paddr::from_raw(raw).maybe_relative_to(owner)));
            children.push(ChildSlot::Unknown);
        }

        Self {
            meta: NodeMeta::new(begin, end, depth),
            entries,
            children,
            capacity,
        }
    }
}

impl<K: NodeKey, V: NodeVal> TreeNode for InternalNode<K, V> {
    type Key = K;
    type Val = V;

    const KIND: ExtentKind = ExtentKind::InternalNode;

    fn meta(&self) -> NodeMeta<K> {
        self.meta
    }
}

impl<K: NodeKey, V: NodeVal> Extent<InternalNode<K, V>> {
    /// Updates the in-memory child-pointer array. This is cache state, not
    /// node content: it is legal on stable extents (faulting a child links
    /// it under its stable parent).
    pub fn link_child(&self, pos: u16, slot: ChildSlot<K, V>) {
        self.write_for_commit().set_child(pos as usize, slot);
    }

    /// Points live children's back-references at this extent. Run after
    /// structural operations move children between nodes.
    ///
    /// Only transaction-owned (mutable) children are re-pointed here:
    /// stable children are shared with other transactions and keep their
    /// committed back-references until the commit relink pass adopts
    /// them, so an abandoned transaction leaves them untouched.
    pub fn relink_children(self: &Rc<Self>) {
        let live: Vec<ChildSlot<K, V>> = self
            .read()
            .children
            .iter()
            .filter(|s| s.is_live())
            .cloned()
            .collect();
        for slot in live {
            match slot {
                ChildSlot::Internal(child) if child.is_mutable() => child.set_parent(self),
                ChildSlot::Leaf(child) if child.is_mutable() => child.set_parent(self),
                _ => {}
            }
        }
    }
}

impl<K: NodeKey, V: NodeVal> std::fmt::Debug for InternalNode<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalNode")
            .field("meta", &self.meta)
            .field("entries", &self.entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtentMapping;

    type Internal = InternalNode<u32, ExtentMapping>;

    fn node_with(keys: &[u32]) -> Internal {
        let mut node = Internal::new(NodeMeta::new(0, u32::MAX, 2), 8);
        for (i, k) in keys.iter().enumerate() {
            node.insert_at(i, *k, Paddr::new(100 + *k as u64), ChildSlot::Unknown);
        }
        node
    }

    #[test]
    fn descent_selector_never_picks_begin() {
        let node = node_with(&[0, 10, 20, 30]);

        // upper_bound(k) - 1 lands on the covering child for any routed key.
        for (k, expect) in [(0u32, 0usize), (5, 0), (10, 1), (29, 2), (30, 3), (99, 3)] {
            let ub = node.upper_bound(k);
            assert!(ub > 0);
            assert_eq!(ub - 1, expect, "key {}", k);
        }
    }

    #[test]
    fn child_range_uses_next_key_or_meta_end() {
        let node = node_with(&[0, 10, 20]);

        assert_eq!(node.child_range(0), (0, 10));
        assert_eq!(node.child_range(1), (10, 20));
        assert_eq!(node.child_range(2), (20, u32::MAX));
    }

    #[test]
    fn split_partitions_children_and_preserves_sentinels() {
        let mut node = node_with(&[0, 10, 20, 30]);
        node.set_child(1, ChildSlot::Reserved);
        node.set_child(3, ChildSlot::Reserved);

        let (left, right, pivot) = node.make_split_children();
        assert_eq!(pivot, 20);
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 2);
        assert!(left.child(1).is_reserved());
        assert!(right.child(1).is_reserved());
        assert!(!left.child(0).is_reserved());
        assert_eq!(left.meta().end, 20);
        assert_eq!(right.meta().begin, 20);
        assert_eq!(right.meta().depth, 2);
    }

    #[test]
    fn full_merge_concatenates_children() {
        let node = node_with(&[0, 10, 20, 30]);
        let (mut left, right, _) = node.make_split_children();
        left.set_child(0, ChildSlot::Reserved);

        let merged = left.make_full_merge(&right);
        assert_eq!(merged.len(), 4);
        assert!(merged.child(0).is_reserved());
        assert_eq!(merged.meta(), NodeMeta::new(0, u32::MAX, 2));
    }

    #[test]
    fn replace_at_swaps_pivot() {
        let mut node = node_with(&[0, 10, 20]);
        node.replace_at(1, 15, Paddr::new(900), ChildSlot::Unknown);

        assert_eq!(node.entry_key(1), 15);
        assert_eq!(node.entry_paddr(1), Paddr::new(900));
        assert_eq!(node.len(), 3);
    }

    #[test]
    fn codec_roundtrip_stores_relative_child_addrs() {
        let owner = Paddr::new(50);
        let node = node_with(&[0, 10, 20]);

        let mut buf = vec![0u8; 128];
        node.encode(owner, &mut buf);

        // On-disk child address is block-relative.
        let base = NODE_HEADER_SIZE + 2 * 4;
        let raw = u64::from_le_bytes(buf[base + 4..base + 12].try_into().unwrap());
        assert!(Paddr::from_raw(raw).is_relative());

        let decoded = Internal::decode(owner, &buf);
        assert_eq!(decoded.meta(), node.meta());
        assert_eq!(decoded.len(), node.len());
        for i in 0..node.len() {
            assert_eq!(decoded.entry_key(i), node.entry_key(i));
            assert_eq!(decoded.entry_paddr(i), node.entry_paddr(i));
            assert!(!decoded.child(i).is_live());
        }
    }
}
