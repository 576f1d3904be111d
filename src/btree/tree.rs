//! # Fixed-KV Tree
//!
//! The tree handle binding the lookup and mutation engines to a
//! [`RootBlock`]. All state transitions of the index go through here:
//!
//! - **Lookup**: root resolution plus a top-down descent driven by
//!   per-level selector closures, producing a full cursor. The parent's
//!   child-pointer array is consulted before the block cache at every
//!   level.
//! - **Mutation**: `insert`, `update`, `remove`, `rewrite_extent`, all
//!   copy-on-write against the transaction. Splits cascade upward from the
//!   first non-full level; merges cascade upward while ancestors fall
//!   below minimum capacity; the root grows and collapses at the ends of
//!   those cascades.
//!
//! ## Cascade Shapes
//!
//! ```text
//! insert:  check_split ─> [grow root?] ─> split top-down to the leaf
//!          ─> duplicate leaf ─> insert entry
//!
//! remove:  duplicate leaf ─> remove entry
//!          ─> while below min capacity: merge/rebalance with donor
//!          ─> [collapse root?]
//! ```
//!
//! Both cascades re-seat the cursor at every level so the caller's
//! position survives the structural change. For a leaf split,
//! `pos == left.len()` stays on the *left* node (its boundary), because an
//! insertion there must land before `right.begin`; for an internal split
//! the same position jumps to `right` at position 0.
//!
//! ## Depth Bound
//!
//! Descent, split cascades, and merge cascades are all bounded by
//! `MAX_DEPTH` and implemented as loops; an operation that would push the
//! tree past `MAX_DEPTH` aborts.

use std::ops::ControlFlow;
use std::rc::Rc;

use eyre::{ensure, Result};
use tracing::{debug, trace};

use crate::btree::cursor::NodePosition;
use crate::btree::{Cursor, InternalNode, LeafNode, OpCtx};
use crate::config::MAX_DEPTH;
use crate::store::{
    AnyExtent, BlockCache, ChildSlot, Extent, ExtentState, InternalRef, LeafRef, NodeHandle,
    PhyTreeRoot, RootBlockRef, Transaction, TreeNode,
};
use crate::types::{
    Depth, ExtentKind, NodeKey, NodeMeta, NodeVal, Paddr, PlacementHint, INIT_GENERATION,
};

/// Per-node callback invoked during traversal; used by GC and integrity
/// checking to observe the set of live extents.
pub type MappedSpaceVisitor<'v, K, V> =
    dyn FnMut(Paddr, K, u32, Depth, ExtentKind, &Cursor<K, V>) + 'v;

pub struct FixedKvTree<K: NodeKey, V: NodeVal> {
    root_block: RootBlockRef<K, V>,
}

impl<K: NodeKey, V: NodeVal> FixedKvTree<K, V> {
    pub fn new(root_block: RootBlockRef<K, V>) -> Self {
        Self { root_block }
    }

    pub fn root(&self) -> PhyTreeRoot {
        self.root_block.root()
    }

    /// Initializes an empty tree: a single empty leaf covering
    /// `[MIN, MAX)` at depth 1, linked as the root.
    pub fn mkfs(root_block: &RootBlockRef<K, V>, c: OpCtx<'_, K, V>) -> PhyTreeRoot {
        assert!(
            root_block.is_mutable(),
            "mkfs requires a mutation-pending root block"
        );
        let leaf = LeafNode::new(NodeMeta::new(K::MIN, K::MAX, 1), c.cache.leaf_capacity());
        let root_leaf = c.cache.alloc_leaf(c.txn, leaf, PlacementHint::Hot, INIT_GENERATION);

        {
            let mut stats = c.txn.tree_stats();
            stats.depth = 1;
            stats.extents_num_delta += 1;
        }

        root_block.link_root(NodeHandle::Leaf(Rc::clone(&root_leaf)));
        root_block.set_location(root_leaf.paddr());
        root_block.set_depth(1);
        debug!(root = ?root_leaf.paddr(), "mkfs");
        PhyTreeRoot {
            location: root_leaf.paddr(),
            depth: 1,
        }
    }

    /// Builds a partial cursor from a leaf handle the caller already
    /// holds. Ancestor slots stay empty until materialized on demand.
    pub fn make_partial_iter(
        &self,
        c: OpCtx<'_, K, V>,
        leaf: LeafRef<K, V>,
        key: K,
        pos: u16,
    ) -> Cursor<K, V> {
        debug_assert!(
            c.txn.is_weak() || c.txn.is_viewable(&NodeHandle::Leaf(Rc::clone(&leaf))),
            "partial cursor over a leaf this transaction does not view"
        );
        let depth = self.root_block.root().depth;
        let mut ret = Cursor::new_partial(depth);
        ret.leaf.node = Some(leaf);
        ret.leaf.pos = pos;
        if ret.is_end() {
            assert!(key == K::MAX, "end cursor must carry the MAX key");
        } else {
            assert!(key == ret.get_key(), "cursor key disagrees with leaf entry");
        }
        ret
    }

    /// Least position with `key >= k`.
    pub fn lower_bound(&self, c: OpCtx<'_, K, V>, key: K) -> Result<Cursor<K, V>> {
        self.lower_bound_with(c, key, None, 1)
    }

    pub fn lower_bound_with(
        &self,
        c: OpCtx<'_, K, V>,
        key: K,
        visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
        min_depth: Depth,
    ) -> Result<Cursor<K, V>> {
        let cursor = self.lookup(
            c,
            &mut |node: &InternalNode<K, V>| {
                debug_assert!(node.len() > 0);
                let ub = node.upper_bound(key);
                debug_assert!(ub > 0);
                ub - 1
            },
            &mut |node: &LeafNode<K, V>| node.lower_bound(key),
            min_depth,
            visitor,
        )?;
        #[cfg(debug_assertions)]
        if min_depth == 1 {
            cursor.assert_valid();
        }
        Ok(cursor)
    }

    /// Least position with `key > k`.
    pub fn upper_bound(&self, c: OpCtx<'_, K, V>, key: K) -> Result<Cursor<K, V>> {
        let cursor = self.lower_bound(c, key)?;
        if !cursor.is_end() && cursor.get_key() == key {
            cursor.next(c, None)
        } else {
            Ok(cursor)
        }
    }

    /// Least position whose mapping covers or lies past `key`: the
    /// previous entry wins iff `prev.key + prev.val.len > key`.
    pub fn upper_bound_right(&self, c: OpCtx<'_, K, V>, key: K) -> Result<Cursor<K, V>> {
        let cursor = self.lower_bound(c, key)?;
        if cursor.is_begin() {
            return Ok(cursor);
        }
        let prev = cursor.prev(c)?;
        if prev.get_key().add_offset(prev.get_val().extent_len()) > key {
            Ok(prev)
        } else {
            Ok(cursor)
        }
    }

    pub fn begin(&self, c: OpCtx<'_, K, V>) -> Result<Cursor<K, V>> {
        self.lower_bound(c, K::MIN)
    }

    pub fn end(&self, c: OpCtx<'_, K, V>) -> Result<Cursor<K, V>> {
        self.upper_bound(c, K::MAX)
    }

    /// Runs `body` at each position from `cursor` onward until it breaks.
    /// The body must break at `is_end()`; advancing past it is a caller
    /// bug.
    pub fn iterate_repeat<F>(
        c: OpCtx<'_, K, V>,
        cursor: Cursor<K, V>,
        mut body: F,
        mut visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
    ) -> Result<()>
    where
        F: FnMut(&Cursor<K, V>) -> Result<ControlFlow<()>>,
    {
        let mut pos = cursor;
        loop {
            if let ControlFlow::Break(()) = body(&pos)? {
                return Ok(());
            }
            assert!(!pos.is_end(), "iterate_repeat body did not stop at end");
            pos = pos.next(c, visitor.as_deref_mut())?;
        }
    }

    /// Inserts `(key, val)`, using a prior `lower_bound(key)` cursor as a
    /// positioning hint. Returns the cursor at the entry plus `true` iff
    /// the key did not already exist. Invalidates all other outstanding
    /// cursors on this transaction.
    pub fn insert_with_hint(
        &mut self,
        c: OpCtx<'_, K, V>,
        hint: Cursor<K, V>,
        key: K,
        val: V,
    ) -> Result<(Cursor<K, V>, bool)> {
        trace!(?key, "insert");
        let mut cursor = hint;
        self.find_insertion(c, key, &mut cursor)?;

        if !cursor.at_boundary() && cursor.get_key() == key {
            return Ok((cursor, false));
        }

        c.txn.tree_stats().num_inserts += 1;
        self.handle_split(c, &mut cursor)?;

        let leaf = {
            let leaf = cursor.leaf_node().clone();
            if leaf.is_mutable() {
                leaf
            } else {
                let dup = c.cache.duplicate_leaf_for_write(c.txn, &leaf);
                cursor.leaf.node = Some(Rc::clone(&dup));
                dup
            }
        };

        {
            let mut node = leaf.write();
            let pos = cursor.leaf.pos as usize;
            debug_assert_eq!(pos, node.lower_bound(key));
            debug_assert!(pos == node.len() || node.key_at(pos) > key);
            debug_assert!(node.meta().contains(key));
            node.insert_at(pos, key, val);
        }

        Ok((cursor, true))
    }

    /// `insert_with_hint` preceded by its own `lower_bound(key)`.
    pub fn insert(
        &mut self,
        c: OpCtx<'_, K, V>,
        key: K,
        val: V,
    ) -> Result<(Cursor<K, V>, bool)> {
        let hint = self.lower_bound(c, key)?;
        self.insert_with_hint(c, hint, key, val)
    }

    /// Overwrites the value at `cursor`, which must not be end. Returns
    /// the cursor re-seated on the mutable leaf. Invalidates all other
    /// outstanding cursors on this transaction.
    pub fn update(
        &self,
        c: OpCtx<'_, K, V>,
        cursor: Cursor<K, V>,
        val: V,
    ) -> Result<Cursor<K, V>> {
        trace!(key = ?cursor.get_key(), "update");
        let mut cursor = cursor;
        let leaf = {
            let leaf = cursor.leaf_node().clone();
            if leaf.is_mutable() {
                leaf
            } else {
                let dup = c.cache.duplicate_leaf_for_write(c.txn, &leaf);
                cursor.leaf.node = Some(Rc::clone(&dup));
                dup
            }
        };
        c.txn.tree_stats().num_updates += 1;
        leaf.write().update_at(cursor.leaf.pos as usize, val);
        Ok(cursor)
    }

    /// Removes the entry at `cursor`, which must not be end, rebalancing
    /// upward as needed. Returns the cursor at the following position.
    /// Invalidates all other outstanding cursors on this transaction.
    pub fn remove(&mut self, c: OpCtx<'_, K, V>, cursor: Cursor<K, V>) -> Result<Cursor<K, V>> {
        assert!(!cursor.is_end(), "remove() at end");
        trace!(key = ?cursor.get_key(), "remove");
        c.txn.tree_stats().num_erases += 1;

        let mut ret = cursor;
        let leaf = {
            let leaf = ret.leaf_node().clone();
            if leaf.is_mutable() {
                leaf
            } else {
                let dup = c.cache.duplicate_leaf_for_write(c.txn, &leaf);
                ret.leaf.node = Some(Rc::clone(&dup));
                dup
            }
        };
        leaf.write().remove_at(ret.leaf.pos as usize);

        self.handle_merge(c, &mut ret)?;

        if ret.is_end() {
            if ret.is_begin() {
                // Empty root leaf; end stays representable as-is.
                debug_assert!(ret.leaf_node().meta().is_root());
            } else {
                ret.handle_boundary(c, None)?;
            }
        }
        Ok(ret)
    }

    /// Rewrites a node extent into a fresh copy at a new address and
    /// repoints the reference that mapped it (parent entry, or the root
    /// block for the root). The original is retired.
    pub fn rewrite_extent(&mut self, c: OpCtx<'_, K, V>, extent: AnyExtent<K, V>) -> Result<()> {
        let AnyExtent::Node(node) = extent else {
            panic!("rewrite_extent on a non-index extent");
        };

        match &node {
            NodeHandle::Internal(n) => {
                let fresh = c.cache.alloc_internal(
                    c.txn,
                    n.read().clone(),
                    n.hint(),
                    n.generation() + 1,
                );
                let meta = fresh.meta();
                debug!(old = ?n.paddr(), new = ?fresh.paddr(), depth = meta.depth, "rewrite internal");
                self.update_internal_mapping(
                    c,
                    meta.depth,
                    meta.begin,
                    n.paddr(),
                    fresh.paddr(),
                    NodeHandle::Internal(Rc::clone(&fresh)),
                )?;
            }
            NodeHandle::Leaf(n) => {
                let fresh =
                    c.cache
                        .alloc_leaf(c.txn, n.read().clone(), n.hint(), n.generation() + 1);
                let meta = fresh.meta();
                debug!(old = ?n.paddr(), new = ?fresh.paddr(), "rewrite leaf");
                self.update_internal_mapping(
                    c,
                    meta.depth,
                    meta.begin,
                    n.paddr(),
                    fresh.paddr(),
                    NodeHandle::Leaf(Rc::clone(&fresh)),
                )?;
            }
        }

        c.cache.retire_extent(c.txn, AnyExtent::Node(node));
        Ok(())
    }

    /// Repoints the mapping of the node at `(depth, key)` from `old_paddr`
    /// to `new_paddr`. A mismatch between the expected and found mapping
    /// is a fatal corruption condition.
    pub fn update_internal_mapping(
        &mut self,
        c: OpCtx<'_, K, V>,
        depth: Depth,
        key: K,
        old_paddr: Paddr,
        new_paddr: Paddr,
        nextent: NodeHandle<K, V>,
    ) -> Result<()> {
        trace!(?key, depth, ?old_paddr, ?new_paddr, "update internal mapping");
        let cursor = self.lower_bound_with(c, key, None, depth + 1)?;
        debug_assert!(cursor.get_depth() >= depth);

        if depth == cursor.get_depth() {
            // The node is the root; the root block maps it.
            assert!(
                key == K::MIN,
                "root mapping update at {:?}, key is not MIN",
                key
            );
            assert!(
                self.root_block.root().location == old_paddr,
                "root mapping update: root is at {:?}, expected {:?}",
                self.root_block.root().location,
                old_paddr
            );

            let root_block = c.cache.duplicate_root_for_write(c.txn);
            self.root_block = Rc::clone(&root_block);
            root_block.set_location(new_paddr);
            root_block.link_root(nextent);
        } else {
            let (parent, pos) = {
                let entry = cursor.internal_entry(depth + 1);
                (
                    entry
                        .node
                        .clone()
                        .expect("mapping lookup produced no parent"),
                    entry.pos as usize,
                )
            };
            let (found_key, found_paddr) = {
                let p = parent.read();
                debug_assert!(pos < p.len());
                (p.entry_key(pos), p.entry_paddr(pos))
            };
            assert!(
                found_key == key,
                "mapping update at {:?} depth {}: parent entry key is {:?}",
                key,
                depth,
                found_key
            );
            assert!(
                found_paddr == old_paddr,
                "mapping update at {:?} depth {}: parent maps {:?}, expected {:?}",
                key,
                depth,
                found_paddr,
                old_paddr
            );

            let mparent = c.cache.duplicate_internal_for_write(c.txn, &parent);
            let slot = match &nextent {
                NodeHandle::Internal(n) => {
                    n.set_parent(&mparent);
                    ChildSlot::Internal(Rc::clone(n))
                }
                NodeHandle::Leaf(n) => {
                    n.set_parent(&mparent);
                    ChildSlot::Leaf(Rc::clone(n))
                }
            };
            mparent.write().update_at(pos, new_paddr, slot);
        }
        Ok(())
    }

    /// Checks whether a re-faulted extent is still reachable from the
    /// tree. Extents the index does not own (data extents) are always
    /// reported live.
    pub fn init_cached_extent(
        &self,
        c: OpCtx<'_, K, V>,
        extent: &AnyExtent<K, V>,
    ) -> Result<bool> {
        match extent {
            AnyExtent::Node(NodeHandle::Internal(n)) => {
                let cursor = self.lower_bound(c, n.meta().begin)?;
                // Valid even when the cursor is at end.
                let cand_depth = n.meta().depth;
                let live = cand_depth <= cursor.get_depth()
                    && cursor
                        .internal_entry(cand_depth)
                        .node
                        .as_ref()
                        .map(|node| Rc::ptr_eq(node, n))
                        .unwrap_or(false);
                trace!(paddr = ?n.paddr(), live, "init_cached_extent internal");
                Ok(live)
            }
            AnyExtent::Node(NodeHandle::Leaf(n)) => {
                let cursor = self.lower_bound(c, n.meta().begin)?;
                let live = Rc::ptr_eq(cursor.leaf_node(), n);
                trace!(paddr = ?n.paddr(), live, "init_cached_extent leaf");
                Ok(live)
            }
            AnyExtent::Data(_) => Ok(true),
        }
    }

    /// The live leaf mapped at `key` iff it still lives at `paddr`.
    pub fn get_leaf_if_live(
        &self,
        c: OpCtx<'_, K, V>,
        paddr: Paddr,
        key: K,
    ) -> Result<Option<LeafRef<K, V>>> {
        let cursor = self.lower_bound(c, key)?;
        if cursor.leaf_node().paddr() == paddr {
            Ok(Some(cursor.leaf_node().clone()))
        } else {
            trace!(?paddr, ?key, "leaf not live");
            Ok(None)
        }
    }

    /// The live internal node covering `key` iff one still lives at
    /// `paddr` on the cursor path.
    pub fn get_internal_if_live(
        &self,
        c: OpCtx<'_, K, V>,
        paddr: Paddr,
        key: K,
    ) -> Result<Option<InternalRef<K, V>>> {
        let cursor = self.lower_bound(c, key)?;
        for depth in 2..=cursor.get_depth() {
            let node = cursor.internal_node(depth);
            if node.paddr() == paddr {
                assert!(
                    node.meta().begin == key,
                    "internal node at {:?} begins at {:?}, expected {:?}",
                    paddr,
                    node.meta().begin,
                    key
                );
                return Ok(Some(node.clone()));
            }
        }
        trace!(?paddr, ?key, "internal not live");
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Lookup engine
    // ------------------------------------------------------------------

    fn lookup(
        &self,
        c: OpCtx<'_, K, V>,
        li: &mut dyn FnMut(&InternalNode<K, V>) -> usize,
        ll: &mut dyn FnMut(&LeafNode<K, V>) -> usize,
        min_depth: Depth,
        mut visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
    ) -> Result<Cursor<K, V>> {
        debug_assert!(min_depth > 0);
        let root = self.root_block.root();
        ensure!(root.depth >= 1, "tree is not initialized");

        let mut cursor = Cursor::new_full(root.depth);
        self.lookup_root(c, &mut cursor, visitor.as_deref_mut())?;

        if cursor.get_depth() > 1 {
            let pos = {
                let node = cursor.internal_node(root.depth);
                li(&node.read())
            };
            cursor.internal_entry_mut(root.depth).pos = pos as u16;
        } else {
            let pos = ll(&cursor.leaf_node().read());
            cursor.leaf.pos = pos as u16;
        }

        lookup_depth_range(
            c,
            &mut cursor,
            root.depth - 1,
            min_depth - 1,
            li,
            ll,
            visitor.as_deref_mut(),
        )?;

        // min_depth > 1 only serves update_internal_mapping; a boundary is
        // normalized only for leaf-level lookups.
        if min_depth == 1 && cursor.at_boundary() {
            cursor.handle_boundary(c, visitor)?;
        }
        Ok(cursor)
    }

    /// Resolves the root node into the cursor: the root block's tracked
    /// node when linked, a device fault otherwise.
    fn lookup_root(
        &self,
        c: OpCtx<'_, K, V>,
        cursor: &mut Cursor<K, V>,
        visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
    ) -> Result<()> {
        let root = self.root_block.root();
        let handle = match self.root_block.root_node() {
            Some(tracked) => match c.txn.view_of(tracked.paddr()) {
                Some(view) => view,
                None => tracked,
            },
            None => {
                let meta = NodeMeta::new(K::MIN, K::MAX, root.depth);
                if root.depth > 1 {
                    NodeHandle::Internal(c.cache.read_internal(
                        c.txn,
                        root.location,
                        meta,
                        None,
                        false,
                    )?)
                } else {
                    NodeHandle::Leaf(c.cache.read_leaf(c.txn, root.location, meta, None, false)?)
                }
            }
        };
        assert!(
            handle.depth() == root.depth,
            "root node depth {} disagrees with root block depth {}",
            handle.depth(),
            root.depth
        );

        let paddr = handle.paddr();
        let begin = handle.meta().begin;
        let kind = handle.kind();
        match handle {
            NodeHandle::Internal(node) => {
                cursor.internal_entry_mut(root.depth).node = Some(node);
            }
            NodeHandle::Leaf(node) => {
                cursor.leaf.node = Some(node);
            }
        }
        if let Some(visitor) = visitor {
            visitor(
                paddr,
                begin,
                c.cache.node_size() as u32,
                root.depth,
                kind,
                cursor,
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutation engine
    // ------------------------------------------------------------------

    /// Positions `cursor` at the insertion point for `key`. The hint is
    /// usable as-is when it is at-end within a leaf whose range covers
    /// `key`, or points at an entry `>= key` in such a leaf; otherwise the
    /// insertion point is the boundary of the previous leaf.
    fn find_insertion(
        &self,
        c: OpCtx<'_, K, V>,
        key: K,
        cursor: &mut Cursor<K, V>,
    ) -> Result<()> {
        debug_assert!(cursor.is_end() || cursor.get_key() >= key);
        if !cursor.is_end() && cursor.get_key() == key {
            return Ok(());
        }
        if cursor.leaf_node().meta().begin <= key {
            #[cfg(debug_assertions)]
            if cursor.leaf.pos > 0 {
                let mut p = cursor.clone();
                p.leaf.pos -= 1;
                debug_assert!(p.get_key() < key);
            }
            return Ok(());
        }

        debug_assert!(cursor.leaf.pos == 0);
        let mut p = cursor.prev(c)?;
        debug_assert!(p.leaf_node().meta().begin <= key);
        debug_assert!(p.get_key() < key);
        // Deliberately parks the cursor at the previous leaf's boundary,
        // transiently violating pos < len: the insertion must land before
        // the next leaf's begin.
        p.leaf.pos += 1;
        debug_assert!(p.at_boundary());
        *cursor = p;
        Ok(())
    }

    /// Splits nodes along `cursor`'s path as needed for one insertion:
    /// scan up for the first non-full level, then split downward from
    /// there to the leaf, re-seating the cursor at each level.
    fn handle_split(&mut self, c: OpCtx<'_, K, V>, cursor: &mut Cursor<K, V>) -> Result<()> {
        let split_from = cursor.check_split(c);
        trace!(split_from, depth = cursor.get_depth(), "handle split");
        if split_from == 0 {
            return Ok(());
        }

        if split_from == cursor.get_depth() {
            #[cfg(debug_assertions)]
            debug_assert!(cursor.is_full());
            let old_depth = cursor.get_depth();
            assert!(
                (old_depth as usize) < MAX_DEPTH,
                "split would grow the tree past MAX_DEPTH"
            );

            let (old_root_paddr, old_root_slot) = if old_depth > 1 {
                let node = cursor.internal_node(old_depth).clone();
                (node.paddr(), ChildSlot::Internal(node))
            } else {
                let node = cursor.leaf_node().clone();
                (node.paddr(), ChildSlot::Leaf(node))
            };

            let mut nroot_node = InternalNode::new(
                NodeMeta::new(K::MIN, K::MAX, old_depth + 1),
                c.cache.internal_capacity(),
            );
            nroot_node.insert_at(0, K::MIN, old_root_paddr, old_root_slot);
            let nroot = c
                .cache
                .alloc_internal(c.txn, nroot_node, PlacementHint::Hot, INIT_GENERATION);

            cursor.internal.push(NodePosition {
                node: Some(Rc::clone(&nroot)),
                pos: 0,
            });
            debug!(depth = cursor.get_depth(), root = ?nroot.paddr(), "grew root");

            {
                let mut stats = c.txn.tree_stats();
                stats.depth = cursor.get_depth();
                stats.extents_num_delta += 1;
            }

            let root_block = c.cache.duplicate_root_for_write(c.txn);
            self.root_block = Rc::clone(&root_block);
            root_block.set_location(nroot.paddr());
            root_block.set_depth(cursor.get_depth());
            root_block.link_root(NodeHandle::Internal(nroot));
        }

        let mut level = split_from;
        while level > 0 {
            {
                let parent_entry = cursor.internal_entry_mut(level + 1);
                let parent = parent_entry
                    .node
                    .clone()
                    .expect("split cascade requires a materialized parent");
                if !parent.is_mutable() {
                    parent_entry.node =
                        Some(c.cache.duplicate_internal_for_write(c.txn, &parent));
                }
            }

            if level > 1 {
                let parent_idx = (level + 1) as usize - 2;
                let (below, above) = cursor.internal.split_at_mut(parent_idx);
                let pos = &mut below[level as usize - 2];
                let parent_pos = &mut above[0];
                let (left, right) = split_level::<K, V, InternalNode<K, V>>(c, parent_pos, pos)?;

                let left_len = left.read().len();
                if (pos.pos as usize) < left_len {
                    pos.node = Some(left);
                } else {
                    pos.node = Some(right);
                    pos.pos -= left_len as u16;
                    parent_pos.pos += 1;
                }
            } else {
                let parent_pos = &mut cursor.internal[0];
                let pos = &mut cursor.leaf;
                let (left, right) = split_level::<K, V, LeafNode<K, V>>(c, parent_pos, pos)?;

                // pos == left.len() stays on the left (its boundary): the
                // insertion must land before right.begin.
                let left_len = left.read().len();
                if (pos.pos as usize) <= left_len {
                    pos.node = Some(left);
                } else {
                    pos.node = Some(right);
                    pos.pos -= left_len as u16;
                    parent_pos.pos += 1;
                }
            }
            level -= 1;
        }

        Ok(())
    }

    /// Merges or rebalances upward from the leaf while nodes sit below
    /// minimum capacity, collapsing the root if it ends up with a single
    /// entry.
    fn handle_merge(&mut self, c: OpCtx<'_, K, V>, cursor: &mut Cursor<K, V>) -> Result<()> {
        if cursor.get_depth() == 1 || !cursor.leaf_node().read().below_min_capacity() {
            trace!(
                depth = cursor.get_depth(),
                "no merge needed"
            );
            return Ok(());
        }

        let mut to_merge: Depth = 1;
        loop {
            trace!(depth = to_merge, "merging level");
            cursor.ensure_internal(c, to_merge + 1);

            let parent_idx = (to_merge + 1) as usize - 2;
            if to_merge > 1 {
                let (below, above) = cursor.internal.split_at_mut(parent_idx);
                let pos = &mut below[to_merge as usize - 2];
                let parent_pos = &mut above[0];
                merge_level::<K, V, InternalNode<K, V>>(c, to_merge, parent_pos, pos)?;
            } else {
                let parent_pos = &mut cursor.internal[parent_idx];
                merge_level::<K, V, LeafNode<K, V>>(c, to_merge, parent_pos, &mut cursor.leaf)?;
            }

            to_merge += 1;
            if to_merge == cursor.get_depth() {
                #[cfg(debug_assertions)]
                debug_assert!(cursor.is_full());
                self.maybe_collapse_root(c, cursor);
                return Ok(());
            }

            let below_min = cursor
                .internal_node(to_merge)
                .read()
                .below_min_capacity();
            if !below_min {
                return Ok(());
            }
        }
    }

    /// If the root holds a single entry after a merge cascade, its unique
    /// child becomes the new root and the tree loses one level.
    fn maybe_collapse_root(&mut self, c: OpCtx<'_, K, V>, cursor: &mut Cursor<K, V>) {
        let depth = cursor.get_depth();
        let root_node = cursor.internal_node(depth).clone();
        if root_node.read().len() != 1 {
            trace!("no root collapse needed");
            return;
        }

        debug_assert!(cursor.internal_entry(depth).pos == 0);
        let child_paddr = root_node.read().entry_paddr(0);

        c.cache
            .retire_extent(c.txn, AnyExtent::Node(NodeHandle::Internal(root_node.clone())));
        cursor.internal.pop();
        debug!(depth = cursor.get_depth(), "collapsed root");

        {
            let mut stats = c.txn.tree_stats();
            stats.depth = cursor.get_depth();
            stats.extents_num_delta -= 1;
        }

        let root_block = c.cache.duplicate_root_for_write(c.txn);
        self.root_block = Rc::clone(&root_block);
        root_block.set_location(child_paddr.maybe_relative_to(root_node.paddr()));
        root_block.set_depth(cursor.get_depth());

        let new_root = if cursor.get_depth() > 1 {
            NodeHandle::Internal(cursor.internal_node(cursor.get_depth()).clone())
        } else {
            NodeHandle::Leaf(cursor.leaf_node().clone())
        };
        root_block.link_root(new_root);
    }
}

// ----------------------------------------------------------------------
// Level plumbing shared by the engines and the cursor
// ----------------------------------------------------------------------

/// Node-type plumbing for the structural cascades, letting the split and
/// merge paths run identically over leaves and internal nodes.
pub(crate) trait RebalanceNode<K: NodeKey, V: NodeVal>:
    TreeNode<Key = K, Val = V> + Sized
{
    fn len(&self) -> usize;
    fn at_min_capacity(&self) -> bool;
    fn make_split_children(&self) -> (Self, Self, K);
    fn make_full_merge(&self, right: &Self) -> Self;
    fn make_balanced(&self, right: &Self, pivot_idx: usize) -> (Self, Self, K);

    fn alloc(c: OpCtx<'_, K, V>, node: Self) -> Rc<Extent<Self>>;
    fn fault(
        c: OpCtx<'_, K, V>,
        paddr: Paddr,
        expected: NodeMeta<K>,
        parent: (InternalRef<K, V>, u16),
        skip_cache_query: bool,
    ) -> Result<Rc<Extent<Self>>>;
    fn slot(ext: &Rc<Extent<Self>>) -> ChildSlot<K, V>;
    fn handle(ext: &Rc<Extent<Self>>) -> NodeHandle<K, V>;
    fn from_handle(handle: NodeHandle<K, V>) -> Rc<Extent<Self>>;
    fn set_parent(ext: &Rc<Extent<Self>>, parent: &InternalRef<K, V>);
}

impl<K: NodeKey, V: NodeVal> RebalanceNode<K, V> for LeafNode<K, V> {
    fn len(&self) -> usize {
        LeafNode::len(self)
    }

    fn at_min_capacity(&self) -> bool {
        LeafNode::at_min_capacity(self)
    }

    fn make_split_children(&self) -> (Self, Self, K) {
        LeafNode::make_split_children(self)
    }

    fn make_full_merge(&self, right: &Self) -> Self {
        LeafNode::make_full_merge(self, right)
    }

    fn make_balanced(&self, right: &Self, pivot_idx: usize) -> (Self, Self, K) {
        LeafNode::make_balanced(self, right, pivot_idx)
    }

    fn alloc(c: OpCtx<'_, K, V>, node: Self) -> Rc<Extent<Self>> {
        c.cache
            .alloc_leaf(c.txn, node, PlacementHint::Hot, INIT_GENERATION)
    }

    fn fault(
        c: OpCtx<'_, K, V>,
        paddr: Paddr,
        expected: NodeMeta<K>,
        parent: (InternalRef<K, V>, u16),
        skip_cache_query: bool,
    ) -> Result<Rc<Extent<Self>>> {
        c.cache
            .read_leaf(c.txn, paddr, expected, Some(parent), skip_cache_query)
    }

    fn slot(ext: &Rc<Extent<Self>>) -> ChildSlot<K, V> {
        ChildSlot::Leaf(Rc::clone(ext))
    }

    fn handle(ext: &Rc<Extent<Self>>) -> NodeHandle<K, V> {
        NodeHandle::Leaf(Rc::clone(ext))
    }

    fn from_handle(handle: NodeHandle<K, V>) -> Rc<Extent<Self>> {
        match handle {
            NodeHandle::Leaf(n) => n,
            NodeHandle::Internal(_) => panic!("expected a leaf extent"),
        }
    }

    fn set_parent(ext: &Rc<Extent<Self>>, parent: &InternalRef<K, V>) {
        ext.set_parent(parent);
    }
}

impl<K: NodeKey, V: NodeVal> RebalanceNode<K, V> for InternalNode<K, V> {
    fn len(&self) -> usize {
        InternalNode::len(self)
    }

    fn at_min_capacity(&self) -> bool {
        InternalNode::at_min_capacity(self)
    }

    fn make_split_children(&self) -> (Self, Self, K) {
        InternalNode::make_split_children(self)
    }

    fn make_full_merge(&self, right: &Self) -> Self {
        InternalNode::make_full_merge(self, right)
    }

    fn make_balanced(&self, right: &Self, pivot_idx: usize) -> (Self, Self, K) {
        InternalNode::make_balanced(self, right, pivot_idx)
    }

    fn alloc(c: OpCtx<'_, K, V>, node: Self) -> Rc<Extent<Self>> {
        c.cache
            .alloc_internal(c.txn, node, PlacementHint::Hot, INIT_GENERATION)
    }

    fn fault(
        c: OpCtx<'_, K, V>,
        paddr: Paddr,
        expected: NodeMeta<K>,
        parent: (InternalRef<K, V>, u16),
        skip_cache_query: bool,
    ) -> Result<Rc<Extent<Self>>> {
        c.cache
            .read_internal(c.txn, paddr, expected, Some(parent), skip_cache_query)
    }

    fn slot(ext: &Rc<Extent<Self>>) -> ChildSlot<K, V> {
        ChildSlot::Internal(Rc::clone(ext))
    }

    fn handle(ext: &Rc<Extent<Self>>) -> NodeHandle<K, V> {
        NodeHandle::Internal(Rc::clone(ext))
    }

    fn from_handle(handle: NodeHandle<K, V>) -> Rc<Extent<Self>> {
        match handle {
            NodeHandle::Internal(n) => n,
            NodeHandle::Leaf(_) => panic!("expected an internal extent"),
        }
    }

    fn set_parent(ext: &Rc<Extent<Self>>, parent: &InternalRef<K, V>) {
        ext.set_parent(parent);
    }
}

/// Splits the node under `pos`, updating the (already mutable) parent's
/// entry to `left` and inserting `(pivot, right)` after it. The original
/// is retired; the caller re-seats `pos` on the returned halves.
fn split_level<K: NodeKey, V: NodeVal, N: RebalanceNode<K, V>>(
    c: OpCtx<'_, K, V>,
    parent_pos: &mut NodePosition<InternalRef<K, V>>,
    pos: &mut NodePosition<Rc<Extent<N>>>,
) -> Result<(Rc<Extent<N>>, Rc<Extent<N>>)> {
    let node = pos.node.clone().expect("split target not materialized");
    let (left_node, right_node, pivot) = node.read().make_split_children();
    let left = N::alloc(c, left_node);
    let right = N::alloc(c, right_node);

    let parent = parent_pos
        .node
        .clone()
        .expect("split cascade requires a materialized parent");
    {
        let mut p = parent.write();
        p.update_at(parent_pos.pos as usize, left.paddr(), N::slot(&left));
        p.insert_at(
            parent_pos.pos as usize + 1,
            pivot,
            right.paddr(),
            N::slot(&right),
        );
    }
    N::set_parent(&left, &parent);
    N::set_parent(&right, &parent);

    trace!(
        old = ?node.paddr(),
        left = ?left.paddr(),
        right = ?right.paddr(),
        ?pivot,
        "split node"
    );
    c.cache
        .retire_extent(c.txn, AnyExtent::Node(N::handle(&node)));
    c.txn.tree_stats().extents_num_delta += 1;

    Ok((left, right))
}

/// Merges or rebalances the node under `pos` with a donor sibling chosen
/// from its parent: the right neighbor unless `pos` is the parent's last
/// entry. A donor at minimum capacity forces a full merge; otherwise the
/// pair is rebalanced around the combined midpoint. The cursor is
/// re-seated on the replacement node covering its old position.
fn merge_level<K: NodeKey, V: NodeVal, N: RebalanceNode<K, V>>(
    c: OpCtx<'_, K, V>,
    depth: Depth,
    parent_pos: &mut NodePosition<InternalRef<K, V>>,
    pos: &mut NodePosition<Rc<Extent<N>>>,
) -> Result<()> {
    {
        let parent = parent_pos
            .node
            .clone()
            .expect("merge cascade requires a materialized parent");
        if !parent.is_mutable() {
            parent_pos.node = Some(c.cache.duplicate_internal_for_write(c.txn, &parent));
        }
    }
    let parent = parent_pos.node.clone().expect("parent just ensured");

    let pos_idx = parent_pos.pos as usize;
    let (donor_idx, donor_is_left, donor_paddr, donor_meta, donor_slot) = {
        let p = parent.read();
        debug_assert!(pos_idx < p.len());
        let donor_is_left = pos_idx + 1 == p.len();
        let donor_idx = if donor_is_left { pos_idx - 1 } else { pos_idx + 1 };
        let (begin, end) = p.child_range(donor_idx);
        (
            donor_idx,
            donor_is_left,
            p.entry_paddr(donor_idx),
            NodeMeta::new(begin, end, depth),
            p.child(donor_idx).clone(),
        )
    };

    let donor: Rc<Extent<N>> = match donor_slot.handle() {
        Some(handle) => {
            let handle = match c.txn.view_of(handle.paddr()) {
                Some(view) => view,
                None => handle,
            };
            N::from_handle(handle)
        }
        None => N::fault(
            c,
            donor_paddr.maybe_relative_to(parent.paddr()),
            donor_meta,
            (Rc::clone(&parent), donor_idx as u16),
            donor_slot.is_reserved(),
        )?,
    };
    {
        let cur_meta = pos.node.as_ref().expect("merge target").meta();
        let dmeta = donor.meta();
        debug_assert!(if donor_is_left {
            dmeta.end == cur_meta.begin
        } else {
            dmeta.begin == cur_meta.end
        });
    }

    let current = pos.node.clone().expect("merge target not materialized");
    let (l, r) = if donor_is_left {
        (Rc::clone(&donor), Rc::clone(&current))
    } else {
        (Rc::clone(&current), Rc::clone(&donor))
    };
    let (l_idx, r_idx) = if donor_is_left {
        (donor_idx, pos_idx)
    } else {
        (pos_idx, donor_idx)
    };
    let l_len = l.read().len();

    if donor.read().at_min_capacity() {
        let replacement_node = {
            let lref = l.read();
            let rref = r.read();
            lref.make_full_merge(&rref)
        };
        let replacement = N::alloc(c, replacement_node);

        {
            let mut p = parent.write();
            p.update_at(l_idx, replacement.paddr(), N::slot(&replacement));
            p.remove_at(r_idx);
        }
        N::set_parent(&replacement, &parent);

        trace!(
            l = ?l.paddr(),
            r = ?r.paddr(),
            replacement = ?replacement.paddr(),
            depth,
            "full merge"
        );
        pos.node = Some(replacement);
        if donor_is_left {
            pos.pos += l_len as u16;
            parent_pos.pos -= 1;
        }

        c.cache.retire_extent(c.txn, AnyExtent::Node(N::handle(&l)));
        c.cache.retire_extent(c.txn, AnyExtent::Node(N::handle(&r)));
        c.txn.tree_stats().extents_num_delta -= 1;
    } else {
        let (left_node, right_node, pivot) = {
            let lref = l.read();
            let rref = r.read();
            let pivot_idx = (lref.len() + rref.len()) / 2;
            lref.make_balanced(&rref, pivot_idx)
        };
        let new_left = N::alloc(c, left_node);
        let new_right = N::alloc(c, right_node);

        {
            let mut p = parent.write();
            p.update_at(l_idx, new_left.paddr(), N::slot(&new_left));
            p.replace_at(r_idx, pivot, new_right.paddr(), N::slot(&new_right));
        }
        N::set_parent(&new_left, &parent);
        N::set_parent(&new_right, &parent);

        if donor_is_left {
            debug_assert!(parent_pos.pos > 0);
            parent_pos.pos -= 1;
        }

        let orig_position = if donor_is_left {
            l_len + pos.pos as usize
        } else {
            pos.pos as usize
        };
        let new_left_len = new_left.read().len();
        trace!(
            l = ?l.paddr(),
            r = ?r.paddr(),
            new_left = ?new_left.paddr(),
            new_right = ?new_right.paddr(),
            ?pivot,
            depth,
            "rebalanced"
        );
        if orig_position < new_left_len {
            pos.node = Some(new_left);
            pos.pos = orig_position as u16;
        } else {
            parent_pos.pos += 1;
            pos.node = Some(new_right);
            pos.pos = (orig_position - new_left_len) as u16;
        }

        c.cache.retire_extent(c.txn, AnyExtent::Node(N::handle(&l)));
        c.cache.retire_extent(c.txn, AnyExtent::Node(N::handle(&r)));
    }

    Ok(())
}

/// Descends `cursor` through depths `(to, from]`, selecting positions with
/// `li`/`ll`. May leave the cursor at a boundary; callers returning out of
/// the tree run `handle_boundary` first.
pub(crate) fn lookup_depth_range<K: NodeKey, V: NodeVal>(
    c: OpCtx<'_, K, V>,
    cursor: &mut Cursor<K, V>,
    from: Depth,
    to: Depth,
    li: &mut dyn FnMut(&InternalNode<K, V>) -> usize,
    ll: &mut dyn FnMut(&LeafNode<K, V>) -> usize,
    mut visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
) -> Result<()> {
    trace!(from, to, "lookup depth range");
    let mut depth = from;
    while depth > to {
        if depth > 1 {
            lookup_internal_level(c, depth, cursor, li, visitor.as_deref_mut())?;
        } else {
            lookup_leaf(c, cursor, ll, visitor.as_deref_mut())?;
        }
        depth -= 1;
    }
    Ok(())
}

/// Resolves one internal level: the parent's child-pointer slot first,
/// then the cache/device. The faulted child is linked under its parent.
fn lookup_internal_level<K: NodeKey, V: NodeVal>(
    c: OpCtx<'_, K, V>,
    depth: Depth,
    cursor: &mut Cursor<K, V>,
    li: &mut dyn FnMut(&InternalNode<K, V>) -> usize,
    visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
) -> Result<()> {
    debug_assert!(depth > 1);
    let (parent, parent_pos) = {
        let entry = cursor.internal_entry(depth + 1);
        (
            entry.node.clone().expect("descent requires parent"),
            entry.pos,
        )
    };
    let (entry_key, entry_paddr, range, slot) = {
        let p = parent.read();
        (
            p.entry_key(parent_pos as usize),
            p.entry_paddr(parent_pos as usize),
            p.child_range(parent_pos as usize),
            p.child(parent_pos as usize).clone(),
        )
    };

    let child: InternalRef<K, V> = match slot.handle() {
        Some(handle) => {
            let handle = match c.txn.view_of(handle.paddr()) {
                Some(view) => view,
                None => handle,
            };
            let node = handle
                .as_internal()
                .unwrap_or_else(|| panic!("child at {:?} is not an internal node", entry_key))
                .clone();
            debug_assert!(node.meta().begin == entry_key);
            debug_assert!(node.meta().end > entry_key);
            node
        }
        None => c.cache.read_internal(
            c.txn,
            entry_paddr.maybe_relative_to(parent.paddr()),
            NodeMeta::new(range.0, range.1, depth),
            Some((Rc::clone(&parent), parent_pos)),
            slot.is_reserved(),
        )?,
    };

    let pos = li(&child.read());
    let paddr = child.paddr();
    let begin = child.meta().begin;
    {
        let entry = cursor.internal_entry_mut(depth);
        entry.node = Some(child);
        entry.pos = pos as u16;
    }
    if let Some(visitor) = visitor {
        visitor(
            paddr,
            begin,
            c.cache.node_size() as u32,
            depth,
            ExtentKind::InternalNode,
            cursor,
        );
    }
    Ok(())
}

/// Leaf-level counterpart of [`lookup_internal_level`].
fn lookup_leaf<K: NodeKey, V: NodeVal>(
    c: OpCtx<'_, K, V>,
    cursor: &mut Cursor<K, V>,
    ll: &mut dyn FnMut(&LeafNode<K, V>) -> usize,
    visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
) -> Result<()> {
    let (parent, parent_pos) = {
        let entry = cursor.internal_entry(2);
        (
            entry.node.clone().expect("descent requires parent"),
            entry.pos,
        )
    };
    let (entry_key, entry_paddr, range, slot) = {
        let p = parent.read();
        (
            p.entry_key(parent_pos as usize),
            p.entry_paddr(parent_pos as usize),
            p.child_range(parent_pos as usize),
            p.child(parent_pos as usize).clone(),
        )
    };

    let child: LeafRef<K, V> = match slot.handle() {
        Some(handle) => {
            let handle = match c.txn.view_of(handle.paddr()) {
                Some(view) => view,
                None => handle,
            };
            let node = handle
                .as_leaf()
                .unwrap_or_else(|| panic!("child at {:?} is not a leaf node", entry_key))
                .clone();
            debug_assert!(node.meta().begin == entry_key);
            debug_assert!(node.meta().end > entry_key);
            node
        }
        None => c.cache.read_leaf(
            c.txn,
            entry_paddr.maybe_relative_to(parent.paddr()),
            NodeMeta::new(range.0, range.1, 1),
            Some((Rc::clone(&parent), parent_pos)),
            slot.is_reserved(),
        )?,
    };

    let pos = ll(&child.read());
    let paddr = child.paddr();
    let begin = child.meta().begin;
    cursor.leaf.node = Some(child);
    cursor.leaf.pos = pos as u16;
    if let Some(visitor) = visitor {
        visitor(
            paddr,
            begin,
            c.cache.node_size() as u32,
            1,
            ExtentKind::LeafNode,
            cursor,
        );
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Scoped constructors
// ----------------------------------------------------------------------

/// Acquires the transaction's view of the root block and lends a tree
/// handle to `f`.
pub fn with_tree<K: NodeKey, V: NodeVal, R>(
    cache: &BlockCache<K, V>,
    txn: &Transaction<K, V>,
    f: impl FnOnce(OpCtx<'_, K, V>, &mut FixedKvTree<K, V>) -> Result<R>,
) -> Result<R> {
    let root_block = cache.get_root(txn)?;
    let mut tree = FixedKvTree::new(root_block);
    f(OpCtx::new(cache, txn), &mut tree)
}

/// [`with_tree`] threading a state value through the closure and
/// returning it.
pub fn with_tree_state<K: NodeKey, V: NodeVal, S>(
    cache: &BlockCache<K, V>,
    txn: &Transaction<K, V>,
    init: S,
    f: impl FnOnce(OpCtx<'_, K, V>, &mut FixedKvTree<K, V>, &mut S) -> Result<()>,
) -> Result<S> {
    let mut state = init;
    with_tree(cache, txn, |ctx, tree| f(ctx, tree, &mut state))?;
    Ok(state)
}

// ----------------------------------------------------------------------
// Structural audit
// ----------------------------------------------------------------------

impl<K: NodeKey, V: NodeVal> FixedKvTree<K, V> {
    /// Full structural audit of the tree as seen by `c.txn`: capacity
    /// bounds, key ordering within and across nodes, parent/child range
    /// agreement, uniform leaf depth, and agreement of every linked
    /// child-pointer slot with the on-disk entry array.
    pub fn verify_integrity(&self, c: OpCtx<'_, K, V>) -> Result<()> {
        let root = self.root_block.root();
        ensure!(root.depth >= 1, "tree is not initialized");

        let mut last_key: Option<K> = None;
        let meta = NodeMeta::new(K::MIN, K::MAX, root.depth);
        self.verify_node(c, root.location, meta, true, None, &mut last_key)
    }

    fn verify_node(
        &self,
        c: OpCtx<'_, K, V>,
        paddr: Paddr,
        expected: NodeMeta<K>,
        is_root: bool,
        parent: Option<(InternalRef<K, V>, u16)>,
        last_key: &mut Option<K>,
    ) -> Result<()> {
        if expected.depth == 1 {
            let leaf = c.cache.read_leaf(c.txn, paddr, expected, parent, false)?;
            let node = leaf.read();
            if !is_root {
                ensure!(
                    !node.below_min_capacity(),
                    "leaf {:?} below min capacity: {}",
                    paddr,
                    node.len()
                );
            }
            ensure!(
                node.len() <= node.capacity(),
                "leaf {:?} over capacity",
                paddr
            );
            for i in 0..node.len() {
                let key = node.key_at(i);
                ensure!(
                    expected.contains(key),
                    "leaf {:?} key {:?} outside range",
                    paddr,
                    key
                );
                if let Some(last) = last_key {
                    ensure!(
                        *last < key,
                        "keys not strictly increasing at {:?}: {:?} then {:?}",
                        paddr,
                        last,
                        key
                    );
                }
                *last_key = Some(key);
            }
            return Ok(());
        }

        let internal = c
            .cache
            .read_internal(c.txn, paddr, expected, parent, false)?;
        let (len, entries): (usize, Vec<(K, Paddr, K, K)>) = {
            let node = internal.read();
            if !is_root {
                ensure!(
                    !node.below_min_capacity(),
                    "internal {:?} below min capacity: {}",
                    paddr,
                    node.len()
                );
            } else {
                ensure!(node.len() >= 1, "root internal {:?} is empty", paddr);
            }
            ensure!(
                node.len() <= node.capacity(),
                "internal {:?} over capacity",
                paddr
            );
            ensure!(
                node.first_key() == expected.begin,
                "internal {:?} first key {:?} != begin {:?}",
                paddr,
                node.first_key(),
                expected.begin
            );
            let entries = (0..node.len())
                .map(|i| {
                    let (begin, end) = node.child_range(i);
                    (node.entry_key(i), node.entry_paddr(i), begin, end)
                })
                .collect();
            (node.len(), entries)
        };

        for (i, (key, child_paddr, begin, end)) in entries.iter().enumerate() {
            ensure!(begin == key, "entry {} of {:?} disagrees with range", i, paddr);
            ensure!(begin < end, "empty child range in {:?}", paddr);

            // Linked slots must agree with the entry array and back-point
            // at this node (or this transaction's view of it).
            let slot = internal.read().child(i).clone();
            if let Some(child) = slot.handle() {
                ensure!(
                    child.paddr() == *child_paddr,
                    "child slot {} of {:?} points at {:?}, entry says {:?}",
                    i,
                    paddr,
                    child.paddr(),
                    child_paddr
                );
                ensure!(
                    child.meta().begin == *begin,
                    "linked child {} of {:?} begins at {:?}",
                    i,
                    paddr,
                    child.meta().begin
                );
                let back = match &child {
                    NodeHandle::Internal(n) => n.parent_node().map(|p| p.paddr()),
                    NodeHandle::Leaf(n) => n.parent_node().map(|p| p.paddr()),
                };
                ensure!(
                    back == Some(internal.paddr()),
                    "child {} of {:?} back-references {:?}",
                    i,
                    paddr,
                    back
                );
            }

            self.verify_node(
                c,
                child_paddr.maybe_relative_to(internal.paddr()),
                NodeMeta::new(*begin, *end, expected.depth - 1),
                false,
                Some((Rc::clone(&internal), i as u16)),
                last_key,
            )?;
        }
        debug_assert!(len >= 1);

        // Readability of the whole-node instance state.
        ensure!(
            internal.state() != ExtentState::Retired,
            "retired node {:?} reachable from the tree",
            paddr
        );
        Ok(())
    }
}
