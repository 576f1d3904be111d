//! # Tree Cursor
//!
//! A located position in the tree: one leaf position plus a bounded stack
//! of internal-node positions from the leaf's parent (depth 2, index 0) up
//! to the root. Analogous to an iterator, but stack-allocated with at most
//! `MAX_DEPTH - 1` ancestor slots.
//!
//! ## Partial vs. Full
//!
//! A cursor may be *partial*: the leaf (and possibly a lower run of
//! ancestors) is populated while the remaining ancestor slots are empty.
//! Ancestors materialize bottom-up on demand via [`Cursor::ensure_internal`]
//! by asking the current node for its parent back-reference and locating itself
//! in the parent with `upper_bound(child.begin) - 1`. The partial/full
//! distinction is tracked by a debug-only tag; it is not a separate type.
//!
//! ## Boundary
//!
//! `leaf.pos == leaf.len()` is the *boundary* state: a transient position
//! between leaves. It is a valid resting state only as the final `end()`
//! position on the rightmost leaf; everywhere else `handle_boundary`
//! immediately re-seats the cursor at the next leaf's first entry.

use smallvec::SmallVec;

use crate::btree::tree::lookup_depth_range;
use crate::btree::{MappedSpaceVisitor, OpCtx};
use crate::config::MAX_DEPTH;
use crate::store::{InternalRef, LeafRef, NodeHandle};
use crate::types::{Depth, NodeKey, NodeVal};
use eyre::Result;

pub(crate) const INVALID_POS: u16 = u16::MAX;

/// One level of a cursor: a node reference and a position within it.
pub(crate) struct NodePosition<R> {
    pub node: Option<R>,
    pub pos: u16,
}

impl<R> Default for NodePosition<R> {
    fn default() -> Self {
        Self {
            node: None,
            pos: INVALID_POS,
        }
    }
}

impl<R: Clone> Clone for NodePosition<R> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            pos: self.pos,
        }
    }
}

impl<R> NodePosition<R> {
    pub fn reset(&mut self) {
        self.node = None;
        self.pos = INVALID_POS;
    }
}

#[cfg(debug_assertions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorState {
    Partial,
    Full,
}

pub struct Cursor<K: NodeKey, V: NodeVal> {
    /// Ancestors, bottom-up: index 0 is depth 2, the last entry the root.
    pub(crate) internal: SmallVec<[NodePosition<InternalRef<K, V>>; MAX_DEPTH - 1]>,
    pub(crate) leaf: NodePosition<LeafRef<K, V>>,
    #[cfg(debug_assertions)]
    pub(crate) state: CursorState,
}

impl<K: NodeKey, V: NodeVal> Clone for Cursor<K, V> {
    fn clone(&self) -> Self {
        Self {
            internal: self.internal.clone(),
            leaf: self.leaf.clone(),
            #[cfg(debug_assertions)]
            state: self.state,
        }
    }
}

impl<K: NodeKey, V: NodeVal> Cursor<K, V> {
    #[cfg(debug_assertions)]
    pub(crate) fn new(depth: Depth, state: CursorState) -> Self {
        let mut internal = SmallVec::new();
        for _ in 1..depth {
            internal.push(NodePosition::default());
        }
        Self {
            internal,
            leaf: NodePosition::default(),
            state,
        }
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn new(depth: Depth) -> Self {
        let mut internal = SmallVec::new();
        for _ in 1..depth {
            internal.push(NodePosition::default());
        }
        Self {
            internal,
            leaf: NodePosition::default(),
        }
    }

    pub(crate) fn new_partial(depth: Depth) -> Self {
        #[cfg(debug_assertions)]
        {
            Self::new(
                depth,
                if depth == 1 {
                    CursorState::Full
                } else {
                    CursorState::Partial
                },
            )
        }
        #[cfg(not(debug_assertions))]
        {
            Self::new(depth)
        }
    }

    pub(crate) fn new_full(depth: Depth) -> Self {
        #[cfg(debug_assertions)]
        {
            Self::new(depth, CursorState::Full)
        }
        #[cfg(not(debug_assertions))]
        {
            Self::new(depth)
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn is_full(&self) -> bool {
        self.state == CursorState::Full
    }

    #[cfg(debug_assertions)]
    pub(crate) fn is_partial(&self) -> bool {
        self.state == CursorState::Partial
    }

    /// Depth of the tree this cursor was built against.
    pub fn get_depth(&self) -> Depth {
        self.internal.len() as Depth + 1
    }

    pub(crate) fn internal_entry(&self, depth: Depth) -> &NodePosition<InternalRef<K, V>> {
        debug_assert!(depth > 1);
        &self.internal[depth as usize - 2]
    }

    pub(crate) fn internal_entry_mut(
        &mut self,
        depth: Depth,
    ) -> &mut NodePosition<InternalRef<K, V>> {
        debug_assert!(depth > 1);
        &mut self.internal[depth as usize - 2]
    }

    pub(crate) fn internal_node(&self, depth: Depth) -> &InternalRef<K, V> {
        self.internal_entry(depth)
            .node
            .as_ref()
            .expect("internal cursor slot not materialized")
    }

    pub(crate) fn leaf_node(&self) -> &LeafRef<K, V> {
        self.leaf.node.as_ref().expect("cursor has no leaf")
    }

    pub(crate) fn at_boundary(&self) -> bool {
        let len = self.leaf_node().read().len();
        debug_assert!(self.leaf.pos as usize <= len);
        self.leaf.pos as usize == len
    }

    /// True iff this cursor is past the last entry of the tree. External
    /// callers only observe a boundary position when it is the end.
    pub fn is_end(&self) -> bool {
        self.at_boundary()
    }

    pub fn is_begin(&self) -> bool {
        self.leaf.pos == 0 && self.leaf_node().meta().begin == K::MIN
    }

    pub fn get_key(&self) -> K {
        debug_assert!(!self.is_end());
        self.leaf_node().read().key_at(self.leaf.pos as usize)
    }

    /// Value at the cursor, with any embedded physical address resolved
    /// against the owning leaf's block address.
    pub fn get_val(&self) -> V {
        debug_assert!(!self.is_end());
        let leaf = self.leaf_node();
        leaf.read()
            .val_at(self.leaf.pos as usize)
            .maybe_relative_to(leaf.paddr())
    }

    pub fn get_leaf_node(&self) -> LeafRef<K, V> {
        self.leaf_node().clone()
    }

    pub fn get_leaf_pos(&self) -> u16 {
        self.leaf.pos
    }

    /// The next position in key order. Runs boundary handling if the
    /// increment crosses the end of the current leaf.
    pub fn next(
        &self,
        c: OpCtx<'_, K, V>,
        visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
    ) -> Result<Cursor<K, V>> {
        #[cfg(debug_assertions)]
        self.assert_valid();
        assert!(!self.is_end(), "next() past end");

        let mut ret = self.clone();
        ret.leaf.pos += 1;
        if ret.at_boundary() {
            ret.handle_boundary(c, visitor)?;
        }
        Ok(ret)
    }

    /// The previous position in key order. Walks up to the first ancestor
    /// with room on the left, then descends picking the last entry at each
    /// level.
    pub fn prev(&self, c: OpCtx<'_, K, V>) -> Result<Cursor<K, V>> {
        #[cfg(debug_assertions)]
        self.assert_valid();
        assert!(!self.is_begin(), "prev() before begin");

        let mut ret = self.clone();
        if ret.leaf.pos > 0 {
            ret.leaf.pos -= 1;
            return Ok(ret);
        }

        let depth_with_space =
            ret.ensure_internal_bottom_up(c, 2, |cur, depth| cur.internal_entry(depth).pos > 0);
        // Must hold: is_begin() was ruled out above.
        assert!(
            depth_with_space <= ret.get_depth(),
            "prev() found no ancestor with room"
        );

        for depth in 2..depth_with_space {
            ret.internal_entry_mut(depth).reset();
        }
        ret.leaf.reset();
        ret.internal_entry_mut(depth_with_space).pos -= 1;
        // Descending along last entries cannot land on a boundary.
        lookup_depth_range(
            c,
            &mut ret,
            depth_with_space - 1,
            0,
            &mut |node| node.len() - 1,
            &mut |node| node.len() - 1,
            None,
        )?;
        debug_assert!(!ret.at_boundary());
        Ok(ret)
    }

    /// Materializes the ancestor slot at `depth` for a partial cursor by
    /// asking the child for its parent and locating the child within it.
    /// Idempotent for already-populated slots.
    pub(crate) fn ensure_internal(&mut self, c: OpCtx<'_, K, V>, depth: Depth) {
        debug_assert!(depth > 1);
        debug_assert!((depth as usize - 2) < self.internal.len());

        if let Some(node) = &self.internal_entry(depth).node {
            // Read and write must not interleave within one transaction,
            // otherwise the nodes tracked here can become outdated.
            debug_assert!(
                c.txn.is_weak()
                    || c.txn.is_viewable(&NodeHandle::Internal(node.clone())),
                "materialized ancestor is not this transaction's view"
            );
            return;
        }

        let (child_meta, parent) = if depth == 2 {
            let leaf = self.leaf_node();
            (leaf.meta(), leaf.parent_node())
        } else {
            let child = self.internal_node(depth - 1);
            (child.meta(), child.parent_node())
        };
        let parent = parent.expect("non-root node has no parent link");
        // The back-reference may name the committed instance; observe the
        // transaction's view of that address.
        let parent = match c.txn.view_of(parent.paddr()) {
            Some(NodeHandle::Internal(view)) => view,
            Some(NodeHandle::Leaf(_)) => panic!("parent view is not an internal node"),
            None => parent,
        };

        debug_assert!(parent.meta().is_parent_of(&child_meta));
        debug_assert!(
            c.txn.is_weak() || c.txn.is_viewable(&NodeHandle::Internal(parent.clone())),
            "resolved parent is not this transaction's view"
        );

        let pos = {
            let p = parent.read();
            let ub = p.upper_bound(child_meta.begin);
            debug_assert!(ub > 0);
            (ub - 1) as u16
        };
        tracing::trace!(
            depth,
            pos,
            parent = ?parent.paddr(),
            "materialized parent for partial cursor"
        );

        let entry = self.internal_entry_mut(depth);
        entry.node = Some(parent);
        entry.pos = pos;

        #[cfg(debug_assertions)]
        if depth as usize - 1 == self.internal.len() {
            self.state = CursorState::Full;
        }
    }

    /// Walks ancestors upward from `start`, materializing each, until
    /// `stop` holds or the root is passed. Returns the depth the walk
    /// stopped at (`get_depth() + 1` if it ran past the root).
    pub(crate) fn ensure_internal_bottom_up(
        &mut self,
        c: OpCtx<'_, K, V>,
        start: Depth,
        stop: impl Fn(&Self, Depth) -> bool,
    ) -> Depth {
        let mut depth = start;
        loop {
            if depth > self.get_depth() {
                return depth;
            }
            self.ensure_internal(c, depth);
            if stop(self, depth) {
                return depth;
            }
            depth += 1;
        }
    }

    /// Re-seats a boundary cursor at the next leaf's first entry: find the
    /// lowest ancestor with a right sibling, advance it, and descend along
    /// first entries. If no ancestor has room the cursor stays at end.
    pub(crate) fn handle_boundary(
        &mut self,
        c: OpCtx<'_, K, V>,
        visitor: Option<&mut MappedSpaceVisitor<'_, K, V>>,
    ) -> Result<()> {
        debug_assert!(self.at_boundary());

        let depth_with_space = self.ensure_internal_bottom_up(c, 2, |cur, depth| {
            let entry = cur.internal_entry(depth);
            let len = entry
                .node
                .as_ref()
                .expect("materialized slot")
                .read()
                .len();
            (entry.pos as usize + 1) < len
        });

        if depth_with_space <= self.get_depth() {
            for depth in 2..depth_with_space {
                self.internal_entry_mut(depth).reset();
            }
            self.leaf.reset();
            self.internal_entry_mut(depth_with_space).pos += 1;
            // Descending along first entries cannot land on a boundary.
            lookup_depth_range(
                c,
                self,
                depth_with_space - 1,
                0,
                &mut |_node| 0,
                &mut |_node| 0,
                visitor,
            )?;
        }
        Ok(())
    }

    /// Depth from which a split cascade must begin for an insertion at
    /// this cursor: 0 if the leaf has room, otherwise the first non-full
    /// level, clamped to `get_depth()` (meaning a new root is needed).
    pub(crate) fn check_split(&mut self, c: OpCtx<'_, K, V>) -> Depth {
        if !self.leaf_node().read().at_max_capacity() {
            return 0;
        }

        let depth = self.ensure_internal_bottom_up(c, 2, |cur, d| {
            !cur.internal_node(d).read().at_max_capacity()
        });
        debug_assert!(depth > 1);
        let split_from = depth - 1;
        if split_from >= self.get_depth() {
            self.get_depth()
        } else {
            split_from
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn assert_valid(&self) {
        let leaf = self.leaf.node.as_ref().expect("cursor has no leaf");
        assert!(self.leaf.pos as usize <= leaf.read().len());

        let mut hit_null = false;
        for entry in &self.internal {
            match &entry.node {
                Some(node) => {
                    assert!(!hit_null, "populated ancestor above an empty slot");
                    assert!((entry.pos as usize) < node.read().len());
                }
                None => {
                    assert!(self.is_partial());
                    hit_null = true;
                }
            }
        }
    }
}
