//! # Transactions
//!
//! A transaction is the unit of isolation for index mutations. It owns the
//! mutation set: every extent duplicated for write or freshly allocated on
//! its behalf, keyed by physical address, plus the extents it has retired
//! and its private copy of the root block.
//!
//! ## View Resolution
//!
//! The block cache can return either the committed or the in-transaction
//! view of any extent. Resolution order is: the transaction's mutation set
//! first, then the cache's stable residents, then the device. A stable
//! extent is *viewable* by a transaction only while the transaction has no
//! pending instance shadowing it; weak (read-only, best-effort)
//! transactions skip that assertion.
//!
//! ## Statistics
//!
//! Each transaction accumulates per-tree statistics (depth, extent count
//! delta, operation counters) that the commit layer folds into durable
//! counters. The tree core updates these as it goes; nothing here is
//! interpreted by the transaction itself.

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};

use crate::store::extent::{
    AnyExtent, DataRef, ExtentState, NodeHandle, RootBlockRef, TxnId,
};
use crate::types::{Depth, NodeKey, NodeVal, Paddr};

/// Per-tree statistics tracked on the transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: Depth,
    pub extents_num_delta: i64,
    pub num_inserts: u64,
    pub num_updates: u64,
    pub num_erases: u64,
}

/// Result of a transaction-view extent query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentPresence {
    Present,
    Absent,
}

pub struct Transaction<K: NodeKey, V: NodeVal> {
    id: TxnId,
    weak: bool,
    /// Fresh and mutation-pending node extents, by physical address.
    views: RefCell<HashMap<Paddr, NodeHandle<K, V>>>,
    /// Fresh data extents, by physical address.
    data_views: RefCell<HashMap<Paddr, DataRef>>,
    /// Extents retired by this transaction; reclaimed at commit.
    retired: RefCell<Vec<AnyExtent<K, V>>>,
    /// Addresses retired by this transaction; a stable instance at one of
    /// these is no longer part of this transaction's view.
    retired_addrs: RefCell<HashSet<Paddr>>,
    /// Transaction-private copy of the root block, if duplicated.
    pending_root: RefCell<Option<RootBlockRef<K, V>>>,
    stats: RefCell<TreeStats>,
}

impl<K: NodeKey, V: NodeVal> Transaction<K, V> {
    pub(crate) fn new(id: TxnId, weak: bool) -> Self {
        Self {
            id,
            weak,
            views: RefCell::new(HashMap::new()),
            data_views: RefCell::new(HashMap::new()),
            retired: RefCell::new(Vec::new()),
            retired_addrs: RefCell::new(HashSet::new()),
            pending_root: RefCell::new(None),
            stats: RefCell::new(TreeStats::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Weak transactions are read-only, best-effort: they skip the
    /// viewability assertion on materialized ancestors.
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn tree_stats(&self) -> RefMut<'_, TreeStats> {
        self.stats.borrow_mut()
    }

    /// The transaction's view of the node at `paddr`, if it holds one.
    pub fn view_of(&self, paddr: Paddr) -> Option<NodeHandle<K, V>> {
        self.views.borrow().get(&paddr).cloned()
    }

    /// Queries the transaction view for any extent at `paddr`.
    pub fn get_extent(&self, paddr: Paddr) -> ExtentPresence {
        if self.views.borrow().contains_key(&paddr) || self.data_views.borrow().contains_key(&paddr)
        {
            ExtentPresence::Present
        } else {
            ExtentPresence::Absent
        }
    }

    /// True iff `handle` is the instance this transaction should observe:
    /// either a mutable instance it owns, or a stable instance it has not
    /// shadowed with a pending clone.
    pub fn is_viewable(&self, handle: &NodeHandle<K, V>) -> bool {
        match handle.state() {
            ExtentState::Stable => {
                !self.views.borrow().contains_key(&handle.paddr())
                    && !self.retired_addrs.borrow().contains(&handle.paddr())
            }
            ExtentState::Fresh | ExtentState::MutationPending => {
                self.views
                    .borrow()
                    .get(&handle.paddr())
                    .map(|h| h.ptr_eq(handle))
                    .unwrap_or(false)
            }
            ExtentState::Retired => false,
        }
    }

    pub(crate) fn record_view(&self, handle: NodeHandle<K, V>) {
        handle.set_owner(Some(self.id));
        self.views.borrow_mut().insert(handle.paddr(), handle);
    }

    pub(crate) fn record_data_view(&self, data: DataRef) {
        data.set_owner(Some(self.id));
        self.data_views.borrow_mut().insert(data.paddr(), data);
    }

    pub(crate) fn record_retire(&self, extent: AnyExtent<K, V>) {
        // A pending instance shadowing the same address dies with the
        // retire; drop it from the view so commit does not republish it.
        self.views.borrow_mut().remove(&extent.paddr());
        self.data_views.borrow_mut().remove(&extent.paddr());
        self.retired_addrs.borrow_mut().insert(extent.paddr());
        self.retired.borrow_mut().push(extent);
    }

    pub(crate) fn pending_root(&self) -> Option<RootBlockRef<K, V>> {
        self.pending_root.borrow().clone()
    }

    pub(crate) fn set_pending_root(&self, root: RootBlockRef<K, V>) {
        *self.pending_root.borrow_mut() = Some(root);
    }

    pub(crate) fn take_commit_set(
        &self,
    ) -> (
        Vec<NodeHandle<K, V>>,
        Vec<DataRef>,
        Vec<AnyExtent<K, V>>,
        Option<RootBlockRef<K, V>>,
    ) {
        let nodes = self.views.borrow_mut().drain().map(|(_, h)| h).collect();
        let data = self
            .data_views
            .borrow_mut()
            .drain()
            .map(|(_, d)| d)
            .collect();
        let retired = std::mem::take(&mut *self.retired.borrow_mut());
        let root = self.pending_root.borrow_mut().take();
        (nodes, data, retired, root)
    }
}

/// Shared handle to a transaction. Single-threaded cooperative execution;
/// a transaction never crosses threads.
pub type TransactionRef<K, V> = Rc<Transaction<K, V>>;
