//! # Block Cache
//!
//! The extent cache the tree core runs against. It owns the backing
//! device, the resident (committed) extent index, the free-block
//! allocator, and the stable root block, and it implements the
//! copy-on-write protocol:
//!
//! - **Fault**: `read_internal`/`read_leaf` resolve a physical address to
//!   an extent, checking the transaction's mutation set first, then the
//!   resident index, then the device. Freshly faulted nodes are verified
//!   (magic, checksum, metadata range) and linked under their parent.
//! - **Duplicate-for-write**: returns a transaction-private mutable clone
//!   of a stable extent, idempotently. Mutable parents are re-pointed at
//!   mutable children; stable parents are left alone and resolved by
//!   address at read time.
//! - **Retire**: records an extent for reclamation at commit. The stable
//!   instance stays readable by other transactions until then.
//! - **Commit**: publishes the mutation set as the new stable view, writes
//!   blocks through the node codec, reclaims retired blocks, installs the
//!   pending root block, and re-links parent/child pointers so the
//!   in-memory child arrays agree with the on-disk entry arrays.
//!
//! ## Isolation
//!
//! Stable extents are shared across transactions and never written.
//! Pending extents are reachable only through their owning transaction, so
//! a reader on another transaction observes the committed tree regardless
//! of in-flight mutations. Abandoning a transaction drops its mutation set
//! without touching stable state.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;
use zerocopy::{
    byteorder::{LittleEndian, U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::btree::{InternalNode, LeafNode};
use crate::config::{
    internal_capacity, leaf_capacity, FIRST_ALLOCATABLE_BLOCK, SUPERBLOCK_SIZE,
};
use crate::store::device::BlockDevice;
use crate::store::extent::{
    AnyExtent, ChildSlot, DataExtent, DataRef, Extent, ExtentState, InternalRef, LeafRef,
    NodeHandle, PhyTreeRoot, RootBlock, RootBlockRef, TxnId,
};
use crate::store::transaction::{Transaction, TransactionRef, TreeStats};
use crate::types::{NodeKey, NodeMeta, NodeVal, Paddr, PlacementHint};

const SUPERBLOCK_MAGIC: u32 = 0x4252_4e53; // "BRNS"
const SUPERBLOCK_VERSION: u16 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SuperblockLayout {
    magic: U32<LittleEndian>,
    version: U16<LittleEndian>,
    _reserved0: [u8; 2],
    node_size: U32<LittleEndian>,
    _reserved1: [u8; 4],
    root_location: U64<LittleEndian>,
    root_depth: U16<LittleEndian>,
    _reserved2: [u8; 6],
    next_block: U64<LittleEndian>,
    checksum: U64<LittleEndian>,
}

const SUPERBLOCK_LEN: usize = std::mem::size_of::<SuperblockLayout>();
const _: () = assert!(SUPERBLOCK_LEN <= SUPERBLOCK_SIZE);

pub struct BlockCache<K: NodeKey, V: NodeVal> {
    device: BlockDevice,
    node_size: usize,
    resident: RefCell<HashMap<Paddr, NodeHandle<K, V>>>,
    data_resident: RefCell<HashMap<Paddr, DataRef>>,
    stable_root: RootBlockRef<K, V>,
    next_block: Cell<u64>,
    free_blocks: RefCell<Vec<u64>>,
    next_txn: Cell<TxnId>,
    stats: RefCell<TreeStats>,
}

impl<K: NodeKey, V: NodeVal> BlockCache<K, V> {
    /// Creates a fresh store. The tree itself is not initialized until
    /// `mkfs` runs inside a transaction.
    pub fn create<P: AsRef<Path>>(path: P, node_size: usize) -> Result<Self> {
        let floor = crate::config::NODE_HEADER_SIZE
            + 2 * K::ENCODED_LEN
            + 4 * (K::ENCODED_LEN + V::ENCODED_LEN);
        ensure!(
            node_size >= floor
                && leaf_capacity(node_size, K::ENCODED_LEN, V::ENCODED_LEN) >= 4
                && internal_capacity(node_size, K::ENCODED_LEN) >= 4,
            "node size {} too small for a workable fan-out",
            node_size
        );

        let device = BlockDevice::create(path, node_size, FIRST_ALLOCATABLE_BLOCK)?;
        let cache = Self {
            device,
            node_size,
            resident: RefCell::new(HashMap::new()),
            data_resident: RefCell::new(HashMap::new()),
            stable_root: RootBlock::new(
                ExtentState::Stable,
                None,
                PhyTreeRoot {
                    location: Paddr::NULL,
                    depth: 0,
                },
            ),
            next_block: Cell::new(FIRST_ALLOCATABLE_BLOCK),
            free_blocks: RefCell::new(Vec::new()),
            next_txn: Cell::new(1),
            stats: RefCell::new(TreeStats::default()),
        };
        cache.write_superblock()?;
        Ok(cache)
    }

    /// Opens an existing store, restoring the root descriptor and
    /// allocator watermark from the superblock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read store file '{}'", path.display()))?;
        ensure!(
            raw.len() >= SUPERBLOCK_LEN,
            "store file '{}' too small for a superblock",
            path.display()
        );

        let sb = SuperblockLayout::read_from_bytes(&raw[..SUPERBLOCK_LEN])
            .map_err(|e| eyre::eyre!("malformed superblock: {:?}", e))?;
        ensure!(
            sb.magic.get() == SUPERBLOCK_MAGIC,
            "bad superblock magic {:#x}",
            sb.magic.get()
        );
        ensure!(
            sb.version.get() == SUPERBLOCK_VERSION,
            "unsupported store version {}",
            sb.version.get()
        );

        let expected = superblock_checksum(&sb);
        if sb.checksum.get() != expected {
            panic!(
                "superblock checksum mismatch: recorded {:#x}, computed {:#x}",
                sb.checksum.get(),
                expected
            );
        }

        let node_size = sb.node_size.get() as usize;
        let device = BlockDevice::open(path, node_size)?;

        Ok(Self {
            device,
            node_size,
            resident: RefCell::new(HashMap::new()),
            data_resident: RefCell::new(HashMap::new()),
            stable_root: RootBlock::new(
                ExtentState::Stable,
                None,
                PhyTreeRoot {
                    location: Paddr::from_raw(sb.root_location.get()),
                    depth: sb.root_depth.get(),
                },
            ),
            next_block: Cell::new(sb.next_block.get()),
            free_blocks: RefCell::new(Vec::new()),
            next_txn: Cell::new(1),
            stats: RefCell::new(TreeStats::default()),
        })
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn leaf_capacity(&self) -> usize {
        leaf_capacity(self.node_size, K::ENCODED_LEN, V::ENCODED_LEN)
    }

    pub fn internal_capacity(&self) -> usize {
        internal_capacity(self.node_size, K::ENCODED_LEN)
    }

    /// Cumulative committed tree statistics.
    pub fn stats(&self) -> TreeStats {
        *self.stats.borrow()
    }

    pub fn begin_transaction(&self) -> TransactionRef<K, V> {
        self.begin(false)
    }

    pub fn begin_weak_transaction(&self) -> TransactionRef<K, V> {
        self.begin(true)
    }

    fn begin(&self, weak: bool) -> TransactionRef<K, V> {
        let id = self.next_txn.get();
        self.next_txn.set(id + 1);
        trace!(txn = id, weak, "begin transaction");
        Rc::new(Transaction::new(id, weak))
    }

    /// The root block as seen by `txn`: its pending copy if it holds one,
    /// the stable root otherwise.
    pub fn get_root(&self, txn: &Transaction<K, V>) -> Result<RootBlockRef<K, V>> {
        Ok(self.get_root_fast(txn))
    }

    pub fn get_root_fast(&self, txn: &Transaction<K, V>) -> RootBlockRef<K, V> {
        txn.pending_root()
            .unwrap_or_else(|| Rc::clone(&self.stable_root))
    }

    /// Idempotent copy-on-write duplication of the root block.
    pub fn duplicate_root_for_write(&self, txn: &Transaction<K, V>) -> RootBlockRef<K, V> {
        if let Some(pending) = txn.pending_root() {
            return pending;
        }
        let pending = RootBlock::new(
            ExtentState::MutationPending,
            Some(txn.id()),
            self.stable_root.root(),
        );
        if let Some(node) = self.stable_root.root_node() {
            pending.link_root(node);
        }
        txn.set_pending_root(Rc::clone(&pending));
        pending
    }

    fn allocate_block(&self) -> Paddr {
        if let Some(block) = self.free_blocks.borrow_mut().pop() {
            return Paddr::new(block);
        }
        let block = self.next_block.get();
        self.next_block.set(block + 1);
        Paddr::new(block)
    }

    /// Allocates a fresh internal-node extent owned by `txn`.
    pub fn alloc_internal(
        &self,
        txn: &Transaction<K, V>,
        node: InternalNode<K, V>,
        hint: PlacementHint,
        generation: u32,
    ) -> InternalRef<K, V> {
        let paddr = self.allocate_block();
        trace!(txn = txn.id(), ?paddr, "alloc internal extent");
        let ext = Extent::new(
            paddr,
            ExtentState::Fresh,
            Some(txn.id()),
            hint,
            generation,
            node,
        );
        // Children moved into a fresh node must name it as their parent.
        ext.relink_children();
        txn.record_view(NodeHandle::Internal(Rc::clone(&ext)));
        ext
    }

    /// Allocates a fresh leaf-node extent owned by `txn`.
    pub fn alloc_leaf(
        &self,
        txn: &Transaction<K, V>,
        node: LeafNode<K, V>,
        hint: PlacementHint,
        generation: u32,
    ) -> LeafRef<K, V> {
        let paddr = self.allocate_block();
        trace!(txn = txn.id(), ?paddr, "alloc leaf extent");
        let ext = Extent::new(
            paddr,
            ExtentState::Fresh,
            Some(txn.id()),
            hint,
            generation,
            node,
        );
        txn.record_view(NodeHandle::Leaf(Rc::clone(&ext)));
        ext
    }

    /// Allocates a fresh data extent (object payload block) owned by `txn`.
    pub fn alloc_data(
        &self,
        txn: &Transaction<K, V>,
        hint: PlacementHint,
        generation: u32,
    ) -> DataRef {
        let paddr = self.allocate_block();
        trace!(txn = txn.id(), ?paddr, "alloc data extent");
        let data = DataExtent::new(
            paddr,
            ExtentState::Fresh,
            Some(txn.id()),
            hint,
            generation,
            vec![0u8; self.node_size].into_boxed_slice(),
        );
        txn.record_data_view(Rc::clone(&data));
        data
    }

    /// Resolves an internal node at `paddr`, faulting from the device on a
    /// full miss. `expected` is the metadata the parent's entry implies;
    /// a faulted node disagreeing with it is a corruption condition.
    ///
    /// `skip_cache_query` implements the reserved-slot contract: the
    /// resident index is known not to hold the extent, so only the
    /// transaction view and the device are consulted.
    pub fn read_internal(
        &self,
        txn: &Transaction<K, V>,
        paddr: Paddr,
        expected: NodeMeta<K>,
        parent_pos: Option<(InternalRef<K, V>, u16)>,
        skip_cache_query: bool,
    ) -> Result<InternalRef<K, V>> {
        debug_assert!(paddr.is_absolute());
        debug_assert!(expected.depth > 1);

        if let Some(handle) = txn.view_of(paddr) {
            let node = handle
                .as_internal()
                .unwrap_or_else(|| panic!("extent at {:?} is not an internal node", paddr))
                .clone();
            assert_meta(&node.meta(), &expected, paddr);
            return Ok(node);
        }

        if !skip_cache_query {
            if let Some(handle) = self.resident.borrow().get(&paddr) {
                let node = handle
                    .as_internal()
                    .unwrap_or_else(|| panic!("extent at {:?} is not an internal node", paddr))
                    .clone();
                assert_meta(&node.meta(), &expected, paddr);
                self.link_faulted(NodeHandle::Internal(Rc::clone(&node)), &parent_pos, txn);
                return Ok(node);
            }
        }

        let mut buf = vec![0u8; self.node_size];
        self.device.read_block(paddr.block(), &mut buf)?;
        let node = InternalNode::<K, V>::decode(paddr, &buf);
        assert_meta(&node.meta(), &expected, paddr);
        trace!(txn = txn.id(), ?paddr, depth = expected.depth, "faulted internal node");

        let ext = Extent::new(
            paddr,
            ExtentState::Stable,
            None,
            PlacementHint::Hot,
            crate::types::INIT_GENERATION,
            node,
        );
        self.link_faulted(NodeHandle::Internal(Rc::clone(&ext)), &parent_pos, txn);
        self.resident
            .borrow_mut()
            .insert(paddr, NodeHandle::Internal(Rc::clone(&ext)));
        Ok(ext)
    }

    /// Leaf counterpart of [`BlockCache::read_internal`].
    pub fn read_leaf(
        &self,
        txn: &Transaction<K, V>,
        paddr: Paddr,
        expected: NodeMeta<K>,
        parent_pos: Option<(InternalRef<K, V>, u16)>,
        skip_cache_query: bool,
    ) -> Result<LeafRef<K, V>> {
        debug_assert!(paddr.is_absolute());
        debug_assert!(expected.depth == 1);

        if let Some(handle) = txn.view_of(paddr) {
            let node = handle
                .as_leaf()
                .unwrap_or_else(|| panic!("extent at {:?} is not a leaf node", paddr))
                .clone();
            assert_meta(&node.meta(), &expected, paddr);
            return Ok(node);
        }

        if !skip_cache_query {
            if let Some(handle) = self.resident.borrow().get(&paddr) {
                let node = handle
                    .as_leaf()
                    .unwrap_or_else(|| panic!("extent at {:?} is not a leaf node", paddr))
                    .clone();
                assert_meta(&node.meta(), &expected, paddr);
                self.link_faulted(NodeHandle::Leaf(Rc::clone(&node)), &parent_pos, txn);
                return Ok(node);
            }
        }

        let mut buf = vec![0u8; self.node_size];
        self.device.read_block(paddr.block(), &mut buf)?;
        let node = LeafNode::<K, V>::decode(paddr, &buf);
        assert_meta(&node.meta(), &expected, paddr);
        trace!(txn = txn.id(), ?paddr, "faulted leaf node");

        let ext = Extent::new(
            paddr,
            ExtentState::Stable,
            None,
            PlacementHint::Hot,
            crate::types::INIT_GENERATION,
            node,
        );
        self.link_faulted(NodeHandle::Leaf(Rc::clone(&ext)), &parent_pos, txn);
        self.resident
            .borrow_mut()
            .insert(paddr, NodeHandle::Leaf(Rc::clone(&ext)));
        Ok(ext)
    }

    /// Links a faulted or re-found node under its parent (or the root
    /// block) if it is not linked yet.
    ///
    /// The parent's child slot always tracks the node. The node's
    /// back-reference, however, must survive transaction abandon: a
    /// stable node only ever back-references a stable parent (the one at
    /// the parent's address if the descent came through a pending clone).
    fn link_faulted(
        &self,
        node: NodeHandle<K, V>,
        parent_pos: &Option<(InternalRef<K, V>, u16)>,
        txn: &Transaction<K, V>,
    ) {
        match parent_pos {
            Some((parent, pos)) => {
                match &node {
                    NodeHandle::Internal(n) => {
                        parent.link_child(*pos, ChildSlot::Internal(Rc::clone(n)));
                    }
                    NodeHandle::Leaf(n) => {
                        parent.link_child(*pos, ChildSlot::Leaf(Rc::clone(n)));
                    }
                }

                let back_target = if parent.is_stable() {
                    Some(Rc::clone(parent))
                } else {
                    self.resident
                        .borrow()
                        .get(&parent.paddr())
                        .and_then(|h| h.as_internal().cloned())
                };
                if let Some(target) = back_target {
                    match &node {
                        NodeHandle::Internal(n) => n.set_parent(&target),
                        NodeHandle::Leaf(n) => n.set_parent(&target),
                    }
                }
            }
            None => {
                debug_assert!(node.meta().is_root());
                let root_block = self.get_root_fast(txn);
                if root_block
                    .root_node()
                    .map(|existing| !existing.ptr_eq(&node))
                    .unwrap_or(true)
                {
                    root_block.link_root(node);
                }
            }
        }
    }

    /// Idempotent copy-on-write duplication: returns the same extent if it
    /// is already mutable in this transaction, otherwise a private clone.
    pub fn duplicate_for_write(
        &self,
        txn: &Transaction<K, V>,
        handle: &NodeHandle<K, V>,
    ) -> NodeHandle<K, V> {
        match handle {
            NodeHandle::Internal(n) => {
                NodeHandle::Internal(self.duplicate_internal_for_write(txn, n))
            }
            NodeHandle::Leaf(n) => NodeHandle::Leaf(self.duplicate_leaf_for_write(txn, n)),
        }
    }

    pub fn duplicate_internal_for_write(
        &self,
        txn: &Transaction<K, V>,
        node: &InternalRef<K, V>,
    ) -> InternalRef<K, V> {
        match node.state() {
            ExtentState::Fresh | ExtentState::MutationPending => {
                debug_assert_eq!(node.owner(), Some(txn.id()));
                return Rc::clone(node);
            }
            ExtentState::Retired => panic!("duplicate_for_write on a retired extent"),
            ExtentState::Stable => {}
        }

        if let Some(existing) = txn.view_of(node.paddr()) {
            return existing
                .as_internal()
                .expect("pending view kind mismatch")
                .clone();
        }

        trace!(txn = txn.id(), paddr = ?node.paddr(), "duplicate internal for write");
        let clone = Extent::new(
            node.paddr(),
            ExtentState::MutationPending,
            Some(txn.id()),
            node.hint(),
            node.generation(),
            node.read().clone(),
        );
        if let Some(parent) = node.parent_node() {
            clone.set_parent(&parent);
        }
        txn.record_view(NodeHandle::Internal(Rc::clone(&clone)));
        self.point_mutable_parent_at(txn, NodeHandle::Internal(Rc::clone(&clone)));
        clone
    }

    pub fn duplicate_leaf_for_write(
        &self,
        txn: &Transaction<K, V>,
        node: &LeafRef<K, V>,
    ) -> LeafRef<K, V> {
        match node.state() {
            ExtentState::Fresh | ExtentState::MutationPending => {
                debug_assert_eq!(node.owner(), Some(txn.id()));
                return Rc::clone(node);
            }
            ExtentState::Retired => panic!("duplicate_for_write on a retired extent"),
            ExtentState::Stable => {}
        }

        if let Some(existing) = txn.view_of(node.paddr()) {
            return existing.as_leaf().expect("pending view kind mismatch").clone();
        }

        trace!(txn = txn.id(), paddr = ?node.paddr(), "duplicate leaf for write");
        let clone = Extent::new(
            node.paddr(),
            ExtentState::MutationPending,
            Some(txn.id()),
            node.hint(),
            node.generation(),
            node.read().clone(),
        );
        if let Some(parent) = node.parent_node() {
            clone.set_parent(&parent);
        }
        txn.record_view(NodeHandle::Leaf(Rc::clone(&clone)));
        self.point_mutable_parent_at(txn, NodeHandle::Leaf(Rc::clone(&clone)));
        clone
    }

    /// If the transaction already holds a mutable instance of the node's
    /// parent, point its child slot at the fresh clone. Stable parents are
    /// left alone; reads resolve the view by address.
    fn point_mutable_parent_at(&self, txn: &Transaction<K, V>, node: NodeHandle<K, V>) {
        let parent = match &node {
            NodeHandle::Internal(n) => n.parent_node(),
            NodeHandle::Leaf(n) => n.parent_node(),
        };
        let Some(parent) = parent else { return };
        let Some(view) = txn.view_of(parent.paddr()) else { return };
        let Some(parent_view) = view.as_internal() else { return };
        if !parent_view.is_mutable() {
            return;
        }

        let begin = node.meta().begin;
        let (pos, entry_paddr) = {
            let p = parent_view.read();
            let ub = p.upper_bound(begin);
            debug_assert!(ub > 0);
            let pos = ub - 1;
            (pos, p.entry_paddr(pos))
        };
        if entry_paddr == node.paddr() {
            match &node {
                NodeHandle::Internal(n) => {
                    n.set_parent(parent_view);
                    parent_view.link_child(pos as u16, ChildSlot::Internal(Rc::clone(n)));
                }
                NodeHandle::Leaf(n) => {
                    n.set_parent(parent_view);
                    parent_view.link_child(pos as u16, ChildSlot::Leaf(Rc::clone(n)));
                }
            }
        }
    }

    /// Releases an extent; the block is reclaimed when `txn` commits.
    /// Stable instances remain readable by other transactions until then.
    pub fn retire_extent(&self, txn: &Transaction<K, V>, extent: AnyExtent<K, V>) {
        trace!(txn = txn.id(), paddr = ?extent.paddr(), kind = ?extent.kind(), "retire extent");
        match &extent {
            AnyExtent::Node(handle) => {
                if handle.is_mutable() {
                    handle.set_state(ExtentState::Retired);
                }
            }
            AnyExtent::Data(data) => {
                if matches!(
                    data.state(),
                    ExtentState::Fresh | ExtentState::MutationPending
                ) {
                    data.set_state(ExtentState::Retired);
                }
            }
        }
        txn.record_retire(extent);
    }

    /// Debug probe: is an extent at `paddr` resident in the committed
    /// cache index?
    pub fn test_query_cache(&self, paddr: Paddr) -> bool {
        self.resident.borrow().contains_key(&paddr)
            || self.data_resident.borrow().contains_key(&paddr)
    }

    /// Publishes `txn`'s mutation set as the new committed view.
    pub fn commit(&self, txn: &Transaction<K, V>) -> Result<()> {
        let (nodes, data, retired, pending_root) = txn.take_commit_set();
        debug!(
            txn = txn.id(),
            nodes = nodes.len(),
            data = data.len(),
            retired = retired.len(),
            "commit"
        );

        // Retired blocks leave the committed view first so a
        // mutation-pending clone publishing at the same address below wins.
        for extent in &retired {
            match extent {
                AnyExtent::Node(handle) => {
                    handle.set_state(ExtentState::Retired);
                    self.resident.borrow_mut().remove(&handle.paddr());
                }
                AnyExtent::Data(d) => {
                    d.set_state(ExtentState::Retired);
                    self.data_resident.borrow_mut().remove(&d.paddr());
                }
            }
            self.free_blocks.borrow_mut().push(extent.paddr().block());
        }

        let mut buf = vec![0u8; self.node_size];
        for handle in &nodes {
            handle.set_state(ExtentState::Stable);
            handle.set_owner(None);
            match handle {
                NodeHandle::Internal(n) => n.read().encode(n.paddr(), &mut buf),
                NodeHandle::Leaf(n) => n.read().encode(n.paddr(), &mut buf),
            }
            self.device.write_block(handle.paddr().block(), &buf)?;
            self.resident
                .borrow_mut()
                .insert(handle.paddr(), handle.clone());
        }

        for d in &data {
            d.set_state(ExtentState::Stable);
            d.set_owner(None);
            self.device.write_block(d.paddr().block(), &d.bytes())?;
            self.data_resident.borrow_mut().insert(d.paddr(), Rc::clone(d));
        }

        if let Some(pending) = pending_root {
            pending.set_state(ExtentState::Stable);
            self.stable_root.install(pending.root(), pending.root_node());
        }

        self.relink_committed(&nodes);

        // Fold the transaction's tree stats into the durable counters.
        {
            let txn_stats = *txn.tree_stats();
            let mut stats = self.stats.borrow_mut();
            stats.depth = self.stable_root.root().depth;
            stats.extents_num_delta += txn_stats.extents_num_delta;
            stats.num_inserts += txn_stats.num_inserts;
            stats.num_updates += txn_stats.num_updates;
            stats.num_erases += txn_stats.num_erases;
        }

        self.write_superblock()?;
        self.device.sync()
    }

    /// Abandons `txn`: drops its mutation set, recycling fresh blocks. The
    /// stable view is untouched.
    pub fn abandon(&self, txn: &Transaction<K, V>) {
        let (nodes, data, retired, _root) = txn.take_commit_set();
        debug!(txn = txn.id(), "abandon transaction");

        // Only fresh blocks are recyclable; a mutation-pending clone
        // shares its address with the stable extent it shadows.
        for handle in nodes {
            if handle.state() == ExtentState::Fresh {
                self.free_blocks.borrow_mut().push(handle.paddr().block());
            }
            handle.set_state(ExtentState::Retired);
        }
        for d in data {
            if d.state() == ExtentState::Fresh {
                self.free_blocks.borrow_mut().push(d.paddr().block());
            }
            d.set_state(ExtentState::Retired);
        }
        // Retires recorded by the abandoned transaction never happened;
        // only the mutable instances it owned stay dead.
        drop(retired);
    }

    /// Post-commit linkage repair: every committed internal node's child
    /// slots must name the current stable instances, every committed node
    /// must be named by its parent's slot, and a committed root must be
    /// tracked by the stable root block.
    fn relink_committed(&self, nodes: &[NodeHandle<K, V>]) {
        for handle in nodes {
            if let NodeHandle::Internal(n) = handle {
                let live: Vec<(u16, Paddr)> = {
                    let node = n.read();
                    (0..node.len())
                        .filter_map(|i| {
                            node.child(i).handle().map(|h| (i as u16, h.paddr()))
                        })
                        .collect()
                };
                for (pos, child_paddr) in live {
                    let current = self.resident.borrow().get(&child_paddr).cloned();
                    if let Some(current) = current {
                        match &current {
                            NodeHandle::Internal(c) => {
                                c.set_parent(n);
                                n.link_child(pos, ChildSlot::Internal(Rc::clone(c)));
                            }
                            NodeHandle::Leaf(c) => {
                                c.set_parent(n);
                                n.link_child(pos, ChildSlot::Leaf(Rc::clone(c)));
                            }
                        }
                    } else {
                        n.link_child(pos, ChildSlot::Unknown);
                    }
                }
            }
        }

        for handle in nodes {
            let meta = handle.meta();
            if meta.is_root() && meta.depth == self.stable_root.root().depth {
                self.stable_root.link_root(handle.clone());
                continue;
            }

            let parent = match handle {
                NodeHandle::Internal(n) => n.parent_node(),
                NodeHandle::Leaf(n) => n.parent_node(),
            };
            let Some(parent) = parent else { continue };
            // The back-reference may name a replaced prior instance;
            // resolve the current stable parent by address.
            let current = self.resident.borrow().get(&parent.paddr()).cloned();
            let Some(NodeHandle::Internal(parent)) = current else {
                continue;
            };

            let (pos, entry_paddr) = {
                let p = parent.read();
                if p.len() == 0 {
                    continue;
                }
                let ub = p.upper_bound(meta.begin);
                if ub == 0 {
                    continue;
                }
                (ub - 1, p.entry_paddr(ub - 1))
            };
            if entry_paddr == handle.paddr() {
                match handle {
                    NodeHandle::Internal(n) => {
                        n.set_parent(&parent);
                        parent.link_child(pos as u16, ChildSlot::Internal(Rc::clone(n)));
                    }
                    NodeHandle::Leaf(n) => {
                        n.set_parent(&parent);
                        parent.link_child(pos as u16, ChildSlot::Leaf(Rc::clone(n)));
                    }
                }
            }
        }
    }

    fn write_superblock(&self) -> Result<()> {
        let root = self.stable_root.root();
        let mut sb = SuperblockLayout {
            magic: U32::new(SUPERBLOCK_MAGIC),
            version: U16::new(SUPERBLOCK_VERSION),
            _reserved0: [0; 2],
            node_size: U32::new(self.node_size as u32),
            _reserved1: [0; 4],
            root_location: U64::new(root.location.to_raw()),
            root_depth: U16::new(root.depth),
            _reserved2: [0; 6],
            next_block: U64::new(self.next_block.get()),
            checksum: U64::new(0),
        };
        sb.checksum = U64::new(superblock_checksum(&sb));

        let mut block = vec![0u8; self.node_size];
        block[..SUPERBLOCK_LEN].copy_from_slice(sb.as_bytes());
        self.device.write_block(0, &block)
    }
}

fn superblock_checksum(sb: &SuperblockLayout) -> u64 {
    let bytes = sb.as_bytes();
    xxh3_64(&bytes[..SUPERBLOCK_LEN - 8])
}

fn assert_meta<K: NodeKey>(actual: &NodeMeta<K>, expected: &NodeMeta<K>, paddr: Paddr) {
    // A node disagreeing with the range its parent maps it under is
    // corruption; the process must not continue against this tree.
    assert!(
        actual == expected,
        "node at {:?} has meta {:?}, parent implies {:?}",
        paddr,
        actual,
        expected
    );
}
