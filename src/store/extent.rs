//! # Cached Extents
//!
//! In-memory images of on-disk blocks, with the identity and lifecycle
//! state the copy-on-write protocol depends on.
//!
//! ## Lifecycle
//!
//! ```text
//!            fault/alloc                duplicate_for_write
//!   (disk) ─────────────> Stable ──────────────────────────> MutationPending
//!                            │                                     │
//!               alloc        │ retire (txn)                 commit │
//!   Fresh <──────────────────┼───────────> Retired <───────────────┘
//!     │                      │
//!     └── commit ──> Stable ─┘
//! ```
//!
//! A `Stable` extent is the committed view, shared by every transaction. A
//! `Fresh` or `MutationPending` extent is private to the transaction named
//! by its owner id and is never linked into stable structures until commit.
//!
//! ## Parent/Child References
//!
//! Internal nodes carry a child-pointer array parallel to their entries
//! (see [`ChildSlot`]); children carry a non-owning back-reference to their
//! parent. Ownership always runs parent → child: the back-edge is a `Weak`
//! handle and the root is owned through the [`RootBlock`]. A node is
//! *linked* iff its parent's slot references it and its back-reference
//! names that parent; split, merge, rewrite, and root growth/collapse
//! re-link as their last step before retiring originals.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use crate::btree::{InternalNode, LeafNode};
use crate::types::{Depth, ExtentKind, NodeKey, NodeMeta, NodeVal, Paddr, PlacementHint};

/// Transaction identifier.
pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Committed view; may be shared across transactions.
    Stable,
    /// Allocated by an uncommitted transaction; has no prior instance.
    Fresh,
    /// Transaction-private mutable clone of a stable extent.
    MutationPending,
    /// Released; reclaimed when the owning transaction commits.
    Retired,
}

/// A node storable in an extent. Implemented by the leaf and internal node
/// types; gives the extent layer access to node identity without knowing
/// node internals.
pub trait TreeNode: Sized + 'static {
    type Key: NodeKey;
    type Val: NodeVal;

    const KIND: ExtentKind;

    fn meta(&self) -> NodeMeta<Self::Key>;
}

/// An in-memory node image plus the identity the cache tracks it by.
pub struct Extent<N: TreeNode> {
    paddr: Cell<Paddr>,
    state: Cell<ExtentState>,
    owner: Cell<Option<TxnId>>,
    generation: Cell<u32>,
    hint: Cell<PlacementHint>,
    node: RefCell<N>,
    parent: RefCell<Option<Weak<Extent<InternalNode<N::Key, N::Val>>>>>,
}

pub type LeafRef<K, V> = Rc<Extent<LeafNode<K, V>>>;
pub type InternalRef<K, V> = Rc<Extent<InternalNode<K, V>>>;

impl<N: TreeNode> Extent<N> {
    pub fn new(
        paddr: Paddr,
        state: ExtentState,
        owner: Option<TxnId>,
        hint: PlacementHint,
        generation: u32,
        node: N,
    ) -> Rc<Self> {
        Rc::new(Self {
            paddr: Cell::new(paddr),
            state: Cell::new(state),
            owner: Cell::new(owner),
            generation: Cell::new(generation),
            hint: Cell::new(hint),
            node: RefCell::new(node),
            parent: RefCell::new(None),
        })
    }

    pub fn paddr(&self) -> Paddr {
        self.paddr.get()
    }

    pub fn state(&self) -> ExtentState {
        self.state.get()
    }

    pub fn set_state(&self, state: ExtentState) {
        self.state.set(state);
    }

    pub fn owner(&self) -> Option<TxnId> {
        self.owner.get()
    }

    pub fn set_owner(&self, owner: Option<TxnId>) {
        self.owner.set(owner);
    }

    pub fn generation(&self) -> u32 {
        self.generation.get()
    }

    pub fn hint(&self) -> PlacementHint {
        self.hint.get()
    }

    pub fn kind(&self) -> ExtentKind {
        N::KIND
    }

    pub fn meta(&self) -> NodeMeta<N::Key> {
        self.node.borrow().meta()
    }

    /// True iff this instance may be written by its owning transaction.
    pub fn is_mutable(&self) -> bool {
        matches!(
            self.state.get(),
            ExtentState::Fresh | ExtentState::MutationPending
        )
    }

    pub fn is_stable(&self) -> bool {
        self.state.get() == ExtentState::Stable
    }

    pub fn is_retired(&self) -> bool {
        self.state.get() == ExtentState::Retired
    }

    /// Shared borrow of the node contents. Must not be held across cache
    /// calls, which may need to borrow related extents.
    pub fn read(&self) -> Ref<'_, N> {
        self.node.borrow()
    }

    /// Exclusive borrow of the node contents. Callers must hold a mutable
    /// instance; stable extents are shared across transactions and must
    /// never be written.
    pub fn write(&self) -> RefMut<'_, N> {
        debug_assert!(self.is_mutable(), "write access to a non-mutable extent");
        self.node.borrow_mut()
    }

    /// Writes performed outside transaction scope, during commit
    /// publication only.
    pub(crate) fn write_for_commit(&self) -> RefMut<'_, N> {
        self.node.borrow_mut()
    }

    pub fn parent_node(&self) -> Option<InternalRef<N::Key, N::Val>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_parent(&self, parent: &InternalRef<N::Key, N::Val>) {
        *self.parent.borrow_mut() = Some(Rc::downgrade(parent));
    }

    pub fn clear_parent(&self) {
        *self.parent.borrow_mut() = None;
    }
}

/// Typed handle to either flavor of tree-node extent.
pub enum NodeHandle<K: NodeKey, V: NodeVal> {
    Internal(InternalRef<K, V>),
    Leaf(LeafRef<K, V>),
}

impl<K: NodeKey, V: NodeVal> Clone for NodeHandle<K, V> {
    fn clone(&self) -> Self {
        match self {
            NodeHandle::Internal(n) => NodeHandle::Internal(Rc::clone(n)),
            NodeHandle::Leaf(n) => NodeHandle::Leaf(Rc::clone(n)),
        }
    }
}

impl<K: NodeKey, V: NodeVal> NodeHandle<K, V> {
    pub fn paddr(&self) -> Paddr {
        match self {
            NodeHandle::Internal(n) => n.paddr(),
            NodeHandle::Leaf(n) => n.paddr(),
        }
    }

    pub fn state(&self) -> ExtentState {
        match self {
            NodeHandle::Internal(n) => n.state(),
            NodeHandle::Leaf(n) => n.state(),
        }
    }

    pub fn set_state(&self, state: ExtentState) {
        match self {
            NodeHandle::Internal(n) => n.set_state(state),
            NodeHandle::Leaf(n) => n.set_state(state),
        }
    }

    pub fn set_owner(&self, owner: Option<TxnId>) {
        match self {
            NodeHandle::Internal(n) => n.set_owner(owner),
            NodeHandle::Leaf(n) => n.set_owner(owner),
        }
    }

    pub fn kind(&self) -> ExtentKind {
        match self {
            NodeHandle::Internal(_) => ExtentKind::InternalNode,
            NodeHandle::Leaf(_) => ExtentKind::LeafNode,
        }
    }

    pub fn meta(&self) -> NodeMeta<K> {
        match self {
            NodeHandle::Internal(n) => n.meta(),
            NodeHandle::Leaf(n) => n.meta(),
        }
    }

    pub fn depth(&self) -> Depth {
        self.meta().depth
    }

    pub fn is_mutable(&self) -> bool {
        match self {
            NodeHandle::Internal(n) => n.is_mutable(),
            NodeHandle::Leaf(n) => n.is_mutable(),
        }
    }

    pub fn as_internal(&self) -> Option<&InternalRef<K, V>> {
        match self {
            NodeHandle::Internal(n) => Some(n),
            NodeHandle::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafRef<K, V>> {
        match self {
            NodeHandle::Leaf(n) => Some(n),
            NodeHandle::Internal(_) => None,
        }
    }

    /// Pointer identity across handles.
    pub fn ptr_eq(&self, other: &NodeHandle<K, V>) -> bool {
        match (self, other) {
            (NodeHandle::Internal(a), NodeHandle::Internal(b)) => Rc::ptr_eq(a, b),
            (NodeHandle::Leaf(a), NodeHandle::Leaf(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// One entry of an internal node's in-memory child-pointer array.
///
/// `Unknown` means "query the cache"; `Reserved` means "known absent from
/// the cache, fault from the device directly". The two are distinct and
/// both must be preserved across split/merge.
pub enum ChildSlot<K: NodeKey, V: NodeVal> {
    Unknown,
    Reserved,
    Internal(InternalRef<K, V>),
    Leaf(LeafRef<K, V>),
}

impl<K: NodeKey, V: NodeVal> Clone for ChildSlot<K, V> {
    fn clone(&self) -> Self {
        match self {
            ChildSlot::Unknown => ChildSlot::Unknown,
            ChildSlot::Reserved => ChildSlot::Reserved,
            ChildSlot::Internal(n) => ChildSlot::Internal(Rc::clone(n)),
            ChildSlot::Leaf(n) => ChildSlot::Leaf(Rc::clone(n)),
        }
    }
}

impl<K: NodeKey, V: NodeVal> ChildSlot<K, V> {
    pub fn is_live(&self) -> bool {
        matches!(self, ChildSlot::Internal(_) | ChildSlot::Leaf(_))
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, ChildSlot::Reserved)
    }

    pub fn handle(&self) -> Option<NodeHandle<K, V>> {
        match self {
            ChildSlot::Internal(n) => Some(NodeHandle::Internal(Rc::clone(n))),
            ChildSlot::Leaf(n) => Some(NodeHandle::Leaf(Rc::clone(n))),
            _ => None,
        }
    }
}

/// An opaque data extent: one block of object payload the index points at.
/// The tree does not interpret these; they exist so liveness queries can
/// distinguish index nodes from unrelated extents.
pub struct DataExtent {
    paddr: Cell<Paddr>,
    state: Cell<ExtentState>,
    owner: Cell<Option<TxnId>>,
    generation: Cell<u32>,
    hint: Cell<PlacementHint>,
    bytes: RefCell<Box<[u8]>>,
}

pub type DataRef = Rc<DataExtent>;

impl DataExtent {
    pub fn new(
        paddr: Paddr,
        state: ExtentState,
        owner: Option<TxnId>,
        hint: PlacementHint,
        generation: u32,
        bytes: Box<[u8]>,
    ) -> DataRef {
        Rc::new(Self {
            paddr: Cell::new(paddr),
            state: Cell::new(state),
            owner: Cell::new(owner),
            generation: Cell::new(generation),
            hint: Cell::new(hint),
            bytes: RefCell::new(bytes),
        })
    }

    pub fn paddr(&self) -> Paddr {
        self.paddr.get()
    }

    pub fn state(&self) -> ExtentState {
        self.state.get()
    }

    pub fn set_state(&self, state: ExtentState) {
        self.state.set(state);
    }

    pub fn set_owner(&self, owner: Option<TxnId>) {
        self.owner.set(owner);
    }

    pub fn generation(&self) -> u32 {
        self.generation.get()
    }

    pub fn hint(&self) -> PlacementHint {
        self.hint.get()
    }

    pub fn bytes(&self) -> Ref<'_, Box<[u8]>> {
        self.bytes.borrow()
    }

    pub fn bytes_mut(&self) -> RefMut<'_, Box<[u8]>> {
        debug_assert!(
            matches!(
                self.state.get(),
                ExtentState::Fresh | ExtentState::MutationPending
            ),
            "write access to a non-mutable data extent"
        );
        self.bytes.borrow_mut()
    }
}

/// Any extent the cache can hand out.
pub enum AnyExtent<K: NodeKey, V: NodeVal> {
    Node(NodeHandle<K, V>),
    Data(DataRef),
}

impl<K: NodeKey, V: NodeVal> Clone for AnyExtent<K, V> {
    fn clone(&self) -> Self {
        match self {
            AnyExtent::Node(h) => AnyExtent::Node(h.clone()),
            AnyExtent::Data(d) => AnyExtent::Data(Rc::clone(d)),
        }
    }
}

impl<K: NodeKey, V: NodeVal> AnyExtent<K, V> {
    pub fn paddr(&self) -> Paddr {
        match self {
            AnyExtent::Node(h) => h.paddr(),
            AnyExtent::Data(d) => d.paddr(),
        }
    }

    pub fn kind(&self) -> ExtentKind {
        match self {
            AnyExtent::Node(h) => h.kind(),
            AnyExtent::Data(_) => ExtentKind::Data,
        }
    }
}

/// The physical tree root descriptor: where the root node lives and how
/// deep the tree is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhyTreeRoot {
    pub location: Paddr,
    pub depth: Depth,
}

/// Externally managed root descriptor, versioned with the same
/// copy-on-write discipline as tree nodes. Also tracks the in-memory root
/// node so repeated lookups skip the device.
pub struct RootBlock<K: NodeKey, V: NodeVal> {
    state: Cell<ExtentState>,
    owner: Cell<Option<TxnId>>,
    root: Cell<PhyTreeRoot>,
    root_node: RefCell<Option<NodeHandle<K, V>>>,
}

pub type RootBlockRef<K, V> = Rc<RootBlock<K, V>>;

impl<K: NodeKey, V: NodeVal> RootBlock<K, V> {
    pub fn new(state: ExtentState, owner: Option<TxnId>, root: PhyTreeRoot) -> RootBlockRef<K, V> {
        Rc::new(Self {
            state: Cell::new(state),
            owner: Cell::new(owner),
            root: Cell::new(root),
            root_node: RefCell::new(None),
        })
    }

    pub fn state(&self) -> ExtentState {
        self.state.get()
    }

    pub fn set_state(&self, state: ExtentState) {
        self.state.set(state);
    }

    pub fn owner(&self) -> Option<TxnId> {
        self.owner.get()
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self.state.get(),
            ExtentState::Fresh | ExtentState::MutationPending
        )
    }

    pub fn root(&self) -> PhyTreeRoot {
        self.root.get()
    }

    pub fn set_location(&self, location: Paddr) {
        debug_assert!(self.is_mutable(), "root block written while stable");
        let mut r = self.root.get();
        r.location = location;
        self.root.set(r);
    }

    pub fn set_depth(&self, depth: Depth) {
        debug_assert!(self.is_mutable(), "root block written while stable");
        let mut r = self.root.get();
        r.depth = depth;
        self.root.set(r);
    }

    /// Installs committed root state; commit-path only.
    pub(crate) fn install(&self, root: PhyTreeRoot, node: Option<NodeHandle<K, V>>) {
        self.root.set(root);
        *self.root_node.borrow_mut() = node;
    }

    /// The tracked in-memory root node, if linked.
    pub fn root_node(&self) -> Option<NodeHandle<K, V>> {
        self.root_node.borrow().clone()
    }

    /// Links `node` as this root block's tracked root node.
    pub fn link_root(&self, node: NodeHandle<K, V>) {
        match &node {
            NodeHandle::Internal(n) => n.clear_parent(),
            NodeHandle::Leaf(n) => n.clear_parent(),
        }
        *self.root_node.borrow_mut() = Some(node);
    }
}
